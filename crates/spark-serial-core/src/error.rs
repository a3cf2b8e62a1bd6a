//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义串口行读取的错误语义：建立阶段失败、单次请求失败、完成记账异常与配置错误；
//! - 每个变体都映射到稳定的点分错误码，日志与告警以错误码而非文案做匹配。
//!
//! ## 设计要求（What）
//! - 只有建立阶段的失败（[`SerialError::is_setup_failure`]）会终止事件循环；
//! - 其余失败由事件循环记录日志与计数后吸收，下一个周期重试；
//! - 错误类型满足 `Send + Sync + 'static`，可以作为 [`Completion::Failed`](crate::Completion::Failed) 跨任务传递。

use core::fmt;

use thiserror::Error;

use crate::contract::SourceKind;

/// 稳定错误码。
pub mod codes {
    /// 设备已被其他进程占用。
    pub const SETUP_DEVICE_IN_USE: &str = "serial.setup.device_in_use";
    /// 设备打开失败。
    pub const SETUP_DEVICE_OPEN: &str = "serial.setup.device_open";
    /// 初次提交请求失败。
    pub const SETUP_FAILED: &str = "serial.setup.failed";
    /// 提交请求失败。
    pub const REQUEST_ARM: &str = "serial.request.arm";
    /// 读请求失败。
    pub const REQUEST_READ: &str = "serial.request.read";
    /// 查询缓冲字节数失败。
    pub const REQUEST_QUERY: &str = "serial.request.query";
    /// 在没有已完成请求的槽位上消费完成。
    pub const REQUEST_STALE: &str = "serial.request.stale_completion";
    /// 关闭设备失败。
    pub const DEVICE_CLOSE: &str = "serial.device.close";
    /// 配置非法。
    pub const CONFIG_INVALID: &str = "serial.config.invalid";
}

/// 建立阶段的步骤，用于描述 [`SerialError::Setup`] 发生的位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupStage {
    /// 提交首个读请求。
    ArmRead,
    /// 提交首个定时请求。
    ArmTimer,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetupStage::ArmRead => "issuing the first read request",
            SetupStage::ArmTimer => "arming the idle timer",
        })
    }
}

/// 串口行读取的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“必须终止”的建立失败与“记录后重试”的请求失败，让事件循环只在前者退出；
/// - **契约 (What)**：`code()` 返回稳定错误码；`Setup` 包装触发建立失败的原始错误；
/// - **设计权衡 (Trade-offs)**：协作者错误以 `detail` 字符串携带，牺牲结构化细节换取与具体 I/O 库解耦。
#[derive(Debug, Error)]
pub enum SerialError {
    /// 设备已被占用。
    #[error("device `{device}` is already in use by another process")]
    DeviceInUse {
        /// 设备名。
        device: String,
    },

    /// 设备打开失败（占用以外的原因）。
    #[error("device `{device}` could not be opened: {detail}")]
    DeviceOpen {
        /// 设备名。
        device: String,
        /// 失败原因。
        detail: String,
    },

    /// 建立阶段失败；事件循环已排空在途请求并关闭设备。
    #[error("setup failed while {stage}: {cause}")]
    Setup {
        /// 失败步骤。
        stage: SetupStage,
        /// 原始错误。
        #[source]
        cause: Box<SerialError>,
    },

    /// 提交请求失败。
    #[error("failed to issue {kind} request: {detail}")]
    Arm {
        /// 请求来源。
        kind: SourceKind,
        /// 失败原因。
        detail: String,
    },

    /// 读请求以错误结束。
    #[error("device read failed: {detail}")]
    Read {
        /// 失败原因。
        detail: String,
    },

    /// 查询缓冲字节数失败。
    #[error("device query failed: {detail}")]
    Query {
        /// 失败原因。
        detail: String,
    },

    /// 在尚未完成的槽位上消费完成。
    #[error("{kind} completion consumed while no settled request was present")]
    StaleCompletion {
        /// 请求来源。
        kind: SourceKind,
    },

    /// 关闭设备失败，或在仍有在途请求时尝试关闭。
    #[error("device close failed: {detail}")]
    Close {
        /// 失败原因。
        detail: String,
    },

    /// 配置非法。
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SerialError {
    /// 构造 [`SerialError::Arm`]。
    pub fn arm(kind: SourceKind, detail: impl Into<String>) -> Self {
        SerialError::Arm {
            kind,
            detail: detail.into(),
        }
    }

    /// 构造 [`SerialError::Read`]。
    pub fn read(detail: impl Into<String>) -> Self {
        SerialError::Read {
            detail: detail.into(),
        }
    }

    /// 把原始错误包装为建立阶段失败。
    pub fn setup(stage: SetupStage, cause: SerialError) -> Self {
        SerialError::Setup {
            stage,
            cause: Box::new(cause),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SerialError::DeviceInUse { .. } => codes::SETUP_DEVICE_IN_USE,
            SerialError::DeviceOpen { .. } => codes::SETUP_DEVICE_OPEN,
            SerialError::Setup { .. } => codes::SETUP_FAILED,
            SerialError::Arm { .. } => codes::REQUEST_ARM,
            SerialError::Read { .. } => codes::REQUEST_READ,
            SerialError::Query { .. } => codes::REQUEST_QUERY,
            SerialError::StaleCompletion { .. } => codes::REQUEST_STALE,
            SerialError::Close { .. } => codes::DEVICE_CLOSE,
            SerialError::Config(_) => codes::CONFIG_INVALID,
        }
    }

    /// 是否属于终止事件循环的建立失败。
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            SerialError::DeviceInUse { .. }
                | SerialError::DeviceOpen { .. }
                | SerialError::Setup { .. }
                | SerialError::Config(_)
        )
    }

    /// 若为 [`SerialError::Setup`]，返回最内层的原始错误。
    pub fn root_cause(&self) -> &SerialError {
        match self {
            SerialError::Setup { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// 配置字段标识，用于在错误中指出具体键名。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsField {
    /// `serial.raw_capacity`
    RawCapacity,
    /// `serial.line_capacity`
    LineCapacity,
    /// `serial.idle_period_ms`
    IdlePeriod,
    /// `serial.drain_timeout_ms`
    DrainTimeout,
}

impl SettingsField {
    /// 配置文件中的键名。
    pub const fn key(&self) -> &'static str {
        match self {
            SettingsField::RawCapacity => "serial.raw_capacity",
            SettingsField::LineCapacity => "serial.line_capacity",
            SettingsField::IdlePeriod => "serial.idle_period_ms",
            SettingsField::DrainTimeout => "serial.drain_timeout_ms",
        }
    }
}

impl fmt::Display for SettingsField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// 配置解析与校验错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 容量类字段低于下限。
    #[error("`{field}` must be at least {minimum}, got {provided}")]
    TooSmall {
        /// 字段。
        field: SettingsField,
        /// 下限。
        minimum: u64,
        /// 实际值。
        provided: u64,
    },

    /// 时间类字段必须为正。
    #[error("`{field}` must be a positive duration")]
    NonPositiveDuration {
        /// 字段。
        field: SettingsField,
    },

    /// 配置文本无法解析。
    #[error("configuration could not be parsed: {detail}")]
    Parse {
        /// 解析器给出的原因。
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_error_exposes_root_cause_and_code() {
        let err = SerialError::setup(
            SetupStage::ArmRead,
            SerialError::arm(SourceKind::Read, "queue full"),
        );
        assert_eq!(err.code(), codes::SETUP_FAILED);
        assert!(err.is_setup_failure());
        assert_eq!(err.root_cause().code(), codes::REQUEST_ARM);
        assert_eq!(
            err.to_string(),
            "setup failed while issuing the first read request: failed to issue read request: queue full"
        );
    }

    #[test]
    fn request_failures_are_not_fatal() {
        assert!(!SerialError::read("framing").is_setup_failure());
        assert!(
            !SerialError::StaleCompletion {
                kind: SourceKind::Timer
            }
            .is_setup_failure()
        );
    }

    #[test]
    fn config_error_names_the_key() {
        let err = SerialError::from(ConfigError::NonPositiveDuration {
            field: SettingsField::IdlePeriod,
        });
        assert_eq!(err.code(), codes::CONFIG_INVALID);
        assert!(err.to_string().contains("serial.idle_period_ms"));
    }
}
