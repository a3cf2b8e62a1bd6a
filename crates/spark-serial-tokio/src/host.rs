//! 宿主装配：设备来源、配置文件与一次完整运行。
//!
//! # 教案式说明
//! - **Why**：二进制与集成测试需要同一条“校验配置、打开设备、运行循环”的路径，建立失败的分类也必须一致；
//! - **How**：[`HostConfig`] 聚合设备来源、设备缓冲容量与 [`SerialSettings`]；配置文件的 `[device]` 表由本模块解析，
//!   `[serial]` 表交给 [`SerialSettings::from_toml_str`]；
//! - **What**：[`run`] 在打开设备前校验设置；打开失败原样返回 [`SerialError::DeviceInUse`]/[`SerialError::DeviceOpen`]。

use std::path::PathBuf;

use serde::Deserialize;
use spark_serial_core::{
    Cancellation, ConfigError, EventLoop, LineSink, SerialError, SerialSettings, ShutdownReport,
};
use tracing::info;

use crate::{
    device::{DEFAULT_DEVICE_BUFFER, StreamDevice},
    timer::TokioTimer,
};

/// 设备来源。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DeviceSource {
    /// 标准输入。
    #[default]
    Stdin,
    /// 设备路径。
    Path(PathBuf),
}

impl DeviceSource {
    /// 由命令行参数解析；`-` 表示标准输入。
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            DeviceSource::Stdin
        } else {
            DeviceSource::Path(PathBuf::from(arg))
        }
    }
}

/// 宿主配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// 设备来源。
    pub source: DeviceSource,
    /// 设备内部缓冲容量。
    pub device_buffer: usize,
    /// 事件循环设置。
    pub settings: SerialSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            source: DeviceSource::default(),
            device_buffer: DEFAULT_DEVICE_BUFFER,
            settings: SerialSettings::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HostFile {
    #[serde(default)]
    device: DeviceSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DeviceSection {
    path: Option<String>,
    buffer: Option<usize>,
}

impl HostConfig {
    /// 从 TOML 文本解析宿主配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings = SerialSettings::from_toml_str(text)?;
        let file: HostFile = toml::from_str(text).map_err(|err| ConfigError::Parse {
            detail: err.to_string(),
        })?;
        let defaults = Self::default();
        Ok(Self {
            source: file
                .device
                .path
                .as_deref()
                .map_or(defaults.source, DeviceSource::from_arg),
            device_buffer: file.device.buffer.unwrap_or(defaults.device_buffer),
            settings,
        })
    }
}

/// 按来源打开设备。
pub async fn open_device(
    source: &DeviceSource,
    capacity: usize,
) -> Result<StreamDevice, SerialError> {
    match source {
        DeviceSource::Stdin => Ok(StreamDevice::stdin(capacity)),
        DeviceSource::Path(path) => StreamDevice::open_path(path, capacity).await,
    }
}

/// 校验设置、打开设备并运行事件循环直到取消。
pub async fn run<S: LineSink>(
    config: &HostConfig,
    sink: S,
    cancellation: Cancellation,
) -> Result<ShutdownReport, SerialError> {
    config.settings.validate()?;
    let device = open_device(&config.source, config.device_buffer).await?;
    info!(source = ?config.source, "serial host starting");
    EventLoop::new(
        device,
        TokioTimer::new(),
        sink,
        cancellation,
        config.settings.clone(),
    )
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_device_and_serial_tables() {
        let text = r#"
            [device]
            path = "/dev/ttyUSB0"
            buffer = 1024

            [serial]
            idle_period_ms = 1000
        "#;
        let config = HostConfig::from_toml_str(text).expect("合法配置应解析成功");
        assert_eq!(config.source, DeviceSource::Path(PathBuf::from("/dev/ttyUSB0")));
        assert_eq!(config.device_buffer, 1024);
        assert_eq!(config.settings.idle_period(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn dash_selects_stdin() {
        assert_eq!(DeviceSource::from_arg("-"), DeviceSource::Stdin);
        let config = HostConfig::from_toml_str("").expect("空文档使用默认值");
        assert_eq!(config, HostConfig::default());
    }
}
