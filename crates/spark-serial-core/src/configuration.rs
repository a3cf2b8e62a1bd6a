//! 串口行读取的运行参数。
//!
//! # 教案式说明
//! - **Why**：缓冲容量、空闲周期与排空超时决定了内存上限与关闭时延，需要集中声明并在建立前校验；
//! - **How**：[`SerialSettings`] 提供默认值与 `with_*` 构造器；[`SerialSettings::from_toml_str`] 读取
//!   `[serial]` 表中的毫秒字段，未出现的键保持默认值，表内未知键视为错误；
//! - **What**：`raw_capacity` 默认 50 字节（单次读取上限），`line_capacity` 默认 255 字节，
//!   空闲周期默认 5 秒，可通过 `timer_enabled = false` 关闭定时器。

use core::time::Duration;

use serde::Deserialize;
use spark_serial_line::{DEFAULT_LINE_CAPACITY, DelimiterMode, LineAssembler, NEWLINE};

use crate::error::{ConfigError, SettingsField};

/// 单次读取的默认上限（字节）。
pub const DEFAULT_RAW_CAPACITY: usize = 50;

/// 默认空闲周期。
pub const DEFAULT_IDLE_PERIOD: Duration = Duration::from_secs(5);

/// 单次读取上限的下限：第一阶段固定读取 1 字节，还需至少 1 字节给第二阶段。
pub const MIN_RAW_CAPACITY: usize = 2;

/// 串口行读取设置。
///
/// ### 契约说明（What）
/// - `raw_capacity`：一次读完成（两阶段合计）最多交付的字节数；
/// - `line_capacity`：行缓冲上限，超出即整行丢弃；
/// - `idle_period`：`None` 表示不启用定时器；
/// - `restart_timer_on_activity`：读到数据而定时器未触发时，取消并重新提交定时器；
/// - `drain_timeout`：关闭时每个请求的排空上限，`None` 表示无限等待。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialSettings {
    raw_capacity: usize,
    line_capacity: usize,
    delimiter: u8,
    delimiter_mode: DelimiterMode,
    idle_period: Option<Duration>,
    restart_timer_on_activity: bool,
    drain_timeout: Option<Duration>,
}

impl SerialSettings {
    /// 单次读取上限。
    pub const fn raw_capacity(&self) -> usize {
        self.raw_capacity
    }

    /// 行缓冲上限。
    pub const fn line_capacity(&self) -> usize {
        self.line_capacity
    }

    /// 行分隔符。
    pub const fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// 分隔符模式。
    pub const fn delimiter_mode(&self) -> DelimiterMode {
        self.delimiter_mode
    }

    /// 空闲周期。
    pub const fn idle_period(&self) -> Option<Duration> {
        self.idle_period
    }

    /// 读到数据时是否重启定时器。
    pub const fn restart_timer_on_activity(&self) -> bool {
        self.restart_timer_on_activity
    }

    /// 排空超时。
    pub const fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout
    }

    /// 替换单次读取上限。
    pub fn with_raw_capacity(mut self, raw_capacity: usize) -> Self {
        self.raw_capacity = raw_capacity;
        self
    }

    /// 替换行缓冲上限。
    pub fn with_line_capacity(mut self, line_capacity: usize) -> Self {
        self.line_capacity = line_capacity;
        self
    }

    /// 替换行分隔符。
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// 替换分隔符模式。
    pub fn with_delimiter_mode(mut self, mode: DelimiterMode) -> Self {
        self.delimiter_mode = mode;
        self
    }

    /// 替换空闲周期；`None` 关闭定时器。
    pub fn with_idle_period(mut self, idle_period: Option<Duration>) -> Self {
        self.idle_period = idle_period;
        self
    }

    /// 替换“读到数据时重启定时器”开关。
    pub fn with_restart_timer_on_activity(mut self, enabled: bool) -> Self {
        self.restart_timer_on_activity = enabled;
        self
    }

    /// 替换排空超时。
    pub fn with_drain_timeout(mut self, drain_timeout: Option<Duration>) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.raw_capacity < MIN_RAW_CAPACITY {
            return Err(ConfigError::TooSmall {
                field: SettingsField::RawCapacity,
                minimum: MIN_RAW_CAPACITY as u64,
                provided: self.raw_capacity as u64,
            });
        }
        if self.line_capacity == 0 {
            return Err(ConfigError::TooSmall {
                field: SettingsField::LineCapacity,
                minimum: 1,
                provided: 0,
            });
        }
        if self.idle_period.is_some_and(|period| period.is_zero()) {
            return Err(ConfigError::NonPositiveDuration {
                field: SettingsField::IdlePeriod,
            });
        }
        if self.drain_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::NonPositiveDuration {
                field: SettingsField::DrainTimeout,
            });
        }
        Ok(())
    }

    /// 按当前设置构建行组装器。
    pub fn build_assembler(&self) -> LineAssembler {
        LineAssembler::new(self.line_capacity)
            .with_delimiter(self.delimiter)
            .with_mode(self.delimiter_mode)
    }

    /// 从 TOML 文本解析设置并校验。
    ///
    /// 只读取 `[serial]` 表，其他顶层表留给宿主自行解析。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text).map_err(|err| ConfigError::Parse {
            detail: err.to_string(),
        })?;
        let settings = file.serial.apply(Self::default());
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            raw_capacity: DEFAULT_RAW_CAPACITY,
            line_capacity: DEFAULT_LINE_CAPACITY,
            delimiter: NEWLINE,
            delimiter_mode: DelimiterMode::default(),
            idle_period: Some(DEFAULT_IDLE_PERIOD),
            restart_timer_on_activity: true,
            drain_timeout: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    serial: SerialSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SerialSection {
    raw_capacity: Option<usize>,
    line_capacity: Option<usize>,
    delimiter: Option<u8>,
    delimiter_mode: Option<DelimiterMode>,
    idle_period_ms: Option<u64>,
    timer_enabled: Option<bool>,
    restart_timer_on_activity: Option<bool>,
    drain_timeout_ms: Option<u64>,
}

impl SerialSection {
    fn apply(self, mut settings: SerialSettings) -> SerialSettings {
        if let Some(raw_capacity) = self.raw_capacity {
            settings.raw_capacity = raw_capacity;
        }
        if let Some(line_capacity) = self.line_capacity {
            settings.line_capacity = line_capacity;
        }
        if let Some(delimiter) = self.delimiter {
            settings.delimiter = delimiter;
        }
        if let Some(mode) = self.delimiter_mode {
            settings.delimiter_mode = mode;
        }
        if let Some(ms) = self.idle_period_ms {
            settings.idle_period = Some(Duration::from_millis(ms));
        }
        if self.timer_enabled == Some(false) {
            settings.idle_period = None;
        }
        if let Some(enabled) = self.restart_timer_on_activity {
            settings.restart_timer_on_activity = enabled;
        }
        if let Some(ms) = self.drain_timeout_ms {
            settings.drain_timeout = Some(Duration::from_millis(ms));
        }
        settings
    }
}
