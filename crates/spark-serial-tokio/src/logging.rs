//! 日志订阅器安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：行内容写到标准输出，诊断日志必须走标准错误，二者互不干扰；
//! - **逻辑（How）**：使用 `tracing-subscriber` 组装 `fmt + EnvFilter`，显式过滤串优先，
//!   其次读取 `RUST_LOG`，都没有时使用 [`DEFAULT_FILTER`]；
//! - **契约（What）**：进程内只能安装一次，外部已设置全局订阅器时返回 [`LoggingError::AlreadyInstalled`]。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 未指定过滤串时的默认级别。
pub const DEFAULT_FILTER: &str = "info";

/// 日志安装错误。
#[derive(Debug, Error)]
pub enum LoggingError {
    /// 全局订阅器已经存在。
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
    /// 过滤串无法解析。
    #[error("invalid log filter `{directive}`: {detail}")]
    InvalidFilter {
        /// 原始过滤串。
        directive: String,
        /// 解析器给出的原因。
        detail: String,
    },
    /// 设置全局订阅器失败。
    #[error("failed to install the tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 构建过滤器。
pub fn build_filter(directive: Option<&str>) -> Result<EnvFilter, LoggingError> {
    match directive {
        Some(directive) => {
            EnvFilter::try_new(directive).map_err(|err| LoggingError::InvalidFilter {
                directive: directive.to_owned(),
                detail: err.to_string(),
            })
        }
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// 安装全局日志订阅器，输出到标准错误。
pub fn install(directive: Option<&str>) -> Result<(), LoggingError> {
    if dispatcher::has_been_set() {
        return Err(LoggingError::AlreadyInstalled);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_filter(directive)?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_is_validated() {
        assert!(build_filter(Some("spark_serial_core=debug,info")).is_ok());
        assert!(matches!(
            build_filter(Some("spark_serial_core=verbose")),
            Err(LoggingError::InvalidFilter { .. })
        ));
    }
}
