#![warn(missing_docs)]

//! `spark-serial-tokio` 为 `spark-serial-core` 提供 Tokio 宿主实现。
//!
//! # 教案背景（Why）
//! - 核心事件循环与执行器无关，真实运行需要字节设备、定时器、中断信号与日志订阅器；
//! - 这些能力都依赖 Tokio 与 `tracing-subscriber`，集中在本 crate，核心保持纯粹。
//!
//! # 模块地图（How）
//! - [`device`]：[`StreamDevice`]，把任意 `AsyncRead`（设备文件或标准输入）转换为两阶段读取的设备；
//! - [`timer`]：[`TokioTimer`]；
//! - [`signal`]：Ctrl-C 到 [`Cancellation`](spark_serial_core::Cancellation) 的桥接；
//! - [`logging`]：`fmt + EnvFilter` 订阅器安装；
//! - [`sink`]：[`ConsoleSink`]；
//! - [`host`]：[`HostConfig`] 与 [`host::run`]。

pub mod device;
pub mod host;
pub mod logging;
pub mod signal;
pub mod sink;
pub mod timer;

pub use device::{DEFAULT_DEVICE_BUFFER, StreamDevice};
pub use host::{DeviceSource, HostConfig};
pub use logging::LoggingError;
pub use sink::ConsoleSink;
pub use timer::TokioTimer;
