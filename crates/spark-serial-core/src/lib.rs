#![warn(missing_docs)]

//! `spark-serial-core` 提供串口行读取的运行时无关核心：请求调度、单线程事件循环与关闭排空。
//!
//! # 教案背景（Why）
//! - 串口读取、周期定时与外部取消都是异步请求，必须在一个挂起点上统一等待；
//! - 每个来源同一时刻至多一个在途请求，取消后必须等待完成才能复用或释放资源；
//! - 核心不绑定任何执行器，只依赖 `futures-util` 的基础设施，宿主（如 `spark-serial-tokio`）提供真实 I/O。
//!
//! # 模块地图（How）
//! - [`contract`]：协作者契约（[`Device`]、[`Timer`]、[`LineSink`]）与 [`Cancellation`]；
//! - [`request`]：[`RequestHandle`] 与每个来源的 [`PendingRequest`] 槽位；
//! - [`scheduler`]：[`RequestScheduler`]，负责提交、消费与排空请求；
//! - [`event_loop`]：[`EventLoop`]，串联建立、等待、分发与关闭；
//! - [`shutdown`]：[`DrainManager`] 与 [`ShutdownReport`]；
//! - [`configuration`]：[`SerialSettings`]；
//! - [`error`]：[`SerialError`] 与稳定错误码。
//!
//! # 合约说明（What）
//! - 行与丢弃事件按字节到达顺序交付给 [`LineSink`]；
//! - 只有建立阶段失败会让 [`EventLoop::run`] 返回错误，其余失败计入统计并在下一轮重试；
//! - 设备只在所有请求排空之后关闭。

pub mod configuration;
pub mod contract;
pub mod error;
pub mod event_loop;
pub mod request;
pub mod scheduler;
pub mod shutdown;

pub use configuration::{DEFAULT_IDLE_PERIOD, DEFAULT_RAW_CAPACITY, SerialSettings};
pub use contract::{Cancellation, Completion, Device, LineSink, RequestId, SourceKind, Timer};
pub use error::{ConfigError, SerialError, SettingsField, SetupStage, codes};
pub use event_loop::{CycleOutcome, EventLoop, LoopState, LoopStats, Wake, WaitSet};
pub use request::{PendingRequest, RequestHandle, RequestState};
pub use scheduler::{ArmOutcome, RawChunk, RequestScheduler, SchedulerCounters};
pub use shutdown::{
    DrainManager, DrainOutcome, DrainRecord, DrainStatus, ShutdownReason, ShutdownReport,
};
pub use spark_serial_line::{DelimiterMode, LineAssembler, LineEvent};
