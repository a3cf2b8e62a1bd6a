use core::{fmt, time::Duration};

use tracing::{error, info, warn};

use crate::{
    contract::{Device, SourceKind, Timer},
    error::SerialError,
    event_loop::LoopStats,
    scheduler::RequestScheduler,
};

/// 单个请求的排空结果。
#[derive(Debug)]
pub enum DrainStatus {
    /// 槽位本就空闲，无需排空。
    Idle,
    /// 取消生效，请求以中止结束。
    Completed,
    /// 请求在取消生效前已正常完成，结果被丢弃。
    SettledBeforeCancel,
    /// 请求以错误结束。
    Failed(SerialError),
    /// 请求在排空超时内没有结束，被强制释放。
    ForcedTimeout,
}

impl DrainStatus {
    /// 日志标签。
    pub const fn as_str(&self) -> &'static str {
        match self {
            DrainStatus::Idle => "idle",
            DrainStatus::Completed => "completed",
            DrainStatus::SettledBeforeCancel => "settled_before_cancel",
            DrainStatus::Failed(_) => "failed",
            DrainStatus::ForcedTimeout => "forced_timeout",
        }
    }

    /// 是否为强制释放。
    pub fn is_forced(&self) -> bool {
        matches!(self, DrainStatus::ForcedTimeout)
    }
}

impl fmt::Display for DrainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 某个来源的排空记录。
#[derive(Debug)]
pub struct DrainRecord {
    source: SourceKind,
    status: DrainStatus,
}

impl DrainRecord {
    /// 构造记录。
    pub fn new(source: SourceKind, status: DrainStatus) -> Self {
        Self { source, status }
    }

    /// 来源。
    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// 结果。
    pub fn status(&self) -> &DrainStatus {
        &self.status
    }
}

/// 关闭原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 外部取消信号。
    Cancelled,
    /// 建立阶段失败。
    SetupFailed,
}

/// [`DrainManager::drain`] 的产出：排空记录与设备关闭结果。
#[derive(Debug)]
pub struct DrainOutcome {
    /// 按排空顺序排列的记录。
    pub records: Vec<DrainRecord>,
    /// 设备关闭结果。
    pub close: Result<(), SerialError>,
}

/// 关闭流程的结构化报告。
#[derive(Debug)]
pub struct ShutdownReport {
    reason: ShutdownReason,
    records: Vec<DrainRecord>,
    close: Result<(), SerialError>,
    stats: LoopStats,
}

impl ShutdownReport {
    /// 组装报告。
    pub fn new(reason: ShutdownReason, outcome: DrainOutcome, stats: LoopStats) -> Self {
        Self {
            reason,
            records: outcome.records,
            close: outcome.close,
            stats,
        }
    }

    /// 关闭原因。
    pub fn reason(&self) -> ShutdownReason {
        self.reason
    }

    /// 排空记录（先读后定时）。
    pub fn records(&self) -> &[DrainRecord] {
        &self.records
    }

    /// 查找某个来源的排空结果。
    pub fn status_of(&self, source: SourceKind) -> Option<&DrainStatus> {
        self.records
            .iter()
            .find(|record| record.source == source)
            .map(DrainRecord::status)
    }

    /// 设备关闭结果。
    pub fn close_result(&self) -> Result<(), &SerialError> {
        self.close.as_ref().map(|_| ())
    }

    /// 关闭时的循环统计。
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// 被强制释放的请求数。
    pub fn forced_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status.is_forced())
            .count()
    }

    /// 没有强制释放、没有失败且设备正常关闭。
    pub fn is_clean(&self) -> bool {
        self.close.is_ok()
            && self.records.iter().all(|record| {
                !matches!(
                    record.status,
                    DrainStatus::ForcedTimeout | DrainStatus::Failed(_)
                )
            })
    }
}

/// 关闭时的排空管理器。
///
/// # 教案式注解
/// - **问题动机 (Why)**：设备释放前必须确认没有请求仍在写入或引用它；只发出取消而不等待完成，
///   等于把请求交给已经释放的资源；
/// - **协作方式 (How)**：按固定顺序（先读请求后定时请求）逐个“取消，再等待完成”，全部空闲后关闭设备；
///   配置了 `drain_timeout` 时，每次等待都有一个借助定时器实现的守护上限；
///
/// # 契约说明 (What)
/// - **后置条件**：返回时两个槽位都为 `Idle`，设备已关闭（或关闭失败已记录）；
/// - **输出**：每个来源一条 [`DrainRecord`]，顺序固定为 Read、Timer。
///
/// # 风险提示 (Trade-offs)
/// - 强制释放只是放弃等待，协作者侧的请求可能仍未结束；此时会输出 ERROR 日志，运维需关注该设备驱动。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainManager {
    drain_timeout: Option<Duration>,
}

impl DrainManager {
    /// 以可选的排空上限构造管理器。
    pub fn new(drain_timeout: Option<Duration>) -> Self {
        Self { drain_timeout }
    }

    /// 排空上限。
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout
    }

    /// 取消并排空所有在途请求，然后关闭设备。
    pub async fn drain<D: Device, T: Timer>(
        &self,
        scheduler: &mut RequestScheduler<D, T>,
    ) -> DrainOutcome {
        let read = scheduler.drain_read(self.drain_timeout).await;
        let timer = scheduler.drain_timer(self.drain_timeout).await;
        let records = vec![
            DrainRecord::new(SourceKind::Read, read),
            DrainRecord::new(SourceKind::Timer, timer),
        ];

        for record in &records {
            match &record.status {
                DrainStatus::Failed(err) => warn!(
                    source = %record.source,
                    error = %err,
                    code = err.code(),
                    "request failed while draining"
                ),
                status => info!(source = %record.source, status = status.as_str(), "request drained"),
            }
        }

        let close = scheduler.close_device();
        match &close {
            Ok(()) => info!(device = scheduler.device().name(), "device closed"),
            Err(err) => error!(
                device = scheduler.device().name(),
                error = %err,
                code = err.code(),
                "device close failed"
            ),
        }
        DrainOutcome { records, close }
    }
}
