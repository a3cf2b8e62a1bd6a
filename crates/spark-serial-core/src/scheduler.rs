//! 读请求与定时请求的调度器。
//!
//! # 教案式说明
//! - **Why**：每个来源同一时刻至多一个在途请求，且完成必须被观察一次、仅一次；
//!   重复提交会泄漏请求，漏掉消费会让下一轮等待立即被陈旧完成唤醒；
//! - **How**：调度器持有两个 [`PendingRequest`] 槽位，提交前检查槽位、消费时取出句柄；
//!   读请求分两阶段：第一阶段异步等待 1 字节，第二阶段在消费时同步查询并读取已缓冲字节；
//! - **What**：提交幂等，消费即回到 `Idle`；陈旧状态会被记录为异常并强制回到 `Idle`，不会无声丢失请求。

use core::{
    task::{Context, Poll},
    time::Duration,
};

use futures_util::future::poll_fn;
use tracing::{debug, error, trace, warn};

use crate::{
    contract::{Completion, Device, SourceKind, Timer},
    error::SerialError,
    request::{PendingRequest, RequestState},
    shutdown::DrainStatus,
};

/// 一次读完成交付的原始字节块（两阶段合计）。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawChunk {
    bytes: Vec<u8>,
}

impl RawChunk {
    /// 包装字节。
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// 字节内容。
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// 字节数。
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for RawChunk {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// 提交操作的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmOutcome {
    /// 新提交了请求。
    Armed(crate::RequestId),
    /// 已有在途请求，未做任何事。
    AlreadyInFlight(crate::RequestId),
}

/// 调度器计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerCounters {
    /// 提交的读请求数。
    pub reads_issued: u64,
    /// 提交的定时请求数。
    pub timers_issued: u64,
    /// 因设备活动而取消重启的定时请求数。
    pub timers_retired: u64,
    /// 陈旧完成等记账异常数。
    pub anomalies: u64,
}

/// 读/定时请求调度器。
///
/// # 契约说明（What）
/// - [`ensure_timer_armed`](Self::ensure_timer_armed)/[`ensure_read_armed`](Self::ensure_read_armed)：
///   槽位空闲才提交，否则返回 [`ArmOutcome::AlreadyInFlight`]；
/// - [`on_read_complete`](Self::on_read_complete)/[`on_timer_complete`](Self::on_timer_complete)：
///   消费已完成的请求并把槽位置回 `Idle`，只能在等待阶段报告该来源就绪后调用；
/// - [`cancel_all`](Self::cancel_all) 只发出取消，不等待；等待由 [`drain_read`](Self::drain_read)/
///   [`drain_timer`](Self::drain_timer) 完成；
/// - 只有两个槽位都空闲时 [`close_device`](Self::close_device) 才会关闭设备。
///
/// # 风险提示（Trade-offs）
/// - 已完成但未消费的读请求不会被当作陈旧状态丢弃：其中携带数据，下一轮等待会立即交付；
///   定时请求没有负载，陈旧完成直接回收，避免下一轮等待被无意义地立即唤醒。
#[derive(Debug)]
pub struct RequestScheduler<D, T> {
    device: D,
    timer: T,
    read: PendingRequest<Vec<u8>>,
    read_limit: usize,
    tick: PendingRequest<()>,
    counters: SchedulerCounters,
}

impl<D: Device, T: Timer> RequestScheduler<D, T> {
    /// 以设备与定时器构建调度器，两个槽位初始为空闲。
    pub fn new(device: D, timer: T) -> Self {
        Self {
            device,
            timer,
            read: PendingRequest::Idle,
            read_limit: 0,
            tick: PendingRequest::Idle,
            counters: SchedulerCounters::default(),
        }
    }

    /// 设备引用。
    pub fn device(&self) -> &D {
        &self.device
    }

    /// 读槽位状态。
    pub fn read_state(&self) -> RequestState {
        self.read.state()
    }

    /// 定时槽位状态。
    pub fn timer_state(&self) -> RequestState {
        self.tick.state()
    }

    /// 两个槽位是否都空闲。
    pub fn is_quiescent(&self) -> bool {
        self.read.is_idle() && self.tick.is_idle()
    }

    /// 计数快照。
    pub fn counters(&self) -> SchedulerCounters {
        self.counters
    }

    /// 确保有一个在途定时请求。
    pub fn ensure_timer_armed(&mut self, period: Duration) -> Result<ArmOutcome, SerialError> {
        if let Some(handle) = self.tick.handle()
            && handle.is_settled()
        {
            self.counters.anomalies += 1;
            warn!(
                request = %handle.id(),
                "leaked timer completion reclaimed before re-arming"
            );
            self.tick.take();
        }
        if let Some(handle) = self.tick.handle() {
            return Ok(ArmOutcome::AlreadyInFlight(handle.id()));
        }

        let handle = self.timer.arm(period)?;
        let id = handle.id();
        self.counters.timers_issued += 1;
        trace!(
            request = %id,
            period_ms = period.as_millis() as u64,
            "timer request issued"
        );
        self.tick = PendingRequest::InFlight(handle);
        Ok(ArmOutcome::Armed(id))
    }

    /// 确保有一个在途读请求；`max_len` 是两阶段合计的上限。
    pub fn ensure_read_armed(&mut self, max_len: usize) -> Result<ArmOutcome, SerialError> {
        if let Some(handle) = self.read.handle() {
            return Ok(ArmOutcome::AlreadyInFlight(handle.id()));
        }

        let handle = self.device.issue_read(1)?;
        let id = handle.id();
        self.read_limit = max_len.max(1);
        self.counters.reads_issued += 1;
        trace!(request = %id, limit = self.read_limit, "read request issued");
        self.read = PendingRequest::InFlight(handle);
        Ok(ArmOutcome::Armed(id))
    }

    /// 轮询读请求完成。
    pub fn poll_read_settled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.read.poll_settled(cx)
    }

    /// 轮询定时请求完成。
    pub fn poll_timer_settled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.tick.poll_settled(cx)
    }

    /// 消费读完成并执行第二阶段读取。
    ///
    /// 第二阶段失败时保留第一阶段已到达的字节并记录告警。
    pub fn on_read_complete(&mut self) -> Result<RawChunk, SerialError> {
        let Some(handle) = self.read.take() else {
            self.counters.anomalies += 1;
            warn!("read completion consumed while the read slot was idle");
            return Err(SerialError::StaleCompletion {
                kind: SourceKind::Read,
            });
        };

        let mut bytes = match handle.into_settled() {
            Ok(Completion::Done(bytes)) => bytes,
            Ok(Completion::Aborted) => return Err(SerialError::read("read request was aborted")),
            Ok(Completion::Failed(err)) => return Err(err),
            Err(mut unsettled) => {
                self.counters.anomalies += 1;
                unsettled.cancel();
                warn!(
                    request = %unsettled.id(),
                    "read completion consumed before the request settled"
                );
                return Err(SerialError::StaleCompletion {
                    kind: SourceKind::Read,
                });
            }
        };

        bytes.truncate(self.read_limit);
        let room = self.read_limit - bytes.len();
        if room > 0 {
            match self.device.query_available() {
                Ok(0) => {}
                Ok(available) => {
                    let wanted = available.min(room);
                    match self.device.read_buffered(wanted) {
                        Ok(mut more) => {
                            more.truncate(wanted);
                            bytes.append(&mut more);
                        }
                        Err(err) => warn!(
                            error = %err,
                            code = err.code(),
                            "buffered read failed; keeping first byte only"
                        ),
                    }
                }
                Err(err) => warn!(
                    error = %err,
                    code = err.code(),
                    "buffered byte query failed; keeping first byte only"
                ),
            }
        }
        Ok(RawChunk::new(bytes))
    }

    /// 消费定时完成。
    pub fn on_timer_complete(&mut self) -> Result<(), SerialError> {
        let Some(handle) = self.tick.take() else {
            self.counters.anomalies += 1;
            warn!("timer completion consumed while the timer slot was idle");
            return Err(SerialError::StaleCompletion {
                kind: SourceKind::Timer,
            });
        };

        match handle.into_settled() {
            Ok(Completion::Done(())) => Ok(()),
            Ok(Completion::Aborted) => {
                debug!("timer completion reported abort");
                Ok(())
            }
            Ok(Completion::Failed(err)) => Err(err),
            Err(mut unsettled) => {
                self.counters.anomalies += 1;
                unsettled.cancel();
                warn!(
                    request = %unsettled.id(),
                    "timer completion consumed before the request settled"
                );
                Err(SerialError::StaleCompletion {
                    kind: SourceKind::Timer,
                })
            }
        }
    }

    /// 对所有在途请求发出取消，不等待完成。
    pub fn cancel_all(&mut self) {
        for (kind, issued) in [
            (
                SourceKind::Read,
                self.read.handle_mut().map(|handle| handle.cancel()),
            ),
            (
                SourceKind::Timer,
                self.tick.handle_mut().map(|handle| handle.cancel()),
            ),
        ] {
            if let Some(issued) = issued {
                debug!(source = %kind, cancel_issued = issued, "cancel requested");
            }
        }
    }

    /// 取消并排空定时请求，使下一轮提交一个全新的周期。
    pub async fn retire_timer(&mut self) -> DrainStatus {
        if self.tick.is_idle() {
            return DrainStatus::Idle;
        }
        self.counters.timers_retired += 1;
        self.drain_timer(None).await
    }

    /// 取消并排空读请求；`guard` 为排空上限。
    pub async fn drain_read(&mut self, guard: Option<Duration>) -> DrainStatus {
        drain_slot(&mut self.read, &mut self.timer, guard, SourceKind::Read).await
    }

    /// 取消并排空定时请求；`guard` 为排空上限。
    pub async fn drain_timer(&mut self, guard: Option<Duration>) -> DrainStatus {
        drain_slot(&mut self.tick, &mut self.timer, guard, SourceKind::Timer).await
    }

    /// 关闭设备；仍有在途请求时拒绝关闭。
    pub fn close_device(&mut self) -> Result<(), SerialError> {
        if !self.is_quiescent() {
            error!(
                read = ?self.read.state(),
                timer = ?self.tick.state(),
                "refusing to close device with requests in flight"
            );
            return Err(SerialError::Close {
                detail: "requests are still in flight".to_owned(),
            });
        }
        self.device.close()
    }
}

/// 取消并等待单个槽位的请求完成。
///
/// 配置了 `guard` 时借助定时器提交一个守护请求；守护先到期则强制释放请求并返回
/// [`DrainStatus::ForcedTimeout`]。守护请求本身同样被取消并排空。
async fn drain_slot<X, T: Timer>(
    slot: &mut PendingRequest<X>,
    timer: &mut T,
    guard: Option<Duration>,
    kind: SourceKind,
) -> DrainStatus {
    let Some(mut handle) = slot.take() else {
        return DrainStatus::Idle;
    };
    let id = handle.id();
    let cancel_issued = handle.cancel();
    debug!(request = %id, source = %kind, cancel_issued, "draining request");

    let mut guard_handle = match guard {
        Some(timeout) => match timer.arm(timeout) {
            Ok(guard_handle) => Some(guard_handle),
            Err(err) => {
                warn!(
                    source = %kind,
                    error = %err,
                    "drain guard unavailable; waiting without deadline"
                );
                None
            }
        },
        None => None,
    };

    let settled = poll_fn(|cx| {
        if handle.poll_settled(cx).is_ready() {
            return Poll::Ready(true);
        }
        if let Some(guard_handle) = guard_handle.as_mut()
            && guard_handle.poll_settled(cx).is_ready()
        {
            return Poll::Ready(false);
        }
        Poll::Pending
    })
    .await;

    if let Some(mut guard_handle) = guard_handle.take() {
        guard_handle.cancel();
        let _ = guard_handle.drain().await;
    }

    if !settled {
        error!(
            request = %id,
            source = %kind,
            timeout_ms = guard.map_or(0, |timeout| timeout.as_millis() as u64),
            "request ignored cancellation; released after drain timeout"
        );
        return DrainStatus::ForcedTimeout;
    }

    let status = match handle.take_settled() {
        Some(Completion::Done(_)) => DrainStatus::SettledBeforeCancel,
        Some(Completion::Failed(err)) => DrainStatus::Failed(err),
        Some(Completion::Aborted) | None => DrainStatus::Completed,
    };
    trace!(request = %id, source = %kind, status = status.as_str(), "request drained");
    status
}
