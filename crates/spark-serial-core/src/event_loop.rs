//! 单线程事件循环：提交请求、在等待集合上挂起、按固定顺序分发完成。
//!
//! # 教案式说明
//! - **Why**：读、定时与取消三个来源共用一个挂起点，循环才能在静默时定期醒来、在取消时立即退出，
//!   同时保证每个来源至多一个在途请求；
//! - **How**：每一轮依次经过 `Arming`（补齐空闲来源的请求）、`Waiting`（一次 `poll_fn` 同时轮询三个来源）、
//!   `Dispatching`（按“取消、读、定时”的顺序处理本轮触发的全部来源）；
//! - **What**：只有建立阶段失败会让循环以错误结束；其余失败计数并记录后在下一轮重试，
//!   取消之后进入 [`DrainManager`] 的排空流程并给出 [`ShutdownReport`]。

use core::{mem, task::Poll};

use futures_util::future::poll_fn;
use spark_serial_line::{LineAssembler, LineEvent};
use tracing::{debug, error, info, trace, warn};

use crate::{
    configuration::SerialSettings,
    contract::{Cancellation, Device, LineSink, SourceKind, Timer},
    error::{SerialError, SetupStage},
    scheduler::RequestScheduler,
    shutdown::{DrainManager, DrainOutcome, DrainStatus, ShutdownReason, ShutdownReport},
};

/// 事件循环所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// 尚未启动。
    Idle,
    /// 正在补齐请求。
    Arming,
    /// 挂起等待。
    Waiting,
    /// 正在分发完成。
    Dispatching,
    /// 已进入关闭流程。
    ShuttingDown,
}

/// 本轮等待的来源集合；取消始终在集合内。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitSet {
    read: bool,
    timer: bool,
}

impl WaitSet {
    /// 集合是否包含某个来源。
    pub fn includes(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Cancellation => true,
            SourceKind::Read => self.read,
            SourceKind::Timer => self.timer,
        }
    }

    /// 除取消外没有任何来源。
    pub fn is_cancellation_only(&self) -> bool {
        !self.read && !self.timer
    }
}

/// 一次等待中触发的来源。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Wake {
    /// 取消已触发。
    pub cancelled: bool,
    /// 读请求已完成。
    pub read: bool,
    /// 定时请求已完成。
    pub timer: bool,
}

impl Wake {
    /// 没有任何来源触发。
    pub fn is_empty(&self) -> bool {
        !self.cancelled && !self.read && !self.timer
    }
}

/// 单轮循环的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 继续下一轮。
    Continue,
    /// 取消已观察到，应进入关闭流程。
    ShutdownRequested,
}

/// 循环统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// 完成的轮数。
    pub cycles: u64,
    /// 读到的字节总数。
    pub bytes_read: u64,
    /// 交付的行数。
    pub lines: u64,
    /// 丢弃的超长行数。
    pub drops: u64,
    /// 丢弃的字节数。
    pub dropped_bytes: u64,
    /// 空闲周期到期次数。
    pub idle_ticks: u64,
    /// 因设备活动而重启定时器的次数。
    pub timer_restarts: u64,
    /// 请求失败次数（提交、读取或定时失败）。
    pub request_failures: u64,
    /// 记账异常次数。
    pub anomalies: u64,
}

/// 串口行读取事件循环。
///
/// # 教案式注解
/// - **架构定位 (Where)**：位于宿主适配层之下，拥有调度器、行组装器与行消费者的全部状态；
/// - **协作方式 (How)**：[`run`](Self::run) 串联 [`start`](Self::start)、若干次 [`turn`](Self::turn)
///   与 [`shutdown`](Self::shutdown)；测试可以逐轮驱动；
///
/// # 契约说明 (What)
/// - 分发顺序固定：取消优先且独占本轮；读完成先于定时完成；
/// - 读到数据而定时器未触发时（`restart_timer_on_activity`），定时请求被取消并排空，下一轮提交新的周期；
/// - 任何来源都不会被无声放弃：退出前所有在途请求都经过“取消，再排空”。
pub struct EventLoop<D, T, S> {
    scheduler: RequestScheduler<D, T>,
    assembler: LineAssembler,
    sink: S,
    cancellation: Cancellation,
    settings: SerialSettings,
    state: LoopState,
    stats: LoopStats,
    events: Vec<LineEvent>,
    closed: bool,
    skipped_wait: bool,
}

impl<D: Device, T: Timer, S: LineSink> EventLoop<D, T, S> {
    /// 组装事件循环；设置应已通过 [`SerialSettings::validate`]。
    pub fn new(
        device: D,
        timer: T,
        sink: S,
        cancellation: Cancellation,
        settings: SerialSettings,
    ) -> Self {
        Self {
            scheduler: RequestScheduler::new(device, timer),
            assembler: settings.build_assembler(),
            sink,
            cancellation,
            settings,
            state: LoopState::Idle,
            stats: LoopStats::default(),
            events: Vec::new(),
            closed: false,
            skipped_wait: false,
        }
    }

    /// 当前阶段。
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// 统计快照。
    pub fn stats(&self) -> LoopStats {
        LoopStats {
            anomalies: self.scheduler.counters().anomalies,
            ..self.stats
        }
    }

    /// 调度器。
    pub fn scheduler(&self) -> &RequestScheduler<D, T> {
        &self.scheduler
    }

    /// 行组装器。
    pub fn assembler(&self) -> &LineAssembler {
        &self.assembler
    }

    /// 行消费者。
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// 行消费者（可变）。
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// 生效的设置。
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// 当前在途请求构成的等待集合。
    pub fn wait_set(&self) -> WaitSet {
        WaitSet {
            read: self.scheduler.read_state().is_in_flight(),
            timer: self.scheduler.timer_state().is_in_flight(),
        }
    }

    /// 建立阶段：先提交定时请求（若启用），再提交首个读请求。
    ///
    /// 任一步失败都视为建立失败：已提交的请求被取消并排空，设备关闭，返回 [`SerialError::Setup`]。
    pub async fn start(&mut self) -> Result<(), SerialError> {
        self.state = LoopState::Arming;
        info!(
            device = self.scheduler.device().name(),
            raw_capacity = self.settings.raw_capacity(),
            line_capacity = self.settings.line_capacity(),
            idle_ms = self
                .settings
                .idle_period()
                .map_or(0, |period| period.as_millis() as u64),
            "serial loop starting"
        );

        if let Some(period) = self.settings.idle_period()
            && let Err(err) = self.scheduler.ensure_timer_armed(period)
        {
            return Err(self.abort_setup(SetupStage::ArmTimer, err).await);
        }
        if let Err(err) = self
            .scheduler
            .ensure_read_armed(self.settings.raw_capacity())
        {
            return Err(self.abort_setup(SetupStage::ArmRead, err).await);
        }
        Ok(())
    }

    /// 执行一轮“补齐、等待、分发”。
    pub async fn turn(&mut self) -> CycleOutcome {
        if self.state == LoopState::ShuttingDown {
            return CycleOutcome::ShutdownRequested;
        }
        self.stats.cycles += 1;

        self.state = LoopState::Arming;
        let arm_failed = self.arm();

        self.state = LoopState::Waiting;
        self.skipped_wait = arm_failed && self.wait_set().is_cancellation_only();
        let wake = if self.skipped_wait {
            // 无可等待的请求时不挂起，下一轮立即重新提交。
            Wake {
                cancelled: self.cancellation.is_cancelled(),
                ..Wake::default()
            }
        } else {
            self.wait().await
        };
        trace!(
            cancelled = wake.cancelled,
            read = wake.read,
            timer = wake.timer,
            "loop woke"
        );

        self.state = LoopState::Dispatching;
        if wake.cancelled {
            info!("cancellation observed; shutting down");
            self.state = LoopState::ShuttingDown;
            return CycleOutcome::ShutdownRequested;
        }
        if wake.read {
            self.dispatch_read();
        }
        if wake.timer {
            self.dispatch_timer();
        }
        if wake.read
            && !wake.timer
            && self.settings.restart_timer_on_activity()
            && self.scheduler.timer_state().is_in_flight()
        {
            self.restart_timer().await;
        }
        CycleOutcome::Continue
    }

    /// 完整运行：建立、循环直到取消、排空并关闭。
    pub async fn run(mut self) -> Result<ShutdownReport, SerialError> {
        self.start().await?;
        while self.turn().await == CycleOutcome::Continue {
            if self.skipped_wait {
                yield_once().await;
            }
        }
        Ok(self.shutdown(ShutdownReason::Cancelled).await)
    }

    /// 关闭流程：排空所有在途请求、关闭设备、冲刷行组装器。
    pub async fn shutdown(mut self, reason: ShutdownReason) -> ShutdownReport {
        self.teardown(reason).await
    }

    /// 补齐空闲来源的请求；返回本轮是否有提交失败。
    fn arm(&mut self) -> bool {
        let mut failed = false;
        if let Some(period) = self.settings.idle_period()
            && let Err(err) = self.scheduler.ensure_timer_armed(period)
        {
            failed = true;
            self.stats.request_failures += 1;
            warn!(
                error = %err,
                code = err.code(),
                "timer request failed; retrying next cycle"
            );
        }
        if let Err(err) = self
            .scheduler
            .ensure_read_armed(self.settings.raw_capacity())
        {
            failed = true;
            self.stats.request_failures += 1;
            warn!(
                error = %err,
                code = err.code(),
                "read request failed; retrying next cycle"
            );
        }
        if failed && self.wait_set().is_cancellation_only() {
            warn!("no request in flight; retrying without waiting");
        }
        failed
    }

    async fn wait(&mut self) -> Wake {
        let set = self.wait_set();
        let cancellation = &self.cancellation;
        let scheduler = &mut self.scheduler;
        poll_fn(|cx| {
            let wake = Wake {
                cancelled: cancellation.poll_cancelled(cx).is_ready(),
                read: set.read && scheduler.poll_read_settled(cx).is_ready(),
                timer: set.timer && scheduler.poll_timer_settled(cx).is_ready(),
            };
            if wake.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(wake)
            }
        })
        .await
    }

    fn dispatch_read(&mut self) {
        match self.scheduler.on_read_complete() {
            Ok(chunk) => {
                self.stats.bytes_read += chunk.len() as u64;
                trace!(len = chunk.len(), "serial chunk received");
                let mut events = mem::take(&mut self.events);
                self.assembler.feed_into(chunk.as_bytes(), &mut events);
                for event in events.drain(..) {
                    deliver(&mut self.sink, &mut self.stats, event);
                }
                self.events = events;
            }
            Err(SerialError::StaleCompletion { .. }) => {}
            Err(err) => {
                self.stats.request_failures += 1;
                warn!(
                    error = %err,
                    code = err.code(),
                    "read completed with failure; re-arming next cycle"
                );
            }
        }
    }

    fn dispatch_timer(&mut self) {
        match self.scheduler.on_timer_complete() {
            Ok(()) => {
                self.stats.idle_ticks += 1;
                debug!("idle period elapsed");
                self.sink.on_idle();
            }
            Err(SerialError::StaleCompletion { .. }) => {}
            Err(err) => {
                self.stats.request_failures += 1;
                warn!(
                    error = %err,
                    code = err.code(),
                    "timer completed with failure; re-arming next cycle"
                );
            }
        }
    }

    async fn restart_timer(&mut self) {
        let status = self.scheduler.retire_timer().await;
        self.stats.timer_restarts += 1;
        match status {
            DrainStatus::Failed(err) => warn!(
                error = %err,
                code = err.code(),
                "retired timer completed with failure"
            ),
            status => trace!(status = status.as_str(), "idle timer restarted after activity"),
        }
    }

    async fn abort_setup(&mut self, stage: SetupStage, cause: SerialError) -> SerialError {
        error!(
            stage = %stage,
            error = %cause,
            code = cause.code(),
            "setup failed; draining partially armed requests"
        );
        let report = self.teardown(ShutdownReason::SetupFailed).await;
        debug!(
            forced = report.forced_count(),
            clean = report.is_clean(),
            "setup teardown finished"
        );
        SerialError::setup(stage, cause)
    }

    async fn teardown(&mut self, reason: ShutdownReason) -> ShutdownReport {
        self.state = LoopState::ShuttingDown;
        let outcome = if self.closed {
            DrainOutcome {
                records: Vec::new(),
                close: Ok(()),
            }
        } else {
            self.closed = true;
            DrainManager::new(self.settings.drain_timeout())
                .drain(&mut self.scheduler)
                .await
        };
        if let Some(event) = self.assembler.finish() {
            deliver(&mut self.sink, &mut self.stats, event);
        }
        let stats = self.stats();
        info!(
            reason = ?reason,
            cycles = stats.cycles,
            lines = stats.lines,
            drops = stats.drops,
            "serial loop stopped"
        );
        ShutdownReport::new(reason, outcome, stats)
    }
}

/// 让出一次执行权，避免提交持续失败时独占执行器。
async fn yield_once() {
    let mut yielded = false;
    poll_fn(|cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}

fn deliver<S: LineSink>(sink: &mut S, stats: &mut LoopStats, event: LineEvent) {
    match event {
        LineEvent::Line(line) => {
            stats.lines += 1;
            debug!(len = line.len(), "processing line");
            sink.on_line(&line);
        }
        LineEvent::Dropped(count) => {
            stats.drops += 1;
            stats.dropped_bytes += count as u64;
            warn!(bytes = count, "discarding long line");
            sink.on_drop(count);
        }
    }
}
