//! 事件循环集成测试共用的脚本化协作者。
//!
//! - `ScriptedDevice`：字节由测试通过 `DeviceController::push` 注入，挂起的读请求在有数据时立即完成；
//! - `ManualTimer`：定时请求只在测试调用 `TimerController::fire` 时完成，可配置为对特定周期立即完成；
//! - `Journal`：设备与定时器共享的操作日志，用于断言取消、排空与关闭的先后顺序。
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use futures::channel::oneshot;
use spark_serial_core::{
    Completion, Device, LineSink, RequestHandle, RequestId, SerialError, SourceKind, Timer,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("测试状态锁不应中毒")
}

/// 协作者共享的操作日志。
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }
}

struct PendingRead {
    id: RequestId,
    max_len: usize,
    sender: oneshot::Sender<Completion<Vec<u8>>>,
}

#[derive(Default)]
struct DeviceState {
    buffered: VecDeque<u8>,
    pending: Option<PendingRead>,
    next_id: u64,
    issued: usize,
    aborted: usize,
    ignore_cancel: bool,
    fail_next_issue: bool,
    fail_query: bool,
    close_calls: usize,
    in_flight_at_close: bool,
}

impl DeviceState {
    fn complete_pending(&mut self) {
        if self.buffered.is_empty() {
            return;
        }
        if let Some(pending) = self.pending.take() {
            let take = pending.max_len.min(self.buffered.len());
            let bytes: Vec<u8> = self.buffered.drain(..take).collect();
            let _ = pending.sender.send(Completion::Done(bytes));
        }
    }
}

/// 测试侧对脚本化设备的控制柄。
#[derive(Clone)]
pub struct DeviceController {
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceController {
    /// 注入字节；若有挂起的读请求则立即完成它。
    pub fn push(&self, bytes: &[u8]) {
        let mut state = lock(&self.state);
        state.buffered.extend(bytes.iter().copied());
        state.complete_pending();
    }

    /// 以错误结束挂起的读请求。
    pub fn fail_pending(&self, detail: &str) {
        let mut state = lock(&self.state);
        if let Some(pending) = state.pending.take() {
            let _ = pending
                .sender
                .send(Completion::Failed(SerialError::read(detail)));
        }
    }

    pub fn ignore_cancel(&self, ignore: bool) {
        lock(&self.state).ignore_cancel = ignore;
    }

    pub fn fail_next_issue(&self) {
        lock(&self.state).fail_next_issue = true;
    }

    pub fn fail_query(&self, fail: bool) {
        lock(&self.state).fail_query = fail;
    }

    pub fn issued(&self) -> usize {
        lock(&self.state).issued
    }

    pub fn aborted(&self) -> usize {
        lock(&self.state).aborted
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    pub fn buffered(&self) -> usize {
        lock(&self.state).buffered.len()
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    pub fn closed_with_request_in_flight(&self) -> bool {
        lock(&self.state).in_flight_at_close
    }
}

/// 脚本化设备。
pub struct ScriptedDevice {
    state: Arc<Mutex<DeviceState>>,
    journal: Journal,
}

impl ScriptedDevice {
    pub fn new(journal: Journal) -> (Self, DeviceController) {
        let state = Arc::new(Mutex::new(DeviceState::default()));
        (
            Self {
                state: Arc::clone(&state),
                journal,
            },
            DeviceController { state },
        )
    }
}

impl Device for ScriptedDevice {
    fn name(&self) -> &str {
        "scripted"
    }

    fn issue_read(&mut self, max_len: usize) -> Result<RequestHandle<Vec<u8>>, SerialError> {
        let mut state = lock(&self.state);
        if state.fail_next_issue {
            state.fail_next_issue = false;
            return Err(SerialError::arm(SourceKind::Read, "scripted issue failure"));
        }
        state.next_id += 1;
        state.issued += 1;
        let id = RequestId::new(state.next_id);
        self.journal.record("read:issue");

        let (sender, receiver) = oneshot::channel();
        state.pending = Some(PendingRead {
            id,
            max_len,
            sender,
        });
        state.complete_pending();

        let shared = Arc::clone(&self.state);
        let journal = self.journal.clone();
        Ok(RequestHandle::new(
            id,
            async move { receiver.await.unwrap_or(Completion::Aborted) },
            move || {
                journal.record("read:abort");
                let mut state = lock(&shared);
                state.aborted += 1;
                if !state.ignore_cancel
                    && let Some(pending) = state.pending.take()
                {
                    let _ = pending.sender.send(Completion::Aborted);
                }
            },
        ))
    }

    fn query_available(&mut self) -> Result<usize, SerialError> {
        let state = lock(&self.state);
        if state.fail_query {
            return Err(SerialError::Query {
                detail: "scripted query failure".to_owned(),
            });
        }
        Ok(state.buffered.len())
    }

    fn read_buffered(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError> {
        let mut state = lock(&self.state);
        let take = max_len.min(state.buffered.len());
        Ok(state.buffered.drain(..take).collect())
    }

    fn close(&mut self) -> Result<(), SerialError> {
        let mut state = lock(&self.state);
        state.close_calls += 1;
        state.in_flight_at_close = state.pending.is_some();
        self.journal.record("device:close");
        Ok(())
    }
}

struct PendingTick {
    id: RequestId,
    period: Duration,
    sender: oneshot::Sender<Completion<()>>,
}

#[derive(Default)]
struct TimerState {
    pending: Vec<PendingTick>,
    instant: Vec<Duration>,
    next_id: u64,
    armed: Vec<Duration>,
    aborted: usize,
    ignore_cancel: bool,
    fail_next_arm: bool,
}

/// 测试侧对手动定时器的控制柄。
#[derive(Clone)]
pub struct TimerController {
    state: Arc<Mutex<TimerState>>,
}

impl TimerController {
    /// 触发所有周期为 `period` 的挂起请求，返回触发数量。
    pub fn fire(&self, period: Duration) -> usize {
        let mut state = lock(&self.state);
        let (due, rest): (Vec<_>, Vec<_>) = state
            .pending
            .drain(..)
            .partition(|tick| tick.period == period);
        state.pending = rest;
        let fired = due.len();
        for tick in due {
            let _ = tick.sender.send(Completion::Done(()));
        }
        fired
    }

    /// 对给定周期的请求在提交时立即完成。
    pub fn complete_instantly(&self, period: Duration) {
        lock(&self.state).instant.push(period);
    }

    pub fn ignore_cancel(&self, ignore: bool) {
        lock(&self.state).ignore_cancel = ignore;
    }

    pub fn fail_next_arm(&self) {
        lock(&self.state).fail_next_arm = true;
    }

    pub fn armed(&self) -> Vec<Duration> {
        lock(&self.state).armed.clone()
    }

    pub fn aborted(&self) -> usize {
        lock(&self.state).aborted
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

/// 手动定时器。
pub struct ManualTimer {
    state: Arc<Mutex<TimerState>>,
    journal: Journal,
}

impl ManualTimer {
    pub fn new(journal: Journal) -> (Self, TimerController) {
        let state = Arc::new(Mutex::new(TimerState::default()));
        (
            Self {
                state: Arc::clone(&state),
                journal,
            },
            TimerController { state },
        )
    }
}

impl Timer for ManualTimer {
    fn arm(&mut self, period: Duration) -> Result<RequestHandle<()>, SerialError> {
        let mut state = lock(&self.state);
        if state.fail_next_arm {
            state.fail_next_arm = false;
            return Err(SerialError::arm(SourceKind::Timer, "scripted arm failure"));
        }
        state.next_id += 1;
        state.armed.push(period);
        let id = RequestId::new(state.next_id);
        self.journal.record("timer:arm");

        if state.instant.contains(&period) {
            return Ok(RequestHandle::settled(id, Completion::Done(())));
        }

        let (sender, receiver) = oneshot::channel();
        state.pending.push(PendingTick {
            id,
            period,
            sender,
        });

        let shared = Arc::clone(&self.state);
        let journal = self.journal.clone();
        Ok(RequestHandle::new(
            id,
            async move { receiver.await.unwrap_or(Completion::Aborted) },
            move || {
                journal.record("timer:abort");
                let mut state = lock(&shared);
                state.aborted += 1;
                if state.ignore_cancel {
                    return;
                }
                if let Some(index) = state.pending.iter().position(|tick| tick.id == id) {
                    let tick = state.pending.remove(index);
                    let _ = tick.sender.send(Completion::Aborted);
                }
            },
        ))
    }
}

/// 记录所有回调的行消费者；`events` 保留跨回调类型的先后顺序。
#[derive(Debug, Default)]
pub struct Recorder {
    pub lines: Vec<String>,
    pub drops: Vec<usize>,
    pub idles: usize,
    pub events: Vec<String>,
}

impl LineSink for Recorder {
    fn on_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line).into_owned();
        self.events.push(format!("line:{text}"));
        self.lines.push(text);
    }

    fn on_drop(&mut self, byte_count: usize) {
        self.events.push(format!("drop:{byte_count}"));
        self.drops.push(byte_count);
    }

    fn on_idle(&mut self) {
        self.events.push("idle".to_owned());
        self.idles += 1;
    }
}

/// 让出一次执行权。
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// 连续让出若干次，确保同一任务中被 `join!` 的事件循环推进到下一个挂起点。
pub async fn settle() {
    for _ in 0..8 {
        yield_now().await;
    }
}

/// 测试侧的控制柄集合。
#[derive(Clone)]
pub struct Controls {
    pub journal: Journal,
    pub device: DeviceController,
    pub timer: TimerController,
}

/// 构建共享同一操作日志的设备、定时器与控制柄。
pub fn harness() -> (ScriptedDevice, ManualTimer, Controls) {
    let journal = Journal::default();
    let (device, device_ctl) = ScriptedDevice::new(journal.clone());
    let (timer, timer_ctl) = ManualTimer::new(journal.clone());
    (
        device,
        timer,
        Controls {
            journal,
            device: device_ctl,
            timer: timer_ctl,
        },
    )
}
