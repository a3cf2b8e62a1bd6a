//! 事件循环与外部协作者之间的契约：设备、定时器、行消费者与取消令牌。
//!
//! # 教案式说明
//! - **Why**：核心循环只依赖“发起请求、取消请求、等待完成”三种能力，具体 I/O 由宿主 crate 提供，
//!   这样同一套调度逻辑既能跑在 Tokio 上，也能被脚本化的测试替身驱动；
//! - **How**：每次异步请求都以 [`RequestHandle`] 表示，取消与等待完成都挂在句柄上；
//!   设备额外提供同步的“查询缓冲量/读取缓冲字节”两步，用于第二阶段读取；
//! - **What**：协作者的方法都不阻塞；唯一的挂起点是事件循环的等待阶段。

use core::{
    fmt,
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
    time::Duration,
};
use std::sync::Arc;

use futures_util::{future::poll_fn, task::AtomicWaker};

use crate::{error::SerialError, request::RequestHandle};

/// 事件循环可等待的事件来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// 外部取消信号。
    Cancellation,
    /// 设备读请求。
    Read,
    /// 周期定时器请求。
    Timer,
}

impl SourceKind {
    /// 结构化日志中使用的稳定标签。
    pub const fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Cancellation => "cancellation",
            SourceKind::Read => "read",
            SourceKind::Timer => "timer",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协作者分配的请求标识，仅用于日志关联与断言。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// 以原始序号构造标识。
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 原始序号。
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一次异步请求的最终结果。
///
/// - `Done`：请求正常完成并携带结果；
/// - `Aborted`：请求因取消而结束，没有结果；
/// - `Failed`：请求由协作者以错误结束。
#[derive(Debug)]
pub enum Completion<T> {
    /// 正常完成。
    Done(T),
    /// 因取消而结束。
    Aborted,
    /// 以错误结束。
    Failed(SerialError),
}

impl<T> Completion<T> {
    /// 是否为正常完成。
    pub fn is_done(&self) -> bool {
        matches!(self, Completion::Done(_))
    }

    /// 是否为取消结束。
    pub fn is_aborted(&self) -> bool {
        matches!(self, Completion::Aborted)
    }

    /// 转换正常完成携带的结果。
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Completion::Done(value) => Completion::Done(f(value)),
            Completion::Aborted => Completion::Aborted,
            Completion::Failed(err) => Completion::Failed(err),
        }
    }
}

/// 串口类字节设备。
///
/// # 契约说明（What）
/// - [`issue_read`](Device::issue_read)：提交一个异步读请求，至少有一个字节可用时完成，最多返回 `max_len` 字节；
///   同一时刻调用方至多持有一个读请求；
/// - [`query_available`](Device::query_available)：同步查询设备内部已缓冲、可立即读取的字节数；
/// - [`read_buffered`](Device::read_buffered)：同步读取至多 `max_len` 个已缓冲字节，不得等待新数据；
/// - [`close`](Device::close)：释放设备，调用方保证此时没有在途请求。
///
/// 打开设备属于实现者的构造函数职责，打开失败应区分 [`SerialError::DeviceInUse`] 与 [`SerialError::DeviceOpen`]。
pub trait Device {
    /// 用于日志的设备名。
    fn name(&self) -> &str;

    /// 提交异步读请求。
    fn issue_read(&mut self, max_len: usize) -> Result<RequestHandle<Vec<u8>>, SerialError>;

    /// 查询可立即读取的缓冲字节数。
    fn query_available(&mut self) -> Result<usize, SerialError>;

    /// 读取至多 `max_len` 个已缓冲字节。
    fn read_buffered(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError>;

    /// 关闭设备。
    fn close(&mut self) -> Result<(), SerialError>;
}

/// 单次触发的定时器：每次 [`arm`](Timer::arm) 提交一个在 `period` 后完成的请求。
pub trait Timer {
    /// 提交定时请求。
    fn arm(&mut self, period: Duration) -> Result<RequestHandle<()>, SerialError>;
}

/// 行事件的消费者。
///
/// 回调在事件循环的分发阶段同步执行，顺序与字节到达顺序一致。
pub trait LineSink {
    /// 一条完整的行（不含分隔符）。
    fn on_line(&mut self, line: &[u8]);

    /// 一条超长行被丢弃，携带丢弃字节数。
    fn on_drop(&mut self, byte_count: usize);

    /// 空闲周期到期。
    fn on_idle(&mut self) {}
}

impl<S: LineSink + ?Sized> LineSink for &mut S {
    fn on_line(&mut self, line: &[u8]) {
        (**self).on_line(line)
    }

    fn on_drop(&mut self, byte_count: usize) {
        (**self).on_drop(byte_count)
    }

    fn on_idle(&mut self) {
        (**self).on_idle()
    }
}

impl<S: LineSink + ?Sized> LineSink for Box<S> {
    fn on_line(&mut self, line: &[u8]) {
        (**self).on_line(line)
    }

    fn on_drop(&mut self, byte_count: usize) {
        (**self).on_drop(byte_count)
    }

    fn on_idle(&mut self) {
        (**self).on_idle()
    }
}

/// 取消令牌：单次触发、可克隆，触发时唤醒正在等待的事件循环。
///
/// # 设计动机（Why）
/// - 与运行时的取消原语保持同样的原子位语义，同时补充唤醒能力，使取消能作为等待集合中的一个来源；
///
/// # 契约说明（What）
/// - [`cancel`](Self::cancel) 返回 `true` 表示本次调用首次触发；
/// - 克隆与 [`child`](Self::child) 共享同一状态；
/// - 只保存最近一次注册的 waker，约定同一时刻只有一个等待者（事件循环本身）。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    waker: AtomicWaker,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState::default()),
        }
    }

    /// 是否已经取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 触发取消并唤醒等待者。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.waker.wake();
        }
        first
    }

    /// 派生共享同一状态的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 轮询取消状态；未取消时登记 waker。
    pub fn poll_cancelled(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_cancelled() {
            return Poll::Ready(());
        }
        self.inner.waker.register(cx.waker());
        // 登记与触发之间可能发生取消，登记后需要再检查一次。
        if self.is_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// 等待取消发生。
    pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| self.poll_cancelled(cx))
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::task::noop_waker_ref;

    #[test]
    fn cancel_fires_once_and_is_shared_with_children() {
        let token = Cancellation::new();
        let child = token.child();
        assert!(!child.is_cancelled());
        assert!(child.cancel());
        assert!(!token.cancel(), "第二次取消必须返回 false");
        assert!(token.is_cancelled());
    }

    #[test]
    fn poll_cancelled_reports_pending_then_ready() {
        let token = Cancellation::new();
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(token.poll_cancelled(&mut cx).is_pending());
        token.cancel();
        assert!(token.poll_cancelled(&mut cx).is_ready());
    }

    #[test]
    fn completion_map_preserves_variant() {
        assert!(Completion::Done(2).map(|v| v * 2).is_done());
        assert!(Completion::<u8>::Aborted.map(|v| v + 1).is_aborted());
    }
}
