//! 异步请求句柄与请求槽位。
//!
//! # 教案式说明
//! - **Why**：取消一个请求并不等于请求已经结束；协作者可能在取消生效前就完成了请求。
//!   只有观察到完成，才能安全地复用槽位或释放设备，因此句柄把“完成 future”“一次性中止钩子”
//!   与“已观察到的结果”放在一起；
//! - **How**：[`RequestHandle::poll_settled`] 把完成结果缓存到句柄内部，之后的轮询立即就绪；
//!   [`RequestHandle::cancel`] 只发出中止请求，不代表完成，调用方仍需 [`RequestHandle::drain`]；
//! - **What**：[`PendingRequest`] 是每个来源的槽位，`Idle` 与 `InFlight` 两态，状态迁移只由调度器驱动。

use core::{
    fmt,
    future::Future,
    mem,
    task::{Context, Poll},
};

use futures_util::future::{BoxFuture, poll_fn};

use crate::contract::{Completion, RequestId};

type AbortHook = Box<dyn FnOnce() + Send + 'static>;

/// 一次在途异步请求的句柄。
pub struct RequestHandle<T> {
    id: RequestId,
    completion: BoxFuture<'static, Completion<T>>,
    abort: Option<AbortHook>,
    settled: Option<Completion<T>>,
    cancel_requested: bool,
}

impl<T: Send + 'static> RequestHandle<T> {
    /// 以完成 future 与中止钩子构造句柄。
    ///
    /// 中止钩子至多被调用一次；调用后完成 future 仍必须最终就绪（通常以 [`Completion::Aborted`]）。
    pub fn new<F, A>(id: RequestId, completion: F, abort: A) -> Self
    where
        F: Future<Output = Completion<T>> + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        Self {
            id,
            completion: Box::pin(completion),
            abort: Some(Box::new(abort)),
            settled: None,
            cancel_requested: false,
        }
    }

    /// 构造一个已经完成的句柄，用于同步即可得出结果的协作者。
    pub fn settled(id: RequestId, completion: Completion<T>) -> Self {
        Self {
            id,
            completion: Box::pin(futures_util::future::pending()),
            abort: None,
            settled: Some(completion),
            cancel_requested: false,
        }
    }
}

impl<T> RequestHandle<T> {
    /// 请求标识。
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// 是否已观察到完成。
    pub fn is_settled(&self) -> bool {
        self.settled.is_some()
    }

    /// 是否已经发出过取消。
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// 轮询完成；完成结果缓存在句柄内部，重复轮询立即就绪。
    pub fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.settled.is_some() {
            return Poll::Ready(());
        }
        match self.completion.as_mut().poll(cx) {
            Poll::Ready(completion) => {
                self.settled = Some(completion);
                self.abort = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// 发出取消。
    ///
    /// 返回 `true` 表示本次调用触发了中止钩子；已完成或已取消过的请求返回 `false`。
    /// 取消之后请求仍处于在途状态，直到完成被观察到。
    pub fn cancel(&mut self) -> bool {
        if self.settled.is_some() {
            return false;
        }
        match self.abort.take() {
            Some(hook) => {
                hook();
                self.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    /// 等待完成并取出结果，不发出取消。
    pub async fn drain(mut self) -> Completion<T> {
        poll_fn(|cx| self.poll_settled(cx)).await;
        self.take_settled().unwrap_or(Completion::Aborted)
    }

    /// 取出已缓存的结果。
    pub fn take_settled(&mut self) -> Option<Completion<T>> {
        self.settled.take()
    }

    /// 若已完成则返回结果，否则原样交还句柄。
    pub fn into_settled(mut self) -> Result<Completion<T>, Self> {
        match self.settled.take() {
            Some(completion) => Ok(completion),
            None => Err(self),
        }
    }
}

impl<T> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("settled", &self.settled.is_some())
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}

/// 槽位状态的可复制快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// 没有在途请求。
    Idle,
    /// 有在途请求。
    InFlight(RequestId),
}

impl RequestState {
    /// 是否有在途请求。
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RequestState::InFlight(_))
    }
}

/// 单个事件来源的请求槽位。
#[derive(Debug)]
pub enum PendingRequest<T> {
    /// 没有在途请求。
    Idle,
    /// 有一个在途请求，可能已完成但尚未被消费。
    InFlight(RequestHandle<T>),
}

impl<T> Default for PendingRequest<T> {
    fn default() -> Self {
        PendingRequest::Idle
    }
}

impl<T> PendingRequest<T> {
    /// 当前状态快照。
    pub fn state(&self) -> RequestState {
        match self {
            PendingRequest::Idle => RequestState::Idle,
            PendingRequest::InFlight(handle) => RequestState::InFlight(handle.id()),
        }
    }

    /// 是否空闲。
    pub fn is_idle(&self) -> bool {
        matches!(self, PendingRequest::Idle)
    }

    /// 在途句柄。
    pub fn handle(&self) -> Option<&RequestHandle<T>> {
        match self {
            PendingRequest::Idle => None,
            PendingRequest::InFlight(handle) => Some(handle),
        }
    }

    /// 在途句柄（可变）。
    pub fn handle_mut(&mut self) -> Option<&mut RequestHandle<T>> {
        match self {
            PendingRequest::Idle => None,
            PendingRequest::InFlight(handle) => Some(handle),
        }
    }

    /// 取出在途句柄并把槽位置回 `Idle`。
    pub fn take(&mut self) -> Option<RequestHandle<T>> {
        match mem::replace(self, PendingRequest::Idle) {
            PendingRequest::InFlight(handle) => Some(handle),
            PendingRequest::Idle => None,
        }
    }

    /// 轮询在途请求的完成；空闲槽位永远不会就绪。
    pub fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self {
            PendingRequest::Idle => Poll::Pending,
            PendingRequest::InFlight(handle) => handle.poll_settled(cx),
        }
    }
}
