use std::time::Duration;

use spark_serial_core::{Completion, RequestHandle, RequestId, SerialError, Timer};
use tokio::sync::oneshot;

/// 基于 `tokio::time::sleep` 的单次定时器。
///
/// 每次提交生成一个独立的睡眠 future；取消通过一次性通道与睡眠竞赛，取消优先。
/// 完成 future 必须在 Tokio 运行时中轮询。
#[derive(Debug, Default)]
pub struct TokioTimer {
    next_id: u64,
}

impl TokioTimer {
    /// 构造定时器。
    pub fn new() -> Self {
        Self::default()
    }
}

impl Timer for TokioTimer {
    fn arm(&mut self, period: Duration) -> Result<RequestHandle<()>, SerialError> {
        self.next_id += 1;
        let (abort_tx, abort_rx) = oneshot::channel::<()>();
        let completion = async move {
            tokio::select! {
                biased;
                _ = abort_rx => Completion::Aborted,
                _ = tokio::time::sleep(period) => Completion::Done(()),
            }
        };
        Ok(RequestHandle::new(
            RequestId::new(self.next_id),
            completion,
            move || {
                let _ = abort_tx.send(());
            },
        ))
    }
}
