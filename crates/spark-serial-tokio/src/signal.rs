//! 进程信号到取消令牌的桥接。

use spark_serial_core::Cancellation;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 监听 Ctrl-C，收到后触发取消。
///
/// 返回监听任务的句柄；需要在 Tokio 运行时上下文中调用。
pub fn install_ctrl_c(cancellation: Cancellation) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; cancelling serial loop");
                cancellation.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for interrupt signal"),
        }
    })
}
