//! 基于 Tokio 字节流的设备实现。
//!
//! # 教案式说明
//! - **Why**：串口驱动在内核侧持续接收字节，应用读取时拿到的是“已缓冲多少给多少”；
//!   用一个后台泵任务把任意 [`AsyncRead`] 搬进有界缓冲，就能在用户态复现同样的两阶段读取语义；
//! - **How**：泵任务写入 `parking_lot::Mutex` 保护的环形缓冲并通过 [`Notify`] 唤醒等待者；
//!   读请求等待缓冲非空后取走至多 `max_len` 字节，取消通过一次性通道与等待竞赛；
//! - **What**：缓冲满时新到字节被丢弃并计入溢出计数；输入结束后读请求保持挂起，直到被取消；
//!   输入以错误结束后，缓冲取尽时每个读请求都以该错误完成。

use std::{collections::VecDeque, io, path::Path, sync::Arc};

use parking_lot::Mutex;
use spark_serial_core::{Completion, Device, RequestHandle, RequestId, SerialError, SourceKind};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Notify, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// 设备内部缓冲的默认容量（字节）。
pub const DEFAULT_DEVICE_BUFFER: usize = 4096;

const PUMP_CHUNK: usize = 256;

#[derive(Debug, Default)]
struct StreamState {
    buffer: VecDeque<u8>,
    capacity: usize,
    overrun: u64,
    eof: bool,
    failure: Option<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<StreamState>,
    notify: Notify,
}

impl Shared {
    fn take(&self, max_len: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        let count = max_len.min(state.buffer.len());
        state.buffer.drain(..count).collect()
    }
}

/// 以字节流为后端的设备。
///
/// # 契约说明（What）
/// - 构造函数需要在 Tokio 运行时上下文中调用，以便启动泵任务；
/// - [`close`](Device::close) 停止泵任务，之后的读请求提交返回 [`SerialError::Arm`]；
/// - [`overrun_bytes`](Self::overrun_bytes) 报告因缓冲已满而丢弃的字节数。
#[derive(Debug)]
pub struct StreamDevice {
    name: String,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
    next_id: u64,
}

impl StreamDevice {
    /// 以任意字节流构建设备。
    pub fn from_reader<R>(name: impl Into<String>, reader: R, capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState {
                capacity: capacity.max(1),
                ..StreamState::default()
            }),
            notify: Notify::new(),
        });
        let pump = tokio::spawn(pump(name.clone(), reader, Arc::clone(&shared)));
        Self {
            name,
            shared,
            pump: Some(pump),
            next_id: 0,
        }
    }

    /// 以标准输入构建设备。
    pub fn stdin(capacity: usize) -> Self {
        Self::from_reader("stdin", tokio::io::stdin(), capacity)
    }

    /// 打开设备路径。
    ///
    /// 设备被占用时返回 [`SerialError::DeviceInUse`]，其余失败返回 [`SerialError::DeviceOpen`]。
    pub async fn open_path(path: impl AsRef<Path>, capacity: usize) -> Result<Self, SerialError> {
        let path = path.as_ref();
        let device = path.display().to_string();
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                info!(device = %device, capacity, "device opened");
                Ok(Self::from_reader(device, file, capacity))
            }
            Err(err) => Err(map_open_error(device, &err)),
        }
    }

    /// 当前缓冲字节数。
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// 因缓冲已满而丢弃的字节数。
    pub fn overrun_bytes(&self) -> u64 {
        self.shared.state.lock().overrun
    }

    /// 输入流是否已经结束。
    pub fn is_eof(&self) -> bool {
        self.shared.state.lock().eof
    }

    /// 输入流是否以错误结束。
    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failure.is_some()
    }

    fn is_closed(&self) -> bool {
        self.pump.is_none()
    }
}

impl Device for StreamDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn issue_read(&mut self, max_len: usize) -> Result<RequestHandle<Vec<u8>>, SerialError> {
        if self.is_closed() {
            return Err(SerialError::arm(SourceKind::Read, "device is closed"));
        }
        self.next_id += 1;
        let id = RequestId::new(self.next_id);
        let shared = Arc::clone(&self.shared);
        let (abort_tx, abort_rx) = oneshot::channel::<()>();

        let completion = async move {
            tokio::select! {
                biased;
                _ = abort_rx => Completion::Aborted,
                completion = wait_for_bytes(&shared, max_len) => completion,
            }
        };
        Ok(RequestHandle::new(id, completion, move || {
            let _ = abort_tx.send(());
        }))
    }

    fn query_available(&mut self) -> Result<usize, SerialError> {
        Ok(self.buffered())
    }

    fn read_buffered(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError> {
        Ok(self.shared.take(max_len))
    }

    fn close(&mut self) -> Result<(), SerialError> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let overrun = self.overrun_bytes();
            debug!(device = %self.name, overrun, "device pump stopped");
        }
        Ok(())
    }
}

impl Drop for StreamDevice {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn wait_for_bytes(shared: &Shared, max_len: usize) -> Completion<Vec<u8>> {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let mut state = shared.state.lock();
            if !state.buffer.is_empty() {
                let count = max_len.min(state.buffer.len());
                return Completion::Done(state.buffer.drain(..count).collect());
            }
            // 泵任务已停止，故障对之后的每个读请求都成立。
            if let Some(detail) = &state.failure {
                return Completion::Failed(SerialError::read(detail.clone()));
            }
        }
        notified.await;
    }
}

async fn pump<R>(name: String, mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; PUMP_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                shared.state.lock().eof = true;
                info!(device = %name, "device input ended; reads stay pending until cancelled");
                return;
            }
            Ok(read) => {
                {
                    let mut state = shared.state.lock();
                    let room = state.capacity - state.buffer.len();
                    let kept = read.min(room);
                    if kept < read {
                        let lost = (read - kept) as u64;
                        state.overrun += lost;
                        warn!(device = %name, lost, total = state.overrun, "device buffer overrun");
                    }
                    state.buffer.extend(&chunk[..kept]);
                }
                shared.notify.notify_waiters();
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!(device = %name, error = %err, "device read failed; pump stopped");
                shared.state.lock().failure = Some(err.to_string());
                shared.notify.notify_waiters();
                return;
            }
        }
    }
}

fn map_open_error(device: String, err: &io::Error) -> SerialError {
    match err.kind() {
        io::ErrorKind::ResourceBusy => SerialError::DeviceInUse { device },
        _ => SerialError::DeviceOpen {
            device,
            detail: err.to_string(),
        },
    }
}
