use std::io::{self, Stdout, Write};

use spark_serial_core::LineSink;
use tracing::warn;

/// 把每一行写入 `Write` 的行消费者。
///
/// - 行以原始字节写出并追加 `\n`；丢弃事件只计数，不写入输出，保持输出中只有完整行；
/// - 空闲周期到期时冲刷输出；
/// - 写入失败不会中断事件循环，只记录第一次失败并累计次数。
#[derive(Debug)]
pub struct ConsoleSink<W: Write> {
    writer: W,
    lines: u64,
    dropped_lines: u64,
    write_errors: u64,
}

impl ConsoleSink<Stdout> {
    /// 写到标准输出。
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleSink<W> {
    /// 包装任意写出端。
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            lines: 0,
            dropped_lines: 0,
            write_errors: 0,
        }
    }

    /// 已写出的行数。
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// 被丢弃的超长行数。
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    /// 写入失败次数。
    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    /// 取回写出端。
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn record_failure(&mut self, err: &io::Error) {
        if self.write_errors == 0 {
            warn!(error = %err, "failed to write line output");
        }
        self.write_errors += 1;
    }
}

impl<W: Write> LineSink for ConsoleSink<W> {
    fn on_line(&mut self, line: &[u8]) {
        let result = self
            .writer
            .write_all(line)
            .and_then(|()| self.writer.write_all(b"\n"));
        match result {
            Ok(()) => self.lines += 1,
            Err(err) => self.record_failure(&err),
        }
    }

    fn on_drop(&mut self, _byte_count: usize) {
        self.dropped_lines += 1;
    }

    fn on_idle(&mut self) {
        if let Err(err) = self.writer.flush() {
            self.record_failure(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines_and_counts_drops() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.on_line(b"hello");
        sink.on_drop(300);
        sink.on_line(b"world");
        sink.on_idle();
        assert_eq!(sink.lines(), 2);
        assert_eq!(sink.dropped_lines(), 1);
        assert_eq!(sink.into_inner(), b"hello\nworld\n");
    }
}
