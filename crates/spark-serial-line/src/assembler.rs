use alloc::vec::Vec;
use core::mem;

use crate::{DEFAULT_LINE_CAPACITY, NEWLINE};

/// 单个字节块内分隔符的处理策略。
///
/// # 教案式说明
/// - **Why**：早期串口工具每次解析只识别块内第一个分隔符，其余原样并入下一行；已有发送端可能依赖这一行为，
///   因此保留为可选兼容模式，而默认行为是逐个分隔符切分；
/// - **What**：`EveryDelimiter` 对块内每个分隔符都完成一行；`FirstPerChunk` 只承认首个分隔符，
///   剩余字节（包括其中的分隔符）逐字节写入行缓冲。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DelimiterMode {
    /// 块内每个分隔符都结束一行。
    #[default]
    EveryDelimiter,
    /// 仅块内第一个分隔符结束一行，其余分隔符视为普通字节。
    FirstPerChunk,
}

/// 组装器对外产生的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
    /// 一条完整的行，不含分隔符。
    Line(Vec<u8>),
    /// 行缓冲溢出，携带本次溢出丢弃的字节数（原缓冲加新块，不含分隔符）。
    Dropped(usize),
}

impl LineEvent {
    /// 若为完整行则返回行内容。
    pub fn as_line(&self) -> Option<&[u8]> {
        match self {
            LineEvent::Line(line) => Some(line.as_slice()),
            LineEvent::Dropped(_) => None,
        }
    }

    /// 若为丢弃事件则返回丢弃字节数。
    pub fn dropped(&self) -> Option<usize> {
        match self {
            LineEvent::Line(_) => None,
            LineEvent::Dropped(count) => Some(*count),
        }
    }
}

/// 流式行组装器：持有未终止的行缓冲，按到达顺序把字节块转换为 [`LineEvent`]。
///
/// # 设计动机（Why）
/// - 读完成的粒度与行边界无关，组装器负责跨读取拼接半行、在一次读取中拆出多行；
/// - 行缓冲有固定上限，超限时整条行被丢弃并以计数上报，保证内存占用恒定。
///
/// # 行为概览（How）
/// - 无分隔符：若 `缓冲长度 + 块长度 <= capacity` 则整体追加；否则丢弃缓冲与该块，
///   把二者长度之和计入丢弃计数，立即产生 [`LineEvent::Dropped`]，缓冲清空后照常接收后续字节；
/// - 遇到分隔符：完成 `缓冲 ++ 块[..i]`；若丢弃计数非零，该行属于已上报的超长行，
///   内容被丢弃且不再产生行事件，计数清零；
/// - 分隔符之后的剩余部分按 [`DelimiterMode`] 继续切分或逐字节写入缓冲。
///
/// # 契约说明（What）
/// - 空块不产生任何效果；块首即分隔符时产生一条空行；
/// - 每次溢出产生一个丢弃事件，且先于其后完成的任何行；
/// - 没有分隔符的流中，每个字节要么已在某次丢弃事件中计数，要么仍在缓冲内；
/// - 组装器不做 UTF-8 校验，调用方自行决定如何呈现字节。
///
/// # 权衡与风险（Trade-offs）
/// - 每完成一行都会转移缓冲所有权，换取事件可以直接被下游持有而不受后续输入影响；
/// - 超长行溢出之后、分隔符之前到达的尾部字节只在分隔符处静默丢弃，不单独计数。
#[derive(Debug, Clone)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    capacity: usize,
    delimiter: u8,
    mode: DelimiterMode,
    dropped: usize,
}

impl LineAssembler {
    /// 以给定行容量构建组装器，分隔符为 `\n`，模式为 [`DelimiterMode::EveryDelimiter`]。
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity,
            delimiter: NEWLINE,
            mode: DelimiterMode::default(),
            dropped: 0,
        }
    }

    /// 替换行分隔符。
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// 替换分隔符处理模式。
    pub fn with_mode(mut self, mode: DelimiterMode) -> Self {
        self.mode = mode;
        self
    }

    /// 行缓冲容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前分隔符。
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// 当前分隔符模式。
    pub fn mode(&self) -> DelimiterMode {
        self.mode
    }

    /// 尚未终止的行内容。
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// 当前未终止的超长行已丢弃的字节数；非零表示该行会在分隔符处被整体放弃。
    pub fn pending_drop(&self) -> usize {
        self.dropped
    }

    /// 消费一个字节块并返回本次完成的事件。
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<LineEvent> {
        let mut events = Vec::new();
        self.feed_into(chunk, &mut events);
        events
    }

    /// 与 [`feed`](Self::feed) 相同，但把事件追加到调用方提供的向量中，便于复用分配。
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<LineEvent>) {
        if chunk.is_empty() {
            return;
        }

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|byte| *byte == self.delimiter) {
            self.absorb(&rest[..pos], out);
            self.complete_line(out);
            rest = &rest[pos + 1..];
            if self.mode == DelimiterMode::FirstPerChunk {
                break;
            }
        }
        self.absorb(rest, out);
    }

    /// 流结束：缓冲中尚未上报的未终止内容作为一次丢弃上报，并清空全部状态。
    pub fn finish(&mut self) -> Option<LineEvent> {
        let discarded = self.buffer.len();
        self.reset();
        (discarded > 0).then_some(LineEvent::Dropped(discarded))
    }

    /// 清空行缓冲与丢弃计数。
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.dropped = 0;
    }

    fn absorb(&mut self, bytes: &[u8], out: &mut Vec<LineEvent>) {
        if bytes.is_empty() {
            return;
        }
        let total = self.buffer.len() + bytes.len();
        if total > self.capacity {
            self.dropped = self.dropped.saturating_add(total);
            self.buffer.clear();
            out.push(LineEvent::Dropped(total));
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    fn complete_line(&mut self, out: &mut Vec<LineEvent>) {
        if self.dropped > 0 {
            // 超长行的尾部，溢出时已经上报。
            self.buffer.clear();
            self.dropped = 0;
        } else {
            out.push(LineEvent::Line(mem::take(&mut self.buffer)));
        }
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_CAPACITY)
    }
}
