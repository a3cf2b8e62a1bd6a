#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

//! `spark-serial-line` 将串口类设备读出的原始字节块重组为以分隔符结尾的文本行。
//!
//! # 教案背景（Why）
//! - 串口读取按“到达多少给多少”的粒度完成，一行文本可能被拆散在多次读取中，也可能一次读取包含多行；
//! - 行缓冲必须有上限，超长行需要整体丢弃并给出可观测的丢弃计数，而不是无界增长；
//! - 解析器保持纯函数式的输入输出（字节块进、事件出），事件循环与任何 I/O 细节都留在 `spark-serial-core`。
//!
//! # 使用概览（How）
//! - 通过 [`LineAssembler::new`] 指定行容量，按需调整分隔符与 [`DelimiterMode`]；
//! - 每收到一个字节块调用 [`LineAssembler::feed`]，按接收顺序得到 [`LineEvent`] 序列；
//! - 流结束时调用 [`LineAssembler::finish`]，缓冲中未终止的残余内容会作为一次丢弃上报。
//!
//! # 合约说明（What）
//! - 行事件严格按字节到达顺序产生；
//! - 行缓冲溢出时立即产生 [`LineEvent::Dropped`]，它先于之后完成的任何行；超长行在其分隔符处被整体放弃；
//! - 不做字符集解码，行内容以原始字节交付。

extern crate alloc;

mod assembler;

pub use crate::assembler::{DelimiterMode, LineAssembler, LineEvent};

/// 默认行分隔符。
pub const NEWLINE: u8 = b'\n';

/// 默认行缓冲容量（字节）。
pub const DEFAULT_LINE_CAPACITY: usize = 255;
