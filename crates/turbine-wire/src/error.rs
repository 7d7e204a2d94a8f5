//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义帧编解码阶段的错误语义，供传输层直接映射为“连接致命”的成帧错误；
//! - 区分“数据不完整”（调用方继续读取即可）与“数据非法”（必须关闭连接）。
//!
//! ## 设计要求（What）
//! - 所有变体派生 [`thiserror::Error`]，并携带足以排障的上下文（命令字、标签、偏移）；
//! - 成帧错误永不尝试自动重同步，调用方收到后应关闭连接。

use thiserror::Error;

use crate::schema::Kind;

/// 帧编解码错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“括号不平衡”“标签早于帧打开”“缺少必填字段”等失败模式显式化，
///   便于上层在日志中快速定位是哪一端的协议实现有缺陷。
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可跨任务传播；
///   出现任一变体即意味着该连接的字节流已不可信。
/// - **风险 (Trade-offs)**：使用 `String` 保存上下文，牺牲少量分配换取可读性。
#[derive(Clone, Debug, Error, PartialEq)]
pub enum WireError {
    /// 出现了没有对应开括号的闭括号，或帧在闭合之前结束。
    #[error("unbalanced brackets at byte {offset}: {detail}")]
    Unbalanced { offset: usize, detail: &'static str },

    /// 在所属消息帧打开（`{`）之前就读到了标签。
    #[error("tag `{tag}` referenced before its message frame was opened")]
    TagOutsideFrame { tag: String },

    /// 命令字未在注册表中登记。
    #[error("unknown command `{command}`")]
    UnknownCommand { command: String },

    /// 必填字段缺失且该消息类型没有默认值。
    #[error("{kind:?} frame is missing required field `{tag}`")]
    MissingField { kind: Kind, tag: &'static str },

    /// 字段类型与消息定义不符。
    #[error("{kind:?} field `{tag}` has unexpected type, expected {expected}")]
    FieldType {
        kind: Kind,
        tag: &'static str,
        expected: &'static str,
    },

    /// 差分帧到达时解码端没有同类型的基准对象。
    #[error("delta frame for {kind:?} arrived without a previous object to merge into")]
    MissingBasis { kind: Kind },

    /// 单个值无法按文本或二进制语法解析。
    #[error("malformed value at byte {offset}: {detail}")]
    MalformedValue { offset: usize, detail: String },

    /// 列表与嵌套对象的层数超过上限。递归下降解析器据此拒绝恶意构造的深层帧。
    #[error("value nesting exceeds {limit} levels at byte {offset}")]
    TooDeep { offset: usize, limit: usize },

    /// 帧长度超过上限。
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },
}
