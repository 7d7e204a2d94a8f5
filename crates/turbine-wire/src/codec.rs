//! # codec 模块说明
//!
//! ## 角色定位（Why）
//! - 把 [`Message`] 编成文本或二进制帧，并在连接级别维护差分编码所需的“上一对象”缓存；
//! - 发送端与接收端各持有一半状态（[`FrameEncoder`] / [`FrameDecoder`]），便于读写两条
//!   路径分别加锁。
//!
//! ## 差分编码（How）
//! - 编码端按种类缓存上一次发送的对象，新对象与之逐字段比较，只写出变化的字段；
//!   上一对象有而新对象没有的字段写出 `Null`；
//! - 解码端按种类缓存上一次解码的完整对象，差分帧与之合并还原；
//! - 路由角色、配置关闭、或发送的正是缓存中的同一个对象时，一律写完整帧。
//!
//! ## 风险（Trade-offs）
//! - 差分开关在登录协商时确定，连接存续期间不可切换，否则两端缓存会失去同步。

use std::{collections::HashMap, sync::Arc};

use bytes::BytesMut;
use tracing::debug;

use crate::{
    binary,
    error::WireError,
    feature::{BuildStamp, PeerFeatures},
    message::Message,
    schema::Kind,
    text,
    value::{Record, Value},
};

/// 默认单帧上限：16 MiB。
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// 单帧内列表与嵌套对象的最大层数。
pub const MAX_NESTING: usize = 64;

/// 帧语法。登录阶段固定使用文本，登录完成后切换为二进制。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FrameMode {
    #[default]
    Text,
    Binary,
}

/// 解码一帧的中间结果。
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub delta: bool,
    pub record: Record,
}

/// 解码失败的两种性质：数据尚未到齐，或数据本身非法。
#[derive(Debug)]
pub(crate) enum DecodeFault {
    Incomplete,
    Invalid(WireError),
}

impl From<WireError> for DecodeFault {
    fn from(err: WireError) -> Self {
        DecodeFault::Invalid(err)
    }
}

/// 编解码器构造参数。
///
/// # 教案式说明
/// - **意图 (Why)**：差分开关与构建戳以显式配置注入，而不是读取进程级全局变量；
/// - **契约 (What)**：`diff` 只表达本端意愿，连接上实际是否启用由登录协商决定；
///   `max_frame` 同时约束收发两个方向；
/// - **风险 (Trade-offs)**：配置按值复制进每条连接，热更新只影响之后建立的连接。
#[derive(Clone, Debug)]
pub struct WireConfig {
    pub diff: bool,
    pub stamp: BuildStamp,
    pub max_frame: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            diff: true,
            stamp: BuildStamp::current(),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// 登录协商后的连接参数，对编码端与解码端一次性生效。
#[derive(Clone, Debug)]
pub struct Negotiated {
    pub mode: FrameMode,
    pub diff: bool,
    pub peer: Option<BuildStamp>,
}

struct SentEntry {
    message: Arc<Message>,
    record: Record,
}

/// 发送方向的帧编码器。
pub struct FrameEncoder {
    mode: FrameMode,
    diff: bool,
    max_frame: usize,
    features: PeerFeatures,
    last_sent: HashMap<Kind, SentEntry>,
}

impl FrameEncoder {
    pub fn new(config: &WireConfig) -> Self {
        Self {
            mode: FrameMode::Text,
            // 登录前对端能力未知，先写完整帧。
            diff: false,
            max_frame: config.max_frame,
            features: PeerFeatures::default(),
            last_sent: HashMap::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    pub fn diff_enabled(&self) -> bool {
        self.diff
    }

    /// 应用登录协商结果；关闭差分时同时清空缓存。
    pub fn apply(&mut self, negotiated: &Negotiated) {
        self.mode = negotiated.mode;
        self.diff = negotiated.diff;
        self.features = PeerFeatures::new(negotiated.peer.clone());
        if !self.diff {
            self.last_sent.clear();
        }
    }

    /// 把消息编码追加到 `out`，返回写入的字节数。
    ///
    /// 帧通过长度检查之后才刷新差分缓存；失败时缓存保持调用前的状态，
    /// 与对端解码器仍然同步。
    pub fn encode(&mut self, message: &Arc<Message>, out: &mut BytesMut) -> Result<usize, WireError> {
        let record = message.to_record(&self.features);
        let kind = record.kind();
        let (frame, basis) = match self.last_sent.get(&kind) {
            Some(entry) if self.diff && Arc::ptr_eq(&entry.message, message) => {
                // 与缓存是同一对象：写完整帧且不刷新缓存，避免自引用差分。
                (
                    Frame {
                        delta: false,
                        record,
                    },
                    None,
                )
            }
            Some(entry) if self.diff => {
                let delta = diff_records(&entry.record, &record);
                let frame = if delta.len() < record.len() {
                    Frame {
                        delta: true,
                        record: delta,
                    }
                } else {
                    Frame {
                        delta: false,
                        record: record.clone(),
                    }
                };
                (frame, Some(record))
            }
            _ if self.diff => (
                Frame {
                    delta: false,
                    record: record.clone(),
                },
                Some(record),
            ),
            _ => (
                Frame {
                    delta: false,
                    record,
                },
                None,
            ),
        };

        let start = out.len();
        encode_frame(self.mode, &frame, out);
        let written = out.len() - start;
        if written > self.max_frame {
            out.truncate(start);
            return Err(WireError::FrameTooLarge {
                len: written,
                limit: self.max_frame,
            });
        }
        if let Some(record) = basis {
            self.last_sent.insert(
                kind,
                SentEntry {
                    message: Arc::clone(message),
                    record,
                },
            );
        }
        Ok(written)
    }

    /// 丢弃 `kind` 的差分基准。帧已编码却没有完整写上线路时调用，
    /// 之后同类消息以完整帧发送。
    pub fn forget(&mut self, kind: Kind) {
        self.last_sent.remove(&kind);
    }
}

/// 接收方向的帧解码器。
pub struct FrameDecoder {
    mode: FrameMode,
    max_frame: usize,
    last_received: HashMap<Kind, Record>,
}

impl FrameDecoder {
    pub fn new(config: &WireConfig) -> Self {
        Self {
            mode: FrameMode::Text,
            max_frame: config.max_frame,
            last_received: HashMap::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    pub fn apply(&mut self, negotiated: &Negotiated) {
        self.mode = negotiated.mode;
    }

    /// 从 `buf` 头部解出一条消息。
    ///
    /// - 数据不足一帧时返回 `Ok(None)`，`buf` 保持不变；
    /// - 成功时从 `buf` 中移除已消耗的字节；
    /// - 任何 [`WireError`] 都意味着该连接必须关闭。
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<(Message, usize)>, WireError> {
        let parsed = match self.mode {
            FrameMode::Text => text::read_frame(buf),
            FrameMode::Binary => binary::read_frame(buf, self.max_frame),
        };
        let (frame, used) = match parsed {
            Ok(parsed) => parsed,
            Err(DecodeFault::Incomplete) => {
                if self.mode == FrameMode::Text && buf.len() > self.max_frame {
                    return Err(WireError::FrameTooLarge {
                        len: buf.len(),
                        limit: self.max_frame,
                    });
                }
                return Ok(None);
            }
            Err(DecodeFault::Invalid(err)) => {
                debug!(error = %err, "rejecting malformed frame");
                return Err(err);
            }
        };
        let _ = buf.split_to(used);

        let kind = frame.record.kind();
        let record = if frame.delta {
            let basis = self
                .last_received
                .get(&kind)
                .ok_or(WireError::MissingBasis { kind })?;
            merge_records(basis, frame.record)
        } else {
            strip_nulls(frame.record)
        };
        let message = Message::from_record(&record)?;
        self.last_received.insert(kind, record);
        Ok(Some((message, used)))
    }
}

/// 无状态地编码一帧，供登录前后切换模式的调用方直接使用。
pub fn encode_frame(mode: FrameMode, frame: &Frame, out: &mut BytesMut) {
    match mode {
        FrameMode::Text => text::write_frame(frame, out),
        FrameMode::Binary => binary::write_frame(frame, out),
    }
}

/// 计算 `next` 相对 `prev` 的差分记录。
pub fn diff_records(prev: &Record, next: &Record) -> Record {
    let mut delta = Record::new(next.kind());
    for (index, value) in next.iter() {
        if prev.get_index(index) != Some(value) {
            delta.insert_index(index, value.clone());
        }
    }
    for index in prev.indices() {
        if next.get_index(index).is_none() {
            delta.insert_index(index, Value::Null);
        }
    }
    delta
}

/// 把差分记录合并到基准记录上。
pub fn merge_records(basis: &Record, delta: Record) -> Record {
    let mut merged = basis.clone();
    for (index, value) in delta.iter() {
        match value {
            Value::Null => merged.remove_index(index),
            other => merged.insert_index(index, other.clone()),
        }
    }
    merged
}

fn strip_nulls(record: Record) -> Record {
    if record.iter().all(|(_, value)| *value != Value::Null) {
        return record;
    }
    let mut cleaned = Record::new(record.kind());
    for (index, value) in record.iter() {
        if *value != Value::Null {
            cleaned.insert_index(index, value.clone());
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PeerUpdate, Routed, ShortcutInfo};

    fn binary() -> Negotiated {
        Negotiated {
            mode: FrameMode::Binary,
            diff: true,
            peer: Some(BuildStamp::current()),
        }
    }

    fn update(counter: u64, shortcuts: Vec<ShortcutInfo>) -> Arc<Message> {
        Arc::new(Message::PeerUpdate(PeerUpdate {
            address: "tcp://peer:3333".into(),
            name: "/peer".into(),
            counter,
            shortcuts,
        }))
    }

    fn pair() -> (FrameEncoder, FrameDecoder) {
        let config = WireConfig::default();
        let mut encoder = FrameEncoder::new(&config);
        let mut decoder = FrameDecoder::new(&config);
        encoder.apply(&binary());
        decoder.apply(&binary());
        (encoder, decoder)
    }

    #[test]
    fn second_frame_is_a_delta_and_merges_back() {
        let (mut encoder, mut decoder) = pair();
        let first = update(1, vec![ShortcutInfo::new("/b", "tcp://b:3333", 1.0)]);
        let second = update(2, vec![ShortcutInfo::new("/b", "tcp://b:3333", 1.0)]);

        let mut wire = BytesMut::new();
        let full_len = encoder.encode(&first, &mut wire).expect("首帧编码");
        let delta_len = encoder.encode(&second, &mut wire).expect("差分帧编码");
        assert!(delta_len < full_len, "只变化计数器时差分帧应更短");

        let (a, _) = decoder.decode(&mut wire).expect("解码").expect("首帧完整");
        let (b, _) = decoder.decode(&mut wire).expect("解码").expect("差分帧完整");
        assert_eq!(a, *first);
        assert_eq!(b, *second);
        assert!(wire.is_empty());
    }

    #[test]
    fn removed_fields_travel_as_null_markers() {
        let prev = update(1, vec![ShortcutInfo::new("/b", "tcp://b:3333", 1.0)]).to_record(&PeerFeatures::default());
        let next = update(1, Vec::new()).to_record(&PeerFeatures::default());
        let delta = diff_records(&prev, &next);
        assert_eq!(delta.get("SHC"), Some(&Value::Null));
        assert_eq!(merge_records(&prev, delta), next);
    }

    #[test]
    fn same_object_is_sent_in_full() {
        let (mut encoder, mut decoder) = pair();
        let message = update(5, Vec::new());
        let mut wire = BytesMut::new();
        let first = encoder.encode(&message, &mut wire).expect("编码");
        let again = encoder.encode(&message, &mut wire).expect("编码");
        assert_eq!(first, again, "同一对象再次发送必须是完整帧");
        for _ in 0..2 {
            let (decoded, _) = decoder.decode(&mut wire).expect("解码").expect("完整帧");
            assert_eq!(decoded, *message);
        }
    }

    #[test]
    fn disabled_diff_always_writes_full_frames() {
        let config = WireConfig::default();
        let mut encoder = FrameEncoder::new(&config);
        encoder.apply(&Negotiated {
            diff: false,
            ..binary()
        });
        let mut wire = BytesMut::new();
        let a = encoder.encode(&update(1, Vec::new()), &mut wire).expect("编码");
        let b = encoder.encode(&update(2, Vec::new()), &mut wire).expect("编码");
        assert_eq!(a, b);
        // 全新的解码器（例如转发给另一对端）也能直接解出第二帧。
        let mut fresh = FrameDecoder::new(&config);
        fresh.apply(&binary());
        let _ = wire.split_to(a);
        let (decoded, _) = fresh.decode(&mut wire).expect("解码").expect("完整帧");
        assert_eq!(decoded, *update(2, Vec::new()));
    }

    #[test]
    fn oversized_send_leaves_the_diff_basis_alone() {
        let config = WireConfig {
            max_frame: 200,
            ..WireConfig::default()
        };
        let mut encoder = FrameEncoder::new(&config);
        let mut decoder = FrameDecoder::new(&config);
        encoder.apply(&binary());
        decoder.apply(&binary());
        let routed = |destination: &str, payload: Vec<u8>| {
            Arc::new(Message::Routed(Routed {
                destination: destination.into(),
                payload: payload.into(),
            }))
        };

        let mut wire = BytesMut::new();
        encoder.encode(&routed("/a", vec![1; 4]), &mut wire).expect("首帧编码");
        let before = wire.len();
        assert!(matches!(
            encoder.encode(&routed("/b", vec![9; 1000]), &mut wire),
            Err(WireError::FrameTooLarge { limit: 200, .. })
        ));
        assert_eq!(wire.len(), before, "超长帧不得留下任何字节");
        let last = routed("/b", vec![7; 5]);
        encoder.encode(&last, &mut wire).expect("第三帧编码");

        let (first, _) = decoder.decode(&mut wire).expect("解码").expect("首帧完整");
        assert_eq!(first, *routed("/a", vec![1; 4]));
        let (second, _) = decoder.decode(&mut wire).expect("解码").expect("第三帧完整");
        assert_eq!(second, *last);
    }

    #[test]
    fn forgotten_basis_falls_back_to_a_full_frame() {
        let (mut encoder, _) = pair();
        let mut wire = BytesMut::new();
        let full = encoder.encode(&update(1, Vec::new()), &mut wire).expect("编码");
        encoder.forget(Kind::PeerUpdate);
        let mut fresh = FrameDecoder::new(&WireConfig::default());
        fresh.apply(&binary());
        wire.clear();
        let again = encoder.encode(&update(2, Vec::new()), &mut wire).expect("编码");
        assert_eq!(full, again, "丢弃基准后必须写完整帧");
        let (decoded, _) = fresh.decode(&mut wire).expect("解码").expect("完整帧");
        assert_eq!(decoded, *update(2, Vec::new()));
    }

    #[test]
    fn delta_without_basis_is_a_framing_error() {
        let mut wire = BytesMut::from(&b"~PUP { UPC 3 }\n"[..]);
        let mut decoder = FrameDecoder::new(&WireConfig::default());
        assert_eq!(
            decoder.decode(&mut wire).unwrap_err(),
            WireError::MissingBasis {
                kind: Kind::PeerUpdate
            }
        );
    }

    #[test]
    fn incomplete_input_leaves_buffer_untouched() {
        let mut wire = BytesMut::from(&b"PNG { DAT b4:ab"[..]);
        let mut decoder = FrameDecoder::new(&WireConfig::default());
        assert!(decoder.decode(&mut wire).expect("不完整不是错误").is_none());
        assert_eq!(&wire[..], b"PNG { DAT b4:ab");
        wire.extend_from_slice(b"cd }\n");
        let (message, _) = decoder.decode(&mut wire).expect("解码").expect("补齐后完整");
        assert_eq!(message.kind(), Kind::Ping);
    }
}
