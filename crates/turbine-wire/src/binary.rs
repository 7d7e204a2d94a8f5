//! 二进制帧语法。
//!
//! ```text
//! u32 BE 帧长 | flags | kind | '{' | (tag, value)* | '}'
//! ```
//!
//! 值以一个类型字节开头，自描述长度，因此未知标签的值可以整体跳过。
//! 标签字节取自种类的标签表下标，表长远小于 `'}'`，两者不会混淆。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::{
    codec::{DecodeFault, Frame, MAX_NESTING},
    error::WireError,
    schema::Kind,
    value::{Record, Value},
};

const OPEN: u8 = b'{';
const CLOSE: u8 = b'}';
const FLAG_DELTA: u8 = 0x01;

const T_NULL: u8 = 0;
const T_FALSE: u8 = 1;
const T_TRUE: u8 = 2;
const T_INT: u8 = 3;
const T_FLOAT: u8 = 4;
const T_TEXT: u8 = 5;
const T_BYTES: u8 = 6;
const T_LIST: u8 = 7;
const T_OBJECT: u8 = 8;

pub(crate) fn write_frame(frame: &Frame, out: &mut BytesMut) {
    let start = out.len();
    out.put_u32(0);
    out.put_u8(if frame.delta { FLAG_DELTA } else { 0 });
    write_record(&frame.record, out);
    let body_len = out.len() - start - 4;
    // 帧长在写完后回填；单帧超过 4 GiB 之前早已被长度上限拦截。
    let len = u32::try_from(body_len).unwrap_or(u32::MAX);
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn write_record(record: &Record, out: &mut BytesMut) {
    out.put_u8(record.kind().index());
    out.put_u8(OPEN);
    for (index, value) in record.iter() {
        out.put_u8(index);
        write_value(value, out);
    }
    out.put_u8(CLOSE);
}

fn put_len(out: &mut BytesMut, len: usize) {
    out.put_u32(u32::try_from(len).unwrap_or(u32::MAX));
}

fn write_value(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Null => out.put_u8(T_NULL),
        Value::Bool(false) => out.put_u8(T_FALSE),
        Value::Bool(true) => out.put_u8(T_TRUE),
        Value::Int(number) => {
            out.put_u8(T_INT);
            out.put_i64(*number);
        }
        Value::Float(number) => {
            out.put_u8(T_FLOAT);
            out.put_f64(*number);
        }
        Value::Text(text) => {
            out.put_u8(T_TEXT);
            put_len(out, text.len());
            out.put_slice(text.as_bytes());
        }
        Value::Bytes(bytes) => {
            out.put_u8(T_BYTES);
            put_len(out, bytes.len());
            out.put_slice(bytes);
        }
        Value::List(items) => {
            out.put_u8(T_LIST);
            put_len(out, items.len());
            for item in items {
                write_value(item, out);
            }
        }
        Value::Object(record) => {
            out.put_u8(T_OBJECT);
            write_record(record, out);
        }
    }
}

/// 尝试从缓冲区头部解析一帧，返回帧与消耗的字节数。
pub(crate) fn read_frame(buf: &[u8], limit: usize) -> Result<(Frame, usize), DecodeFault> {
    if buf.len() < 4 {
        return Err(DecodeFault::Incomplete);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > limit {
        return Err(WireError::FrameTooLarge { len, limit }.into());
    }
    if buf.len() < 4 + len {
        return Err(DecodeFault::Incomplete);
    }
    let mut body = Body {
        buf: &buf[4..4 + len],
        base: 4,
    };
    let flags = body.u8()?;
    let record = body.record(0)?;
    if !body.buf.is_empty() {
        return Err(WireError::Unbalanced {
            offset: body.offset(),
            detail: "bytes after the closing bracket",
        }
        .into());
    }
    Ok((
        Frame {
            delta: flags & FLAG_DELTA != 0,
            record,
        },
        4 + len,
    ))
}

struct Body<'a> {
    buf: &'a [u8],
    base: usize,
}

impl<'a> Body<'a> {
    fn offset(&self) -> usize {
        self.base
    }

    /// 帧长已经完整到达，因此任何越界读取都意味着闭括号缺失。
    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.len() < n {
            Err(WireError::Unbalanced {
                offset: self.base,
                detail: "frame ended before its closing bracket",
            })
        } else {
            Ok(())
        }
    }

    fn advance(&mut self, n: usize) {
        self.buf.advance(n);
        self.base += n;
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        let byte = self.buf[0];
        self.advance(1);
        Ok(byte)
    }

    fn u32(&mut self) -> Result<usize, WireError> {
        self.need(4)?;
        let value = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        self.advance(4);
        Ok(value as usize)
    }

    fn slice(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.need(n)?;
        let buf = self.buf;
        self.advance(n);
        Ok(&buf[..n])
    }

    fn nest(&self, depth: usize) -> Result<(), WireError> {
        if depth > MAX_NESTING {
            return Err(WireError::TooDeep {
                offset: self.base,
                limit: MAX_NESTING,
            });
        }
        Ok(())
    }

    fn record(&mut self, depth: usize) -> Result<Record, WireError> {
        self.nest(depth)?;
        let offset = self.offset();
        let kind_index = self.u8()?;
        let kind = Kind::from_index(kind_index).ok_or_else(|| WireError::UnknownCommand {
            command: format!("#{kind_index}"),
        })?;
        let open = self.u8()?;
        if open == CLOSE {
            return Err(WireError::Unbalanced {
                offset,
                detail: "closing bracket before opening bracket",
            });
        }
        if open != OPEN {
            return Err(WireError::TagOutsideFrame {
                tag: kind.tag_name(open).map_or_else(|| format!("#{open}"), str::to_owned),
            });
        }

        let mut record = Record::new(kind);
        loop {
            let offset = self.offset();
            match self.u8()? {
                CLOSE => return Ok(record),
                OPEN => {
                    return Err(WireError::Unbalanced {
                        offset,
                        detail: "opening bracket where a tag was expected",
                    });
                }
                tag => {
                    let value = self.value(depth)?;
                    if kind.tag_name(tag).is_some() {
                        record.insert_index(tag, value);
                    } else {
                        trace!(command = kind.command(), tag, "skipping unknown tag");
                    }
                }
            }
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, WireError> {
        let offset = self.offset();
        Ok(match self.u8()? {
            T_NULL => Value::Null,
            T_FALSE => Value::Bool(false),
            T_TRUE => Value::Bool(true),
            T_INT => {
                let mut raw = self.slice(8)?;
                Value::Int(raw.get_i64())
            }
            T_FLOAT => {
                let mut raw = self.slice(8)?;
                Value::Float(raw.get_f64())
            }
            T_TEXT => {
                let len = self.u32()?;
                let raw = self.slice(len)?;
                let text = std::str::from_utf8(raw).map_err(|err| WireError::MalformedValue {
                    offset,
                    detail: err.to_string(),
                })?;
                Value::Text(text.to_owned())
            }
            T_BYTES => {
                let len = self.u32()?;
                Value::Bytes(Bytes::copy_from_slice(self.slice(len)?))
            }
            T_LIST => {
                self.nest(depth + 1)?;
                let count = self.u32()?;
                // 每个元素至少占一个字节，先据此校验，避免恶意计数触发巨量预分配。
                self.need(count)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Value::List(items)
            }
            T_OBJECT => Value::Object(self.record(depth + 1)?),
            other => {
                return Err(WireError::MalformedValue {
                    offset,
                    detail: format!("unknown value type {other}"),
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1 << 20;

    fn sample() -> Record {
        let mut record = Record::new(Kind::RoleReversal);
        record
            .set("NAM", Value::Text("/edge".into()))
            .set("PRM", Value::Bool(true));
        record
    }

    #[test]
    fn frames_round_trip_and_report_length() {
        let mut out = BytesMut::new();
        let frame = Frame {
            delta: true,
            record: sample(),
        };
        write_frame(&frame, &mut out);
        out.put_slice(b"trailing");
        let (decoded, used) = read_frame(&out, LIMIT).expect("二进制帧必须可解析");
        assert_eq!(used, out.len() - b"trailing".len());
        assert!(decoded.delta);
        assert_eq!(decoded.record, sample());
    }

    #[test]
    fn short_buffers_are_incomplete() {
        let mut out = BytesMut::new();
        write_frame(
            &Frame {
                delta: false,
                record: sample(),
            },
            &mut out,
        );
        for cut in 0..out.len() {
            assert!(matches!(
                read_frame(&out[..cut], LIMIT),
                Err(DecodeFault::Incomplete)
            ));
        }
    }

    #[test]
    fn unknown_tag_index_is_skipped() {
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_u8(Kind::Ping.index());
        body.put_u8(OPEN);
        body.put_u8(40);
        body.put_u8(T_TEXT);
        body.put_u32(3);
        body.put_slice(b"new");
        body.put_u8(CLOSE);
        let mut out = BytesMut::new();
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        let (frame, _) = read_frame(&out, LIMIT).expect("未知标签应被跳过");
        assert!(frame.record.is_empty());
    }

    fn nested_lists(levels: usize) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_u8(Kind::Ping.index());
        body.put_u8(OPEN);
        body.put_u8(0);
        for _ in 0..levels {
            body.put_u8(T_LIST);
            body.put_u32(1);
        }
        body.put_u8(T_NULL);
        body.put_u8(CLOSE);
        let mut out = BytesMut::new();
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        out
    }

    #[test]
    fn nesting_is_bounded() {
        assert!(read_frame(&nested_lists(MAX_NESTING), LIMIT).is_ok());
        assert!(matches!(
            read_frame(&nested_lists(MAX_NESTING + 1), LIMIT),
            Err(DecodeFault::Invalid(WireError::TooDeep { limit: MAX_NESTING, .. }))
        ));
        // 远超栈容量的层数同样以成帧错误结束，而不是耗尽调用栈。
        assert!(matches!(
            read_frame(&nested_lists(2_000_000), 16 << 20),
            Err(DecodeFault::Invalid(WireError::TooDeep { .. }))
        ));
    }

    #[test]
    fn missing_close_and_oversize_are_errors() {
        let mut out = BytesMut::new();
        write_frame(
            &Frame {
                delta: false,
                record: sample(),
            },
            &mut out,
        );
        // 去掉闭括号并修正帧长。
        out.truncate(out.len() - 1);
        let len = (out.len() - 4) as u32;
        out[..4].copy_from_slice(&len.to_be_bytes());
        assert!(matches!(
            read_frame(&out, LIMIT),
            Err(DecodeFault::Invalid(WireError::Unbalanced { .. }))
        ));
        assert!(matches!(
            read_frame(&out, 4),
            Err(DecodeFault::Invalid(WireError::FrameTooLarge { .. }))
        ));
    }
}
