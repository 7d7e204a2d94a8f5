//! 文本帧语法。
//!
//! ```text
//! LGN { USR s5:alice VER s4:V3.0 DAT 20261017 DIF TRUE }
//! ~PUP { UPC 7 SHC NIL }
//! ```
//!
//! 记号之间以空白分隔；字符串采用 `s<长度>:<字节>`、原始字节采用 `b<长度>:<字节>`，
//! 因而可以包含任意空白；浮点以 `d` 前缀加科学计数法书写。开头的 `~` 标记差分帧。

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::{
    codec::{DecodeFault, Frame, MAX_NESTING},
    error::WireError,
    schema::Kind,
    value::{Record, Value},
};

pub(crate) fn write_frame(frame: &Frame, out: &mut BytesMut) {
    if frame.delta {
        out.put_u8(b'~');
    }
    write_record(&frame.record, out);
    out.put_u8(b'\n');
}

fn write_record(record: &Record, out: &mut BytesMut) {
    out.put_slice(record.kind().command().as_bytes());
    out.put_slice(b" {");
    for (index, value) in record.iter() {
        let Some(tag) = record.kind().tag_name(index) else {
            continue;
        };
        out.put_u8(b' ');
        out.put_slice(tag.as_bytes());
        out.put_u8(b' ');
        write_value(value, out);
    }
    out.put_slice(b" }");
}

fn write_value(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Null => out.put_slice(b"NIL"),
        Value::Bool(true) => out.put_slice(b"TRUE"),
        Value::Bool(false) => out.put_slice(b"FALSE"),
        Value::Int(number) => out.put_slice(number.to_string().as_bytes()),
        Value::Float(number) => out.put_slice(format!("d{number:e}").as_bytes()),
        Value::Text(text) => {
            out.put_slice(format!("s{}:", text.len()).as_bytes());
            out.put_slice(text.as_bytes());
        }
        Value::Bytes(bytes) => {
            out.put_slice(format!("b{}:", bytes.len()).as_bytes());
            out.put_slice(bytes);
        }
        Value::List(items) => {
            out.put_u8(b'[');
            for item in items {
                out.put_u8(b' ');
                write_value(item, out);
            }
            out.put_slice(b" ]");
        }
        Value::Object(record) => write_record(record, out),
    }
}

/// 尝试从缓冲区头部解析一帧，返回帧与消耗的字节数。
pub(crate) fn read_frame(buf: &[u8]) -> Result<(Frame, usize), DecodeFault> {
    let mut cursor = Cursor { buf, pos: 0 };
    let (start, token) = cursor.token()?;
    let (delta, command) = match token.strip_prefix(b"~") {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    if matches!(command, b"{" | b"}" | b"[" | b"]") || command.is_empty() {
        return Err(WireError::Unbalanced {
            offset: start,
            detail: "frame must start with a command",
        }
        .into());
    }
    let command = String::from_utf8_lossy(command);
    let kind = Kind::from_command(&command).ok_or_else(|| WireError::UnknownCommand {
        command: command.to_string(),
    })?;
    let record = cursor.body(kind, 0)?;
    if cursor.buf.get(cursor.pos) == Some(&b'\n') {
        cursor.pos += 1;
    }
    Ok((Frame { delta, record }, cursor.pos))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn skip_whitespace(&mut self) -> Result<(), DecodeFault> {
        while let Some(byte) = self.buf.get(self.pos) {
            if !byte.is_ascii_whitespace() {
                return Ok(());
            }
            self.pos += 1;
        }
        Err(DecodeFault::Incomplete)
    }

    fn peek(&mut self) -> Result<u8, DecodeFault> {
        self.skip_whitespace()?;
        Ok(self.buf[self.pos])
    }

    /// 读取一个记号；括号自成记号，其余记号必须以空白结束才算完整。
    fn token(&mut self) -> Result<(usize, &'a [u8]), DecodeFault> {
        self.skip_whitespace()?;
        let buf = self.buf;
        let start = self.pos;
        if matches!(buf[start], b'{' | b'}' | b'[' | b']') {
            self.pos += 1;
            return Ok((start, &buf[start..self.pos]));
        }
        let rest = &buf[start..];
        let len = rest
            .iter()
            .position(u8::is_ascii_whitespace)
            .ok_or(DecodeFault::Incomplete)?;
        self.pos += len;
        Ok((start, &rest[..len]))
    }

    fn nest(&self, depth: usize) -> Result<(), DecodeFault> {
        if depth > MAX_NESTING {
            return Err(WireError::TooDeep {
                offset: self.pos,
                limit: MAX_NESTING,
            }
            .into());
        }
        Ok(())
    }

    fn body(&mut self, kind: Kind, depth: usize) -> Result<Record, DecodeFault> {
        self.nest(depth)?;
        let (offset, open) = self.token()?;
        match open {
            b"{" => {}
            b"}" | b"[" | b"]" => {
                return Err(WireError::Unbalanced {
                    offset,
                    detail: "expected `{` after command",
                }
                .into());
            }
            tag => {
                return Err(WireError::TagOutsideFrame {
                    tag: String::from_utf8_lossy(tag).into_owned(),
                }
                .into());
            }
        }

        let mut record = Record::new(kind);
        loop {
            let (offset, token) = self.token()?;
            match token {
                b"}" => return Ok(record),
                b"{" | b"[" | b"]" => {
                    return Err(WireError::Unbalanced {
                        offset,
                        detail: "bracket where a tag was expected",
                    }
                    .into());
                }
                tag => {
                    let tag = String::from_utf8_lossy(tag).into_owned();
                    let value = self.value(depth)?;
                    match kind.tag_index(&tag) {
                        Some(index) => record.insert_index(index, value),
                        None => trace!(command = kind.command(), %tag, "skipping unknown tag"),
                    }
                }
            }
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeFault> {
        let offset = self.pos;
        match self.peek()? {
            b'[' => {
                self.nest(depth + 1)?;
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    match self.peek()? {
                        b']' => {
                            self.pos += 1;
                            return Ok(Value::List(items));
                        }
                        b'}' | b'{' => {
                            return Err(WireError::Unbalanced {
                                offset: self.pos,
                                detail: "list closed by the wrong bracket",
                            }
                            .into());
                        }
                        _ => items.push(self.value(depth + 1)?),
                    }
                }
            }
            b']' | b'}' | b'{' => Err(WireError::Unbalanced {
                offset,
                detail: "bracket where a value was expected",
            }
            .into()),
            prefix @ (b's' | b'b') => {
                let payload = self.counted()?;
                if prefix == b's' {
                    let text = String::from_utf8(payload.to_vec()).map_err(|err| {
                        WireError::MalformedValue {
                            offset,
                            detail: err.to_string(),
                        }
                    })?;
                    Ok(Value::Text(text))
                } else {
                    Ok(Value::Bytes(bytes::Bytes::copy_from_slice(payload)))
                }
            }
            b'd' => {
                let (offset, token) = self.token()?;
                let text = String::from_utf8_lossy(&token[1..]);
                let number = text
                    .parse::<f64>()
                    .map_err(|err| malformed(offset, err.to_string()))?;
                Ok(Value::Float(number))
            }
            b'-' | b'0'..=b'9' => {
                let (offset, token) = self.token()?;
                let text = String::from_utf8_lossy(token);
                let number = text
                    .parse::<i64>()
                    .map_err(|err| malformed(offset, err.to_string()))?;
                Ok(Value::Int(number))
            }
            _ => {
                let (offset, token) = self.token()?;
                match token {
                    b"TRUE" => Ok(Value::Bool(true)),
                    b"FALSE" => Ok(Value::Bool(false)),
                    b"NIL" => Ok(Value::Null),
                    command => {
                        let command = String::from_utf8_lossy(command);
                        let kind = Kind::from_command(&command).ok_or_else(|| {
                            if command.bytes().all(|b| b.is_ascii_uppercase()) {
                                WireError::UnknownCommand {
                                    command: command.to_string(),
                                }
                            } else {
                                malformed(offset, format!("unexpected token `{command}`"))
                            }
                        })?;
                        Ok(Value::Object(self.body(kind, depth + 1)?))
                    }
                }
            }
        }
    }

    /// 读取 `s<len>:` / `b<len>:` 形式的计长载荷。
    fn counted(&mut self) -> Result<&'a [u8], DecodeFault> {
        let buf = self.buf;
        let offset = self.pos;
        let rest = &buf[offset + 1..];
        let colon = match rest.iter().position(|b| !b.is_ascii_digit()) {
            Some(idx) => idx,
            None => return Err(DecodeFault::Incomplete),
        };
        if colon == 0 || rest[colon] != b':' {
            return Err(malformed(offset, "length prefix must be digits followed by `:`".into()).into());
        }
        let len: usize = std::str::from_utf8(&rest[..colon])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| malformed(offset, "length prefix overflow".into()))?;
        let start = offset + 1 + colon + 1;
        let end = start.checked_add(len).ok_or_else(|| malformed(offset, "length overflow".into()))?;
        if end > buf.len() {
            return Err(DecodeFault::Incomplete);
        }
        self.pos = end;
        Ok(&buf[start..end])
    }
}

fn malformed(offset: usize, detail: String) -> WireError {
    WireError::MalformedValue { offset, detail }
}
