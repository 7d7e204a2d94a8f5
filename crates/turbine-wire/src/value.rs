//! 帧内值模型。
//!
//! [`Record`] 是一帧解码后的中间形态：种类加上按标签下标排序的字段表。消息层在
//! [`Record`] 与强类型 [`crate::Message`] 之间转换，编解码层只认识 [`Record`]，
//! 差分编码也在这一层完成。

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{error::WireError, schema::Kind};

/// 单个字段值。
///
/// `Null` 只出现在差分帧中，表示“上一对象有、本对象已删除”的字段。
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Object(Record),
}

impl Value {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }
}

/// 一帧的字段集合。
///
/// # 教案式说明
/// - **意图 (Why)**：以“种类 + 有序字段表”表达任何帧，使文本/二进制两种语法与差分合并
///   共享同一份数据结构；
/// - **契约 (What)**：字段以标签下标为键，迭代顺序即写出顺序；同一标签至多出现一次；
/// - **风险 (Trade-offs)**：`BTreeMap` 对于十个以内的字段略显笨重，但换来了确定的
///   输出顺序，便于文本模式下人工比对抓包。
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    kind: Kind,
    fields: BTreeMap<u8, Value>,
}

impl Record {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// 以标签名写入字段；标签必须属于本种类。
    ///
    /// 标签名来自编译期常量，拼错属于编程错误，因此以 `debug_assert!` 把关，
    /// release 构建下静默忽略。
    pub fn set(&mut self, tag: &'static str, value: Value) -> &mut Self {
        let index = self.kind.tag_index(tag);
        debug_assert!(index.is_some(), "tag {tag} not declared for {:?}", self.kind);
        if let Some(index) = index {
            self.fields.insert(index, value);
        }
        self
    }

    /// 仅在值存在时写入。
    pub fn set_opt(&mut self, tag: &'static str, value: Option<Value>) -> &mut Self {
        if let Some(value) = value {
            self.set(tag, value);
        }
        self
    }

    pub fn get(&self, tag: &str) -> Option<&Value> {
        self.kind
            .tag_index(tag)
            .and_then(|index| self.fields.get(&index))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn insert_index(&mut self, index: u8, value: Value) {
        self.fields.insert(index, value);
    }

    pub(crate) fn remove_index(&mut self, index: u8) {
        self.fields.remove(&index);
    }

    pub(crate) fn get_index(&self, index: u8) -> Option<&Value> {
        self.fields.get(&index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u8, &Value)> {
        self.fields.iter().map(|(index, value)| (*index, value))
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = u8> + '_ {
        self.fields.keys().copied()
    }

    fn required(&self, tag: &'static str) -> Result<&Value, WireError> {
        self.get(tag).ok_or(WireError::MissingField {
            kind: self.kind,
            tag,
        })
    }

    fn type_error(&self, tag: &'static str, expected: &'static str) -> WireError {
        WireError::FieldType {
            kind: self.kind,
            tag,
            expected,
        }
    }

    pub fn text(&self, tag: &'static str) -> Result<String, WireError> {
        match self.required(tag)? {
            Value::Text(text) => Ok(text.clone()),
            _ => Err(self.type_error(tag, "text")),
        }
    }

    pub fn opt_text(&self, tag: &'static str) -> Result<Option<String>, WireError> {
        match self.get(tag) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(_) => Err(self.type_error(tag, "text")),
        }
    }

    pub fn int(&self, tag: &'static str) -> Result<i64, WireError> {
        match self.required(tag)? {
            Value::Int(value) => Ok(*value),
            _ => Err(self.type_error(tag, "int")),
        }
    }

    pub fn opt_int(&self, tag: &'static str) -> Result<Option<i64>, WireError> {
        match self.get(tag) {
            None => Ok(None),
            Some(Value::Int(value)) => Ok(Some(*value)),
            Some(_) => Err(self.type_error(tag, "int")),
        }
    }

    pub fn float_or(&self, tag: &'static str, default: f64) -> Result<f64, WireError> {
        match self.get(tag) {
            None => Ok(default),
            Some(Value::Float(value)) => Ok(*value),
            Some(Value::Int(value)) => Ok(*value as f64),
            Some(_) => Err(self.type_error(tag, "float")),
        }
    }

    pub fn bool_or(&self, tag: &'static str, default: bool) -> Result<bool, WireError> {
        match self.get(tag) {
            None => Ok(default),
            Some(Value::Bool(value)) => Ok(*value),
            Some(_) => Err(self.type_error(tag, "bool")),
        }
    }

    pub fn bytes(&self, tag: &'static str) -> Result<Bytes, WireError> {
        match self.required(tag)? {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            _ => Err(self.type_error(tag, "bytes")),
        }
    }

    pub fn opt_bytes(&self, tag: &'static str) -> Result<Option<Bytes>, WireError> {
        match self.get(tag) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(self.type_error(tag, "bytes")),
        }
    }

    pub fn list(&self, tag: &'static str) -> Result<&[Value], WireError> {
        match self.required(tag)? {
            Value::List(items) => Ok(items),
            _ => Err(self.type_error(tag, "list")),
        }
    }

    pub fn opt_list(&self, tag: &'static str) -> Result<&[Value], WireError> {
        match self.get(tag) {
            None => Ok(&[]),
            Some(Value::List(items)) => Ok(items),
            Some(_) => Err(self.type_error(tag, "list")),
        }
    }

    pub fn opt_object(&self, tag: &'static str) -> Result<Option<&Record>, WireError> {
        match self.get(tag) {
            None => Ok(None),
            Some(Value::Object(record)) => Ok(Some(record)),
            Some(_) => Err(self.type_error(tag, "object")),
        }
    }
}
