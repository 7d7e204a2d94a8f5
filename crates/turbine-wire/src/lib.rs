#![doc = r#"
# turbine-wire

## 章节定位（Why）
- **目标**：为控制通道提供统一的帧格式：带标签字段、文本/二进制两种语法、按种类的差分编码；
- **边界**：只处理“字节 ↔ [`Message`]”的转换与连接级缓存，不涉及任何 IO；
  传输层持有 [`FrameEncoder`] / [`FrameDecoder`] 并负责读写套接字。

## 帧结构（What）
- 文本：`CMD { TAG value TAG value ... }`，登录阶段使用，便于人工排障；
- 二进制：`u32` 长度前缀后接种类字节、`{`、`(标签下标, 值)*`、`}`，登录完成后切换；
- 每种帧拥有独立标签表（[`Kind::tags`]），解码遇到未知标签时跳过其值，
  因此较新的对端多写的可选字段不会破坏较旧的接收端；
- 可选字段由 [`Feature`] 表按对端 `(版本, 构建日期)` 门控。

## 差分编码（How）
- 参见 [`codec`] 模块；开关通过 [`WireConfig`] 显式注入并在登录时协商，连接存续期间固定。
"#]

mod binary;
pub mod codec;
pub mod error;
pub mod feature;
pub mod message;
pub mod schema;
mod text;
pub mod value;

pub use codec::{
    DEFAULT_MAX_FRAME, Frame, FrameDecoder, FrameEncoder, FrameMode, MAX_NESTING, Negotiated,
    WireConfig, diff_records, encode_frame, merge_records,
};
pub use error::WireError;
pub use feature::{BuildStamp, CURRENT_BUILD_DATE, Feature, PROTOCOL_VERSION, PeerFeatures};
pub use message::{
    ExceptionKind, ExceptionMessage, Login, Message, PathMessage, PeerUpdate, Ping, RoleReversal,
    RouteRequest, Routed, ServerTree, ShortcutInfo,
};
pub use schema::Kind;
pub use value::{Record, Value};
