//! 控制通道上流动的全部消息。
//!
//! [`Message`] 是封闭的和类型：解码时按命令字一次分派到具体变体，之后的处理逻辑只做
//! `match`，不再做任何运行期类型判断。

use bytes::Bytes;

use crate::{
    error::WireError,
    feature::{BuildStamp, Feature, PeerFeatures},
    schema::Kind,
    value::{Record, Value},
};

/// 登录帧。发起端先发，接收端以同类型帧应答并回填连接编号。
#[derive(Clone, Debug, PartialEq)]
pub struct Login {
    pub username: Option<String>,
    pub password: Option<String>,
    pub stamp: BuildStamp,
    /// 本端是否愿意使用差分编码。
    pub diff: bool,
    /// 接收端分配的连接编号，发起端据此配对数据通道。
    pub connection_id: Option<u64>,
    /// 发起端是否需要批量数据通道。
    pub data_channel: bool,
}

/// 心跳。较新的对端可以携带回显数据。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ping {
    pub data: Option<Bytes>,
}

/// 以数据形式携带的协议级异常。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExceptionKind {
    /// 目标地址上运行的已是另一台服务器。
    AddressInUse,
    AccessDenied,
    Unreachable,
    Protocol,
    Other(String),
}

impl ExceptionKind {
    fn as_str(&self) -> &str {
        match self {
            ExceptionKind::AddressInUse => "AddressInUse",
            ExceptionKind::AccessDenied => "AccessDenied",
            ExceptionKind::Unreachable => "Unreachable",
            ExceptionKind::Protocol => "Protocol",
            ExceptionKind::Other(other) => other,
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "AddressInUse" => ExceptionKind::AddressInUse,
            "AccessDenied" => ExceptionKind::AccessDenied,
            "Unreachable" => ExceptionKind::Unreachable,
            "Protocol" => ExceptionKind::Protocol,
            other => ExceptionKind::Other(other.to_owned()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionMessage {
    pub kind: ExceptionKind,
    pub message: String,
}

/// 子服务器向父服务器（重新）注册路由时发送。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteRequest {
    pub name: String,
    pub address: String,
    /// 请求方认为对端应当是哪台服务器；不符时对端以 `AddressInUse` 拒绝。
    pub target: Option<String>,
}

/// 路由树快照：服务器名、地址与子树。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerTree {
    pub name: String,
    pub address: Option<String>,
    pub children: Vec<ServerTree>,
}

impl ServerTree {
    pub fn leaf(name: impl Into<String>, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            address,
            children: Vec::new(),
        }
    }
}

/// 对等体广播中的捷径条目。
#[derive(Clone, Debug, PartialEq)]
pub struct ShortcutInfo {
    pub name: String,
    pub address: String,
    pub cost: f64,
    pub active: bool,
}

impl ShortcutInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>, cost: f64) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            cost,
            active: true,
        }
    }
}

/// 对等体的版本化快照；计数器更大的更新覆盖旧的。
#[derive(Clone, Debug, PartialEq)]
pub struct PeerUpdate {
    pub address: String,
    pub name: String,
    pub counter: u64,
    pub shortcuts: Vec<ShortcutInfo>,
}

/// 角色反转请求及其应答。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoleReversal {
    pub name: String,
    pub address: String,
    pub from_primary: bool,
    pub tree: Option<ServerTree>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathMessage {
    pub servers: Vec<String>,
    pub cost: u32,
}

/// 需要按路径转发的应用载荷；载荷本身由数据模型协作方负责序列化。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Routed {
    pub destination: String,
    pub payload: Bytes,
}

/// 控制通道消息。
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Login(Login),
    Ping(Ping),
    Exception(ExceptionMessage),
    RouteRequest(RouteRequest),
    RoutingSnapshot(ServerTree),
    PeerUpdate(PeerUpdate),
    RoleReversal(RoleReversal),
    Path(PathMessage),
    Routed(Routed),
    DataChannelOpen { connection_id: u64 },
    Stop,
}

impl Message {
    pub fn exception(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Message::Exception(ExceptionMessage {
            kind,
            message: message.into(),
        })
    }

    pub fn kind(&self) -> Kind {
        match self {
            Message::Login(_) => Kind::Login,
            Message::Ping(_) => Kind::Ping,
            Message::Exception(_) => Kind::Exception,
            Message::RouteRequest(_) => Kind::RouteRequest,
            Message::RoutingSnapshot(_) => Kind::ServerTree,
            Message::PeerUpdate(_) => Kind::PeerUpdate,
            Message::RoleReversal(_) => Kind::RoleReversal,
            Message::Path(_) => Kind::Path,
            Message::Routed(_) => Kind::Routed,
            Message::DataChannelOpen { .. } => Kind::DataChannelOpen,
            Message::Stop => Kind::Stop,
        }
    }

    /// 应用载荷字节数；进程内传输不做序列化，以此计入流量统计。
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Routed(routed) => routed.payload.len(),
            Message::Ping(Ping { data: Some(data) }) => data.len(),
            _ => 0,
        }
    }

    /// 转换为帧记录；受特性门控的可选字段按对端能力决定是否写出。
    pub fn to_record(&self, features: &PeerFeatures) -> Record {
        let mut record = Record::new(self.kind());
        match self {
            Message::Login(login) => {
                if features.allows(Feature::Usernames) {
                    record
                        .set_opt("USR", login.username.clone().map(Value::Text))
                        .set_opt("PWD", login.password.clone().map(Value::Text));
                }
                record
                    .set("VER", Value::Text(login.stamp.version.to_string()))
                    .set("DAT", Value::Int(i64::from(login.stamp.date)))
                    .set("DIF", Value::Bool(login.diff))
                    .set_opt("CID", login.connection_id.map(|id| Value::Int(id as i64)))
                    .set("DCH", Value::Bool(login.data_channel));
            }
            Message::Ping(ping) => {
                if features.allows(Feature::PingsWithData) {
                    record.set_opt("DAT", ping.data.clone().map(Value::Bytes));
                }
            }
            Message::Exception(exception) => {
                record
                    .set("KND", Value::Text(exception.kind.as_str().to_owned()))
                    .set("MSG", Value::Text(exception.message.clone()));
            }
            Message::RouteRequest(request) => {
                record
                    .set("NAM", Value::Text(request.name.clone()))
                    .set("ADR", Value::Text(request.address.clone()))
                    .set_opt("TGT", request.target.clone().map(Value::Text));
            }
            Message::RoutingSnapshot(tree) => return tree_record(tree),
            Message::PeerUpdate(update) => {
                record
                    .set("ADR", Value::Text(update.address.clone()))
                    .set("NAM", Value::Text(update.name.clone()))
                    .set("UPC", Value::Int(update.counter as i64));
                if !update.shortcuts.is_empty() {
                    let items = update.shortcuts.iter().map(shortcut_value).collect();
                    record.set("SHC", Value::List(items));
                }
            }
            Message::RoleReversal(reversal) => {
                record
                    .set("NAM", Value::Text(reversal.name.clone()))
                    .set("ADR", Value::Text(reversal.address.clone()))
                    .set("PRM", Value::Bool(reversal.from_primary))
                    .set_opt(
                        "TRE",
                        reversal
                            .tree
                            .as_ref()
                            .map(|tree| Value::Object(tree_record(tree))),
                    );
            }
            Message::Path(path) => {
                let servers = path.servers.iter().cloned().map(Value::Text).collect();
                record
                    .set("SRV", Value::List(servers))
                    .set("CST", Value::Int(i64::from(path.cost)));
            }
            Message::Routed(routed) => {
                record
                    .set("DST", Value::Text(routed.destination.clone()))
                    .set("PLD", Value::Bytes(routed.payload.clone()));
            }
            Message::DataChannelOpen { connection_id } => {
                record.set("CID", Value::Int(*connection_id as i64));
            }
            Message::Stop => {}
        }
        record
    }

    /// 从完整记录还原消息，缺少必填字段时报告 [`WireError::MissingField`]。
    pub fn from_record(record: &Record) -> Result<Self, WireError> {
        Ok(match record.kind() {
            Kind::Login => Message::Login(Login {
                username: record.opt_text("USR")?,
                password: record.opt_text("PWD")?,
                stamp: BuildStamp::new(record.text("VER")?, non_negative(record, "DAT")? as u32),
                diff: record.bool_or("DIF", false)?,
                connection_id: match record.opt_int("CID")? {
                    Some(_) => Some(non_negative(record, "CID")?),
                    None => None,
                },
                data_channel: record.bool_or("DCH", false)?,
            }),
            Kind::Ping => Message::Ping(Ping {
                data: record.opt_bytes("DAT")?,
            }),
            Kind::Exception => Message::Exception(ExceptionMessage {
                kind: ExceptionKind::parse(&record.text("KND")?),
                message: record.opt_text("MSG")?.unwrap_or_default(),
            }),
            Kind::RouteRequest => Message::RouteRequest(RouteRequest {
                name: record.text("NAM")?,
                address: record.text("ADR")?,
                target: record.opt_text("TGT")?,
            }),
            Kind::ServerTree => Message::RoutingSnapshot(tree_from_record(record)?),
            Kind::PeerUpdate => Message::PeerUpdate(PeerUpdate {
                address: record.text("ADR")?,
                name: record.text("NAM")?,
                counter: non_negative(record, "UPC")?,
                shortcuts: record
                    .opt_list("SHC")?
                    .iter()
                    .map(|item| shortcut_from_value(record.kind(), item))
                    .collect::<Result<_, _>>()?,
            }),
            Kind::Shortcut => {
                return Err(WireError::UnknownCommand {
                    command: Kind::Shortcut.command().to_owned(),
                });
            }
            Kind::RoleReversal => Message::RoleReversal(RoleReversal {
                name: record.text("NAM")?,
                address: record.text("ADR")?,
                from_primary: record.bool_or("PRM", false)?,
                tree: record.opt_object("TRE")?.map(tree_from_record).transpose()?,
            }),
            Kind::Path => Message::Path(PathMessage {
                servers: record
                    .list("SRV")?
                    .iter()
                    .map(|item| match item {
                        Value::Text(name) => Ok(name.clone()),
                        _ => Err(WireError::FieldType {
                            kind: Kind::Path,
                            tag: "SRV",
                            expected: "list of text",
                        }),
                    })
                    .collect::<Result<_, _>>()?,
                cost: u32::try_from(record.opt_int("CST")?.unwrap_or(0)).unwrap_or(u32::MAX),
            }),
            Kind::Routed => Message::Routed(Routed {
                destination: record.text("DST")?,
                payload: record.bytes("PLD")?,
            }),
            Kind::DataChannelOpen => Message::DataChannelOpen {
                connection_id: non_negative(record, "CID")?,
            },
            Kind::Stop => Message::Stop,
        })
    }
}

fn non_negative(record: &Record, tag: &'static str) -> Result<u64, WireError> {
    u64::try_from(record.int(tag)?).map_err(|_| WireError::FieldType {
        kind: record.kind(),
        tag,
        expected: "non-negative int",
    })
}

fn tree_record(tree: &ServerTree) -> Record {
    let mut record = Record::new(Kind::ServerTree);
    record
        .set("NAM", Value::Text(tree.name.clone()))
        .set_opt("ADR", tree.address.clone().map(Value::Text));
    if !tree.children.is_empty() {
        let children = tree
            .children
            .iter()
            .map(|child| Value::Object(tree_record(child)))
            .collect();
        record.set("CHL", Value::List(children));
    }
    record
}

fn tree_from_record(record: &Record) -> Result<ServerTree, WireError> {
    if record.kind() != Kind::ServerTree {
        return Err(WireError::FieldType {
            kind: record.kind(),
            tag: "TRE",
            expected: "SRV object",
        });
    }
    let children = record
        .opt_list("CHL")?
        .iter()
        .map(|item| match item {
            Value::Object(child) => tree_from_record(child),
            _ => Err(WireError::FieldType {
                kind: Kind::ServerTree,
                tag: "CHL",
                expected: "list of SRV objects",
            }),
        })
        .collect::<Result<_, _>>()?;
    Ok(ServerTree {
        name: record.text("NAM")?,
        address: record.opt_text("ADR")?,
        children,
    })
}

fn shortcut_value(shortcut: &ShortcutInfo) -> Value {
    let mut record = Record::new(Kind::Shortcut);
    record
        .set("NAM", Value::Text(shortcut.name.clone()))
        .set("ADR", Value::Text(shortcut.address.clone()))
        .set("CST", Value::Float(shortcut.cost))
        .set("ACT", Value::Bool(shortcut.active));
    Value::Object(record)
}

fn shortcut_from_value(owner: Kind, value: &Value) -> Result<ShortcutInfo, WireError> {
    match value {
        Value::Object(record) if record.kind() == Kind::Shortcut => Ok(ShortcutInfo {
            name: record.text("NAM")?,
            address: record.text("ADR")?,
            cost: record.float_or("CST", 1.0)?,
            active: record.bool_or("ACT", true)?,
        }),
        _ => Err(WireError::FieldType {
            kind: owner,
            tag: "SHC",
            expected: "list of SHC objects",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login() -> Login {
        Login {
            username: Some("alice".into()),
            password: None,
            stamp: BuildStamp::new("V2.0", 20021106),
            diff: true,
            connection_id: Some(7),
            data_channel: false,
        }
    }

    #[test]
    fn login_survives_record_conversion() {
        let message = Message::Login(login());
        let record = message.to_record(&PeerFeatures::default());
        assert_eq!(Message::from_record(&record).expect("登录帧可还原"), message);
    }

    #[test]
    fn ping_data_is_gated_by_peer_build() {
        let message = Message::Ping(Ping {
            data: Some(Bytes::from_static(b"echo")),
        });
        let old_peer = PeerFeatures::new(Some(BuildStamp::new("V2.0", 20021106)));
        let record = message.to_record(&old_peer);
        assert!(record.get("DAT").is_none(), "旧对端不支持带数据的心跳");
        let record = message.to_record(&PeerFeatures::default());
        assert!(record.get("DAT").is_some());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let mut record = Record::new(Kind::RouteRequest);
        record.set("NAM", Value::Text("/a".into()));
        assert_eq!(
            Message::from_record(&record),
            Err(WireError::MissingField {
                kind: Kind::RouteRequest,
                tag: "ADR"
            })
        );
    }

    #[test]
    fn nested_tree_round_trips() {
        let tree = ServerTree {
            name: "/root".into(),
            address: Some("tcp://root:3333".into()),
            children: vec![ServerTree::leaf("/root/a", None)],
        };
        let message = Message::RoleReversal(RoleReversal {
            name: "/edge".into(),
            address: "tcp://edge:3333".into(),
            from_primary: true,
            tree: Some(tree),
        });
        let record = message.to_record(&PeerFeatures::default());
        assert_eq!(Message::from_record(&record).expect("可还原"), message);
    }

    #[test]
    fn unknown_exception_kinds_are_preserved() {
        let message = Message::exception(ExceptionKind::Other("Quota".into()), "too much");
        let record = message.to_record(&PeerFeatures::default());
        assert_eq!(Message::from_record(&record).expect("可还原"), message);
    }
}
