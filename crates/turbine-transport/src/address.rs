use core::fmt;
use std::{hash, sync::Arc};

use crate::{
    access::{AccessClass, AccessControl, Candidate},
    error::TransportError,
};

/// 未显式给出主机时使用的默认主机。
pub const DEFAULT_HOST: &str = "localhost";
/// 未显式给出端口时使用的默认端口。
pub const DEFAULT_PORT: u16 = 3333;

/// 传输协议族。
///
/// # 教案级说明
///
/// ## 意图（Why）
/// - 地址串中的协议前缀决定由哪一个 [`crate::Transport`] 负责拨号与监听；
/// - 以封闭枚举表达已知协议，未知协议在解析阶段即报寻址错误。
///
/// ## 契约（What）
/// - `Tcp`：面向连接的套接字传输，前缀 `tcp`；未写前缀时的默认值；
/// - `InProcess`：同一运行时内的进程内传输，前缀 `ram` 或 `internal`；
/// - 前缀大小写不敏感。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Scheme {
    Tcp,
    InProcess,
}

impl Scheme {
    pub fn parse(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "tcp" => Some(Scheme::Tcp),
            "ram" | "internal" => Some(Scheme::InProcess),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::InProcess => "ram",
        }
    }
}

/// 经过校验的端点描述。
///
/// # 教案级说明
///
/// ## 意图（Why）
/// - 把 `scheme://[user[:password]@]host[:port]` 形式的字符串一次性解析为不可变值，
///   后续拨号、监听、访问控制都只消费结构化字段；
/// - 监听地址可以附带访问控制表，接受连接时据此判定是否放行。
///
/// ## 契约（What）
/// - `parse`：无 `//` 时视为套接字传输；TCP 主机缺省为 `localhost`、端口缺省为 `3333`；
///   进程内地址的“主机”即通道名，不允许为空；
/// - 相等性只比较协议、主机、端口与用户名，不比较口令与访问控制表；
/// - **后置条件**：构造完成后不再变化，`with_access` 返回新值。
///
/// ## 风险提示（Trade-offs）
/// - 主机名不做 DNS 解析，解析推迟到拨号时由具体传输完成。
#[derive(Clone)]
pub struct Address {
    scheme: Scheme,
    host: Arc<str>,
    port: Option<u16>,
    username: Option<Arc<str>>,
    password: Option<Arc<str>>,
    access: Option<Arc<AccessControl>>,
}

impl Address {
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let trimmed = input.trim();
        let malformed = |reason| TransportError::MalformedAddress {
            input: input.to_owned(),
            reason,
        };
        if trimmed.is_empty() {
            return Err(malformed("address is empty"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((prefix, rest)) => {
                let scheme =
                    Scheme::parse(prefix).ok_or_else(|| TransportError::UnsupportedScheme {
                        scheme: prefix.to_owned(),
                    })?;
                (scheme, rest)
            }
            None => (Scheme::Tcp, trimmed),
        };

        let (credentials, endpoint) = match rest.rsplit_once('@') {
            Some((credentials, endpoint)) => (Some(credentials), endpoint),
            None => (None, rest),
        };
        let (username, password) = match credentials {
            Some(credentials) => match credentials.split_once(':') {
                Some((user, password)) => (non_empty(user), non_empty(password)),
                None => (non_empty(credentials), None),
            },
            None => (None, None),
        };

        let (host, port) = match scheme {
            Scheme::InProcess => {
                if endpoint.is_empty() {
                    return Err(malformed("in-process address needs a channel name"));
                }
                (endpoint.to_owned(), None)
            }
            Scheme::Tcp => {
                let (host, port) = split_host_port(endpoint).map_err(malformed)?;
                let host = if host.is_empty() { DEFAULT_HOST } else { host };
                (host.to_owned(), Some(port.unwrap_or(DEFAULT_PORT)))
            }
        };

        Ok(Self {
            scheme,
            host: host.into(),
            port,
            username,
            password,
            access: None,
        })
    }

    /// 构造进程内地址。
    pub fn in_process(name: &str) -> Self {
        Self {
            scheme: Scheme::InProcess,
            host: name.into(),
            port: None,
            username: None,
            password: None,
            access: None,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// 供 `tokio::net` 使用的 `host:port`，IPv6 字面量自动加方括号。
    pub fn socket_target(&self) -> String {
        let port = self.port.unwrap_or(DEFAULT_PORT);
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }

    pub fn with_credentials(mut self, username: &str, password: Option<&str>) -> Self {
        self.username = non_empty(username);
        self.password = password.and_then(non_empty);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        if self.scheme == Scheme::Tcp {
            self.port = Some(port);
        }
        self
    }

    pub fn with_access(mut self, access: AccessControl) -> Self {
        self.access = Some(Arc::new(access));
        self
    }

    pub fn access(&self) -> Option<&AccessControl> {
        self.access.as_deref()
    }

    /// 判定入站候选方是否被允许以 `class` 身份接入。
    ///
    /// 未附带访问控制表时默认放行；否则由最具体的匹配规则决定，无规则匹配即拒绝。
    pub fn is_allowed_access(&self, candidate: &Candidate, class: AccessClass) -> bool {
        match &self.access {
            None => true,
            Some(access) => access.is_allowed(candidate, class),
        }
    }
}

fn non_empty(text: &str) -> Option<Arc<str>> {
    (!text.is_empty()).then(|| Arc::from(text))
}

fn split_host_port(endpoint: &str) -> Result<(&str, Option<u16>), &'static str> {
    let parse_port = |text: &str| {
        text.parse::<u16>()
            .map_err(|_| "port is not a number between 0 and 65535")
    };
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or("unterminated IPv6 literal")?;
        return match tail {
            "" => Ok((host, None)),
            _ => match tail.strip_prefix(':') {
                Some(port) => Ok((host, Some(parse_port(port)?))),
                None => Err("unexpected characters after IPv6 literal"),
            },
        };
    }
    match endpoint.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Err("IPv6 literals must be bracketed"),
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((endpoint, None)),
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        if let Some(user) = &self.username {
            write!(f, "{user}@")?;
        }
        match self.scheme {
            Scheme::Tcp => f.write_str(&self.socket_target()),
            Scheme::InProcess => f.write_str(&self.host),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("address", &self.to_string())
            .field("access", &self.access.is_some())
            .finish()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.username == other.username
    }
}

impl Eq for Address {}

impl hash::Hash for Address {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.scheme.hash(state);
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
        self.username.hash(state);
    }
}

impl std::str::FromStr for Address {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Address::parse(input)
    }
}
