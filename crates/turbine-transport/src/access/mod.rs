//! # access 模块说明
//!
//! ## 角色定位（Why）
//! - 服务端在接受入站连接后、处理任何应用消息前，用监听地址上的访问控制表判定是否放行；
//! - 规则形如 `pattern[=permissions]`，权限由五个访问类别字母组成。
//!
//! ## 判定逻辑（How）
//! - 候选方的主机名与 IP 字面量都参与匹配；
//! - 同一名单内多个规则同时命中时，通配符密度更低者胜出，常量模式最具体；
//! - 允许与拒绝同时命中时比较二者的具体程度；无规则命中即拒绝。
//!
//! ## 风险提示（Trade-offs）
//! - 拒绝规则不能只拒绝部分权限：只需在允许规则中列出想开放的权限即可。

mod wildcard;

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::Path,
};

pub use wildcard::Wildcard;

use crate::error::TransportError;

/// 访问类别。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AccessClass {
    Control,
    Plugin,
    Router,
    Sink,
    Source,
}

impl AccessClass {
    pub const ALL: [AccessClass; 5] = [
        AccessClass::Control,
        AccessClass::Plugin,
        AccessClass::Router,
        AccessClass::Sink,
        AccessClass::Source,
    ];

    pub const fn letter(self) -> char {
        match self {
            AccessClass::Control => 'X',
            AccessClass::Plugin => 'P',
            AccessClass::Router => 'T',
            AccessClass::Sink => 'R',
            AccessClass::Source => 'W',
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// 权限位图，每个 [`AccessClass`] 占一位。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const ALL: Permissions = Permissions(0x1f);

    pub fn parse(letters: &str) -> Option<Self> {
        letters.chars().try_fold(Permissions::NONE, |acc, letter| {
            AccessClass::ALL
                .iter()
                .find(|class| class.letter() == letter.to_ascii_uppercase())
                .map(|class| Permissions(acc.0 | class.bit()))
        })
    }

    pub fn contains(self, class: AccessClass) -> bool {
        self.0 & class.bit() != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for class in AccessClass::ALL {
            if self.contains(class) {
                write!(f, "{}", class.letter())?;
            }
        }
        Ok(())
    }
}

/// 一条 `(pattern, permissions)` 规则。
#[derive(Clone, Debug)]
pub struct AccessRule {
    pattern: Wildcard,
    permissions: Permissions,
    implicit: bool,
}

impl AccessRule {
    /// 解析 `pattern[=permissions]`；省略权限即授予全部类别。
    ///
    /// `localhost` 被替换为本机回环地址，反查主机名失败时回环对端仍能命中。
    pub fn parse(rule: &str) -> Result<Self, TransportError> {
        let invalid = |reason| TransportError::InvalidRule {
            rule: rule.to_owned(),
            reason,
        };
        let (pattern, permissions) = match rule.rsplit_once('=') {
            Some((pattern, letters)) => (
                pattern,
                Permissions::parse(letters).ok_or_else(|| invalid("unknown permission letter"))?,
            ),
            None => (rule, Permissions::ALL),
        };
        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        let pattern = if pattern.eq_ignore_ascii_case("localhost") {
            Ipv4Addr::LOCALHOST.to_string()
        } else {
            pattern.to_owned()
        };
        Ok(Self {
            pattern: Wildcard::new(&pattern).map_err(invalid)?,
            permissions,
            implicit: false,
        })
    }

    fn implicit_allow_all() -> Self {
        Self {
            pattern: Wildcard::any(),
            permissions: Permissions::ALL,
            implicit: true,
        }
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.pattern.matches(candidate)
    }

    /// `self` 是否比 `other` 更具体。
    ///
    /// 常量模式比任何通配模式具体；两个通配模式比较密度，密度相同视为更具体，
    /// 因此同密度时后加入的规则胜出；两个常量模式互不更具体。
    pub fn is_more_specific(&self, other: &AccessRule) -> bool {
        if other.pattern.is_constant() {
            return false;
        }
        self.pattern.is_constant() || self.pattern.wildness() <= other.pattern.wildness()
    }
}

/// 入站候选方：IP 字面量与（若已知）主机名。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Candidate {
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
}

impl Candidate {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            host: None,
            ip: Some(ip),
        }
    }

    /// 进程内对端视为本机回环。
    pub fn loopback() -> Self {
        Self {
            host: Some("localhost".to_owned()),
            ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    fn identities(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if let Some(host) = &self.host {
            out.push(host.clone());
        }
        if let Some(ip) = self.ip {
            out.push(ip.to_string());
        }
        out
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, &self.ip) {
            (Some(host), Some(ip)) => write!(f, "{host} ({ip})"),
            (Some(host), None) => f.write_str(host),
            (None, Some(ip)) => write!(f, "{ip}"),
            (None, None) => f.write_str("<unknown peer>"),
        }
    }
}

/// 允许/拒绝两张名单。
///
/// # 教案式说明
/// - **意图 (Why)**：把授权文件的语义固化为可测试的纯函数，接受路径上只做一次同步判定；
/// - **契约 (What)**：未显式允许任何模式时隐含 `*` 允许全部；拒绝规则不携带权限；
///   加入拒绝规则会移除同模式的允许规则；
/// - **风险 (Trade-offs)**：候选方的多个身份必须全部放行才算放行，
///   仅凭隐含的 `*` 放行某一身份而另一身份未被放行时判定为拒绝。
#[derive(Clone, Debug, Default)]
pub struct AccessControl {
    allow: Vec<AccessRule>,
    deny: Vec<AccessRule>,
}

impl AccessControl {
    /// 只含隐含 `*` 的访问控制表。
    pub fn allow_all() -> Self {
        Self {
            allow: vec![AccessRule::implicit_allow_all()],
            deny: Vec::new(),
        }
    }

    pub fn allow(&mut self, rule: AccessRule) -> &mut Self {
        self.allow.retain(|existing| !existing.implicit);
        self.allow.push(rule);
        self
    }

    pub fn deny(&mut self, rule: &str) -> Result<&mut Self, TransportError> {
        let parsed = AccessRule::parse(rule)?;
        if parsed.permissions != Permissions::ALL {
            return Err(TransportError::InvalidRule {
                rule: rule.to_owned(),
                reason: "deny rules cannot name specific permissions",
            });
        }
        if self.deny.iter().any(|existing| existing.pattern() == parsed.pattern()) {
            return Ok(self);
        }
        self.allow.retain(|existing| existing.pattern() != parsed.pattern());
        self.deny.push(AccessRule {
            permissions: Permissions::NONE,
            ..parsed
        });
        Ok(self)
    }

    /// 解析授权文件文本：`ALLOW`/`DENY` 关键字切换名单，`#` 开头的行为注释。
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Allow,
            Deny,
        }
        let mut control = AccessControl::default();
        let mut section = Section::None;
        let mut allowed = false;
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            for token in line.split_whitespace() {
                if token.eq_ignore_ascii_case("ALLOW") {
                    section = Section::Allow;
                } else if token.eq_ignore_ascii_case("DENY") {
                    section = Section::Deny;
                } else {
                    match section {
                        Section::None => {
                            return Err(TransportError::InvalidRule {
                                rule: token.to_owned(),
                                reason: "pattern appears before ALLOW or DENY",
                            });
                        }
                        Section::Allow => {
                            allowed = true;
                            control.allow(AccessRule::parse(token)?);
                        }
                        Section::Deny => {
                            control.deny(token)?;
                        }
                    }
                }
            }
        }
        if !allowed {
            control.allow.push(AccessRule::implicit_allow_all());
        }
        Ok(control)
    }

    pub fn from_auth_file(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|err| TransportError::io("read authorization file", err))?;
        Self::parse(&text)
    }

    pub fn allow_rules(&self) -> &[AccessRule] {
        &self.allow
    }

    pub fn deny_rules(&self) -> &[AccessRule] {
        &self.deny
    }

    /// 求候选方的有效权限；`None` 表示被拒绝。
    pub fn permissions_for(&self, candidate: &Candidate) -> Option<Permissions> {
        let mut best: Option<&AccessRule> = None;
        for identity in candidate.identities() {
            let Some(allowed) = best_match(&self.allow, &identity) else {
                if best.is_some_and(|rule| rule.implicit) {
                    best = None;
                }
                continue;
            };
            let denied = best_match(&self.deny, &identity);
            match denied {
                Some(denied) if !allowed.is_more_specific(denied) => {
                    let replace = match best {
                        Some(current) if current.permissions != Permissions::NONE => {
                            !current.is_more_specific(denied)
                        }
                        Some(current) => denied.is_more_specific(current),
                        None => true,
                    };
                    if replace {
                        best = Some(denied);
                    }
                }
                _ => {
                    if best.is_none_or(|current| allowed.is_more_specific(current)) {
                        best = Some(allowed);
                    }
                }
            }
        }
        best.map(|rule| rule.permissions)
            .filter(|permissions| *permissions != Permissions::NONE)
    }

    pub fn is_allowed(&self, candidate: &Candidate, class: AccessClass) -> bool {
        self.permissions_for(candidate)
            .is_some_and(|permissions| permissions.contains(class))
    }
}

fn best_match<'a>(rules: &'a [AccessRule], identity: &str) -> Option<&'a AccessRule> {
    let mut best: Option<&AccessRule> = None;
    for rule in rules {
        if rule.matches(identity) && best.is_none_or(|current| rule.is_more_specific(current)) {
            best = Some(rule);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(text: &str) -> Candidate {
        Candidate::from_ip(text.parse().expect("合法 IP"))
    }

    #[test]
    fn permission_letters_map_to_classes() {
        let rule = AccessRule::parse("10.*=RW").expect("规则");
        assert!(rule.permissions().contains(AccessClass::Sink));
        assert!(rule.permissions().contains(AccessClass::Source));
        assert!(!rule.permissions().contains(AccessClass::Router));
        assert_eq!(rule.permissions().to_string(), "RW");
        assert_eq!(AccessRule::parse("host").expect("规则").permissions(), Permissions::ALL);
        assert!(AccessRule::parse("host=Q").is_err());
    }

    #[test]
    fn localhost_maps_to_loopback() {
        let mut control = AccessControl::default();
        control.allow(AccessRule::parse("localhost=X").expect("规则"));
        assert!(control.is_allowed(&ip("127.0.0.1"), AccessClass::Control));
        assert!(!control.is_allowed(&ip("127.0.0.1"), AccessClass::Router));
    }

    #[test]
    fn unmatched_candidates_are_denied() {
        let control = AccessControl::parse("ALLOW 10.0.0.*").expect("授权文本");
        assert!(control.is_allowed(&ip("10.0.0.5"), AccessClass::Sink));
        assert!(!control.is_allowed(&ip("192.168.0.5"), AccessClass::Sink));
    }

    #[test]
    fn more_specific_allow_beats_broad_deny() {
        let control = AccessControl::parse(
            "# 拒绝整个网段，只放行其中一台\nDENY 10.0.*\nALLOW 10.0.0.7=TX\n",
        )
        .expect("授权文本");
        assert!(control.is_allowed(&ip("10.0.0.7"), AccessClass::Router));
        assert!(!control.is_allowed(&ip("10.0.0.8"), AccessClass::Router));
    }

    #[test]
    fn deny_without_allow_keeps_default_wildcard() {
        let control = AccessControl::parse("DENY 192.168.1.13").expect("授权文本");
        assert!(control.is_allowed(&ip("192.168.1.14"), AccessClass::Control));
        assert!(!control.is_allowed(&ip("192.168.1.13"), AccessClass::Control));
    }

    #[test]
    fn file_syntax_errors_are_reported() {
        assert!(AccessControl::parse("10.0.0.1").is_err(), "缺少 ALLOW/DENY 前缀");
        assert!(AccessControl::parse("DENY host=R").is_err(), "拒绝规则不能携带权限");
    }
}
