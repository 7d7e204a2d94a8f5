//! 消息种类与标签表。
//!
//! 每一种帧（顶层命令或嵌套对象）都有一个三字母命令字与一张有序标签表。文本模式按名字
//! 书写标签，二进制模式写入标签在表中的下标，因此标签表只能追加、不能重排。

/// 帧种类。
///
/// # 教案式说明
/// - **意图 (Why)**：用封闭枚举取代运行期类型判断，解码时一次分派即可得到具体种类；
/// - **契约 (What)**：`index()` 即二进制模式中的种类字节，`command()` 即文本模式中的命令字；
///   二者在协议生命周期内保持稳定；
/// - **风险 (Trade-offs)**：新增种类只能追加在末尾，否则旧版本对端会把下标解释成别的种类。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Kind {
    Login,
    Ping,
    Exception,
    RouteRequest,
    ServerTree,
    PeerUpdate,
    Shortcut,
    RoleReversal,
    Path,
    Routed,
    DataChannelOpen,
    Stop,
}

const KINDS: [Kind; 12] = [
    Kind::Login,
    Kind::Ping,
    Kind::Exception,
    Kind::RouteRequest,
    Kind::ServerTree,
    Kind::PeerUpdate,
    Kind::Shortcut,
    Kind::RoleReversal,
    Kind::Path,
    Kind::Routed,
    Kind::DataChannelOpen,
    Kind::Stop,
];

impl Kind {
    /// 文本模式的命令字。
    pub const fn command(self) -> &'static str {
        match self {
            Kind::Login => "LGN",
            Kind::Ping => "PNG",
            Kind::Exception => "EXM",
            Kind::RouteRequest => "RTQ",
            Kind::ServerTree => "SRV",
            Kind::PeerUpdate => "PUP",
            Kind::Shortcut => "SHC",
            Kind::RoleReversal => "RVS",
            Kind::Path => "PTH",
            Kind::Routed => "RTD",
            Kind::DataChannelOpen => "DLC",
            Kind::Stop => "STP",
        }
    }

    /// 本种类的标签表，顺序即二进制下标。
    pub const fn tags(self) -> &'static [&'static str] {
        match self {
            Kind::Login => &["USR", "PWD", "VER", "DAT", "DIF", "CID", "DCH"],
            Kind::Ping => &["DAT"],
            Kind::Exception => &["KND", "MSG"],
            Kind::RouteRequest => &["NAM", "ADR", "TGT"],
            Kind::ServerTree => &["NAM", "ADR", "CHL"],
            Kind::PeerUpdate => &["ADR", "NAM", "UPC", "SHC"],
            Kind::Shortcut => &["NAM", "ADR", "CST", "ACT"],
            Kind::RoleReversal => &["NAM", "ADR", "PRM", "TRE"],
            Kind::Path => &["SRV", "CST"],
            Kind::Routed => &["DST", "PLD"],
            Kind::DataChannelOpen => &["CID"],
            Kind::Stop => &[],
        }
    }

    pub const fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        KINDS.get(usize::from(index)).copied()
    }

    pub fn from_command(command: &str) -> Option<Self> {
        KINDS.iter().copied().find(|kind| kind.command() == command)
    }

    /// 按名字查标签下标；未知标签返回 `None`，由解码器跳过其值。
    pub fn tag_index(self, tag: &str) -> Option<u8> {
        self.tags()
            .iter()
            .position(|candidate| *candidate == tag)
            .and_then(|idx| u8::try_from(idx).ok())
    }

    pub fn tag_name(self, index: u8) -> Option<&'static str> {
        self.tags().get(usize::from(index)).copied()
    }

    /// 已登记的全部种类。
    pub fn all() -> &'static [Kind] {
        &KINDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_and_indices_are_unique() {
        for (idx, kind) in Kind::all().iter().enumerate() {
            assert_eq!(usize::from(kind.index()), idx, "下标必须与登记顺序一致");
            assert_eq!(Kind::from_command(kind.command()), Some(*kind));
            assert_eq!(Kind::from_index(kind.index()), Some(*kind));
        }
        assert_eq!(Kind::from_command("ZZZ"), None);
    }

    #[test]
    fn tags_resolve_by_name_and_index() {
        assert_eq!(Kind::PeerUpdate.tag_index("UPC"), Some(2));
        assert_eq!(Kind::PeerUpdate.tag_name(3), Some("SHC"));
        assert_eq!(Kind::RoleReversal.tag_index("PRM"), Some(2));
        assert_eq!(Kind::Ping.tag_index("XYZ"), None);
    }
}
