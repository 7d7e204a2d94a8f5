//! 可选字段的特性门控。
//!
//! 连接登录后双方交换 `(构建版本, 构建日期)`，编码器据此查静态表决定某个可选字段是否
//! 写出，使同一套编解码器可以与旧版本对端互通。

use std::{cmp::Ordering, sync::Arc};

/// 对端的构建戳。
///
/// # 教案式说明
/// - **意图 (Why)**：特性门控需要同时比较版本串与构建日期，二者任一缺失都视为不支持；
/// - **契约 (What)**：`date` 以 `yyyymmdd` 十进制整数表示（例如 `20030225`），
///   `version` 形如 `V2.1`、`V2.0B5`；
/// - **风险 (Trade-offs)**：版本串只解析前导数字段，`B5` 之类的后缀不参与比较，
///   与构建日期配合已足以区分历史版本。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildStamp {
    pub version: Arc<str>,
    pub date: u32,
}

impl BuildStamp {
    pub fn new(version: impl Into<Arc<str>>, date: u32) -> Self {
        Self {
            version: version.into(),
            date,
        }
    }

    /// 当前构建自身的戳。
    pub fn current() -> Self {
        Self::new(PROTOCOL_VERSION, CURRENT_BUILD_DATE)
    }

    /// 判断该构建是否支持 `feature`。
    pub fn supports(&self, feature: Feature) -> bool {
        if self.version.is_empty() || self.date == 0 {
            return false;
        }
        if let Some(minimum) = feature.minimum_version() {
            if compare_versions(&self.version, minimum) == Ordering::Less {
                return false;
            }
        }
        self.date >= feature.minimum_date()
    }
}

/// 本构建的协议版本串。
pub const PROTOCOL_VERSION: &str = "V3.0";

/// 本构建的日期戳，随发布更新。
pub const CURRENT_BUILD_DATE: u32 = 20261017;

/// 受门控的可选特性。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Feature {
    /// 登录帧携带用户名与口令。
    Usernames,
    /// 心跳帧可携带回显数据。
    PingsWithData,
}

impl Feature {
    /// 首次支持该特性的构建日期。
    ///
    /// 后出现的特性隐含依赖先出现的特性，因此取沿途各日期的最大值。
    pub const fn minimum_date(self) -> u32 {
        match self {
            Feature::Usernames => 20030114,
            Feature::PingsWithData => max_date(20030225, Feature::Usernames.minimum_date()),
        }
    }

    pub const fn minimum_version(self) -> Option<&'static str> {
        match self {
            Feature::Usernames => None,
            Feature::PingsWithData => Some("V2.1"),
        }
    }
}

const fn max_date(a: u32, b: u32) -> u32 {
    if a > b { a } else { b }
}

fn numeric_parts(version: &str) -> Vec<u32> {
    version
        .trim_start_matches(['V', 'v'])
        .split('.')
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

fn compare_versions(left: &str, right: &str) -> Ordering {
    numeric_parts(left).cmp(&numeric_parts(right))
}

/// 编码器视角的对端能力。
///
/// 登录完成前对端未知，此时按“全部支持”处理：登录帧本身只会被更新的对端发送，
/// 旧对端会按未知标签跳过多余字段。
#[derive(Clone, Debug, Default)]
pub struct PeerFeatures {
    peer: Option<BuildStamp>,
}

impl PeerFeatures {
    pub fn new(peer: Option<BuildStamp>) -> Self {
        Self { peer }
    }

    pub fn allows(&self, feature: Feature) -> bool {
        self.peer
            .as_ref()
            .is_none_or(|stamp| stamp.supports(feature))
    }

    pub fn peer(&self) -> Option<&BuildStamp> {
        self.peer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pings_with_data_requires_version_and_date() {
        assert!(BuildStamp::new("V2.1", 20030304).supports(Feature::PingsWithData));
        assert!(!BuildStamp::new("V2.0B5", 20030304).supports(Feature::PingsWithData));
        assert!(!BuildStamp::new("V2.1", 20030224).supports(Feature::PingsWithData));
        assert!(!BuildStamp::new("", 20030304).supports(Feature::PingsWithData));
    }

    #[test]
    fn later_features_imply_earlier_dates() {
        assert!(Feature::PingsWithData.minimum_date() >= Feature::Usernames.minimum_date());
        assert!(BuildStamp::new("V1.9", 20030114).supports(Feature::Usernames));
    }

    #[test]
    fn unknown_peer_allows_everything() {
        let features = PeerFeatures::default();
        assert!(features.allows(Feature::PingsWithData));
        let old = PeerFeatures::new(Some(BuildStamp::new("V2.0", 20021106)));
        assert!(!old.allows(Feature::PingsWithData));
    }

    #[test]
    fn current_build_supports_all_features() {
        let current = BuildStamp::current();
        assert!(current.supports(Feature::Usernames));
        assert!(current.supports(Feature::PingsWithData));
    }
}
