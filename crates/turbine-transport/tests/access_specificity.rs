//! 访问规则具体程度：两条规则同时命中时，通配符密度更低者胜出，与加入顺序无关。

use proptest::prelude::*;
use turbine_transport::{AccessClass, AccessControl, AccessRule, Candidate};

fn prefix_pattern(octets: &[u8], fixed: usize) -> String {
    let mut pattern = octets[..fixed]
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".");
    pattern.push_str(".*");
    pattern
}

proptest! {
    #[test]
    fn lower_density_wins_regardless_of_order(
        octets in prop::array::uniform4(any::<u8>()),
        fixed in (1usize..=3, 1usize..=3).prop_filter("两条规则长度不同", |(a, b)| a != b),
        swap in any::<bool>(),
    ) {
        let (broad, narrow) = if fixed.0 < fixed.1 { (fixed.0, fixed.1) } else { (fixed.1, fixed.0) };
        let broad_rule = format!("{}=R", prefix_pattern(&octets, broad));
        let narrow_rule = format!("{}=T", prefix_pattern(&octets, narrow));
        let (first, second) = if swap { (&narrow_rule, &broad_rule) } else { (&broad_rule, &narrow_rule) };

        let mut control = AccessControl::default();
        control.allow(AccessRule::parse(first).expect("规则"));
        control.allow(AccessRule::parse(second).expect("规则"));

        let candidate = Candidate::from_ip(std::net::IpAddr::from(octets));
        prop_assert!(control.is_allowed(&candidate, AccessClass::Router));
        prop_assert!(!control.is_allowed(&candidate, AccessClass::Sink));
    }

    #[test]
    fn constant_pattern_beats_any_wildcard(
        octets in prop::array::uniform4(any::<u8>()),
        fixed in 1usize..=3,
        swap in any::<bool>(),
    ) {
        let exact = std::net::Ipv4Addr::from(octets).to_string();
        let constant = format!("{exact}=W");
        let wild = format!("{}=X", prefix_pattern(&octets, fixed));
        let (first, second) = if swap { (&constant, &wild) } else { (&wild, &constant) };

        let mut control = AccessControl::default();
        control.allow(AccessRule::parse(first).expect("规则"));
        control.allow(AccessRule::parse(second).expect("规则"));

        let candidate = Candidate::from_ip(std::net::IpAddr::from(octets));
        prop_assert!(control.is_allowed(&candidate, AccessClass::Source));
        prop_assert!(!control.is_allowed(&candidate, AccessClass::Control));
    }
}
