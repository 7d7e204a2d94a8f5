//! 层级服务器名：`/root/child/grandchild`。
//!
//! 名称本身即编码了树结构：父名是去掉最后一段后的前缀，祖先关系就是按段的前缀关系。

/// 校验名称：以 `/` 开头、不以 `/` 结尾、不含空段。
pub fn validate(name: &str) -> Result<(), &'static str> {
    let Some(rest) = name.strip_prefix('/') else {
        return Err("server names start with `/`");
    };
    if rest.is_empty() {
        return Err("server name has no segments");
    }
    if rest.split('/').any(str::is_empty) {
        return Err("server name contains an empty segment");
    }
    Ok(())
}

/// 上一级名称；根服务器没有父级。
pub fn parent_of(name: &str) -> Option<&str> {
    let cut = name.rfind('/')?;
    (cut > 0).then(|| &name[..cut])
}

/// 段数，即在树中的深度（根为 1）。
pub fn depth(name: &str) -> usize {
    name.split('/').filter(|segment| !segment.is_empty()).count()
}

/// `name` 是否位于 `ancestor` 的子树中（不含自身）。
pub fn is_descendant(name: &str, ancestor: &str) -> bool {
    name.len() > ancestor.len()
        && name.starts_with(ancestor)
        && name.as_bytes()[ancestor.len()] == b'/'
}

/// 同一棵树：首段相同。
pub fn same_root(a: &str, b: &str) -> bool {
    root_of(a) == root_of(b)
}

pub fn root_of(name: &str) -> &str {
    match name[1.min(name.len())..].find('/') {
        Some(cut) => &name[..cut + 1],
        None => name,
    }
}

/// 从 `ancestor` 往下走到 `name` 途经的每一级名称，不含 `ancestor`，含 `name`。
pub fn chain_below<'a>(ancestor: &str, name: &'a str) -> Vec<&'a str> {
    if !is_descendant(name, ancestor) {
        return Vec::new();
    }
    let mut chain = Vec::new();
    let mut cursor = ancestor.len() + 1;
    while let Some(next) = name[cursor..].find('/') {
        chain.push(&name[..cursor + next]);
        cursor += next + 1;
    }
    chain.push(name);
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_follows_segments() {
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_of("/a"), None);
        assert_eq!(depth("/a/b/c"), 3);
        assert_eq!(root_of("/a/b/c"), "/a");
        assert_eq!(root_of("/a"), "/a");
        assert!(is_descendant("/a/b", "/a"));
        assert!(!is_descendant("/ab", "/a"));
        assert!(!is_descendant("/a", "/a"));
        assert!(same_root("/a/x", "/a/y/z"));
        assert!(!same_root("/a/x", "/b/x"));
    }

    #[test]
    fn chain_walks_every_level() {
        assert_eq!(chain_below("/a", "/a/b/c/d"), vec!["/a/b", "/a/b/c", "/a/b/c/d"]);
        assert_eq!(chain_below("/a/b", "/a/b/c"), vec!["/a/b/c"]);
        assert!(chain_below("/a/b", "/x/y").is_empty());
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert!(validate("/a/b").is_ok());
        assert!(validate("a/b").is_err());
        assert!(validate("/").is_err());
        assert!(validate("/a//b").is_err());
        assert!(validate("/a/").is_err());
    }
}
