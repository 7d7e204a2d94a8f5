//! 地址模式的通配符匹配。
//!
//! 支持的语法：
//! - `*` 任意长度、`?` 单个字符；
//! - `[abc]`、`[a-z]` 字符集合，`[!...]` 取反；
//! - `x{2}`、`x{1,3}`、`x{2,}` 对前一个单字符表达式计数重复；
//! - 开头的 `!` 对整个模式取反；顶层 `|` 表示“或”、`&` 表示“且”；
//! - `\` 转义下一个字符。
//!
//! 匹配对 ASCII 大小写不敏感，主机名比较不区分大小写。

const WILDCARD_CHARS: &[char] = &['*', '?', '[', '{', '!', '|', '&'];

/// 编译后的通配符模式。
#[derive(Clone, Debug)]
pub struct Wildcard {
    source: String,
    wild_chars: usize,
    expr: Expr,
}

#[derive(Clone, Debug)]
enum Expr {
    Not(Box<Expr>),
    Any(Vec<Expr>),
    All(Vec<Expr>),
    Seq(Vec<Piece>),
}

#[derive(Clone, Debug)]
enum Piece {
    Literal(char),
    AnyChar,
    AnyRun,
    Set { negate: bool, ranges: Vec<(char, char)> },
    Repeat { piece: Box<Piece>, min: usize, max: Option<usize> },
}

impl Wildcard {
    pub fn new(pattern: &str) -> Result<Self, &'static str> {
        let chars: Vec<char> = pattern.chars().collect();
        let expr = parse_expr(&chars)?;
        Ok(Self {
            source: pattern.to_owned(),
            wild_chars: count_wild(&chars),
            expr,
        })
    }

    /// 通配一切的 `*`。
    pub(crate) fn any() -> Self {
        Self {
            source: "*".to_owned(),
            wild_chars: 1,
            expr: Expr::Seq(vec![Piece::AnyRun]),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 不含任何未转义通配符的模式。
    pub fn is_constant(&self) -> bool {
        self.wild_chars == 0
    }

    /// 通配符密度：未转义通配符个数 / 模式长度。
    pub fn wildness(&self) -> f64 {
        let len = self.source.chars().count();
        if len == 0 {
            return 0.0;
        }
        self.wild_chars as f64 / len as f64
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let text: Vec<char> = candidate.chars().map(|c| c.to_ascii_lowercase()).collect();
        eval(&self.expr, &text)
    }
}

fn count_wild(chars: &[char]) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for &c in chars {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if WILDCARD_CHARS.contains(&c) {
            count += 1;
        }
    }
    count
}

/// 按顶层未转义的 `sep` 切分。
fn split_top(chars: &[char], sep: char) -> Vec<&[char]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    let mut in_set = false;
    while idx < chars.len() {
        match chars[idx] {
            '\\' => idx += 1,
            '[' => in_set = true,
            ']' => in_set = false,
            c if c == sep && !in_set => {
                parts.push(&chars[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
        idx += 1;
    }
    parts.push(&chars[start.min(chars.len())..]);
    parts
}

fn parse_expr(chars: &[char]) -> Result<Expr, &'static str> {
    if let Some(('!', rest)) = chars.split_first().map(|(c, rest)| (*c, rest)) {
        return Ok(Expr::Not(Box::new(parse_expr(rest)?)));
    }
    let alternatives = split_top(chars, '|');
    if alternatives.len() > 1 {
        return alternatives
            .into_iter()
            .map(parse_expr)
            .collect::<Result<_, _>>()
            .map(Expr::Any);
    }
    let conjuncts = split_top(chars, '&');
    if conjuncts.len() > 1 {
        return conjuncts
            .into_iter()
            .map(parse_expr)
            .collect::<Result<_, _>>()
            .map(Expr::All);
    }
    parse_seq(chars).map(Expr::Seq)
}

fn parse_seq(chars: &[char]) -> Result<Vec<Piece>, &'static str> {
    let mut pieces: Vec<Piece> = Vec::new();
    let mut idx = 0;
    while idx < chars.len() {
        let c = chars[idx];
        idx += 1;
        let piece = match c {
            '\\' => {
                let quoted = *chars.get(idx).ok_or("dangling escape")?;
                idx += 1;
                Piece::Literal(quoted.to_ascii_lowercase())
            }
            '*' => Piece::AnyRun,
            '?' => Piece::AnyChar,
            '[' => {
                let (piece, used) = parse_set(&chars[idx..])?;
                idx += used;
                piece
            }
            '{' => {
                let (min, max, used) = parse_count(&chars[idx..])?;
                idx += used;
                let previous = pieces.pop().ok_or("repeat count without an expression")?;
                if matches!(previous, Piece::AnyRun | Piece::Repeat { .. }) {
                    return Err("repeat count must follow a single-character expression");
                }
                Piece::Repeat {
                    piece: Box::new(previous),
                    min,
                    max,
                }
            }
            other => Piece::Literal(other.to_ascii_lowercase()),
        };
        pieces.push(piece);
    }
    Ok(pieces)
}

fn parse_set(chars: &[char]) -> Result<(Piece, usize), &'static str> {
    let mut idx = 0;
    let negate = chars.first() == Some(&'!');
    if negate {
        idx += 1;
    }
    let mut members = Vec::new();
    loop {
        let c = *chars.get(idx).ok_or("unterminated character set")?;
        idx += 1;
        match c {
            ']' => break,
            '\\' => {
                members.push(*chars.get(idx).ok_or("dangling escape")?);
                idx += 1;
            }
            other => members.push(other),
        }
    }
    let members: Vec<char> = members.iter().map(char::to_ascii_lowercase).collect();
    let ranges = if members.len() == 3 && members[1] == '-' {
        vec![(members[0], members[2])]
    } else {
        members.iter().map(|c| (*c, *c)).collect()
    };
    Ok((Piece::Set { negate, ranges }, idx))
}

fn parse_count(chars: &[char]) -> Result<(usize, Option<usize>, usize), &'static str> {
    let close = chars
        .iter()
        .position(|c| *c == '}')
        .ok_or("unterminated repeat count")?;
    let body: String = chars[..close].iter().collect();
    let number = |text: &str| text.trim().parse::<usize>().map_err(|_| "repeat count is not a number");
    let (min, max) = match body.split_once(',') {
        None => {
            let exact = number(&body)?;
            (exact, Some(exact))
        }
        Some((min, max)) => {
            let min = if min.trim().is_empty() { 0 } else { number(min)? };
            let max = if max.trim().is_empty() { None } else { Some(number(max)?) };
            (min, max)
        }
    };
    if max.is_some_and(|max| max < min) {
        return Err("repeat maximum below minimum");
    }
    Ok((min, max, close + 1))
}

fn eval(expr: &Expr, text: &[char]) -> bool {
    match expr {
        Expr::Not(inner) => !eval(inner, text),
        Expr::Any(options) => options.iter().any(|option| eval(option, text)),
        Expr::All(parts) => parts.iter().all(|part| eval(part, text)),
        Expr::Seq(pieces) => match_seq(pieces, text),
    }
}

fn accepts(piece: &Piece, c: char) -> bool {
    match piece {
        Piece::Literal(expected) => *expected == c,
        Piece::AnyChar => true,
        Piece::Set { negate, ranges } => {
            let inside = ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c));
            inside != *negate
        }
        Piece::AnyRun | Piece::Repeat { .. } => false,
    }
}

fn match_seq(pieces: &[Piece], text: &[char]) -> bool {
    let Some((first, rest)) = pieces.split_first() else {
        return text.is_empty();
    };
    match first {
        Piece::AnyRun => (0..=text.len()).any(|skip| match_seq(rest, &text[skip..])),
        Piece::Repeat { piece, min, max } => {
            let limit = max.unwrap_or(text.len()).min(text.len());
            if *min > limit {
                return false;
            }
            let accepted = text[..limit]
                .iter()
                .take_while(|c| accepts(piece, **c))
                .count();
            (*min..=accepted).any(|count| match_seq(rest, &text[count..]))
        }
        single => match text.split_first() {
            Some((c, tail)) => accepts(single, *c) && match_seq(rest, tail),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wild(pattern: &str) -> Wildcard {
        Wildcard::new(pattern).expect("模式应可编译")
    }

    #[test]
    fn star_and_question_mark() {
        assert!(wild("*").matches("anything.example"));
        assert!(wild("192.168.1.*").matches("192.168.1.20"));
        assert!(!wild("192.168.1.*").matches("192.168.2.20"));
        assert!(wild("host?").matches("HOST7"));
        assert!(!wild("host?").matches("host"));
    }

    #[test]
    fn sets_repeats_and_escapes() {
        assert!(wild("10.0.0.[1-3]").matches("10.0.0.2"));
        assert!(!wild("10.0.0.[!1-3]").matches("10.0.0.2"));
        assert!(wild("a[0-9]{2,3}").matches("a123"));
        assert!(!wild("a[0-9]{2,3}").matches("a1"));
        assert!(wild(r"literal\*").matches("literal*"));
        assert!(wild(r"literal\*").is_constant());
    }

    #[test]
    fn top_level_operators() {
        assert!(wild("alpha|beta").matches("beta"));
        assert!(wild("*.example&web*").matches("web1.example"));
        assert!(!wild("*.example&web*").matches("db1.example"));
        assert!(wild("!*.blocked").matches("ok.example"));
        assert!(!wild("!*.blocked").matches("x.blocked"));
    }

    #[test]
    fn density_counts_unescaped_wildcards() {
        assert!(wild("host.example").is_constant());
        assert_eq!(wild("*").wildness(), 1.0);
        assert!(wild("192.168.*").wildness() < wild("192.*").wildness());
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for pattern in ["[abc", "a{2", "{2}", "x\\", "a{3,1}"] {
            assert!(Wildcard::new(pattern).is_err(), "`{pattern}` 应编译失败");
        }
    }
}
