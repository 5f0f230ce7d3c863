//! Token estimation.
//!
//! CJK ideographs are costed at 1.5 tokens each, everything else at one
//! token per four bytes. Both parts round up, so the estimate of a
//! concatenation never exceeds the sum of the estimates of its parts.

/// Estimate the token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let mut cjk_chars = 0usize;
    let mut other_bytes = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk_chars += 1;
        } else {
            other_bytes += c.len_utf8();
        }
    }

    (cjk_chars * 3).div_ceil(2) + other_bytes.div_ceil(4)
}

/// Estimate tokens for a sequence of text parts.
pub fn estimate_all<'a, I>(parts: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    parts.into_iter().map(estimate_tokens).sum()
}

pub(crate) fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}' | '\u{f900}'..='\u{faff}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_ascii_rounds_up() {
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn test_cjk_costs_more() {
        assert_eq!(estimate_tokens("你好"), 3);
        assert_eq!(estimate_tokens("你"), 2);
        assert!(estimate_tokens("他突然决定离开") > estimate_tokens("abcdefg"));
    }

    #[test]
    fn test_monotonic_when_appending() {
        let mut text = String::new();
        let mut last = 0;
        for piece in ["The ", "storm ", "broke.", " 雷声", "响起", "!"] {
            text.push_str(piece);
            let now = estimate_tokens(&text);
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_concatenation_is_subadditive() {
        let parts = ["Chapter one.", "林风拔剑", "\n\n## heading\n", "x"];
        let joined: String = parts.concat();
        assert!(estimate_tokens(&joined) <= estimate_all(parts));
    }
}
