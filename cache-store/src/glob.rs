//! Translates the store's glob dialect (`*`, `?`, `\` escape) into a regex
//! anchored across the whole key, used by both backends' `deleteMatching`.

use regex::Regex;

pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                } else {
                    out.push_str(&regex::escape("\\"));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    // patterns are operator-supplied key prefixes, not untrusted input; a
    // malformed pattern should not be reachable, but fall back to "match
    // nothing" rather than panicking if it ever is.
    Regex::new(&out).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_trailing_wildcard() {
        let re = glob_to_regex("stale:*");
        assert!(re.is_match("stale:eth_blockNumber:[]"));
        assert!(!re.is_match("negative:eth_blockNumber:[]"));
    }

    #[test]
    fn single_char_wildcard() {
        let re = glob_to_regex("lock:eth_call:?");
        assert!(re.is_match("lock:eth_call:1"));
        assert!(!re.is_match("lock:eth_call:12"));
    }

    #[test]
    fn escapes_literal_special_characters() {
        let re = glob_to_regex(r"fp\.v1:*");
        assert!(re.is_match("fp.v1:eth_blockNumber"));
        assert!(!re.is_match("fpXv1:eth_blockNumber"));
    }
}
