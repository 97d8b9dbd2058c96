//! Rewrites API-key-shaped path segments out of a URL before it is logged
//! or exposed on `/health`. Kept as its own tested helper, the way the
//! teacher isolates small pure functions for unit testing.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

fn api_key_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(v\d+/)?[A-Za-z0-9_-]{20,}$").unwrap())
}

pub fn sanitize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let segments: Vec<String> = url
        .path_segments()
        .map(|segs| {
            segs.map(|seg| {
                if api_key_segment().is_match(seg) {
                    "[API_KEY]".to_string()
                } else {
                    seg.to_string()
                }
            })
            .collect()
        })
        .unwrap_or_default();

    let new_path = format!("/{}", segments.join("/"));
    url.set_path(&new_path);
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_a_bare_api_key_segment() {
        let out = sanitize_url("https://rpc.example.com/abcdefghijklmnopqrstuvwxyz12345");
        assert_eq!(out, "https://rpc.example.com/[API_KEY]");
    }

    #[test]
    fn redacts_a_versioned_api_key_segment() {
        let out = sanitize_url("https://rpc.example.com/v2/abcdefghijklmnopqrstuvwxyz12345");
        assert_eq!(out, "https://rpc.example.com/v2/[API_KEY]");
    }

    #[test]
    fn leaves_short_segments_alone() {
        let out = sanitize_url("https://rpc.example.com/mainnet");
        assert_eq!(out, "https://rpc.example.com/mainnet");
    }

    #[test]
    fn strips_query_strings() {
        let out = sanitize_url("https://rpc.example.com/mainnet?apikey=shouldnotleak1234567890");
        assert_eq!(out, "https://rpc.example.com/mainnet");
    }
}
