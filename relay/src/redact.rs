//! Secret redaction for sensitive data in logs, configuration `Debug` impls,
//! and log-line scrubbing.
//!
//! [`Redacted`] is carried over unchanged from the multichain lineage's
//! wrapper type. [`scrub_line`] is new: a best-effort regex-free scanner that
//! strips 64-hex sequences (private keys, tx hashes we don't want correlated
//! with secrets by pattern alone), bearer tokens, and RPC-URL-embedded API
//! keys from a rendered log line before it reaches the configured writer
//! (§4.11).

use std::fmt::{self, Debug, Display};

/// Wrapper that redacts its inner value when formatted or serialized.
#[derive(Clone, Copy)]
pub struct Redacted<T>(pub T);

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> serde::Serialize for Redacted<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        "<redacted>".serialize(serializer)
    }
}

/// Scrub a rendered log line of anything that looks like a secret.
///
/// This runs over already-formatted text (the tracing layer's output), not
/// structured fields — fields that are known secrets at the call site should
/// already be wrapped in [`Redacted`]. This exists as a second line of
/// defense for values whose sensitivity is only apparent from their shape:
/// a 64-hex private key pasted into an error message, a bearer token copied
/// into a debug log, an Infura/Alchemy-style API key embedded in an RPC URL
/// path segment.
pub fn scrub_line(line: &str) -> String {
    let line = scrub_hex64(&line);
    let line = scrub_bearer(&line);
    scrub_rpc_path_keys(&line)
}

fn is_hex_char(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn scrub_hex64(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < chars.len() {
        let start = i;
        while i < chars.len() && is_hex_char(chars[i]) {
            i += 1;
        }
        let run_len = i - start;
        if run_len >= 64 {
            out.push_str("<redacted-hex>");
        } else {
            out.extend(&chars[start..i]);
        }
        if i < chars.len() {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

fn scrub_bearer(line: &str) -> String {
    const NEEDLE: &str = "Bearer ";
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(idx) = rest.find(NEEDLE) {
        out.push_str(&rest[..idx]);
        out.push_str("Bearer <redacted>");
        let after = &rest[idx + NEEDLE.len()..];
        let token_end = after.find(char::is_whitespace).unwrap_or(after.len());
        rest = &after[token_end..];
    }
    out.push_str(rest);
    out
}

/// Scrub the trailing path segment of `/v2/<key>` or `/v3/<key>` style RPC
/// URLs (Infura/Alchemy convention), leaving the host visible.
fn scrub_rpc_path_keys(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    loop {
        let v2 = rest.find("/v2/");
        let v3 = rest.find("/v3/");
        let hit = match (v2, v3) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        let Some(idx) = hit else {
            out.push_str(rest);
            break;
        };
        let prefix_len = idx + 4;
        out.push_str(&rest[..prefix_len]);
        out.push_str("<redacted>");
        let after = &rest[prefix_len..];
        let key_end = after
            .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
            .unwrap_or(after.len());
        rest = &after[key_end..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_never_prints_inner_value() {
        let secret = Redacted("super-secret-key");
        assert_eq!(format!("{secret}"), "<redacted>");
        assert_eq!(format!("{secret:?}"), "<redacted>");
    }

    #[test]
    fn scrub_hex64_masks_64_char_hex_runs_only() {
        let short = "0xabc123";
        assert_eq!(scrub_hex64(short), short);
        let key = "a".repeat(64);
        assert_eq!(scrub_hex64(&key), "<redacted-hex>");
    }

    #[test]
    fn scrub_bearer_masks_token_value() {
        let line = "Authorization: Bearer abc.def.ghi sent";
        assert_eq!(scrub_bearer(line), "Authorization: Bearer <redacted> sent");
    }

    #[test]
    fn scrub_rpc_path_keys_masks_trailing_segment() {
        let line = "connecting to https://mainnet.infura.io/v3/abcdef0123456789 now";
        let scrubbed = scrub_rpc_path_keys(line);
        assert_eq!(scrubbed, "connecting to https://mainnet.infura.io/v3/<redacted> now");
    }

    #[test]
    fn scrub_line_composes_all_three_passes() {
        let line = format!(
            "pk={} auth=Bearer tok123 url=https://x.io/v2/key456",
            "f".repeat(64)
        );
        let scrubbed = scrub_line(&line);
        assert!(scrubbed.contains("<redacted-hex>"));
        assert!(scrubbed.contains("Bearer <redacted>"));
        assert!(scrubbed.contains("/v2/<redacted>"));
    }
}
