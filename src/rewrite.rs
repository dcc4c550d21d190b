//! Header rewriting for branded upstreams.
//!
//! Some upstream proxies require a computed `X-T5-Auth` token derived
//! from the target hostname, with the `Host` header stripped of its
//! port. The request is first built with a sentinel auth value; just
//! before the serialized bytes hit the wire, [`apply_t5_rewrite`]
//! substitutes the real token.

use regex::Regex;
use std::sync::OnceLock;

/// Header carrying the computed auth token.
pub const T5_AUTH_HEADER: &str = "X-T5-Auth";

/// Placeholder value replaced during serialization.
pub const T5_AUTH_SENTINEL: &str = "bd_x_t5_auth";

/// User agent sent alongside the auth token.
pub const BRANDED_USER_AGENT: &str = "okhttp/4.9.0 Dalvik/2.1.0 baiduboxapp";

/// Carrier WAP gateway address that takes the host-override branch
/// instead of the token branch.
pub const WAP_GATEWAY_ADDR: &str = "10.0.0.172";

/// Host presented to the WAP gateway.
pub const WAP_GATEWAY_HOST: &str = "ysj.iread.wo.com.cn";

fn host_line_pattern() -> &'static Regex {
    static HOST_LINE: OnceLock<Regex> = OnceLock::new();
    HOST_LINE.get_or_init(|| Regex::new(r"Host: ([^:]+)(:)?(\d+)?\r\n").unwrap())
}

/// Computes the `X-T5-Auth` token for a hostname.
///
/// The recurrence runs in signed 32-bit arithmetic with wraparound on
/// both the multiply and the add; the final mask keeps the decimal
/// rendering non-negative.
pub fn x_t5_auth_token(address: &str) -> String {
    let mut index: i32 = 0;
    for c in address.chars() {
        index = (index.wrapping_mul(1_318_293) & 0x7FFF_FFFF).wrapping_add(c as i32);
    }
    if index < 0 {
        index &= 0x7FFF_FFFF;
    }
    index.to_string()
}

/// Rewrites a serialized HTTP/1.1 request carrying the auth sentinel.
///
/// Strips the port from the `Host:` line and replaces the sentinel with
/// the token computed from the bare hostname. Applying this to an
/// already-rewritten request is a no-op: the port is gone and the
/// sentinel no longer matches.
pub fn apply_t5_rewrite(serialized: &str) -> String {
    let Some(caps) = host_line_pattern().captures(serialized) else {
        return serialized.to_string();
    };
    let full = caps.get(0).unwrap().as_str();
    let hostname = caps.get(1).unwrap().as_str();

    let rewritten = serialized.replacen(full, &format!("Host: {}\r\n", hostname), 1);
    rewritten.replacen(
        &format!("{}: {}", T5_AUTH_HEADER, T5_AUTH_SENTINEL),
        &format!("{}: {}", T5_AUTH_HEADER, x_t5_auth_token(hostname)),
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_empty() {
        assert_eq!(x_t5_auth_token(""), "0");
    }

    #[test]
    fn test_token_single_char() {
        assert_eq!(x_t5_auth_token("a"), "97");
    }

    #[test]
    fn test_token_hostname_vectors() {
        // Values follow from the signed 32-bit recurrence.
        assert_eq!(x_t5_auth_token("example.com"), "1321448409");
        assert_eq!(x_t5_auth_token("m.example.com"), "958387820");
    }

    #[test]
    fn test_token_deterministic() {
        assert_eq!(
            x_t5_auth_token("cloudnproxy.baidu.com"),
            x_t5_auth_token("cloudnproxy.baidu.com")
        );
    }

    fn sample_request(host_line: &str) -> String {
        format!(
            "CONNECT m.example.com:8443 HTTP/1.1\r\n\
             Host: {}\r\n\
             User-Agent: {}\r\n\
             X-T5-Auth: {}\r\n\
             Proxy-Connection: Keep-Alive\r\n\r\n",
            host_line, BRANDED_USER_AGENT, T5_AUTH_SENTINEL
        )
    }

    #[test]
    fn test_rewrite_strips_port_and_fills_token() {
        let rewritten = apply_t5_rewrite(&sample_request("m.example.com:8443"));

        assert!(rewritten.contains("Host: m.example.com\r\n"));
        assert!(!rewritten.contains("Host: m.example.com:8443"));
        assert!(rewritten.contains(&format!("X-T5-Auth: {}\r\n", x_t5_auth_token("m.example.com"))));
        assert!(!rewritten.contains(T5_AUTH_SENTINEL));
    }

    #[test]
    fn test_rewrite_without_port() {
        let rewritten = apply_t5_rewrite(&sample_request("m.example.com"));

        assert!(rewritten.contains("Host: m.example.com\r\n"));
        assert!(rewritten.contains(&format!("X-T5-Auth: {}\r\n", x_t5_auth_token("m.example.com"))));
    }

    #[test]
    fn test_rewrite_idempotent() {
        let once = apply_t5_rewrite(&sample_request("m.example.com:8443"));
        let twice = apply_t5_rewrite(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rewrite_no_host_line_is_noop() {
        let raw = "CONNECT a:1 HTTP/1.1\r\n\r\n";
        assert_eq!(apply_t5_rewrite(raw), raw);
    }
}
