//! Stub DNS resolver speaking to upstream servers through the virtual stack.
//!
//! - [`message`]: the RFC 1035 wire codec
//! - [`exchange`]: one query/response round trip, UDP with TCP fallback
//! - [`resolver`]: multi-server, dual-stack host lookup

pub mod exchange;
pub mod message;
pub mod resolver;

pub use message::{Header, MessageBuilder, MessageError, Parser, Question, RCode, ResourceHeader};
pub use resolver::{Resolver, ResolverConfig};

/// Maximum presentation length of a name, not counting a trailing dot.
const MAX_NAME_LEN: usize = 254;
const MAX_LABEL_LEN: usize = 63;

/// Whether `s` is a syntactically valid host name.
///
/// Labels are letters, digits, `-` and `_`, 1 to 63 octets long, and may
/// neither start nor end with a hyphen. At least one label must contain a
/// non-digit so that dotted numbers are never sent to a server.
pub fn is_domain_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    let len = bytes.len();
    if len == 0 || len > MAX_NAME_LEN || (len == MAX_NAME_LEN && bytes[len - 1] != b'.') {
        return false;
    }

    let mut last = b'.';
    let mut non_numeric = false;
    let mut label_len = 0;
    for &c in bytes {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                non_numeric = true;
                label_len += 1;
            }
            b'0'..=b'9' => label_len += 1,
            b'-' => {
                if last == b'.' {
                    return false;
                }
                non_numeric = true;
                label_len += 1;
            }
            b'.' => {
                if last == b'.' || last == b'-' || label_len == 0 || label_len > MAX_LABEL_LEN {
                    return false;
                }
                label_len = 0;
            }
            _ => return false,
        }
        last = c;
    }

    last != b'-' && label_len <= MAX_LABEL_LEN && non_numeric
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_host_names() {
        for name in [
            "example.com",
            "example.com.",
            "a",
            "x-1.example",
            "_service._tcp.example.org",
            "1.2.3.example",
            "xn--bcher-kva.example",
        ] {
            assert!(is_domain_name(name), "{name}");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        let long_label = format!("{}.com", "a".repeat(64));
        for name in [
            "",
            ".",
            "..",
            "example..com",
            "-example.com",
            "example-.com",
            "example.com-",
            "exa mple.com",
            "exämple.com",
            "1.2.3.4",
            "123",
            long_label.as_str(),
        ] {
            assert!(!is_domain_name(name), "{name:?}");
        }
    }

    #[test]
    fn enforces_total_length() {
        // Four labels of 61 octets plus separators: 4*61 + 3 = 247.
        let label = "a".repeat(61);
        let base = [label.as_str(); 4].join(".");
        assert_eq!(base.len(), 247);

        let ok = format!("{base}.abcdef"); // 254 without a trailing dot
        assert_eq!(ok.len(), 254);
        assert!(!is_domain_name(&ok));

        let ok = format!("{base}.abcde"); // 253
        assert!(is_domain_name(&ok));
        assert!(is_domain_name(&format!("{ok}."))); // 254 with the dot

        let too_long = format!("{base}.abcdef."); // 255
        assert!(!is_domain_name(&too_long));
    }
}
