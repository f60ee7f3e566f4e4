//! Public-key fingerprinting and deterministic subdomain derivation (§3).

use russh_keys::ssh_encoding::Encode;

pub const DEFAULT_FORWARD_ADDR: &str = "localhost";
pub const DEFAULT_FORWARD_PORT: u32 = 80;

/// Colonless hex MD5 digest of the SSH wire-format public key. Printable,
/// never a secret.
pub fn fingerprint(public_key: &russh_keys::PublicKey) -> String {
    let mut wire = Vec::new();
    public_key
        .key_data()
        .encode(&mut wire)
        .expect("ssh public key always encodes to its wire format");
    format!("{:x}", md5::compute(&wire))
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// `<sanitized_host>-<port>-<fingerprint>`, omitting a segment whose value
/// equals the default. Always non-empty and DNS-label legal.
pub fn make_subdomain(fingerprint: &str, host: &str, port: u32) -> String {
    let mut prefix = String::new();

    if host != DEFAULT_FORWARD_ADDR {
        prefix.push_str(&sanitize_host(host));
        prefix.push('-');
    }

    if port != DEFAULT_FORWARD_PORT {
        prefix.push_str(&port.to_string());
        prefix.push('-');
    }

    format!("{prefix}{fingerprint}")
}

/// A forward binding request as parsed from the wire: the raw address
/// (possibly carrying `+flags`) and the requested port.
#[derive(Debug, Clone)]
pub struct ForwardBindingRequest {
    pub address: String,
    pub port: u32,
}

/// Parsed form of a binding request (§3), plus the subdomain derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub address: String,
    pub host: String,
    pub port: u32,
    pub https: bool,
    pub rewrite_origin: bool,
    pub subdomain: String,
}

/// Splits `host+flags` into the bare host and its flag characters.
/// `s` marks the upstream as HTTPS, `o` requests `Origin` rewriting.
fn parse_flags(address: &str) -> (&str, bool, bool) {
    match address.split_once('+') {
        None => (address, false, false),
        Some((host, flags)) => {
            let https = flags.contains('s');
            let rewrite_origin = flags.contains('o');
            (host, https, rewrite_origin)
        }
    }
}

/// Inverse of [`parse_flags`], used by the round-trip property test.
pub fn build_host_with_flags(host: &str, https: bool, rewrite_origin: bool) -> String {
    let mut flags = String::new();
    if https {
        flags.push('s');
    }
    if rewrite_origin {
        flags.push('o');
    }
    if flags.is_empty() {
        host.to_string()
    } else {
        format!("{host}+{flags}")
    }
}

impl ForwardInfo {
    pub fn parse(address: &str, port: u32, fingerprint: &str) -> Self {
        let (host, https, rewrite_origin) = parse_flags(address);
        let subdomain = make_subdomain(fingerprint, host, port);
        Self {
            address: address.to_string(),
            host: host.to_string(),
            port,
            https,
            rewrite_origin,
            subdomain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "f";

    #[test]
    fn default_binding() {
        assert_eq!(make_subdomain(FP, "localhost", 80), "f");
    }

    #[test]
    fn port_only() {
        assert_eq!(make_subdomain(FP, "localhost", 8080), "8080-f");
    }

    #[test]
    fn custom_host() {
        assert_eq!(make_subdomain(FP, "api.internal", 8080), "api_internal-8080-f");
    }

    #[test]
    fn illegal_characters() {
        assert_eq!(make_subdomain(FP, "test%^&*()=", 111), "test_______-111-f");
    }

    #[test]
    fn subdomain_is_dns_label_legal() {
        for (host, port) in [
            ("localhost", 80),
            ("localhost", 8080),
            ("api.internal", 8080),
            ("test%^&*()=", 111),
            ("", 0),
        ] {
            let sub = make_subdomain(FP, host, port);
            assert!(!sub.is_empty());
            assert!(sub.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn subdomain_is_stable() {
        assert_eq!(
            make_subdomain(FP, "api.internal", 8080),
            make_subdomain(FP, "api.internal", 8080)
        );
    }

    #[test]
    fn different_fingerprints_never_collide_on_same_binding() {
        assert_ne!(
            make_subdomain("f1", "api.internal", 8080),
            make_subdomain("f2", "api.internal", 8080)
        );
    }

    #[test]
    fn forward_info_flags() {
        let info = ForwardInfo::parse("localhost+so", 80, FP);
        assert_eq!(info.host, "localhost");
        assert!(info.https);
        assert!(info.rewrite_origin);
        assert_eq!(info.subdomain, "f");
    }

    #[test]
    fn forward_info_no_flags() {
        let info = ForwardInfo::parse("api.internal", 8080, FP);
        assert!(!info.https);
        assert!(!info.rewrite_origin);
        assert_eq!(info.host, "api.internal");
    }

    #[test]
    fn flags_round_trip() {
        for (https, rewrite_origin) in [(false, false), (true, false), (false, true), (true, true)] {
            let built = build_host_with_flags("example.com", https, rewrite_origin);
            let (host, parsed_https, parsed_rewrite) = parse_flags(&built);
            assert_eq!(host, "example.com");
            assert_eq!(parsed_https, https);
            assert_eq!(parsed_rewrite, rewrite_origin);
        }
    }
}
