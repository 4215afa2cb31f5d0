//! # Address Codec
//!
//! Human-readable transport addresses, their structural comparison, their
//! conversion to socket addresses, and the binary blob forms exchanged with
//! the transport service.
//!
//! Two address families exist, one per communicator protocol:
//!
//! - `unix-<path>[#<options>]` — a UNIX datagram endpoint. A path starting
//!   with `@` (option bit 0 set) names a Linux abstract-namespace socket;
//!   the `@` becomes a leading NUL byte on the wire.
//! - `http://host[:port][/path][#<options>]` and the `https` equivalent —
//!   a long-polling HTTP peer. Option bit 0 requests certificate
//!   verification.
//!
//! The parser is fed service-supplied *and* peer-advertised strings, so it is
//! a security surface: every length is bounded and every branch rejects
//! malformed input instead of guessing.

use std::fmt;
use std::os::unix::net::SocketAddr as UnixSocketAddr;

use thiserror::Error;

/// Upper bound on any address string or blob accepted by the parser.
pub const MAX_ADDRESS_LEN: usize = 1024;

/// Option bit 0 on UNIX addresses: abstract-namespace socket.
pub const UNIX_OPT_ABSTRACT: u32 = 0x0000_0001;

/// Option bit 0 on HTTP addresses: verify the peer's TLS certificate.
pub const HTTP_OPT_VERIFY_CERT: u32 = 0x0000_0001;

/// Errors from address parsing and blob decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("address longer than {MAX_ADDRESS_LEN} bytes ({0})")]
    TooLong(usize),

    #[error("missing protocol separator in {0:?}")]
    MissingSeparator(String),

    #[error("unsupported protocol {0:?}")]
    UnknownProtocol(String),

    #[error("unterminated bracketed host in {0:?}")]
    UnterminatedHost(String),

    #[error("empty host in {0:?}")]
    EmptyHost(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid option bits {0:?}")]
    InvalidOptions(String),

    #[error("empty socket path")]
    EmptyPath,

    #[error("address blob truncated")]
    Truncated,

    #[error("address blob is not valid UTF-8")]
    BadEncoding,

    #[error("address blob length field disagrees with payload")]
    LengthMismatch,

    #[error("address is not a socket address")]
    NotSockable,
}

/// A UNIX datagram endpoint.
///
/// `path` keeps the human form: a leading `@` marks the abstract namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnixAddress {
    pub path: String,
    pub options: u32,
}

impl UnixAddress {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let options = if path.starts_with('@') { UNIX_OPT_ABSTRACT } else { 0 };
        Self { path, options }
    }

    /// Whether this names an abstract-namespace socket.
    pub fn is_abstract(&self) -> bool {
        self.options & UNIX_OPT_ABSTRACT != 0 || self.path.starts_with('@')
    }

    /// Derive the socket address, mapping `@name` to a leading-NUL
    /// abstract-namespace name.
    pub fn to_socket_addr(&self) -> Result<UnixSocketAddr, AddressError> {
        if self.is_abstract() {
            #[cfg(target_os = "linux")]
            {
                use std::os::linux::net::SocketAddrExt;
                let name = self.path.strip_prefix('@').unwrap_or(&self.path);
                return UnixSocketAddr::from_abstract_name(name.as_bytes())
                    .map_err(|_| AddressError::NotSockable);
            }
            #[cfg(not(target_os = "linux"))]
            {
                return Err(AddressError::NotSockable);
            }
        }
        UnixSocketAddr::from_pathname(&self.path).map_err(|_| AddressError::NotSockable)
    }

    /// Binary blob form: `u32 options | u32 len-including-NUL | path NUL`.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.path.len() + 1);
        out.extend_from_slice(&self.options.to_be_bytes());
        out.extend_from_slice(&((self.path.len() as u32 + 1).to_be_bytes()));
        out.extend_from_slice(self.path.as_bytes());
        out.push(0);
        out
    }

    pub fn from_wire(blob: &[u8]) -> Result<Self, AddressError> {
        if blob.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong(blob.len()));
        }
        if blob.len() < 9 {
            return Err(AddressError::Truncated);
        }
        let options = u32::from_be_bytes(blob[0..4].try_into().unwrap());
        let len = u32::from_be_bytes(blob[4..8].try_into().unwrap()) as usize;
        if len == 0 || blob.len() != 8 + len {
            return Err(AddressError::LengthMismatch);
        }
        if blob[8 + len - 1] != 0 {
            return Err(AddressError::LengthMismatch);
        }
        let path = std::str::from_utf8(&blob[8..8 + len - 1])
            .map_err(|_| AddressError::BadEncoding)?;
        if path.is_empty() {
            return Err(AddressError::EmptyPath);
        }
        Ok(Self { path: path.to_string(), options })
    }
}

/// An HTTP(S) long-polling endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpAddress {
    pub https: bool,
    /// Hostname, IPv4 literal, or IPv6 literal without brackets.
    pub host: String,
    pub port: u16,
    /// Empty, or starts with `/`.
    pub path: String,
    pub options: u32,
}

impl HttpAddress {
    /// Protocol default port: 80 for http, 443 for https.
    pub fn default_port(https: bool) -> u16 {
        if https { 443 } else { 80 }
    }

    /// Whether TLS certificate verification is requested.
    pub fn verify_cert(&self) -> bool {
        self.options & HTTP_OPT_VERIFY_CERT != 0
    }

    /// The base URL (no option suffix), suitable for an HTTP client.
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{}://{}:{}{}", scheme, host, self.port, self.path)
    }

    /// Binary blob form: `u32 options | u32 url_len | url`.
    pub fn to_wire(&self) -> Vec<u8> {
        let url = self.base_url();
        let mut out = Vec::with_capacity(8 + url.len());
        out.extend_from_slice(&self.options.to_be_bytes());
        out.extend_from_slice(&(url.len() as u32).to_be_bytes());
        out.extend_from_slice(url.as_bytes());
        out
    }

    pub fn from_wire(blob: &[u8]) -> Result<Self, AddressError> {
        if blob.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong(blob.len()));
        }
        if blob.len() < 8 {
            return Err(AddressError::Truncated);
        }
        let options = u32::from_be_bytes(blob[0..4].try_into().unwrap());
        let len = u32::from_be_bytes(blob[4..8].try_into().unwrap()) as usize;
        if blob.len() != 8 + len {
            return Err(AddressError::LengthMismatch);
        }
        let url = std::str::from_utf8(&blob[8..]).map_err(|_| AddressError::BadEncoding)?;
        let mut parsed = match Address::parse(url)? {
            Address::Http(h) => h,
            Address::Unix(_) => return Err(AddressError::UnknownProtocol(url.to_string())),
        };
        parsed.options = options;
        Ok(parsed)
    }
}

/// A transport address: one variant per communicator protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Unix(UnixAddress),
    Http(HttpAddress),
}

impl Address {
    /// The protocol tag, as used in config sections and service announcements.
    pub fn protocol(&self) -> &'static str {
        match self {
            Address::Unix(_) => "unix",
            Address::Http(h) if h.https => "https",
            Address::Http(_) => "http",
        }
    }

    /// Parse a human-readable address string.
    ///
    /// Accepts `unix-<path>[#opts]`, `http://…[#opts]`, `https://…[#opts]`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        if input.is_empty() {
            return Err(AddressError::Empty);
        }
        if input.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong(input.len()));
        }

        // Split the trailing option bits off first; neither address family
        // may contain '#' in its location.
        let (body, options) = match input.rsplit_once('#') {
            Some((body, opts)) => {
                let bits: u32 = opts
                    .parse()
                    .map_err(|_| AddressError::InvalidOptions(opts.to_string()))?;
                (body, Some(bits))
            }
            None => (input, None),
        };

        if let Some(path) = body.strip_prefix("unix-") {
            if path.is_empty() {
                return Err(AddressError::EmptyPath);
            }
            let mut addr = UnixAddress::new(path);
            if let Some(bits) = options {
                addr.options = bits;
            }
            return Ok(Address::Unix(addr));
        }

        let (https, rest) = if let Some(rest) = body.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = body.strip_prefix("http://") {
            (false, rest)
        } else {
            return match body.split_once(['-', ':']) {
                Some((proto, _)) => Err(AddressError::UnknownProtocol(proto.to_string())),
                None => Err(AddressError::MissingSeparator(body.to_string())),
            };
        };

        let mut http = parse_http_rest(https, rest, input)?;
        if let Some(bits) = options {
            http.options = bits;
        }
        Ok(Address::Http(http))
    }

    /// Structural equality, exposed as a named operation for call sites that
    /// compare service-supplied against locally-held addresses.
    pub fn equals(a: &Address, b: &Address) -> bool {
        a == b
    }
}

/// Parse `host[:port][/path]` after the scheme.
fn parse_http_rest(https: bool, rest: &str, original: &str) -> Result<HttpAddress, AddressError> {
    if rest.is_empty() {
        return Err(AddressError::EmptyHost(original.to_string()));
    }

    let (host, after_host) = if let Some(inner) = rest.strip_prefix('[') {
        // IPv6 literal.
        let end = inner
            .find(']')
            .ok_or_else(|| AddressError::UnterminatedHost(original.to_string()))?;
        (&inner[..end], &inner[end + 1..])
    } else {
        let end = rest.find([':', '/']).unwrap_or(rest.len());
        (&rest[..end], &rest[end..])
    };

    if host.is_empty() {
        return Err(AddressError::EmptyHost(original.to_string()));
    }

    let (port, path) = if let Some(after_colon) = after_host.strip_prefix(':') {
        let end = after_colon.find('/').unwrap_or(after_colon.len());
        let port_str = &after_colon[..end];
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressError::InvalidPort(port_str.to_string()))?;
        (port, &after_colon[end..])
    } else if after_host.is_empty() || after_host.starts_with('/') {
        (HttpAddress::default_port(https), after_host)
    } else {
        // Garbage directly after a bracketed host, e.g. "[::1]x".
        return Err(AddressError::UnterminatedHost(original.to_string()));
    };

    Ok(HttpAddress {
        https,
        host: host.to_string(),
        port,
        path: path.trim_end_matches('/').to_string(),
        options: 0,
    })
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(u) => {
                if u.options != 0 {
                    write!(f, "unix-{}#{}", u.path, u.options)
                } else {
                    write!(f, "unix-{}", u.path)
                }
            }
            Address::Http(h) => {
                if h.options != 0 {
                    write!(f, "{}#{}", h.base_url(), h.options)
                } else {
                    f.write_str(&h.base_url())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(s: &str) -> Address {
        let addr = Address::parse(s).unwrap();
        let reparsed = Address::parse(&addr.to_string()).unwrap();
        assert_eq!(addr, reparsed, "round trip failed for {s}");
        addr
    }

    #[test]
    fn parse_unix_plain() {
        let addr = round_trip("unix-/tmp/unix-plugin-sock.1");
        match addr {
            Address::Unix(u) => {
                assert_eq!(u.path, "/tmp/unix-plugin-sock.1");
                assert_eq!(u.options, 0);
                assert!(!u.is_abstract());
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn parse_unix_abstract() {
        let addr = round_trip("unix-@peer-sock#1");
        match addr {
            Address::Unix(u) => {
                assert!(u.is_abstract());
                assert_eq!(u.options, UNIX_OPT_ABSTRACT);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn parse_http_defaults() {
        let addr = Address::parse("http://example.org").unwrap();
        match &addr {
            Address::Http(h) => {
                assert!(!h.https);
                assert_eq!(h.host, "example.org");
                assert_eq!(h.port, 80);
                assert_eq!(h.path, "");
            }
            _ => panic!("wrong family"),
        }
        round_trip("https://example.org:8443/pub");
    }

    #[test]
    fn parse_https_default_port() {
        match Address::parse("https://example.org").unwrap() {
            Address::Http(h) => assert_eq!(h.port, 443),
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn parse_ipv6_literal() {
        match round_trip("http://[2001:db8::1]:8080/x") {
            Address::Http(h) => {
                assert_eq!(h.host, "2001:db8::1");
                assert_eq!(h.port, 8080);
                assert_eq!(h.path, "/x");
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(Address::parse(""), Err(AddressError::Empty));
        assert!(matches!(
            Address::parse("http://"),
            Err(AddressError::EmptyHost(_))
        ));
        assert!(matches!(
            Address::parse("http://[::1"),
            Err(AddressError::UnterminatedHost(_))
        ));
        assert!(matches!(
            Address::parse("http://h:70000"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            Address::parse("http://h:12ab"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            Address::parse("gopher://x"),
            Err(AddressError::UnknownProtocol(_)) | Err(AddressError::MissingSeparator(_))
        ));
        assert!(matches!(
            Address::parse("justastring"),
            Err(AddressError::MissingSeparator(_))
        ));
        let long = format!("unix-/{}", "a".repeat(MAX_ADDRESS_LEN));
        assert!(matches!(Address::parse(&long), Err(AddressError::TooLong(_))));
    }

    #[test]
    fn unix_wire_blob_round_trip() {
        let addr = UnixAddress::new("@abstract-name");
        let blob = addr.to_wire();
        // options | len | bytes | NUL
        assert_eq!(blob[3], 1);
        assert_eq!(*blob.last().unwrap(), 0);
        assert_eq!(UnixAddress::from_wire(&blob).unwrap(), addr);
    }

    #[test]
    fn unix_wire_blob_rejects_missing_nul() {
        let addr = UnixAddress::new("/tmp/x");
        let mut blob = addr.to_wire();
        *blob.last_mut().unwrap() = b'x';
        assert_eq!(
            UnixAddress::from_wire(&blob),
            Err(AddressError::LengthMismatch)
        );
    }

    #[test]
    fn http_wire_blob_round_trip() {
        let addr = match Address::parse("https://example.org:8443/pub#1").unwrap() {
            Address::Http(h) => h,
            _ => unreachable!(),
        };
        assert!(addr.verify_cert());
        let blob = addr.to_wire();
        let back = HttpAddress::from_wire(&blob).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn abstract_socket_addr_has_leading_nul() {
        #[cfg(target_os = "linux")]
        {
            use std::os::linux::net::SocketAddrExt;
            let addr = UnixAddress::new("@abs");
            let sock = addr.to_socket_addr().unwrap();
            assert_eq!(sock.as_abstract_name(), Some(&b"abs"[..]));
        }
    }
}
