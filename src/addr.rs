//! Address syntax: `unix:///absolute/path` or `tcp://host[:port]`.

use crate::error::ConfigError;

/// Transport protocol a backend or frontend address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Unix,
}

/// Splits `scheme://rest` and validates the scheme, returning the endpoint
/// string appropriate to that scheme: a filesystem path for `unix`, or a
/// `host[:port]` pair (bracketed IPv6 preserved) for `tcp`.
pub fn parse_addr(addr: &str) -> Result<(Proto, String), ConfigError> {
    let (scheme, rest) = addr
        .split_once("://")
        .ok_or_else(|| ConfigError::InvalidAddr(addr.to_string()))?;

    if scheme.is_empty() || rest.is_empty() {
        return Err(ConfigError::InvalidAddr(addr.to_string()));
    }

    match scheme {
        "unix" => Ok((Proto::Unix, rest.to_string())),
        "tcp" => {
            let url = url::Url::parse(addr)?;
            let host = url
                .host_str()
                .ok_or_else(|| ConfigError::InvalidAddr(addr.to_string()))?;
            let host = if host.contains(':') {
                format!("[{host}]")
            } else {
                host.to_string()
            };
            let endpoint = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            };
            Ok((Proto::Tcp, endpoint))
        }
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_socket_path() {
        let (proto, endpoint) = parse_addr("unix:///var/run/docker.sock").unwrap();
        assert_eq!(proto, Proto::Unix);
        assert_eq!(endpoint, "/var/run/docker.sock");
    }

    #[test]
    fn parses_tcp_host_and_port() {
        let (proto, endpoint) = parse_addr("tcp://127.0.0.1:2375").unwrap();
        assert_eq!(proto, Proto::Tcp);
        assert_eq!(endpoint, "127.0.0.1:2375");
    }

    #[test]
    fn parses_tcp_with_no_port() {
        let (proto, endpoint) = parse_addr("tcp://example.com").unwrap();
        assert_eq!(proto, Proto::Tcp);
        assert_eq!(endpoint, "example.com");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let (proto, endpoint) = parse_addr("tcp://[::1]:2375").unwrap();
        assert_eq!(proto, Proto::Tcp);
        assert_eq!(endpoint, "[::1]:2375");
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        assert!(parse_addr("not-an-address").is_err());
    }

    #[test]
    fn rejects_empty_remainder() {
        assert!(parse_addr("unix://").is_err());
    }

    #[test]
    fn rejects_unsupported_scheme() {
        match parse_addr("ftp://example.com") {
            Err(ConfigError::UnsupportedScheme(scheme)) => assert_eq!(scheme, "ftp"),
            other => panic!("expected unsupported scheme error, got {other:?}"),
        }
    }
}
