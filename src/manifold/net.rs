use std::net::SocketAddr;

use anyhow::Context;

/// Resolve a `host:port` target to a single address, preferring IPv4.
pub async fn resolve_host_port(target: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = target.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("resolve {target:?}"))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("no addresses for {target:?}"))
}

/// Whether an I/O error is an expected end of stream rather than a fault.
/// These still close the virtual connection but are not worth a warning.
pub fn is_normal_close(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_the_resolver() {
        let sa = resolve_host_port("127.0.0.1:7").await.unwrap();
        assert_eq!(sa, "127.0.0.1:7".parse().unwrap());
    }

    #[tokio::test]
    async fn unresolvable_targets_error() {
        assert!(resolve_host_port("just-a-hostname").await.is_err());
        assert!(resolve_host_port("").await.is_err());
    }

    #[test]
    fn normal_close_kinds() {
        use std::io::{Error, ErrorKind};
        assert!(is_normal_close(&Error::from(ErrorKind::ConnectionReset)));
        assert!(is_normal_close(&Error::from(ErrorKind::BrokenPipe)));
        assert!(is_normal_close(&Error::from(ErrorKind::UnexpectedEof)));
        assert!(!is_normal_close(&Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_normal_close(&Error::from(ErrorKind::TimedOut)));
    }
}
