use std::net::{IpAddr, Ipv4Addr};

use anyhow::Context;
use ipnet::Ipv4Net;

/// IPv4 CIDR allow-list.
///
/// `0.0.0.0/0` and `::/0` are wildcard entries: either one admits every peer
/// address. Without a wildcard, IPv4 peers (including IPv4-mapped IPv6) are
/// matched against the listed networks and bare IPv6 peers are rejected;
/// there is no IPv6 subnet matching.
#[derive(Debug, Clone)]
pub struct Acl {
    nets: Vec<Ipv4Net>,
    allow_any: bool,
}

impl Acl {
    pub fn parse(list: &str) -> anyhow::Result<Self> {
        let mut nets = Vec::new();
        let mut allow_any = false;

        for item in list.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            if item == "0.0.0.0/0" || item == "::/0" {
                allow_any = true;
                continue;
            }
            let net: Ipv4Net = item
                .parse()
                .with_context(|| format!("gate: bad cidr {item:?}"))?;
            nets.push(net);
        }

        if nets.is_empty() && !allow_any {
            anyhow::bail!("gate: empty allow-list");
        }

        Ok(Self { nets, allow_any })
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        if self.allow_any {
            return true;
        }
        match canonical_v4(addr) {
            Some(v4) => self.nets.iter().any(|n| n.contains(&v4)),
            None => false,
        }
    }
}

fn canonical_v4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(a) => Some(a),
        IpAddr::V6(a) => a.to_ipv4_mapped(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("peer address not in allow-list")]
    Ip,
    #[error("bad or missing token")]
    Token,
    #[error("path mismatch")]
    Path,
}

/// Per-listener admission policy, evaluated once per connection before the
/// websocket handshake. The decision is final for the connection's lifetime.
#[derive(Debug)]
pub struct Gate {
    acl: Acl,
    token: String,
    ws_path: String,
}

impl Gate {
    pub fn new(acl: Acl, token: String, ws_path: String) -> Self {
        Self {
            acl,
            token,
            ws_path,
        }
    }

    pub fn evaluate(
        &self,
        peer: IpAddr,
        path: &str,
        subprotocol: Option<&str>,
    ) -> Result<(), Denial> {
        if path != self.ws_path {
            return Err(Denial::Path);
        }
        if !self.acl.permits(peer) {
            return Err(Denial::Ip);
        }
        if !self.token.is_empty() && subprotocol != Some(self.token.as_str()) {
            return Err(Denial::Token);
        }
        Ok(())
    }

    /// The subprotocol value to echo into the 101 response, if any.
    pub fn token(&self) -> Option<&str> {
        if self.token.is_empty() {
            None
        } else {
            Some(&self.token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn wildcard_admits_everything() {
        let acl = Acl::parse("0.0.0.0/0,::/0").unwrap();
        assert!(acl.permits(ip("192.0.2.1")));
        assert!(acl.permits(ip("2001:db8::1")));

        let v4_only = Acl::parse("0.0.0.0/0").unwrap();
        assert!(v4_only.permits(ip("2001:db8::1")));
    }

    #[test]
    fn cidr_match_is_prefix_based() {
        let acl = Acl::parse("10.0.0.0/8").unwrap();
        assert!(acl.permits(ip("10.1.2.3")));
        assert!(!acl.permits(ip("192.0.2.1")));
        assert!(!acl.permits(ip("11.0.0.1")));
    }

    #[test]
    fn mapped_v6_peers_match_v4_networks() {
        let acl = Acl::parse("10.0.0.0/8").unwrap();
        assert!(acl.permits(ip("::ffff:10.1.2.3")));
        assert!(!acl.permits(ip("::ffff:192.0.2.1")));
        // Bare IPv6 never matches an IPv4 network.
        assert!(!acl.permits(ip("2001:db8::1")));
    }

    #[test]
    fn list_entries_are_trimmed_and_empty_items_skipped() {
        let acl = Acl::parse(" 10.0.0.0/8 , ,127.0.0.0/8").unwrap();
        assert!(acl.permits(ip("127.0.0.1")));
        assert!(acl.permits(ip("10.9.9.9")));
    }

    #[test]
    fn bad_or_empty_lists_are_rejected() {
        assert!(Acl::parse("10.0.0.0/33").is_err());
        assert!(Acl::parse("not-a-cidr").is_err());
        assert!(Acl::parse(" , ").is_err());
        // IPv6 subnets other than ::/0 are not supported.
        assert!(Acl::parse("2001:db8::/32").is_err());
    }

    #[test]
    fn gate_checks_path_then_ip_then_token() {
        let gate = Gate::new(
            Acl::parse("10.0.0.0/8").unwrap(),
            "secret".into(),
            "/ws".into(),
        );

        assert_eq!(
            gate.evaluate(ip("10.1.2.3"), "/other", Some("secret")),
            Err(Denial::Path)
        );
        assert_eq!(
            gate.evaluate(ip("192.0.2.1"), "/ws", Some("secret")),
            Err(Denial::Ip)
        );
        assert_eq!(
            gate.evaluate(ip("10.1.2.3"), "/ws", Some("wrong")),
            Err(Denial::Token)
        );
        assert_eq!(gate.evaluate(ip("10.1.2.3"), "/ws", None), Err(Denial::Token));
        assert_eq!(gate.evaluate(ip("10.1.2.3"), "/ws", Some("secret")), Ok(()));
    }

    #[test]
    fn empty_token_ignores_subprotocol() {
        let gate = Gate::new(Acl::parse("0.0.0.0/0").unwrap(), String::new(), "/ws".into());
        assert_eq!(gate.evaluate(ip("192.0.2.1"), "/ws", None), Ok(()));
        assert_eq!(gate.evaluate(ip("192.0.2.1"), "/ws", Some("anything")), Ok(()));
        assert!(gate.token().is_none());
    }
}
