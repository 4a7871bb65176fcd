use crate::session::TransferError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Turns a hostname into the IPv4 address a transfer talks to.
#[allow(async_fn_in_trait)]
pub trait HostResolver {
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, TransferError>;
}

/// Resolves through the system resolver, keeping the first IPv4 answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, TransferError> {
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Ok(addr);
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| TransferError::Resolve(format!("{host}: {e}")))?;

        first_ipv4(addrs).ok_or_else(|| TransferError::Resolve(format!("{host}: no IPv4 address is known")))
    }
}

fn first_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

/// Always answers with the same address. Handy when the caller already knows it.
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver(pub Ipv4Addr);

impl HostResolver for StaticResolver {
    async fn resolve(&self, _host: &str) -> Result<Ipv4Addr, TransferError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_first_ipv4_skips_v6() {
        let addrs = vec![
            SocketAddr::from((Ipv6Addr::LOCALHOST, 0)),
            SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 0)),
            SocketAddr::from((Ipv4Addr::new(192, 0, 2, 2), 0)),
        ];
        assert_eq!(first_ipv4(addrs), Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(first_ipv4(vec![SocketAddr::from((Ipv6Addr::LOCALHOST, 0))]), None);
    }

    #[tokio::test]
    async fn test_dns_resolver_literal_address() {
        let addr = DnsResolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addr, Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_dns_resolver_failure() {
        let err = DnsResolver.resolve("no-such-host.invalid").await.unwrap_err();
        assert!(matches!(err, TransferError::Resolve(_)));
    }
}
