use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Peers allowed to connect to the listener.
#[derive(Debug, Clone, Default)]
pub struct PeerAllowlist {
    entries: Option<Vec<IpNet>>,
}

impl PeerAllowlist {
    /// Accepts every peer.
    #[must_use]
    pub const fn open() -> Self {
        Self { entries: None }
    }

    /// Parses single addresses and CIDR subnets. `None` allows everyone.
    pub fn parse(allowed: Option<&[String]>) -> Result<Self> {
        let Some(allowed) = allowed else {
            return Ok(Self::open());
        };

        let entries = allowed
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .or_else(|_| entry.parse::<IpNet>())
                    .map_err(|_| anyhow!("Invalid IP address or CIDR in allowed_proxy_ips: {entry}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            entries: Some(entries),
        })
    }

    #[must_use]
    pub fn allows(&self, peer: IpAddr) -> bool {
        self.entries
            .as_ref()
            .is_none_or(|entries| entries.iter().any(|net| net.contains(&peer)))
    }
}
