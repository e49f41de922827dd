//! Host discovery
//!
//! Discovery is one bulk operation over every enumerated target under a single
//! deadline. It runs before any port is probed and produces the host set the job
//! queue is built from. An empty host set is a valid outcome.

pub mod arp;
pub mod sweep;

use crate::config::{DiscoveryMethod, ScanConfig};
use crate::Result;
use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub use arp::ArpDiscovery;
pub use sweep::ConnectSweep;

/// A live host observed during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub address: IpAddr,
    /// Hardware address from the discovery reply, when the method sees one
    #[serde(with = "mac_serde", default)]
    pub link_layer_id: Option<MacAddr>,
    pub discovered_at: DateTime<Utc>,
}

impl Host {
    pub fn new(address: IpAddr, link_layer_id: Option<MacAddr>) -> Self {
        Self {
            address,
            link_layer_id,
            discovered_at: Utc::now(),
        }
    }
}

/// Bulk host discovery
#[async_trait::async_trait]
pub trait HostDiscovery: Send + Sync {
    fn method_name(&self) -> &str;

    /// Fail fast when the method cannot run on this host; called before discovery
    fn check_privileges(&self, targets: &[IpAddr]) -> Result<()>;

    /// Probe every target once and collect replies until `timeout` elapses
    async fn discover(&self, targets: &[IpAddr], timeout: Duration) -> Result<Vec<Host>>;
}

/// Discovery implementation selected by the configuration
pub fn for_config(config: &ScanConfig) -> Arc<dyn HostDiscovery> {
    match config.discovery {
        DiscoveryMethod::Arp => Arc::new(ArpDiscovery::new(config.interface.clone())),
        DiscoveryMethod::Connect => Arc::new(ConnectSweep::default()),
    }
}

/// Order replies by target enumeration order, dropping anything not targeted
pub(crate) fn order_by_targets(targets: &[IpAddr], mut found: HashMap<IpAddr, Host>) -> Vec<Host> {
    targets.iter().filter_map(|t| found.remove(t)).collect()
}

/// Serialize `Option<MacAddr>` as `"aa:bb:cc:dd:ee:ff"` or null
pub mod mac_serde {
    use pnet::util::MacAddr;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(mac: &Option<MacAddr>, s: S) -> Result<S::Ok, S::Error> {
        match mac {
            Some(mac) => s.serialize_some(&mac.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<MacAddr>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(text) => MacAddr::from_str(&text)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid MAC address {}: {:?}", text, e))),
            None => Ok(None),
        }
    }
}
