//! Fleet and proxy configuration (§3's ProxyList, §6's construction
//! parameters). Loaded from TOML via `serdeconv`, matching
//! `game/core/src/config.rs`'s `GameConfig::load`.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Either a single address/credentials pair shared by every bot, or
/// per-index arrays. The password array's length additionally determines
/// how many bots can use a proxy at all (§3, §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyList {
    pub address: Option<String>,
    pub username: Option<String>,

    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub usernames: Vec<String>,
    #[serde(default)]
    pub passwords: Vec<String>,
}

impl ProxyList {
    /// The address a given bot index should dial the proxy at, if any.
    pub fn address_for(&self, index: usize) -> Option<&str> {
        if let Some(address) = &self.address {
            Some(address.as_str())
        } else {
            self.addresses.get(index).map(String::as_str)
        }
    }

    pub fn username_for(&self, index: usize) -> Option<&str> {
        if let Some(username) = &self.username {
            Some(username.as_str())
        } else {
            self.usernames.get(index).map(String::as_str)
        }
    }

    pub fn password_for(&self, index: usize) -> Option<&str> {
        self.passwords.get(index).map(String::as_str)
    }

    /// Number of bots that can be assigned a proxy at all.
    pub fn capacity(&self) -> usize {
        self.passwords.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotCredentials {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Max in-flight items across the whole fleet (the dispatcher's `cap`).
    pub inspect_capacity: u32,
    pub worker_pool_size: usize,
    #[serde(default)]
    pub proxy_list: ProxyList,
    #[serde(default)]
    pub ignore_proxy: bool,
    pub bots: Vec<BotCredentials>,
    #[serde(default)]
    pub log: inspectgw_common::logging::LogConfig,
}

impl Default for FleetConfig {
    fn default() -> FleetConfig {
        FleetConfig {
            inspect_capacity: 1024,
            worker_pool_size: 8,
            proxy_list: ProxyList::default(),
            ignore_proxy: true,
            bots: Vec::new(),
            log: inspectgw_common::logging::LogConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> FleetConfig {
        serdeconv::from_toml_file(path).expect("Error loading fleet configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_address_wins_over_per_index_array() {
        let list = ProxyList {
            address: Some("shared:1080".into()),
            addresses: vec!["per-bot:1080".into()],
            ..Default::default()
        };
        assert_eq!(list.address_for(0), Some("shared:1080"));
    }

    #[test]
    fn per_index_address_used_when_no_shared_one() {
        let list = ProxyList {
            addresses: vec!["a:1".into(), "b:2".into()],
            ..Default::default()
        };
        assert_eq!(list.address_for(1), Some("b:2"));
        assert_eq!(list.address_for(2), None);
    }

    #[test]
    fn capacity_is_password_array_length() {
        let list = ProxyList {
            passwords: vec!["p1".into(), "p2".into(), "p3".into()],
            ..Default::default()
        };
        assert_eq!(list.capacity(), 3);
    }
}
