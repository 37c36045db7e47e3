//! Static configuration, loaded from a YAML file.

use std::net::{IpAddr, Ipv4Addr};

use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub interface: Option<Ipv4Addr>,

    /// Only answer queries for which this server is authoritative:
    /// do not perform recursive resolution.
    #[serde(default)]
    pub authoritative_only: bool,

    #[serde(default)]
    pub zone_files: Vec<String>,

    #[serde(default)]
    pub zone_dirs: Vec<String>,

    /// A zone file holding only DNSKEY records, used to seed the key
    /// store at startup.
    #[serde(default)]
    pub key_files: Vec<String>,

    #[serde(default)]
    pub cache_size: Option<usize>,

    /// Zones this server is a secondary for, polled and transferred
    /// from the named primary.
    #[serde(default)]
    pub secondary_zones: Vec<SecondaryConfig>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct SecondaryConfig {
    pub zone: String,
    pub primary_ip: IpAddr,
    #[serde(default = "default_dns_port")]
    pub primary_port: u16,
    #[serde(default)]
    pub key_name: Option<String>,
}

fn default_dns_port() -> u16 {
    53
}

impl Settings {
    pub fn new(filename: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(filename))
            .build()?
            .try_deserialize()
    }
}
