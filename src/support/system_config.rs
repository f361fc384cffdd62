//-
// Copyright (c) 2024, The Archiveopteryx Developers
//
// This file is part of Archiveopteryx.
//
// Archiveopteryx is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Archiveopteryx is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
// or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Archiveopteryx. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use super::error::Error;

/// The system-wide configuration.
///
/// This is stored in a file named `archiveopteryx.toml`, typically under
/// `/usr/local/etc/archiveopteryx` or `/etc/archiveopteryx`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    /// The name this host uses to identify itself in banners, EHLO, and
    /// Received fields.
    pub hostname: String,

    /// The smarthost all outgoing mail is forwarded to.
    #[serde(rename = "smart-host-address")]
    pub smart_host_address: String,
    #[serde(rename = "smart-host-port", default = "default_smart_host_port")]
    pub smart_host_port: u16,

    /// Where the LMTP service listens.
    #[serde(rename = "lmtp-address", default = "default_lmtp_address")]
    pub lmtp_address: ListenAddress,
    #[serde(rename = "lmtp-port", default = "default_lmtp_port")]
    pub lmtp_port: u16,

    /// Where the IMAP service listens.
    #[serde(rename = "imap-address", default = "default_imap_address")]
    pub imap_address: ListenAddress,
    #[serde(rename = "imap-port", default = "default_imap_port")]
    pub imap_port: u16,

    /// Approximate memory budget in megabytes. Among other things this
    /// bounds the SIZE we are willing to announce to the smarthost.
    #[serde(rename = "memory-limit", default = "default_memory_limit")]
    pub memory_limit: u64,

    /// Whether security checking is enabled. Disabling it is announced in
    /// the IMAP banner.
    #[serde(default = "default_security")]
    pub security: bool,

    /// Maximum size of a single IMAP literal.
    #[serde(rename = "literal-size-limit", default = "default_literal_limit")]
    pub literal_size_limit: u32,

    /// Where the database server lives and how to log into it.
    #[serde(rename = "db-address", default = "default_db_address")]
    pub db_address: String,
    #[serde(rename = "db-port", default = "default_db_port")]
    pub db_port: u16,
    #[serde(rename = "db-name", default = "default_db_name")]
    pub db_name: String,
    #[serde(rename = "db-user", default = "default_db_user")]
    pub db_user: String,
    #[serde(rename = "db-password", default)]
    pub db_password: Option<String>,

    /// Where the submission service listens.
    #[serde(rename = "submit-address", default = "default_imap_address")]
    pub submit_address: ListenAddress,
    #[serde(rename = "submit-port", default = "default_submit_port")]
    pub submit_port: u16,
}

fn default_db_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "archiveopteryx".to_owned()
}

fn default_db_user() -> String {
    "aox".to_owned()
}

fn default_submit_port() -> u16 {
    587
}

fn default_smart_host_port() -> u16 {
    25
}

fn default_lmtp_address() -> ListenAddress {
    ListenAddress::Inet("127.0.0.1".parse().unwrap())
}

fn default_lmtp_port() -> u16 {
    2026
}

fn default_imap_address() -> ListenAddress {
    ListenAddress::Inet("0.0.0.0".parse().unwrap())
}

fn default_imap_port() -> u16 {
    143
}

fn default_memory_limit() -> u64 {
    256
}

fn default_security() -> bool {
    true
}

fn default_literal_limit() -> u32 {
    32 * 1024 * 1024
}

impl SystemConfig {
    pub fn load(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    pub fn smart_host(&self) -> (String, u16) {
        (self.smart_host_address.clone(), self.smart_host_port)
    }
}

/// One of the address literal forms accepted by the `*-address` settings.
///
/// `/unix/path` names a UNIX socket; `fd/N` an inherited file descriptor;
/// `systemd/domain.INET/index.0` a systemd-passed socket; anything else
/// must be a dotted IPv4 or compressed IPv6 address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenAddress {
    Inet(IpAddr),
    Unix(PathBuf),
    Fd(u32),
    Systemd { domain: String, index: u32 },
}

impl ListenAddress {
    pub fn socket_addr(&self, port: u16) -> Option<SocketAddr> {
        match *self {
            ListenAddress::Inet(ip) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }
}

impl FromStr for ListenAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.starts_with('/') {
            return Ok(ListenAddress::Unix(PathBuf::from(s)));
        }

        if let Some(fd) = s.strip_prefix("fd/") {
            return fd
                .parse::<u32>()
                .map(ListenAddress::Fd)
                .map_err(|_| Error::BadListenAddress(s.to_owned()));
        }

        if let Some(rest) = s.strip_prefix("systemd/") {
            let (domain, index) = rest
                .split_once('/')
                .ok_or_else(|| Error::BadListenAddress(s.to_owned()))?;
            let domain = domain
                .strip_suffix(".INET")
                .ok_or_else(|| Error::BadListenAddress(s.to_owned()))?;
            let index = index
                .strip_prefix("index.")
                .and_then(|ix| ix.parse::<u32>().ok())
                .ok_or_else(|| Error::BadListenAddress(s.to_owned()))?;
            return Ok(ListenAddress::Systemd {
                domain: domain.to_owned(),
                index,
            });
        }

        s.parse::<IpAddr>()
            .map(ListenAddress::Inet)
            .map_err(|_| Error::BadListenAddress(s.to_owned()))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ListenAddress::Inet(ip) => write!(f, "{}", ip),
            ListenAddress::Unix(ref path) => write!(f, "{}", path.display()),
            ListenAddress::Fd(fd) => write!(f, "fd/{}", fd),
            ListenAddress::Systemd { ref domain, index } => {
                write!(f, "systemd/{}.INET/index.{}", domain, index)
            },
        }
    }
}

impl<'de> Deserialize<'de> for ListenAddress {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for ListenAddress {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_listen_addresses() {
        assert_eq!(
            ListenAddress::Inet("192.0.2.1".parse().unwrap()),
            "192.0.2.1".parse().unwrap(),
        );
        assert_eq!(
            ListenAddress::Inet("2001:db8::1".parse().unwrap()),
            "2001:db8::1".parse().unwrap(),
        );
        assert_eq!(
            ListenAddress::Unix(PathBuf::from("/var/run/aox.sock")),
            "/var/run/aox.sock".parse().unwrap(),
        );
        assert_eq!(ListenAddress::Fd(3), "fd/3".parse().unwrap());
        assert_eq!(
            ListenAddress::Systemd {
                domain: "imap".to_owned(),
                index: 0,
            },
            "systemd/imap.INET/index.0".parse().unwrap(),
        );
        assert!("bogus".parse::<ListenAddress>().is_err());
        assert!("fd/three".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn load_minimal_config() {
        let config = SystemConfig::load(
            "hostname = \"mail.example.com\"\n\
             smart-host-address = \"198.51.100.25\"\n",
        )
        .unwrap();
        assert_eq!("mail.example.com", config.hostname);
        assert_eq!(25, config.smart_host_port);
        assert_eq!(2026, config.lmtp_port);
        assert!(config.security);
    }

    #[test]
    fn load_full_config() {
        let config = SystemConfig::load(
            "hostname = \"mail.example.com\"\n\
             smart-host-address = \"relay.example.com\"\n\
             smart-host-port = 587\n\
             lmtp-address = \"::1\"\n\
             lmtp-port = 24\n\
             memory-limit = 512\n\
             security = false\n",
        )
        .unwrap();
        assert_eq!(587, config.smart_host_port);
        assert_eq!(
            ListenAddress::Inet("::1".parse().unwrap()),
            config.lmtp_address,
        );
        assert_eq!(512, config.memory_limit);
        assert!(!config.security);
    }
}
