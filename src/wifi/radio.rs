//! Collaborators of the connectivity state machine
//!
//! Platform layers translate their native link notifications into
//! [`LinkEvent`]s and implement [`Radio`] and [`NameService`].

use anyhow::Result;
#[cfg(feature = "mock")]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr};

/// Client network credentials.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
pub struct Credentials {
    pub ssid: String,
    pub passphrase: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("passphrase", &"********")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RadioMode {
    pub client: bool,
    pub access_point: bool,
}

impl RadioMode {
    pub const OFF: Self = Self {
        client: false,
        access_point: false,
    };

    pub fn is_combined(&self) -> bool {
        self.client && self.access_point
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkEventKind {
    LinkUp,
    LinkDown,
    ModeChanged,
}

/// Normalized link-layer notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkEvent {
    pub kind: LinkEventKind,
    pub address: Option<Ipv4Addr>,
    pub reason: Option<u16>,
}

impl LinkEvent {
    pub fn up(address: Ipv4Addr) -> Self {
        Self {
            kind: LinkEventKind::LinkUp,
            address: Some(address),
            reason: None,
        }
    }

    pub fn down(reason: Option<u16>) -> Self {
        Self {
            kind: LinkEventKind::LinkDown,
            address: None,
            reason,
        }
    }

    pub fn mode_changed() -> Self {
        Self {
            kind: LinkEventKind::ModeChanged,
            address: None,
            reason: None,
        }
    }
}

/// Radio control.
#[cfg_attr(feature = "mock", automock)]
pub trait Radio: Send {
    fn set_hostname(&mut self, hostname: &str);
    fn enable_client(&mut self, enable: bool);
    fn enable_access_point(&mut self, enable: bool);
    /// Start a client connect attempt, with last known credentials if `None`.
    fn begin(&mut self, credentials: Option<Credentials>);
    fn configure_access_point(&mut self, ssid: &str, passphrase: Option<String>);
    fn mode(&self) -> RadioMode;
    /// Current client address, unspecified while none is assigned.
    fn client_address(&self) -> Ipv4Addr;
    fn mac_address(&self) -> [u8; 6];

    /// Restart the DHCP client of the client interface.
    ///
    /// Platforms that report an acquired address before it is usable
    /// override this.
    fn restart_dhcp_client(&mut self) {}

    fn rssi(&self) -> Option<i32> {
        None
    }
}

/// Local name resolution service (mDNS).
#[cfg_attr(feature = "mock", automock)]
pub trait NameService: Send {
    fn start(&mut self, hostname: &str) -> Result<()>;
    fn stop(&mut self);
}
