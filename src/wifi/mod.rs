//! Wireless connectivity state machine
//!
//! Arbitrates between client mode and the local access point. A client that
//! fails to connect within `connect_timeout` brings the access point up next
//! to it and keeps retrying every `reconnect_interval`; once the client link
//! is stable for another `connect_timeout` the access point goes down again.

pub mod nmcli;
pub mod radio;

use crate::{
    device::Device,
    scheduler::{Purpose, Scheduler},
    settings::{self, SettingsExt, SettingsStore},
};
use log::{debug, error, info, warn};
use radio::{Credentials, NameService, Radio};
use serde::Serialize;
use std::{net::Ipv4Addr, time::Duration};

/// Access-point passphrases shorter than this are treated as absent.
pub const PASSPHRASE_MIN_LEN: usize = 8;

const WIFI_TIMERS: [Purpose; 3] = [
    Purpose::ConnectTimeout,
    Purpose::ApShutdown,
    Purpose::ClientRetry,
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Disconnected,
    ConnectingClient,
    ClientConnected,
    /// Access point up while client connects are retried.
    ApFallback,
    ApOnly,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PreferredMode {
    ClientOnly,
    ApOnly,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WifiTiming {
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl Default for WifiTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectivityConfig {
    pub preferred_mode: PreferredMode,
    /// `None` lets the radio use its last known credentials.
    pub credentials: Option<Credentials>,
    pub ap_passphrase: Option<String>,
    /// Used as access-point SSID and announced name.
    pub hostname: String,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl ConnectivityConfig {
    pub fn from_settings(settings: &dyn SettingsStore, hostname: String, timing: WifiTiming) -> Self {
        let preferred_mode = if settings.flag(settings::AP_ONLY) {
            PreferredMode::ApOnly
        } else {
            PreferredMode::ClientOnly
        };

        let credentials = settings
            .string(settings::CLIENT_SSID)
            .map(|ssid| Credentials {
                ssid,
                passphrase: settings
                    .string(settings::CLIENT_PASSPHRASE)
                    .unwrap_or_default(),
            });

        Self {
            preferred_mode,
            credentials,
            ap_passphrase: settings.string(settings::AP_PASSPHRASE),
            hostname,
            connect_timeout: timing.connect_timeout,
            reconnect_interval: timing.reconnect_interval,
        }
    }
}

/// Drop an access-point passphrase the radio would refuse.
pub fn sanitize_passphrase(passphrase: Option<String>) -> Option<String> {
    match passphrase {
        Some(p) if p.chars().count() < PASSPHRASE_MIN_LEN => {
            warn!("wifi: access-point passphrase too short, using an open network");
            None
        }
        passphrase => passphrase,
    }
}

pub struct WifiManager {
    state: ConnectivityState,
    config: ConnectivityConfig,
    radio: Box<dyn Radio>,
    names: Box<dyn NameService>,
}

impl WifiManager {
    pub fn new(
        mut config: ConnectivityConfig,
        radio: Box<dyn Radio>,
        names: Box<dyn NameService>,
    ) -> Self {
        config.ap_passphrase = sanitize_passphrase(config.ap_passphrase.take());

        Self {
            state: ConnectivityState::Disconnected,
            config,
            radio,
            names,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    pub fn radio(&self) -> &dyn Radio {
        self.radio.as_ref()
    }

    /// Whether the client radio is enabled.
    pub fn client_mode(&self) -> bool {
        self.radio.mode().client
    }

    pub fn access_point_active(&self) -> bool {
        self.radio.mode().access_point
    }

    /// Client address while connected.
    pub fn address(&self) -> Option<Ipv4Addr> {
        (self.state == ConnectivityState::ClientConnected)
            .then(|| self.radio.client_address())
            .filter(|address| !address.is_unspecified())
    }

    pub fn start(&mut self, scheduler: &mut Scheduler<Device>) {
        if self.config.preferred_mode == PreferredMode::ApOnly {
            info!("wifi: start in access-point only mode");
            self.force_ap(scheduler);
            return;
        }

        info!("wifi: start in client mode");
        self.radio.set_hostname(&self.config.hostname);
        self.attempt_client(scheduler);
    }

    /// Explicit client connect request.
    pub fn connect(&mut self, scheduler: &mut Scheduler<Device>, credentials: Option<Credentials>) {
        info!(
            "wifi: connect to {}",
            credentials
                .as_ref()
                .map_or("last known network", |c| c.ssid.as_str())
        );

        self.config.preferred_mode = PreferredMode::ClientOnly;
        if credentials.is_some() {
            self.config.credentials = credentials;
        }

        for purpose in WIFI_TIMERS {
            scheduler.cancel(purpose);
        }

        self.attempt_client(scheduler);
    }

    pub fn force_ap(&mut self, scheduler: &mut Scheduler<Device>) {
        info!("wifi: force access-point only mode");

        for purpose in WIFI_TIMERS {
            scheduler.cancel(purpose);
        }

        self.config.preferred_mode = PreferredMode::ApOnly;
        self.radio.enable_client(false);
        self.setup_access_point(true);
        self.set_state(ConnectivityState::ApOnly);
    }

    pub fn set_ap_only(&mut self, scheduler: &mut Scheduler<Device>, ap_only: bool) {
        if ap_only {
            self.force_ap(scheduler);
        } else {
            self.config.preferred_mode = PreferredMode::ClientOnly;
            if self.state == ConnectivityState::ApOnly {
                self.attempt_client(scheduler);
            }
        }
    }

    /// Replace the configuration and apply what changed.
    pub fn reconfigure(&mut self, scheduler: &mut Scheduler<Device>, mut config: ConnectivityConfig) {
        config.ap_passphrase = sanitize_passphrase(config.ap_passphrase.take());

        let hostname_changed = config.hostname != self.config.hostname;
        let ap_changed = hostname_changed || config.ap_passphrase != self.config.ap_passphrase;
        self.config = config;

        if hostname_changed {
            self.radio.set_hostname(&self.config.hostname);
        }

        match self.config.preferred_mode {
            PreferredMode::ApOnly if self.state != ConnectivityState::ApOnly => {
                return self.force_ap(scheduler);
            }
            PreferredMode::ClientOnly if self.state == ConnectivityState::ApOnly => {
                self.attempt_client(scheduler);
            }
            _ => {}
        }

        if ap_changed && self.access_point_active() {
            self.setup_access_point(true);
        } else if hostname_changed {
            self.restart_names();
        }
    }

    pub fn set_hostname(&mut self, scheduler: &mut Scheduler<Device>, hostname: String) {
        let config = ConnectivityConfig {
            hostname,
            ..self.config.clone()
        };
        self.reconfigure(scheduler, config);
    }

    pub fn on_link_up(&mut self, scheduler: &mut Scheduler<Device>, reported: Option<Ipv4Addr>) {
        if self.state == ConnectivityState::ApOnly {
            debug!("wifi: ignore link up in access-point only mode");
            return;
        }

        // some stacks report the address before it is usable
        self.radio.restart_dhcp_client();
        let address = self.radio.client_address();
        if address.is_unspecified() {
            info!("wifi: link up (reported {reported:?}), waiting for dhcp");
            return;
        }

        info!("wifi: client connected, address {address}");

        scheduler.cancel(Purpose::ConnectTimeout);
        scheduler.cancel(Purpose::ClientRetry);
        self.set_state(ConnectivityState::ClientConnected);

        // restarts the countdown on every link up
        scheduler.once(
            Purpose::ApShutdown,
            self.config.connect_timeout,
            |device: &mut Device| device.wifi.shut_down_access_point(),
        );

        self.restart_names();
    }

    pub fn on_link_down(&mut self, scheduler: &mut Scheduler<Device>, reason: Option<u16>) {
        match self.state {
            ConnectivityState::ClientConnected | ConnectivityState::ConnectingClient => {
                info!("wifi: link down, reason {reason:?}");
                scheduler.cancel(Purpose::ApShutdown);

                if self.access_point_active() {
                    self.set_state(ConnectivityState::ApFallback);
                    if !scheduler.is_pending(Purpose::ClientRetry) {
                        self.arm_retry(scheduler);
                    }
                    return;
                }

                self.set_state(ConnectivityState::ConnectingClient);
                self.names.stop();

                if scheduler.is_pending(Purpose::ConnectTimeout) {
                    debug!("wifi: access-point fallback already pending");
                } else {
                    self.arm_fallback(scheduler);
                }
            }
            ConnectivityState::ApFallback => {
                debug!("wifi: link down in fallback, retry continues");
                if !scheduler.is_pending(Purpose::ClientRetry) {
                    self.arm_retry(scheduler);
                }
            }
            ConnectivityState::Disconnected | ConnectivityState::ApOnly => {
                debug!("wifi: ignore link down in {:?}", self.state);
            }
        }
    }

    pub fn on_mode_changed(&mut self) {
        debug!("wifi: radio mode changed to {:?}", self.radio.mode());
    }

    pub fn shutdown(&mut self, scheduler: &mut Scheduler<Device>) {
        for purpose in WIFI_TIMERS {
            scheduler.cancel(purpose);
        }
        self.names.stop();
        self.set_state(ConnectivityState::Disconnected);
    }

    fn attempt_client(&mut self, scheduler: &mut Scheduler<Device>) {
        self.radio.enable_client(true);
        self.radio.begin(self.config.credentials.clone());

        if self.access_point_active() {
            scheduler.cancel(Purpose::ConnectTimeout);
            self.set_state(ConnectivityState::ApFallback);
            self.arm_retry(scheduler);
        } else {
            self.set_state(ConnectivityState::ConnectingClient);
            self.arm_fallback(scheduler);
        }
    }

    fn arm_fallback(&self, scheduler: &mut Scheduler<Device>) {
        scheduler.once(
            Purpose::ConnectTimeout,
            self.config.connect_timeout,
            |device: &mut Device| device.wifi.fall_back_to_ap(&mut device.scheduler),
        );
    }

    fn arm_retry(&self, scheduler: &mut Scheduler<Device>) {
        scheduler.every(
            Purpose::ClientRetry,
            self.config.reconnect_interval,
            |device: &mut Device| device.wifi.retry_client(&mut device.scheduler),
        );
    }

    fn fall_back_to_ap(&mut self, scheduler: &mut Scheduler<Device>) {
        if !matches!(
            self.state,
            ConnectivityState::ConnectingClient | ConnectivityState::Disconnected
        ) {
            debug!("wifi: connect timeout ignored in {:?}", self.state);
            return;
        }

        info!("wifi: client connect timed out, enabling access point");
        self.setup_access_point(false);
        self.attempt_client(scheduler);
    }

    fn retry_client(&mut self, scheduler: &mut Scheduler<Device>) {
        if self.state != ConnectivityState::ApFallback {
            scheduler.cancel(Purpose::ClientRetry);
            return;
        }

        info!("wifi: client reconnect attempt");
        self.radio.begin(self.config.credentials.clone());
    }

    fn shut_down_access_point(&mut self) {
        // the device may have changed mode since the timer was armed
        if self.state != ConnectivityState::ClientConnected || !self.radio.mode().is_combined() {
            debug!("wifi: access point shutdown not needed in {:?}", self.state);
            return;
        }

        self.radio.enable_access_point(false);
        info!("wifi: access point disabled");
        self.restart_names();
    }

    fn setup_access_point(&mut self, force: bool) {
        if self.access_point_active() && !force {
            return;
        }

        info!(
            "wifi: access point {} ({})",
            self.config.hostname,
            if self.config.ap_passphrase.is_some() {
                "protected"
            } else {
                "open"
            }
        );

        self.radio
            .configure_access_point(&self.config.hostname, self.config.ap_passphrase.clone());
        self.radio.enable_access_point(true);
        self.restart_names();
    }

    fn restart_names(&mut self) {
        self.names.stop();
        if let Err(e) = self.names.start(&self.config.hostname) {
            error!("wifi: failed to start name service: {e:#}");
            self.names.stop();
        }
    }

    fn set_state(&mut self, state: ConnectivityState) {
        if self.state != state {
            info!("wifi: {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }
}
