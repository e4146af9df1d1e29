//! Linux platform adapters
//!
//! [`NmcliRadio`] drives NetworkManager through `nmcli`. Commands are queued
//! and executed in order by one worker task, so radio calls return
//! immediately. [`LinkMonitor`] polls the client interface address and turns
//! transitions into [`LinkEvent`]s. [`AvahiNameService`] announces the
//! device via `avahi-publish`.

use super::radio::{Credentials, LinkEvent, NameService, Radio, RadioMode};
use crate::device::DeviceHandle;
use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use std::{fs, net::Ipv4Addr, time::Duration};
use tokio::{
    process::{Child, Command},
    sync::{mpsc, watch},
    time::interval,
};

const NMCLI: &str = "nmcli";
const AP_CONNECTION: &str = "netlink-hub-ap";
const SECRET_ARGS: [&str; 2] = ["password", "wifi-sec.psk"];

/// Poll interval of the link monitor.
pub const LINK_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn connect_args(interface: &str, credentials: Option<&Credentials>) -> Vec<String> {
    let Some(credentials) = credentials else {
        return args(&["device", "connect", interface]);
    };

    let mut cmd = args(&["device", "wifi", "connect", &credentials.ssid]);
    if !credentials.passphrase.is_empty() {
        cmd.extend(args(&["password", &credentials.passphrase]));
    }
    cmd.extend(args(&["ifname", interface]));
    cmd
}

fn access_point_args(interface: &str, ssid: &str, passphrase: Option<&str>) -> Vec<String> {
    let mut cmd = args(&[
        "connection",
        "add",
        "type",
        "wifi",
        "ifname",
        interface,
        "con-name",
        AP_CONNECTION,
        "autoconnect",
        "no",
        "ssid",
        ssid,
        "802-11-wireless.mode",
        "ap",
        "ipv4.method",
        "shared",
    ]);

    if let Some(passphrase) = passphrase {
        cmd.extend(args(&["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk", passphrase]));
    }

    cmd
}

/// Command line for logging, with secret values masked.
fn describe(args: &[String]) -> String {
    let mut masked = Vec::with_capacity(args.len());
    let mut secret = false;

    for arg in args {
        masked.push(if secret { "********" } else { arg.as_str() });
        secret = SECRET_ARGS.contains(&arg.as_str());
    }

    masked.join(" ")
}

fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');

    for byte in mac.iter_mut() {
        let part = parts.next().context("mac address too short")?;
        *byte = u8::from_str_radix(part, 16).context(format!("invalid mac byte: {part}"))?;
    }

    if parts.next().is_some() {
        bail!("mac address too long");
    }

    Ok(mac)
}

/// First IPv4 address in `ip -4 -o addr show` output.
fn parse_address(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        fields.find(|field| *field == "inet")?;
        fields.next()?.split('/').next()?.parse().ok()
    })
}

async fn run_commands(mut commands: mpsc::UnboundedReceiver<Vec<String>>) {
    while let Some(args) = commands.recv().await {
        let line = describe(&args);

        match Command::new(NMCLI).args(&args).output().await {
            Ok(output) if output.status.success() => debug!("wifi: {NMCLI} {line}"),
            Ok(output) => warn!(
                "wifi: {NMCLI} {line} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => error!("wifi: failed to run {NMCLI}: {e}"),
        }
    }
}

pub struct NmcliRadio {
    interface: String,
    ap_interface: String,
    mode: RadioMode,
    mac: [u8; 6],
    address: watch::Receiver<Ipv4Addr>,
    commands: mpsc::UnboundedSender<Vec<String>>,
}

impl NmcliRadio {
    /// Create the radio and spawn its command worker.
    ///
    /// `address` follows the client interface address, see [`LinkMonitor`].
    pub fn new(
        interface: &str,
        ap_interface: &str,
        address: watch::Receiver<Ipv4Addr>,
    ) -> Result<Self> {
        let path = format!("/sys/class/net/{interface}/address");
        let mac = fs::read_to_string(&path)
            .context(format!("failed to read mac address: {path}"))
            .and_then(|text| parse_mac(&text))?;

        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_commands(rx));

        Ok(Self {
            interface: interface.to_string(),
            ap_interface: ap_interface.to_string(),
            mode: RadioMode::OFF,
            mac,
            address,
            commands,
        })
    }

    fn queue(&self, args: Vec<String>) {
        if self.commands.send(args).is_err() {
            error!("wifi: command worker is gone");
        }
    }
}

impl Radio for NmcliRadio {
    fn set_hostname(&mut self, hostname: &str) {
        self.queue(args(&["general", "hostname", hostname]));
    }

    fn enable_client(&mut self, enable: bool) {
        if enable == self.mode.client {
            return;
        }

        self.mode.client = enable;
        if enable {
            self.queue(args(&["radio", "wifi", "on"]));
        } else {
            self.queue(args(&["device", "disconnect", &self.interface]));
        }
    }

    fn enable_access_point(&mut self, enable: bool) {
        self.mode.access_point = enable;
        let action = if enable { "up" } else { "down" };
        self.queue(args(&["connection", action, AP_CONNECTION]));
    }

    fn begin(&mut self, credentials: Option<Credentials>) {
        self.queue(connect_args(&self.interface, credentials.as_ref()));
    }

    fn configure_access_point(&mut self, ssid: &str, passphrase: Option<String>) {
        // a missing profile makes the delete fail, which is fine
        self.queue(args(&["connection", "delete", AP_CONNECTION]));
        self.queue(access_point_args(
            &self.ap_interface,
            ssid,
            passphrase.as_deref(),
        ));
    }

    fn mode(&self) -> RadioMode {
        self.mode
    }

    fn client_address(&self) -> Ipv4Addr {
        *self.address.borrow()
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }
}

/// Polls the client interface address.
pub struct LinkMonitor {
    interface: String,
    address: watch::Sender<Ipv4Addr>,
}

impl LinkMonitor {
    pub fn new(interface: &str) -> (Self, watch::Receiver<Ipv4Addr>) {
        let (address, rx) = watch::channel(Ipv4Addr::UNSPECIFIED);
        (
            Self {
                interface: interface.to_string(),
                address,
            },
            rx,
        )
    }

    /// Report address transitions to `device` until its loop is gone.
    pub async fn run(self, device: DeviceHandle) -> Result<()> {
        let mut ticker = interval(LINK_POLL_INTERVAL);

        loop {
            ticker.tick().await;

            let current = self.read_address().await;
            let previous = self.address.send_replace(current);

            if let Some(event) = transition(previous, current) {
                debug!("wifi: {} {event:?}", self.interface);
                device.link(event)?;
            }
        }
    }

    async fn read_address(&self) -> Ipv4Addr {
        let output = Command::new("ip")
            .args(["-4", "-o", "addr", "show", "dev", &self.interface])
            .output()
            .await;

        match output {
            Ok(output) => parse_address(&String::from_utf8_lossy(&output.stdout))
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            Err(e) => {
                warn!("wifi: failed to read address of {}: {e}", self.interface);
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}

fn transition(previous: Ipv4Addr, current: Ipv4Addr) -> Option<LinkEvent> {
    match (previous.is_unspecified(), current.is_unspecified()) {
        (_, false) if previous != current => Some(LinkEvent::up(current)),
        (false, true) => Some(LinkEvent::down(None)),
        _ => None,
    }
}

/// Announces `<hostname>` as an HTTP service over mDNS.
pub struct AvahiNameService {
    port: u16,
    child: Option<Child>,
}

impl AvahiNameService {
    pub fn new(port: u16) -> Self {
        Self { port, child: None }
    }
}

impl NameService for AvahiNameService {
    fn start(&mut self, hostname: &str) -> Result<()> {
        self.stop();

        let child = Command::new("avahi-publish")
            .args(["-s", hostname, "_http._tcp", &self.port.to_string()])
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn avahi-publish")?;

        info!(
            "wifi: announcing {hostname} (pid {})",
            child
                .id()
                .map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
        );
        self.child = Some(child);

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!("wifi: failed to stop avahi-publish: {e}");
            }
        }
    }
}
