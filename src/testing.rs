//! Recording fakes of the device collaborators.

use crate::{
    bus::{BusOptions, BusTransport},
    device::{Collaborators, Device, DeviceOptions},
    settings::MemorySettings,
    wifi::radio::{Credentials, NameService, Radio, RadioMode},
};
use anyhow::{Result, bail};
use serde_json::Value;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};

pub const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0xa1, 0xb2, 0xc3];

#[derive(Clone, Debug, Default)]
pub struct RadioLog {
    pub mode: RadioMode,
    pub begins: usize,
    pub dhcp_restarts: usize,
    pub hostname: Option<String>,
    pub ap_ssid: Option<String>,
    pub ap_passphrase: Option<String>,
    pub address: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Default)]
pub struct NamesLog {
    pub starts: usize,
    pub running: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TransportLog {
    pub connects: usize,
    pub disconnects: usize,
    pub subscriptions: Vec<String>,
    pub published: Vec<Published>,
    pub fail_connect: bool,
}

struct FakeRadio(Arc<Mutex<RadioLog>>);

impl Radio for FakeRadio {
    fn set_hostname(&mut self, hostname: &str) {
        self.0.lock().unwrap().hostname = Some(hostname.to_string());
    }

    fn enable_client(&mut self, enable: bool) {
        self.0.lock().unwrap().mode.client = enable;
    }

    fn enable_access_point(&mut self, enable: bool) {
        self.0.lock().unwrap().mode.access_point = enable;
    }

    fn begin(&mut self, _credentials: Option<Credentials>) {
        self.0.lock().unwrap().begins += 1;
    }

    fn configure_access_point(&mut self, ssid: &str, passphrase: Option<String>) {
        let mut log = self.0.lock().unwrap();
        log.ap_ssid = Some(ssid.to_string());
        log.ap_passphrase = passphrase;
    }

    fn mode(&self) -> RadioMode {
        self.0.lock().unwrap().mode
    }

    fn client_address(&self) -> Ipv4Addr {
        self.0
            .lock()
            .unwrap()
            .address
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    fn mac_address(&self) -> [u8; 6] {
        MAC
    }

    fn restart_dhcp_client(&mut self) {
        self.0.lock().unwrap().dhcp_restarts += 1;
    }
}

struct FakeNames(Arc<Mutex<NamesLog>>);

impl NameService for FakeNames {
    fn start(&mut self, hostname: &str) -> Result<()> {
        let mut log = self.0.lock().unwrap();
        log.starts += 1;
        log.running = Some(hostname.to_string());
        Ok(())
    }

    fn stop(&mut self) {
        self.0.lock().unwrap().running = None;
    }
}

struct FakeTransport(Arc<Mutex<TransportLog>>);

impl BusTransport for FakeTransport {
    fn connect(&self, _options: &BusOptions) -> Result<()> {
        let mut log = self.0.lock().unwrap();
        log.connects += 1;
        if log.fail_connect {
            bail!("broker unreachable");
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.0.lock().unwrap().disconnects += 1;
    }

    fn subscribe(&self, filter: &str) -> Result<()> {
        self.0.lock().unwrap().subscriptions.push(filter.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], retained: bool) -> Result<()> {
        self.0.lock().unwrap().published.push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            retained,
        });
        Ok(())
    }
}

/// Shared views into the fakes of one device.
#[derive(Clone, Default)]
pub struct Fakes {
    radio: Arc<Mutex<RadioLog>>,
    names: Arc<Mutex<NamesLog>>,
    transport: Arc<Mutex<TransportLog>>,
}

impl Fakes {
    pub fn radio(&self) -> RadioLog {
        self.radio.lock().unwrap().clone()
    }

    pub fn names(&self) -> NamesLog {
        self.names.lock().unwrap().clone()
    }

    pub fn transport(&self) -> TransportLog {
        self.transport.lock().unwrap().clone()
    }

    pub fn set_address(&self, address: Ipv4Addr) {
        self.radio.lock().unwrap().address = Some(address);
    }

    pub fn fail_connect(&self) {
        self.transport.lock().unwrap().fail_connect = true;
    }

    pub fn clear_published(&self) {
        self.transport.lock().unwrap().published.clear();
    }
}

/// Device on recording fakes, seeded with `settings` (a JSON object).
pub fn device_with(settings: Value) -> (Device, Fakes) {
    let Value::Object(settings) = settings else {
        panic!("settings must be an object");
    };

    let fakes = Fakes::default();
    let transport = fakes.transport.clone();

    let collaborators = Collaborators {
        settings: Box::new(MemorySettings::new(settings)),
        radio: Box::new(FakeRadio(fakes.radio.clone())),
        names: Box::new(FakeNames(fakes.names.clone())),
        transports: Box::new(move |_| {
            Arc::new(FakeTransport(transport.clone())) as Arc<dyn BusTransport>
        }),
    };

    (Device::new(collaborators, DeviceOptions::default()), fakes)
}
