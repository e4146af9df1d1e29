use actix_server::ServerHandle;
use actix_web::{App, HttpServer};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use netlink_hub::{
    api::Api,
    bus::mqtt::MqttTransport,
    config::AppConfig,
    device::{self, Collaborators, Device, DeviceHandle, DeviceOptions},
    settings::MemorySettings,
    wifi::nmcli::{AvahiNameService, LinkMonitor, NmcliRadio},
};
use std::io::Write;
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::get();

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let (handle, events) = DeviceHandle::channel();
    let (monitor, address) = LinkMonitor::new(&config.wifi.interface);

    let settings = MemorySettings::load(&config.paths.settings_file)
        .context("failed to load settings")?;
    let radio = NmcliRadio::new(&config.wifi.interface, &config.wifi.ap_interface, address)
        .context("failed to create radio")?;

    let collaborators = Collaborators {
        settings: Box::new(settings),
        radio: Box::new(radio),
        names: Box::new(AvahiNameService::new(config.http.port)),
        transports: MqttTransport::factory(handle.bus_events()),
    };

    let mut device = Device::new(collaborators, DeviceOptions::from(config));
    device.start();

    let device_task = tokio::spawn(device::run(device, events));
    let mut monitor_task = tokio::spawn(monitor.run(handle.clone()));
    let (server_handle, server_task) = run_server(config, handle.clone())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
        },
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
        result = &mut monitor_task => {
            match result {
                Ok(Ok(())) => debug!("link monitor stopped"),
                Ok(Err(e)) => error!("link monitor stopped: {e:#}"),
                Err(e) => error!("link monitor panicked: {e}"),
            }
        }
    }

    info!("shutting down");

    server_handle.stop(true).await;
    monitor_task.abort();

    if let Err(e) = handle.shutdown() {
        error!("failed to stop device: {e:#}");
    }
    if let Err(e) = device_task.await {
        error!("device task panicked: {e}");
    }

    info!("shutdown complete");

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

fn run_server(
    config: &AppConfig,
    device: DeviceHandle,
) -> Result<(ServerHandle, JoinHandle<Result<(), std::io::Error>>)> {
    let api = Api::new(device);

    let static_dir = config
        .paths
        .static_dir
        .is_dir()
        .then(|| config.paths.static_dir.clone());

    if static_dir.is_none() {
        warn!(
            "static directory {:?} not found, serving api only",
            config.paths.static_dir
        );
    }

    let server = HttpServer::new(move || {
        let api = api.clone();
        let static_dir = static_dir.clone();
        App::new().configure(move |cfg| api.configure(cfg, static_dir))
    })
    .bind(("0.0.0.0", config.http.port))
    .context("failed to bind server")?
    .disable_signals()
    .run();

    Ok((server.handle(), tokio::spawn(server)))
}
