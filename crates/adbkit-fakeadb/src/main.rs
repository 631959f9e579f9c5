use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use adbkit_config::AdbkitConfig;
use adbkit_fakeadb::inventory_feed::InventoryPublisher;
use adbkit_fakeadb::{FakeAdbServer, FakeAdbServerConfig};
use clap::Parser;

/// Fake ADB server for exercising debugger clients without a device.
///
/// Prints the bound address on stdout and runs until interrupted.
#[derive(Debug, Parser)]
#[command(name = "fake-adb-server", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `ADBKIT_CONFIG` is used as a fallback. When neither are provided
    /// the server uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `fake_adb.listen`.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Device to connect at startup, as `SERIAL` or `SERIAL:API_LEVEL`. Repeatable.
    #[arg(long = "device", value_name = "SERIAL[:API]")]
    devices: Vec<String>,
}

/// API level used for `--device` entries without one.
const DEFAULT_API_LEVEL: u32 = 30;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config);
    let _log_buffer = adbkit_config::init_tracing(&config.logging);

    let mut server_config = FakeAdbServerConfig::from(&config);
    if let Some(listen) = cli.listen {
        server_config.listen = listen;
    }
    let server = FakeAdbServer::spawn_with_config(server_config).await?;

    let publisher = InventoryPublisher::new(&config.inventory);
    let mut devices = server.connect_configured_devices(&config.fake_adb.devices);
    for arg in &cli.devices {
        let (serial, api_level) = parse_device_arg(arg);
        let device = server.connect_device(serial, api_level);
        if !devices.iter().any(|known| Arc::ptr_eq(known, &device)) {
            devices.push(device);
        }
    }
    // Feeds end on their own once their device disconnects.
    for device in devices {
        drop(publisher.publish(device));
    }

    println!("{}", server.addr());
    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}

fn parse_device_arg(arg: &str) -> (String, u32) {
    match arg.rsplit_once(':') {
        Some((serial, api)) if !serial.is_empty() => match api.parse() {
            Ok(api_level) => (serial.to_string(), api_level),
            Err(_) => (arg.to_string(), DEFAULT_API_LEVEL),
        },
        _ => (arg.to_string(), DEFAULT_API_LEVEL),
    }
}

fn load_config(cli_path: Option<PathBuf>) -> AdbkitConfig {
    let path = cli_path.or_else(|| std::env::var_os("ADBKIT_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return AdbkitConfig::default();
    };

    match AdbkitConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "fake-adb-server: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            AdbkitConfig::default()
        }
    }
}
