use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Arg, Command};
use ctap_hid::{Packet, PacketError};
use fido2_api::Aaguid;
use fido2_service::{Authenticator, AutoApprove, IdentityError, SelfSignedIdentity};
use futures::{sink, stream, Sink, Stream, TryStreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use usbip_device::{EndpointError, HidDevice, UsbIpServer};

use crate::config::{Config, ConfigError};

mod config;

const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const VERSION: &str = env!("CARGO_PKG_VERSION");
const CONFIG_ARG: &str = "config";
const LISTEN_ARG: &str = "listen";

#[derive(Debug, Error)]
enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Unable to create attestation identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("HID endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
}

#[tokio::main]
async fn main() {
    let args = Command::new("usbip-fido")
        .version(VERSION)
        .author(AUTHORS)
        .about(DESCRIPTION)
        .arg(
            Arg::new(CONFIG_ARG)
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(clap::value_parser!(PathBuf))
                .help("JSON config file, defaults are used for anything it leaves out"),
        )
        .arg(
            Arg::new(LISTEN_ARG)
                .short('l')
                .long("listen")
                .num_args(1)
                .value_parser(clap::value_parser!(SocketAddr))
                .help("Address to accept USB/IP connections on, overrides the config file"),
        )
        .after_help("Attach from the host with: usbip attach -r <address> -b <bus id>")
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = VERSION, "Starting virtual FIDO authenticator");

    let config_path = args.get_one::<PathBuf>(CONFIG_ARG);
    let listen = args.get_one::<SocketAddr>(LISTEN_ARG).copied();
    if let Err(ref err) = run(config_path.map(|x| &**x), listen).await {
        error!(error = %err, "Error encountered, exiting");
        std::process::exit(1);
    }
}

async fn run(config_path: Option<&Path>, listen: Option<SocketAddr>) -> Result<(), Error> {
    let mut config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = listen {
        config.listen = listen;
    }
    debug!(?config, "Loaded configuration");

    let identity = SelfSignedIdentity::generate(&config.authenticator.attestation_common_name)?;
    let presence = AutoApprove::new(config.authenticator.auto_approve);
    let authenticator = Authenticator::new(identity, presence, Aaguid(config.authenticator.aaguid));

    let device = Arc::new(HidDevice::new(
        config.device.clone(),
        &ctap_hid::REPORT_DESCRIPTOR,
        config.report_queue_depth,
    ));

    let listener = TcpListener::bind(config.listen).await?;
    let address = listener.local_addr()?;
    info!(%address, bus_id = device.bus_id(), "Listening for USB/IP connections");
    info!(
        "Attach with: usbip --tcp-port {} attach -r {} -b {}",
        address.port(),
        address.ip(),
        device.bus_id()
    );

    let hid = ctap_hid::Server::new(
        authenticator,
        packets_from_host(device.clone()),
        packets_to_host(device.clone()),
    );
    let usbip = UsbIpServer::serve(listener, device);

    tokio::select! {
        result = usbip => result?,
        result = hid => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, shutting down");
        }
    }
    Ok(())
}

/// Reports the host wrote to the OUT endpoint, as CTAPHID packets.
fn packets_from_host(device: Arc<HidDevice>) -> impl Stream<Item = Result<Packet, Error>> {
    stream::unfold(Some(device), |device| async move {
        let device = device?;
        match device.read_interrupt_out().await {
            Ok(report) => Some((Ok(report), Some(device))),
            Err(err) => Some((Err(Error::from(err)), None)),
        }
    })
    .try_filter_map(|report| async move {
        match Packet::from_bytes(&report) {
            Ok(packet) => Ok(Some(packet)),
            Err(err) => {
                log_bad_report(&err, &report);
                Ok(None)
            }
        }
    })
}

/// CTAPHID packets queued for the host to read from the IN endpoint.
fn packets_to_host(device: Arc<HidDevice>) -> impl Sink<Packet, Error = Error> {
    sink::unfold(device, |device, packet: Packet| async move {
        device.write_interrupt_in(packet.to_bytes()).await?;
        Ok::<_, Error>(device)
    })
}

fn log_bad_report(err: &PacketError, report: &[u8]) {
    warn!(error = %err, "Dropping malformed HID report");
    debug!(?report, "Malformed report");
}
