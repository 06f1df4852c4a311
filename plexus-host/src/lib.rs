//! Hosting loop for out-of-process plexus components.
//!
//! The supervisor launches the host binary with the connector address, the
//! class to instantiate and the parent's exchange id in the environment; the
//! host opens a communicator client in offer mode and serves invokes until
//! it is told to stop.
//!
//! Librarified so embedders can link their implementations, fill a
//! [`ServiceRegistry`] and reuse [`run`]; the stock binary serves classes
//! registered by loaded proxy-stub libraries only.

#![forbid(unsafe_code)]

use std::sync::Arc;

use camino::Utf8PathBuf;
use eyre::WrapErr;
use plexus_com::{exit_code, ClientMode, CommunicatorClient, ServiceRegistry, ANNOUNCE_TIMEOUT};
use plexus_net_utils::NodeAddress;
use plexus_protocol::{ExchangeId, InterfaceId, Version};
use plexus_rpc::{load_proxy_stubs, Administrator};

pub mod reporting;

/// Plexus component host
///
/// Instantiates one class and offers it back to the communicator that
/// launched this process.
#[derive(clap::Parser, Debug)]
#[command(version)]
pub struct Arguments {
    /// The communicator to publish the hosted object to.
    #[arg(long, env = "PLEXUS_CONNECTOR")]
    pub connector: NodeAddress,

    /// Class to instantiate.
    #[arg(long)]
    pub class: String,

    /// Interface id the offered object must expose.
    #[arg(long)]
    pub interface: u32,

    /// Requested interface version.
    #[arg(long, default_value_t = u32::MAX)]
    pub version: u32,

    /// Human tag for diagnostics.
    #[arg(long, default_value = "")]
    pub callsign: String,

    /// Directory of proxy-stub libraries to load before announcing.
    #[arg(long, env = "PLEXUS_PROXY_STUB_PATH")]
    pub proxy_stub_path: Option<Utf8PathBuf>,
}

/// Hosts `arguments.class` from `registry` until the parent tears the
/// process down; returns the exit code to report to the supervisor.
#[tracing::instrument(skip_all, fields(class = %arguments.class, callsign = %arguments.callsign))]
pub async fn run(arguments: Arguments, registry: ServiceRegistry) -> eyre::Result<i32> {
    let administrator = Administrator::new();

    if let Some(path) = &arguments.proxy_stub_path {
        let loaded =
            load_proxy_stubs(&administrator, path).wrap_err("loading proxy-stub libraries")?;
        tracing::info!(loaded, %path, "proxy-stub libraries loaded");
    }

    let exchange = ExchangeId::from_env();
    tracing::info!(%exchange, "hosting for parent exchange");

    let Some(object) = registry.instantiate(&arguments.class, Version(arguments.version)) else {
        tracing::error!("class is not known to this host");
        return Ok(exit_code::LAUNCH_FAILED);
    };
    let Some(object) = object.query_interface(InterfaceId(arguments.interface)) else {
        tracing::error!("class does not expose the requested interface");
        return Ok(exit_code::LAUNCH_FAILED);
    };

    let client = Arc::new(CommunicatorClient::new(
        administrator,
        arguments.connector.clone(),
        ClientMode::Offer { object, exchange },
    ));
    if let Err(code) = client.open(ANNOUNCE_TIMEOUT).await {
        tracing::error!(%code, "offering to the parent failed");
        return Ok(exit_code::ANNOUNCE_TIMEOUT);
    }

    if let Some(categories) = client.trace_categories() {
        // Handed to embedders through the log; the stock host keeps its
        // startup filter.
        tracing::info!(%categories, "parent supplied trace categories");
    }

    let channel = client.channel().expect("open client has a channel");

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let code = tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
            exit_code::SUCCESS
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            exit_code::SUCCESS
        }
        _ = channel.closed() => {
            // The parent dropped us without the courtesy of a signal.
            tracing::warn!("parent closed the channel");
            exit_code::REJECTED
        }
    };

    client.close().await;
    Ok(code)
}
