//! Plexus component host.

#![forbid(unsafe_code)]

use clap::Parser;
use plexus_com::ServiceRegistry;
use plexus_host::{reporting, run, Arguments};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let arguments = Arguments::parse();

    reporting::install()?;

    // The stock host has no statically linked classes; loaded proxy-stub
    // libraries may add theirs through the registry in `run`.
    let registry = ServiceRegistry::new();

    let code = run(arguments, registry).await?;
    std::process::exit(code);
}
