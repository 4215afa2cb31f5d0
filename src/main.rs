//! # Communicator Binary - Main Entry Point
//!
//! Launches one protocol communicator and runs it until interrupted.
//!
//! The entry point performs these key operations:
//! 1. **Validate argv**: non-UTF-8 arguments exit with code 2
//! 2. **Initialize logging**: layered tracing per the verbosity flags
//! 3. **Assemble configuration**: optional file, then `--set` overrides
//! 4. **Build the communicator**: bind sockets, prepare the service client;
//!    any failure here exits with code 1
//! 5. **Run**: drive the communicator; ctrl-c requests a clean shutdown
//!    and the process exits 0

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use peer_communicator::{
    cli::Args,
    communicator::CommunicatorFactory,
    config::Config,
    logging,
    identity::PeerId,
};
use tracing::{error, info};

/// Initialization failure.
const EXIT_INIT: i32 = 1;
/// Arguments were not valid UTF-8.
const EXIT_BAD_ARGV: i32 = 2;

fn main() {
    // Argument validation happens before clap: any non-UTF-8 argv entry is
    // a hard error with its own exit code.
    let mut argv = Vec::new();
    for arg in std::env::args_os() {
        match arg.into_string() {
            Ok(arg) => argv.push(arg),
            Err(bad) => {
                eprintln!("argument is not valid UTF-8: {bad:?}");
                std::process::exit(EXIT_BAD_ARGV);
            }
        }
    }
    let args = Args::parse_from(argv);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            std::process::exit(EXIT_INIT);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        error!("initialization failed: {e:#}");
        std::process::exit(EXIT_INIT);
    }
}

async fn run(args: Args) -> Result<()> {
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;
    if let Some(path) = logging::dated_log_file(args.log_file.as_deref()) {
        info!("detailed logs in {path}");
    }

    let mut config = match &args.config {
        Some(path) => Config::load_file(path)?,
        None => Config::new(),
    };
    args.apply_overrides(&mut config).map_err(|e| anyhow!(e))?;

    let identity = match &args.identity {
        Some(hex) => PeerId::from_hex(hex).context("parsing --identity")?,
        None => {
            let id = PeerId::from_bytes(rand::random());
            info!("generated identity {}", id.short());
            id
        }
    };

    let protocol = args.protocol.into();
    let mut communicator = CommunicatorFactory::create(
        protocol,
        identity,
        &config,
        args.service_socket.clone(),
    )?;
    let handle = communicator.handle();

    info!(
        "starting {protocol} communicator (service at {:?})",
        args.service_socket
    );

    // Ctrl-c requests a clean shutdown; the driver fails pending work
    // synchronously and returns.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    communicator.run().await?;
    info!("clean shutdown");
    Ok(())
}
