//! The `gangway-bridge` binary: a per-session bridge speaking the framed
//! channel protocol on stdin/stdout.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gangwaybridge::packages::{Listing, PackageDirs};
use gangwaybridge::{default_factory, Multiplexer};
use gangwaywire::pipe::Pipe;
use gangwaywire::transport::Transport;

#[derive(Parser)]
#[command(name = "gangway-bridge", version, about = "Gangway session bridge")]
struct Args {
    /// Dump the package listing and exit.
    #[arg(long)]
    packages: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    // Diagnostics go to stderr; stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.packages {
        let listing = Listing::load(&PackageDirs::from_env());
        let mut stdout = std::io::stdout();
        if let Err(err) = listing.dump(&mut stdout) {
            eprintln!("gangway-bridge: {err}");
            return std::process::ExitCode::FAILURE;
        }
        return std::process::ExitCode::SUCCESS;
    }

    let transport = Transport::new(Pipe::stdio());
    let mux = Multiplexer::new(transport, default_factory());
    match mux.run().await {
        None => std::process::ExitCode::SUCCESS,
        Some(problem) => {
            eprintln!("gangway-bridge: transport failed: {problem}");
            std::process::ExitCode::FAILURE
        }
    }
}
