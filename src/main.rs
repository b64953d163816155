use std::sync::Arc;

use clap::Parser;

use usbipd::host::simulated::SimulatedHost;
#[cfg(feature = "rusb-host")]
use usbipd::host::rusb_backend::RusbHost;
use usbipd::registry::Registry;
use usbipd::server;

/// USB/IP server: exports locally attached USB devices to remote USB/IP clients.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address and port to listen on.
    #[arg(long, default_value = "127.0.0.1:3240")]
    bind: String,

    /// Serve an empty simulated device table instead of real hardware.
    /// Useful for exercising the protocol without root or attached devices.
    #[arg(long)]
    simulated: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    if args.simulated {
        log::warn!("running with a simulated, empty device table (--simulated)");
        let registry = Arc::new(Registry::new(SimulatedHost::empty()));
        return server::serve(registry, args.bind).await;
    }

    #[cfg(feature = "rusb-host")]
    {
        let registry = Arc::new(Registry::new(RusbHost::new()));
        server::serve(registry, args.bind).await
    }

    #[cfg(not(feature = "rusb-host"))]
    {
        log::error!("built without the rusb-host feature; pass --simulated or rebuild with it enabled");
        Ok(())
    }
}
