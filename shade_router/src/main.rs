// CLI entry point for the Shade router.
//
// Loads an optional JSON config file, applies command-line overrides, and
// runs the router until the process is killed. See `server.rs` for the
// networking architecture and `command.rs` for request handling.
//
// Usage:
//   router [OPTIONS]
//     --config <PATH>        JSON config file
//     --address <ADDR>       Bind/advertise address
//     --port <PORT>          Listen port
//     --password <PASS>      Router password
//     --threads <N>          Worker pool size
//     --buffer-size <N>      Buffered chunks per transfer

use std::path::PathBuf;

use clap::Parser;
use shade_router::logging::setup_log;
use shade_router::{RouterConfig, start_router};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "router", about = "Anonymizing relay router", version)]
struct Args {
    /// JSON config file; missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    address: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    buffer_size: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<RouterConfig, shade_router::RouterError> {
        let mut config = match &self.config {
            Some(path) => RouterConfig::from_json_file(path)?,
            None => RouterConfig::default(),
        };
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        Ok(config)
    }
}

fn main() {
    setup_log();
    let args = Args::parse();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let name = config.name.clone();

    let (handle, addr) = match start_router(config) {
        Ok(result) => result,
        Err(e) => {
            error!("failed to start router: {e}");
            std::process::exit(1);
        }
    };

    info!(%name, %addr, "router running; Ctrl+C to stop");
    handle.wait();
}
