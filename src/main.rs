//! `device-link` server binary.
//!
//! Usage: `device-link [config.toml]`. Without a path the configuration comes
//! from defaults plus `DEVICE_LINK_*` environment variables.

use device_link::config::LinkConfig;
use device_link::transport::Server;
use device_link::utils::logging::init_logging;
use device_link::Result;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("device-link: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => LinkConfig::from_file(path)?,
        None => LinkConfig::from_env()?,
    };
    config.validate_strict()?;
    init_logging(&config.logging);

    Server::new(config).run().await
}
