use diag_echo::config::Config;
use diag_echo::runtime::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        instance = config.instance_id,
        max_connections = config.max_connections,
        "Starting diag-echo server"
    );

    let mut server = match Server::start(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Server failed to start, exiting");
            return Err(e.into());
        }
    };

    server.run()?;
    Ok(())
}
