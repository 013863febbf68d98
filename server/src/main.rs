use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;

/// Parses the command line, then runs the server loop on the current thread
/// until Ctrl-C or the /shutdown chat command.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();
    config.validate()?;

    info!("Starting MOAG server on {}", config.bind_addr());
    if !config.allow_shutdown() {
        info!("The /shutdown command is disabled");
    }

    let mut server = Server::bind(config).await?;
    server.run().await?;

    info!("Goodbye");
    Ok(())
}
