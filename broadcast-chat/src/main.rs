use anyhow::Result;
use clap::Parser;
use tracing::warn;

use broadcast_chat::{
    cli::{Cli, Command},
    client::{self, Ended},
    config::ServerConfig,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let server = Server::bind(ServerConfig::from(args)).await?;
            let addr = server.local_addr()?;
            // Printed on stdout so scripts can pick up an ephemeral port.
            println!("listening on {addr}");
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Connect(mut args) => {
            let user = match args.user.take() {
                Some(user) => user,
                None => client::prompt_username().await?,
            };
            if client::run(args.into_config(user)).await? == Ended::ServerClosed {
                // A pending terminal read would keep the runtime alive until
                // the next newline.
                std::process::exit(0);
            }
        }
    }

    Ok(())
}
