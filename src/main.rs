use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use sliced::config::Config;
use sliced::server::Server;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::parse();
    let (services, worker) = config.build()?;

    let mut server = Server::bind(&config.addr(), services, config.loops)
        .await?
        .with_balance(config.balance);
    if let Some(path) = &config.unixsocket {
        server = server.listen_unix(path)?;
        info!("also listening on unix socket {}", path.display());
    }
    info!(
        "sliced {} listening on {}",
        sliced::VERSION,
        server.local_addr()?
    );
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err.into());
    }

    if let Some(worker) = worker {
        worker.shutdown();
    }
    Ok(())
}
