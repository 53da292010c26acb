use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use sum_server::{app::SumServer, cli::Cli};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let server = SumServer::bind(&cli.ip, cli.port(), cli.sweep_interval()).await?;
    if let Some(addr) = server.local_addr() {
        info!("server started on {}", addr);
    }

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
