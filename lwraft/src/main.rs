use clap::Parser;
use lwraft::config::RuntimeConfig;
use lwraft::server::Server;
use slog::{o, Drain};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "lwraft", about = "Raft replication node for a directory server")]
struct Args {
    /// Path of the runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Overrides the node id from the config file
    #[arg(long)]
    id: Option<u64>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn raft_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    let mut config = RuntimeConfig::from_toml(&args.config)?;
    if let Some(id) = args.id {
        config.id = id;
    }
    config.validate()?;
    log::info!("starting node {} with {} bootstrap members", config.id, config.node_list.len());

    let logger = raft_logger();
    let mut server = Server::new(config);
    server.start(&logger).await?;
    shutdown_signal().await;
    server.stop().await;
    Ok(())
}
