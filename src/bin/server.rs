use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use log::info;
use tokio::sync::watch;

use subtitle_server::config::Config;
use subtitle_server::server;

#[derive(Default, Debug, Copy, Clone, clap::ValueEnum)]
enum Level {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<Level> for log::LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => log::LevelFilter::Error,
            Level::Warn => log::LevelFilter::Warn,
            Level::Info => log::LevelFilter::Info,
            Level::Debug => log::LevelFilter::Debug,
            Level::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        f.write_str(s)
    }
}

#[derive(Parser)]
#[command(name = "Subtitle Server")]
#[command(version = "0.1.0")]
#[command(about = "WebSocket subtitle generation server", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = format!("127.0.0.1"))]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Idle seconds before upload sessions and jobs are evicted.
    #[arg(long, default_value_t = 900)]
    session_idle_secs: u64,

    #[arg(short, long, default_value_t = Level::Info)]
    #[clap(value_enum)]
    level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%6f"),
                record.args()
            )
        })
        .filter(None, cli.level.into())
        .init();

    let mut config = Config::from_env()?;
    config.session_idle = Duration::from_secs(cli.session_idle_secs);

    let host = IpAddr::from_str(&cli.host)?;
    let listen = SocketAddr::new(host, cli.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    server::run(listen, config, shutdown_rx).await
}
