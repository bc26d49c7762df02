mod intercept;
mod protocol;
mod proxy;
mod sink;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::info;

use intercept::{HexDump, Recorder};
use proxy::ProxyMessage;
use sink::rotating::RotatingFileSink;
use sink::stdout::StdoutSink;
use sink::QuerySink;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Rotating files under --log-dir
    File,
    /// One line per query on stdout
    Stdout,
}

#[derive(Parser, Debug)]
#[command(
    name = "pgwiretap",
    about = "Transparent PostgreSQL proxy that reconstructs and logs client SQL"
)]
struct Cli {
    /// Address to listen on
    listen_host: String,

    /// Port to listen on
    listen_port: u16,

    /// Backend database host
    db_host: String,

    /// Backend database port
    db_port: u16,

    /// Where query lines go
    #[arg(short = 'm', long = "mode", value_enum, default_value = "file")]
    mode: Mode,

    /// Directory for the rotating query log
    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,

    /// Base name of the rotating query log files
    #[arg(long = "log-name", default_value = "query")]
    log_name: String,

    /// Also append a raw hex dump of every forwarded chunk to this file
    #[arg(long = "hex-dump")]
    hex_dump: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Interposing on database traffic is an operator action; gate it the way
    // the classic capture tools do.
    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("pgwiretap must run as root");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pgwiretap=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let sink: Box<dyn QuerySink> = match cli.mode {
        Mode::File => Box::new(RotatingFileSink::new(&cli.log_dir, &cli.log_name)?),
        Mode::Stdout => Box::new(StdoutSink::new()),
    };
    let hex_dump = match &cli.hex_dump {
        Some(path) => Some(HexDump::open(path)?),
        None => None,
    };
    let tap_traffic = hex_dump.is_some();
    let mut recorder = Recorder::new(sink, hex_dump);

    info!(
        "pgwiretap starting — listening on {}:{}, forwarding to {}:{}",
        cli.listen_host, cli.listen_port, cli.db_host, cli.db_port
    );

    let (tx, mut rx) = mpsc::channel::<ProxyMessage>(1024);

    let listen_addr = format!("{}:{}", cli.listen_host, cli.listen_port);
    let upstream_addr = format!("{}:{}", cli.db_host, cli.db_port);

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy::run_proxy(&listen_addr, upstream_addr, tx, tap_traffic).await {
            tracing::error!("Proxy error: {e}");
        }
    });

    let recorder_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            recorder.handle(msg);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
        _ = proxy_handle => {}
        _ = recorder_handle => {}
    }

    Ok(())
}
