//! Entry point for `stopwait-tcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing) and the echo application on top.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use stopwait_tcp::{
    Backoff, ConnError, Connection, ConnectionConfig, PortRegistry, UdpNetwork,
};

/// TCP-like reliable message stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run an echo server, accepting connections one after another.
    Server {
        /// Local address to listen on (e.g. 127.0.0.1:9000).
        ///
        /// Written into every datagram as its source, so it must be an
        /// address clients can reach; 0.0.0.0 and :: are rejected.
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        bind: SocketAddr,
    },
    /// Connect to an echo server, send each message and print the echo.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Local IP to bind; the port is picked from the ephemeral range.
        ///
        /// The server replies to this address, so use one it can reach when
        /// it runs on another host.
        #[arg(long, default_value = "127.0.0.1")]
        ip: IpAddr,
        /// Messages to send, one datagram each.
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[derive(Args)]
struct Tuning {
    /// Per-attempt retransmission timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 500)]
    timeout_ms: u64,
    /// Transmissions per datagram before giving up.
    #[arg(long, global = true, default_value_t = 20)]
    attempts: u32,
    /// Double the timeout after every expiry, up to this many milliseconds.
    #[arg(long, global = true)]
    max_backoff_ms: Option<u64>,
}

impl Tuning {
    fn config(&self) -> ConnectionConfig {
        let backoff = match self.max_backoff_ms {
            Some(max) => Backoff::Exponential {
                max: Duration::from_millis(max),
            },
            None => Backoff::Fixed,
        };
        ConnectionConfig::default()
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_attempts(self.attempts)
            .with_backoff(backoff)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.tuning.config();
    let registry = PortRegistry::new();

    match cli.mode {
        Mode::Server { bind } => {
            check_advertised(bind.ip())?;
            serve(bind, registry, config).await
        }
        Mode::Client {
            server,
            ip,
            messages,
        } => {
            check_advertised(ip)?;
            run_client(server, ip, &messages, registry, config).await
        }
    }
}

/// Peers answer the address carried in our datagrams, so it has to be one
/// they can send to.
fn check_advertised(ip: IpAddr) -> Result<()> {
    ensure!(
        !ip.is_unspecified(),
        "{ip} is not an address peers can reply to; bind a concrete interface address"
    );
    Ok(())
}

async fn serve(bind: SocketAddr, registry: PortRegistry, config: ConnectionConfig) -> Result<()> {
    let mut listener = Connection::new(UdpNetwork, registry, bind, config)
        .await
        .with_context(|| format!("cannot listen on {bind}"))?;
    log::info!("Echo server listening on {bind}");

    loop {
        let conn = listener.accept().await.context("accept failed")?;
        tokio::spawn(async move {
            let peer = conn.remote_addr();
            if let Err(e) = echo(conn).await {
                log::warn!("session with {peer:?} ended with error: {e}");
            }
        });
    }
}

async fn echo(mut conn: Connection<UdpNetwork>) -> Result<(), ConnError> {
    loop {
        match conn.receive().await {
            Ok(message) => conn.send(&message).await?,
            Err(ConnError::Eof) => break,
            Err(e) => return Err(e),
        }
    }
    conn.close().await
}

async fn run_client(
    server: SocketAddr,
    ip: IpAddr,
    messages: &[String],
    registry: PortRegistry,
    config: ConnectionConfig,
) -> Result<()> {
    let mut conn = Connection::ephemeral(UdpNetwork, registry, ip, config).await?;
    conn.connect(server)
        .await
        .with_context(|| format!("cannot connect to {server}"))?;
    log::info!(
        "Connected {} -> {:?}",
        conn.local_addr(),
        conn.remote_addr()
    );

    for message in messages {
        conn.send(message.as_bytes()).await?;
        let reply = conn.receive().await?;
        println!("{}", String::from_utf8_lossy(&reply));
    }

    conn.close().await.context("close failed")?;
    Ok(())
}
