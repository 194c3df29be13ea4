use std::path::PathBuf;

use clap::{Parser, Subcommand};

use parfs_logging::LogConfig;
use parfs_net_rdma::RdmaConfig;

/// RDMA transport diagnostic tool.
///
/// Exercises the socket-level API end to end against a live RNIC: `serve`
/// runs an echo server, `ping` measures round trips through the credit
/// protocol. Requires a build with the `rdma` feature and RDMA-capable
/// hardware on both ends.
#[derive(Parser, Debug)]
#[command(name = "parfs-ibping", version, about)]
struct Args {
    /// Path to a JSON transport configuration; defaults apply if omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an echo server, one thread per accepted connection.
    Serve {
        /// Local address to bind, e.g. 0.0.0.0:7420
        #[arg(long, default_value = "0.0.0.0:7420")]
        bind: std::net::SocketAddr,
    },
    /// Connect to an echo server and measure round trips.
    Ping {
        /// Server hostname or IP.
        host: String,

        #[arg(long, default_value_t = 7420)]
        port: u16,

        /// Number of round trips.
        #[arg(long, default_value_t = 10)]
        count: u32,

        /// Payload size in bytes (minimum 2; 1-byte packets are reserved
        /// for flow control).
        #[arg(long, default_value_t = 4096)]
        size: usize,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RdmaConfig> {
    let config = match path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => RdmaConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = parfs_logging::init_logging(&LogConfig::default());

    let config = load_config(args.config.as_ref())?;
    match args.command {
        Command::Serve { bind } => rdma::serve(bind, config),
        Command::Ping {
            host,
            port,
            count,
            size,
        } => rdma::ping(&host, port, count, size, config),
    }
}

#[cfg(feature = "rdma")]
mod rdma {
    use std::net::SocketAddr;
    use std::time::Instant;

    use anyhow::Context;

    use parfs_net::Accepted;
    use parfs_net_rdma::{RdmaConfig, RdmaError, RdmaSocket};

    const RECV_TIMEOUT_MS: u64 = 30_000;

    pub fn serve(bind: SocketAddr, config: RdmaConfig) -> anyhow::Result<()> {
        let mut listener = RdmaSocket::listen_on(bind, &config)?;
        tracing::info!(%bind, "echo server ready");

        loop {
            match listener.accept(RECV_TIMEOUT_MS) {
                Ok(Accepted::Connection(socket, peer)) => {
                    tracing::info!(%peer, "connection accepted");
                    std::thread::spawn(move || echo_loop(socket, peer));
                }
                Ok(Accepted::Ignored) => continue,
                Err(RdmaError::Timeout) => continue,
                Err(err) => return Err(err).context("accept failed"),
            }
        }
    }

    fn echo_loop(mut socket: RdmaSocket, peer: SocketAddr) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.recv(&mut buf, RECV_TIMEOUT_MS) {
                Ok(0) => continue,
                Ok(n) => {
                    if let Err(err) = socket.send(&buf[..n]) {
                        tracing::warn!(%peer, %err, "echo send failed");
                        break;
                    }
                }
                Err(RdmaError::Timeout) => {
                    // Idle connection; probe it instead of looping forever.
                    if let Err(err) = socket.check_connection() {
                        tracing::info!(%peer, %err, "peer gone");
                        break;
                    }
                }
                Err(err) => {
                    tracing::info!(%peer, %err, "connection closed");
                    break;
                }
            }
        }
        let _ = socket.shutdown();
        socket.close();
    }

    pub fn ping(
        host: &str,
        port: u16,
        count: u32,
        size: usize,
        config: RdmaConfig,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(size >= 2, "payload must be at least 2 bytes");

        let mut socket =
            RdmaSocket::connect_host(host, port, &config).context("connect failed")?;
        tracing::info!(host, port, "connected");

        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut echo = vec![0u8; size];

        for seq in 0..count {
            let started = Instant::now();
            socket.send(&payload)?;

            let mut received = 0;
            while received < size {
                received += socket.recv(&mut echo[received..], RECV_TIMEOUT_MS)?;
            }
            anyhow::ensure!(echo == payload, "echo mismatch on round trip {seq}");
            println!("seq={seq} bytes={size} rtt={:?}", started.elapsed());
        }

        socket.shutdown()?;
        socket.close();
        Ok(())
    }
}

#[cfg(not(feature = "rdma"))]
mod rdma {
    use std::net::SocketAddr;

    use parfs_net_rdma::RdmaConfig;

    pub fn serve(_bind: SocketAddr, _config: RdmaConfig) -> anyhow::Result<()> {
        anyhow::bail!("built without the `rdma` feature; rebuild with --features rdma")
    }

    pub fn ping(
        _host: &str,
        _port: u16,
        _count: u32,
        _size: usize,
        _config: RdmaConfig,
    ) -> anyhow::Result<()> {
        anyhow::bail!("built without the `rdma` feature; rebuild with --features rdma")
    }
}
