//! Yuubinsya tunnel: echo server and client for the transport ciphers.
//!
//! `serve` accepts TCP connections, runs the server handshake and echoes the
//! decrypted stream back; with `--udp` it also echoes datagrams. `send` is
//! the matching client.

#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use yuubinsya_common::{CryptoMethod, TransportConfig};
use yuubinsya_crypto::{DatagramConn, Handshaker, Role, MAX_SEGMENT_SIZE};

#[derive(Parser, Debug)]
#[command(name = "yuubinsya-tunnel")]
#[command(about = "Echo server and client for the Yuubinsya transport ciphers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo everything back
    Serve {
        /// TCP listen address
        #[arg(long, default_value = "127.0.0.1:9000")]
        listen: SocketAddr,

        /// Also echo datagrams on this UDP address
        #[arg(long)]
        udp: Option<SocketAddr>,

        #[command(flatten)]
        transport: TransportArgs,
    },

    /// Send one message and print the echoed reply
    Send {
        /// Server address (host:port)
        #[arg(short, long)]
        server: SocketAddr,

        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Use the datagram cipher instead of a TCP handshake
        #[arg(long, default_value_t = false)]
        udp: bool,

        #[command(flatten)]
        transport: TransportArgs,
    },
}

#[derive(Args, Debug)]
struct TransportArgs {
    /// Pre-shared secret
    #[arg(long, env = "YUUBINSYA_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// AEAD suite: chacha20poly1305 or xchacha20poly1305
    #[arg(long, env = "YUUBINSYA_METHOD")]
    method: Option<CryptoMethod>,

    /// JSON transport config; flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,
}

impl TransportArgs {
    fn resolve(self) -> Result<TransportConfig> {
        let mut config = match &self.config {
            Some(path) => TransportConfig::from_json_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => {
                let password = self
                    .password
                    .clone()
                    .context("--password, YUUBINSYA_PASSWORD or --config is required")?;
                TransportConfig::new(password, CryptoMethod::default())
            }
        };

        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(method) = self.method {
            config.crypto_method = method;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    yuubinsya_common::init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            listen,
            udp,
            transport,
        } => serve(listen, udp, transport.resolve()?).await,
        Command::Send {
            server,
            message,
            udp,
            transport,
        } => {
            let config = transport.resolve()?;
            if udp {
                send_datagram(server, &message, &config).await
            } else {
                send_stream(server, &message, &config).await
            }
        }
    }
}

async fn serve(
    listen: SocketAddr,
    udp: Option<SocketAddr>,
    config: TransportConfig,
) -> Result<()> {
    let handshaker = Handshaker::from_config(Role::Server, &config)?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, method = %config.crypto_method, "listening for stream sessions");

    if let Some(addr) = udp {
        let conn = DatagramConn::bind(addr, config.password_bytes(), config.crypto_method)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "listening for datagrams");
        tokio::spawn(echo_datagrams(conn));
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, peer) = accepted?;
                let handshaker = handshaker.clone();
                tokio::spawn(async move {
                    if let Err(e) = echo_stream(handshaker, tcp).await {
                        warn!(%peer, "session ended: {:#}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn echo_stream(handshaker: Handshaker, tcp: TcpStream) -> Result<()> {
    let peer = tcp.peer_addr()?;
    let conn = handshaker.handshake(tcp).await.context("handshake failed")?;
    info!(%peer, "session established");

    let (mut reader, mut writer) = tokio::io::split(conn);
    let bytes = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    debug!(%peer, bytes, "session closed");
    Ok(())
}

async fn echo_datagrams(conn: DatagramConn) {
    let mut buf = vec![0u8; MAX_SEGMENT_SIZE];
    loop {
        let (n, from) = match conn.recv_authenticated(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("datagram socket failed: {}", e);
                return;
            }
        };
        if let Err(e) = conn.send_to(&buf[..n], from).await {
            warn!(%from, "failed to echo datagram: {}", e);
        }
    }
}

async fn send_stream(server: SocketAddr, message: &str, config: &TransportConfig) -> Result<()> {
    let handshaker = Handshaker::from_config(Role::Client, config)?;
    let tcp = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    let mut conn = handshaker.handshake(tcp).await.context("handshake failed")?;
    info!(%server, "session established");

    conn.write_all(message.as_bytes()).await?;
    conn.flush().await?;

    let mut reply = vec![0u8; message.len()];
    tokio::time::timeout(config.handshake_timeout(), conn.read_exact(&mut reply))
        .await
        .context("timed out waiting for echo")??;
    println!("{}", String::from_utf8_lossy(&reply));

    conn.shutdown().await?;
    Ok(())
}

async fn send_datagram(
    server: SocketAddr,
    message: &str,
    config: &TransportConfig,
) -> Result<()> {
    let bind = if server.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let conn = DatagramConn::bind(bind, config.password_bytes(), config.crypto_method).await?;
    conn.send_to(message.as_bytes(), server).await?;

    let mut buf = vec![0u8; MAX_SEGMENT_SIZE];
    let reply = conn.recv_authenticated(&mut buf);
    let (n, from) = tokio::time::timeout(config.handshake_timeout(), reply)
        .await
        .context("timed out waiting for echo")??;
    debug!(%from, bytes = n, "datagram echoed");
    println!("{}", String::from_utf8_lossy(&buf[..n]));
    Ok(())
}
