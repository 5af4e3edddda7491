// This is an implementation of a TFTP client compliant with RFC 1350
//
// A transfer begins with a request to read (RRQ) or write (WRQ) a file, sent to port 69 on the
// server. The server answers from a port of its own choosing, its transfer identifier (TID), and
// every later packet of the transfer goes to that port.
//
// For a read, the server answers with DATA #1. For a write, it answers with ACK #0 and the client
// sends DATA #1. From then on the peers alternate: each DATA block of up to 512 bytes must be
// acknowledged before the next one is sent. Block numbers are 16 bits and wrap.
//
// A DATA packet shorter than 512 bytes ends the transfer. A file whose length is a multiple of 512
// ends with an empty DATA packet.
//
// Packets:
//
// RRQ/WRQ:  0x01/0x02 | Filename | 0x00 | Mode | 0x00
// DATA:     0x03 | Block # (2 bytes) | Data (0-512 bytes)
// ACK:      0x04 | Block # (2 bytes)
// ERROR:    0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// An ERROR packet terminates the transfer. It is a courtesy: never acknowledged or retransmitted,
// which is why timeouts are needed to notice failures too.
//
// The only error that does not end a transfer is a packet from the wrong TID. It is answered with
// an Unknown TID error and otherwise ignored.

pub mod retry;
pub mod session;
pub mod tftp;
pub mod transfer;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use retry::RetryPolicy;
use session::{ClientConfig, Session};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tftp::FileMode;
use tokio::fs::File;

#[derive(Parser, Debug)]
#[command(name = "tftpc")]
#[command(about = "Trivial File Transfer Protocol client", long_about = None)]
struct Cli {
    /// Server host name or IP address
    host: String,

    /// Whether to download (get) or upload (put) the file
    #[arg(value_enum)]
    operation: Operation,

    /// Name of the file on the server
    filename: String,

    /// Server port
    #[arg(short, long, default_value_t = tftp::DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait for each response
    #[arg(short, long, default_value_t = 5, value_name = "SECS")]
    timeout: u64,

    /// Times to resend the last packet after a timeout before giving up
    #[arg(short, long, default_value_t = 0, value_name = "N")]
    retries: u32,

    /// Transfer mode named in the request (netascii, octet or mail)
    #[arg(short, long, default_value = "octet")]
    mode: FileMode,

    /// Local file to read from or write to [default: FILENAME]
    #[arg(short, long, value_name = "PATH")]
    local: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Operation {
    Get,
    Put,
}

impl Cli {
    fn config(&self, server: SocketAddr) -> ClientConfig {
        ClientConfig {
            server,
            mode: self.mode,
            retry: RetryPolicy::with_retransmits(Duration::from_secs(self.timeout), self.retries),
        }
    }

    fn local_path(&self) -> PathBuf {
        self.local.clone().unwrap_or_else(|| PathBuf::from(&self.filename))
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve '{}'", host))?
        .next()
        .with_context(|| format!("No address found for '{}'", host))
}

/// Downloads `remote` into `local`. A failed download leaves no file behind.
async fn get(config: &ClientConfig, remote: &str, local: &Path) -> Result<()> {
    println!("Initiating GET request for '{}' from {}...", remote, config.server);

    let session = Session::connect(config).context("Failed to open a UDP socket")?;
    let mut file = File::create(local)
        .await
        .with_context(|| format!("Failed to create '{}'", local.display()))?;
    let result = session.download(remote, config.mode.as_str(), &mut file).await;
    drop(file);

    match result {
        Ok(summary) => {
            println!("Download successful: {} bytes in {} blocks.", summary.bytes, summary.blocks);
            Ok(())
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(local).await {
                log::warn!("Couldn't remove partial file {}: {}", local.display(), rm);
            }
            Err(e).context("Download failed")
        }
    }
}

/// Uploads `local` to the server as `remote`.
async fn put(config: &ClientConfig, remote: &str, local: &Path) -> Result<()> {
    let mut file = File::open(local)
        .await
        .with_context(|| format!("File '{}' does not exist or cannot be read", local.display()))?;

    println!("Initiating PUT request for '{}' to {}...", remote, config.server);
    let session = Session::connect(config).context("Failed to open a UDP socket")?;
    let summary = session
        .upload(remote, config.mode.as_str(), &mut file)
        .await
        .context("Upload failed")?;

    println!("Upload successful: {} bytes in {} blocks.", summary.bytes, summary.blocks);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let server = resolve(&cli.host, cli.port).await?;
    let config = cli.config(server);
    let local = cli.local_path();

    match cli.operation {
        Operation::Get => get(&config, &cli.filename, &local).await,
        Operation::Put => put(&config, &cli.filename, &local).await,
    }
}
