// Command line front end for the client.
//
//   tftp get HOST REMOTE [LOCAL]     fetch REMOTE into LOCAL (defaults to REMOTE's file name)
//   tftp put HOST LOCAL [REMOTE]     store LOCAL as REMOTE (defaults to LOCAL's file name)
//
// Logging goes through env_logger, so RUST_LOG=debug shows the packet exchange.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tftp_client::tftp::TransferMode;
use tftp_client::{SessionConfig, TftpClient};

#[derive(Parser, Debug)]
#[command(name = "tftp", about = "Trivial File Transfer Protocol client")]
struct Cli {
    /// Server port requests are sent to
    #[arg(long, default_value_t = tftp_client::tftp::DEFAULT_PORT)]
    port: u16,

    /// Transfer mode: octet, netascii or mail
    #[arg(long, default_value = "octet")]
    mode: TransferMode,

    /// Block size to negotiate (8-65464)
    #[arg(long)]
    blksize: Option<u16>,

    /// Negotiate the transfer size
    #[arg(long)]
    tsize: bool,

    /// Send our timeout to the server with the timeout option
    #[arg(long)]
    negotiate_timeout: bool,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    /// Attempts per packet before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a file from the server
    Get {
        host: String,
        remote: String,
        local: Option<PathBuf>,
    },

    /// Upload a file to the server
    Put {
        host: String,
        local: PathBuf,
        remote: Option<String>,
    },
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mode: self.mode,
            block_size: self.blksize,
            negotiate_size: self.tsize,
            negotiate_timeout: self.negotiate_timeout,
            timeout: Duration::from_secs(self.timeout),
            max_attempts: self.retries,
            port: self.port,
        }
    }
}

/// Last path component of `name`, for when the other side of a transfer is not named.
fn file_name_of(name: &Path) -> Result<String> {
    name.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Cannot derive a file name from {}", name.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.session_config();
    config.validate()?;

    match cli.command {
        Command::Get { host, remote, local } => {
            let local = match local {
                Some(local) => local,
                None => PathBuf::from(file_name_of(Path::new(&remote))?),
            };
            let client = TftpClient::new(host.as_str(), config);
            let stats = client
                .download_file(&remote, &local)
                .await
                .with_context(|| format!("Downloading {remote} from {host}"))?;
            log::info!("Saved {} bytes to {}", stats.bytes, local.display());
        }
        Command::Put { host, local, remote } => {
            let remote = match remote {
                Some(remote) => remote,
                None => file_name_of(&local)?,
            };
            let client = TftpClient::new(host.as_str(), config);
            let stats = client
                .upload_file(&local, &remote)
                .await
                .with_context(|| format!("Uploading {} to {host}", local.display()))?;
            log::info!("Sent {} bytes as {remote}", stats.bytes);
        }
    }

    Ok(())
}
