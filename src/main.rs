use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::FmtSubscriber;

use godiode::auth::AuthKey;
use godiode::config::{Config, DEFAULT_CONF_PATH};
use godiode::transfer::{Receiver, ReceiverOptions, Sender, SenderOptions};

#[derive(Parser)]
#[command(name = "godiode", version, about = "One-way multicast file-tree transfer")]
struct Cli {
    /// JSON config file
    #[arg(long, default_value = DEFAULT_CONF_PATH)]
    conf: PathBuf,

    /// Maximum UDP payload size
    #[arg(long)]
    packetsize: Option<usize>,

    /// HMAC secret
    #[arg(long)]
    secret: Option<String>,

    /// Throttle to N Mbit/s, 0 = unthrottled (sender only)
    #[arg(long)]
    bw: Option<u32>,

    /// Multicast group host:port
    #[arg(long)]
    maddr: Option<String>,

    /// Bind address (sender only)
    #[arg(long)]
    baddr: Option<String>,

    /// IPv4 address of the interface to join on
    #[arg(long = "interface")]
    interface: Option<String>,

    /// Number of transmission rounds (sender only)
    #[arg(long)]
    resend_count: Option<u32>,

    /// Re-broadcast the manifest between files (sender only)
    #[arg(long)]
    resend_manifest: bool,

    /// Delete files absent from the manifest (receiver only)
    #[arg(long)]
    delete: bool,

    /// Verbose output
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Broadcast a directory tree or a single file
    Send { dir: PathBuf },
    /// Receive into a directory
    Receive { dir: PathBuf },
}

fn merge(cli: &Cli) -> Result<Config> {
    let mut config = match Config::load(&cli.conf) {
        Ok(config) => config,
        Err(e) => {
            // the built-in default path may simply not exist
            let default_missing = cli.conf.as_os_str() == DEFAULT_CONF_PATH
                && e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
            if default_missing {
                Config::default()
            } else {
                return Err(e);
            }
        }
    };

    if let Some(size) = cli.packetsize {
        config.max_packet_size = size;
    }
    if let Some(secret) = &cli.secret {
        config.hmac_secret = secret.clone();
    }
    if let Some(bw) = cli.bw {
        config.sender.bw = bw;
    }
    if let Some(maddr) = &cli.maddr {
        config.multicast_addr = maddr.clone();
    }
    if let Some(baddr) = &cli.baddr {
        config.bind_addr = baddr.clone();
    }
    if let Some(interface) = &cli.interface {
        config.nic = interface.clone();
    }
    if let Some(count) = cli.resend_count {
        config.sender.resend_count = count;
    }
    if cli.resend_manifest {
        config.sender.resend_manifest = true;
    }
    if cli.delete {
        config.receiver.delete = true;
    }
    if cli.verbose {
        config.verbose = true;
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = merge(&cli)?;

    let level = if config.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if config.hmac_secret.is_empty() {
        warn!("HMAC secret not set");
    }
    let key = AuthKey::derive(&config.hmac_secret);

    match cli.mode {
        Mode::Send { dir } => {
            let opts = SenderOptions {
                max_packet_size: config.max_packet_size,
                bw: config.sender.bw,
                resend_count: config.sender.resend_count,
                resend_manifest: config.sender.resend_manifest,
                chunk_delay: Duration::from_millis(config.sender.chunk_delay_ms),
                file_delay: Duration::from_millis(config.sender.file_delay_ms),
            };
            let mut sender =
                Sender::connect(&config.multicast_addr, &config.bind_addr, opts, key).await?;
            sender.run(&dir).await
        }
        Mode::Receive { dir } => {
            let meta = std::fs::metadata(&dir)
                .with_context(|| format!("failed to stat receive dir {}", dir.display()))?;
            if !meta.is_dir() {
                bail!("{} is not a directory", dir.display());
            }
            let tmp_dir = config
                .receiver
                .tmp_dir
                .clone()
                .unwrap_or_else(|| dir.join(".tmp"));
            let opts = ReceiverOptions {
                root: dir,
                tmp_dir,
                delete: config.receiver.delete,
                file_permission: config.receiver.file_permission,
                folder_permission: config.receiver.folder_permission,
                max_packet_size: config.max_packet_size,
            };
            Receiver::run(opts, key, &config.multicast_addr, &config.nic).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help and version are not errors
            if e.use_stderr() {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
