//! TFS CLI - store and fetch files from the command line

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tfs_client::{Fd, TcpConnector, TfsClient};
use tfs_common::{ClientConfig, OpenFlags, OptionFlag, StatMode, UnlinkAction, UnlinkType};
use tracing::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tfs-cli")]
#[command(about = "TFS command line client")]
#[command(version)]
struct Args {
    /// Name server address (overrides the config file)
    #[arg(short, long, env = "TFS_NS_ADDR")]
    ns: Option<String>,

    /// Client configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a local file (or stdin) and print its TFS name
    Put {
        /// Local file; stdin when omitted
        path: Option<PathBuf>,
        /// Suffix recorded in the name, e.g. ".jpg"
        #[arg(short, long, default_value = "")]
        suffix: String,
        /// Store as a segmented large file
        #[arg(long)]
        large: bool,
        /// Checkpoint file for resuming an interrupted large upload
        #[arg(long, requires = "large")]
        checkpoint: Option<PathBuf>,
    },
    /// Fetch a file to a local path (or stdout)
    Get {
        name: String,
        #[arg(short, long, default_value = "")]
        suffix: String,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Read deleted or concealed files too
        #[arg(long)]
        force: bool,
    },
    /// Show file metadata as JSON
    Stat {
        name: String,
        #[arg(short, long, default_value = "")]
        suffix: String,
        #[arg(long)]
        force: bool,
    },
    /// Change a file's state
    Rm {
        name: String,
        #[arg(short, long, default_value = "")]
        suffix: String,
        #[arg(short, long, value_enum, default_value_t = Action::Delete)]
        action: Action,
        /// Apply regardless of the current state
        #[arg(long = "override")]
        override_state: bool,
    },
    /// Show the cluster identity and client statistics
    Info,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Action {
    Delete,
    Undelete,
    Conceal,
    Reveal,
}

impl From<Action> for UnlinkAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Delete => Self::Delete,
            Action::Undelete => Self::Undelete,
            Action::Conceal => Self::Conceal,
            Action::Reveal => Self::Reveal,
        }
    }
}

fn is_large_name(name: &str) -> bool {
    name.starts_with('L')
}

async fn put(
    client: &TfsClient,
    data: &[u8],
    suffix: &str,
    large: bool,
    checkpoint: Option<PathBuf>,
) -> Result<String> {
    let mut flags = OpenFlags::CREATE | OpenFlags::WRITE;
    if large {
        flags |= OpenFlags::LARGE;
    }
    let fd = client.open("", suffix, flags, checkpoint.as_deref()).await?;
    if let Err(e) = client.write(fd, data).await {
        let _ = client
            .set_option_flag(fd, OptionFlag::CloseFlagWriteDataFailed)
            .await;
        let _ = client.close(fd).await;
        return Err(e).context("write failed");
    }
    let name = client.close(fd).await?;
    debug!(name = %name, bytes = data.len(), "stored");
    Ok(name)
}

async fn read_to_end(client: &TfsClient, fd: Fd) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = client.read(fd, &mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn read_flags(name: &str, base: OpenFlags, force: bool) -> OpenFlags {
    let mut flags = base;
    if is_large_name(name) {
        flags |= OpenFlags::LARGE;
    }
    if force {
        flags |= OpenFlags::FORCE;
    }
    flags
}

async fn run(client: &TfsClient, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            path,
            suffix,
            large,
            checkpoint,
        } => {
            let data = match &path {
                Some(path) => tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut data = Vec::new();
                    tokio::io::stdin().read_to_end(&mut data).await?;
                    data
                }
            };
            let name = put(client, &data, &suffix, large, checkpoint).await?;
            println!("{name}{suffix}");
        }
        Commands::Get {
            name,
            suffix,
            output,
            force,
        } => {
            let fd = client
                .open(&name, &suffix, read_flags(&name, OpenFlags::READ, force), None)
                .await?;
            let data = read_to_end(client, fd).await;
            client.close(fd).await?;
            let data = data?;
            match output {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Stat {
            name,
            suffix,
            force,
        } => {
            let fd = client
                .open(&name, &suffix, read_flags(&name, OpenFlags::STAT, force), None)
                .await?;
            let stat = client.fstat(fd, StatMode::Force).await;
            client.close(fd).await?;
            println!("{}", serde_json::to_string_pretty(&stat?)?);
        }
        Commands::Rm {
            name,
            suffix,
            action,
            override_state,
        } => {
            let mut unlink = UnlinkType::new(action.into());
            if override_state {
                unlink = unlink.with_override();
            }
            let size = client.unlink(&name, &suffix, unlink).await?;
            println!("{name}: {action:?} ({size} bytes)");
        }
        Commands::Info => {
            println!("Cluster");
            println!("=======");
            println!("Name server: {}", client.default_server());
            println!("Cluster id:  {}", client.cluster_id().await?);
            println!("Server id:   {:#x}", client.server_id().await?);
            println!("Client id:   {}", client.client_id());
            println!();
            println!("{}", serde_json::to_string_pretty(&client.stats().snapshot())?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(ns) = args.ns {
        config.ns_addr = ns;
    }
    if config.ns_addr.is_empty() {
        bail!("no name server address; pass --ns or set TFS_NS_ADDR");
    }
    // One-shot process: no background maintenance
    config.start_background = false;

    let client = TfsClient::initialize(config, Arc::new(TcpConnector))
        .await
        .context("connecting to the name server")?;
    let result = run(&client, args.command).await;
    client.destroy().await?;
    result
}
