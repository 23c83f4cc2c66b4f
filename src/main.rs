use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use pd_core::ids::DeviceId;
use peerdrop::bootstrap::{build_node, init_tracing_subscriber, load_config_or_default, log_events, resolve_paths};

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(version, about = "Peer-to-peer clipboard and file sync node", long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/peerdrop/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device node until Ctrl-C
    Run {
        /// Print a pairing code issued by this node; valid while it runs
        #[arg(long)]
        show_code: bool,

        /// Pair with another node using the code it printed
        #[arg(long, value_name = "CODE", requires = "issuer")]
        pair_code: Option<String>,

        /// Device id of the node that printed the code
        #[arg(long, value_name = "DEVICE_ID")]
        issuer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config_or_default(cli.config.as_deref())?;
    let paths = resolve_paths(&config)?;

    match cli.command {
        Commands::Run {
            show_code,
            pair_code,
            issuer,
        } => {
            init_tracing_subscriber(Some(&paths.data_dir.join("logs")))?;
            info!(version = env!("CARGO_PKG_VERSION"), "starting peerdrop node");

            let mut node = build_node(&config)?;
            node.start().await?;

            if show_code {
                let code = node.app.pairing.issue_code().await.context("failed to issue pairing code")?;
                println!("{}", code.code);
                println!(
                    "device {} ({}), expires {}",
                    node.app.device().device_name,
                    node.app.device().device_id,
                    code.expires_at.to_rfc3339()
                );
            }
            if let (Some(code), Some(issuer)) = (pair_code, issuer) {
                node.app
                    .pairing
                    .pair_with_code_from(&DeviceId::new(issuer), &code)
                    .await
                    .context("failed to send pairing code")?;
            }

            let events = log_events(&node.app);
            let clipboard = &mut node.clipboard;
            let clipboard_task = async move {
                while let Some(content) = clipboard.recv().await {
                    info!(
                        from = %content.from,
                        size = content.data.len(),
                        mime = %content.meta.mime_type,
                        "clipboard content received"
                    );
                }
            };

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        error!(error = %err, "failed to listen for Ctrl-C");
                    }
                }
                _ = events => {}
                _ = clipboard_task => {}
            }

            info!("shutting down");
            node.shutdown().await;
        }
    }

    Ok(())
}
