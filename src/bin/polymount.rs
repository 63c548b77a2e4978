//! Command-line front-end: mount declared sources, sync, and list.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use polymount::config;
use polymount::provider::ProviderRegistry;
use polymount::repo::Repository;
use polymount::service::{VfsService, WalkQuery};
use polymount::syncer::{SyncEvent, Syncer};

#[derive(Parser)]
#[command(name = "polymount", about = "Virtual filesystem service over mounted content sources")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = "polymount.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount every configured source and run a full sync on each.
    Sync,
    /// List the children of a node, or the root level when omitted.
    Ls {
        parent: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> polymount::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let repo = Arc::new(Repository::open(&cfg.database)?);
    let registry = Arc::new(ProviderRegistry::with_builtins());
    let service = VfsService::new(repo.clone(), registry.clone());

    match cli.command {
        Command::Sync => {
            for entry in &cfg.mounts {
                let mount = match &entry.id {
                    Some(id) => service.mount_internal(id.clone(), entry.spec.clone())?,
                    None => service.mount(entry.spec.clone())?,
                };
                let adapter = registry.get(&mount.config)?;
                let syncer =
                    Arc::new(Syncer::new(mount.config.clone(), adapter, repo.clone(), &cfg.content_root));
                syncer.subscribe(|event| {
                    if let SyncEvent::DownloadProgress { source_ref, downloaded_bytes, total_size, .. } =
                        event
                    {
                        tracing::debug!(%source_ref, downloaded_bytes, ?total_size, "downloading");
                    }
                });
                syncer.full_sync().await?;
                println!("synced {}", mount.config.mount_id);
            }
        }
        Command::Ls { parent, limit } => {
            let page = service
                .walk_children(WalkQuery { parent_node_id: parent, limit, cursor: None })
                .await?;
            for node in &page.items {
                println!("{}\t{}\t{}", node.node_id, node.kind.as_str(), node.name);
            }
            if let Some(cursor) = page.next_cursor {
                println!("next: {cursor}");
            }
        }
    }
    Ok(())
}
