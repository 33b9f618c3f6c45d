//! noet-slugs CLI tool
//!
//! Inspect and repair the slugs and generation queue stored in a SQLite database.
//!
//! ## Commands
//!
//! - `queue list|retry|delete|reap`: inspect and manage generation queue entries
//! - `slugs <node>`: show the slugs of a node
//! - `resolve <url> --site <site>`: find the node (or redirect) a URL belongs to

use clap::{Parser, Subcommand};
use noet_slugs::{
    config::TomlConfigProvider,
    db::{DbConnection, SLUG_DB},
    paths::{normalize_slug, SlugFormat},
    properties::{NodeId, CULTURE_INVARIANT},
    queue::decode_payload,
    store::{QueueStore, SlugStore},
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "noet-slugs")]
#[command(author, version, about = "Inspect slugs and the slug generation queue", long_about = None)]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true, default_value = SLUG_DB)]
    db: PathBuf,

    /// Slug configuration file, used to normalize URLs
    #[arg(long, global = true, default_value = "noet-slugs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage generation queue entries
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show every slug of a node
    Slugs {
        /// Node id
        node: NodeId,
    },

    /// Find the node a URL resolves to
    Resolve {
        url: String,

        #[arg(short, long)]
        site: String,

        /// Preferred culture when several nodes share the URL
        #[arg(short, long, default_value = CULTURE_INVARIANT)]
        culture: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List all entries, oldest first
    List {
        /// Also print the root node of each payload
        #[arg(short, long)]
        verbose: bool,
    },
    /// Clear the error of an entry so it is picked up again
    Retry { id: i64 },
    /// Delete an entry
    Delete { id: i64 },
    /// Release every running entry of a process whose worker is gone
    Reap {
        #[arg(short, long)]
        process: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let db = DbConnection::open(cli.db).await?;
    match cli.command {
        Commands::Queue { action } => run_queue(&db, action).await,
        Commands::Slugs { node } => {
            let records = db.slugs_for_node(node).await?;
            if records.is_empty() {
                println!("Node {node} has no slugs");
            }
            for record in records {
                println!(
                    "{}\t{}\t{}{}",
                    record.site,
                    display_culture(&record.culture),
                    record.slug,
                    if record.is_custom { "\t(custom)" } else { "" }
                );
            }
            Ok(())
        }
        Commands::Resolve { url, site, culture } => {
            let site_config = TomlConfigProvider::new(cli.config)
                .get_config()?
                .site(&site);
            let url = normalize_slug(&url, &SlugFormat::from(&site_config));
            let records = db.find_slug(&site, &url).await?;
            let hit = records
                .iter()
                .find(|r| r.culture == culture)
                .or_else(|| records.first());
            match hit {
                Some(record) => println!(
                    "{url} -> node {} ({})",
                    record.node_id,
                    display_culture(&record.culture)
                ),
                None => match db.find_alternate_url(&site, &url).await? {
                    Some(alternate) => println!(
                        "{url} -> redirect to node {} ({})",
                        alternate.node_id,
                        display_culture(&alternate.culture)
                    ),
                    None => println!("{url} does not resolve on '{site}'"),
                },
            }
            Ok(())
        }
    }
}

async fn run_queue(
    db: &DbConnection,
    action: QueueAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        QueueAction::List { verbose } => {
            let entries = db.list_entries().await?;
            if entries.is_empty() {
                println!("Queue is empty");
            }
            for entry in entries {
                let owner = entry
                    .owner
                    .as_ref()
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.id,
                    entry.state(),
                    owner,
                    entry.error.as_deref().unwrap_or("")
                );
                if verbose {
                    match decode_payload(&entry) {
                        Ok(item) => println!(
                            "\tsite '{}', subtree below node {}",
                            item.settings.site, item.node_id
                        ),
                        Err(e) => println!("\tunreadable payload: {e}"),
                    }
                }
            }
        }
        QueueAction::Retry { id } => {
            if db.retry_entry(id).await? {
                println!("Entry {id} is pending again");
            } else {
                println!("Entry {id} does not exist or is running");
            }
        }
        QueueAction::Delete { id } => {
            if db.delete_entry(id).await? {
                println!("Deleted entry {id}");
            } else {
                println!("Entry {id} does not exist");
            }
        }
        QueueAction::Reap { process } => {
            let reaped = db.reap_stuck(&process, None).await?;
            println!("Released {reaped} entries of '{process}'");
        }
    }
    Ok(())
}

fn display_culture(culture: &str) -> &str {
    if culture == CULTURE_INVARIANT {
        "*"
    } else {
        culture
    }
}
