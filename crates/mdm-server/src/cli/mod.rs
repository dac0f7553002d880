pub mod audit;
pub mod config_cmd;
pub mod ingest;
pub mod links;
pub mod merge;
pub mod review;
pub mod stats;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mdm_core::{Link, LinkService, ReasonCode, RedbStorage, TransactionContext};
use mdm_link_server::config::MdmConfig;
use mdm_link_server::resources::RedbRepository;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub type Service = LinkService<RedbStorage, RedbRepository>;

#[derive(Parser, Debug)]
#[command(name = "mdm")]
#[command(version, about = "Golden-record linking: ingest, review and merge master data")]
pub struct Cli {
    /// Path to mdm.toml
    #[arg(long, global = true, env = "MDM_CONFIG", default_value = "mdm.toml")]
    pub config: PathBuf,

    /// Path to data directory (overrides config file)
    #[arg(long, global = true, env = "MDM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Score and link every resource in a JSON-lines file
    Ingest(IngestArgs),
    /// Query links
    #[command(subcommand)]
    Links(LinksCommands),
    /// Record an operator link decision
    Link(LinkArgs),
    /// Delete a link
    Unlink(UnlinkArgs),
    /// Merge one golden record into another
    Merge(MergeArgs),
    /// Review queue operations
    #[command(subcommand)]
    Review(ReviewCommands),
    /// Query the audit log
    Audit(AuditArgs),
    /// Link graph statistics
    Stats,
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// JSON-lines file, one resource per line
    pub path: PathBuf,
    /// Transaction id recorded for every mutation (generated if omitted)
    #[arg(long)]
    pub txn: Option<String>,
    /// Stop at the first failing line instead of reporting and continuing
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(Subcommand, Debug)]
pub enum LinksCommands {
    /// Every link a golden record owns
    Golden(GoldenLinksArgs),
    /// Every link pointing at a target resource
    Target(TargetLinksArgs),
    /// Links filtered by outcome
    List(LinkListArgs),
}

#[derive(Args, Debug)]
pub struct GoldenLinksArgs {
    pub id: String,
    /// Output format: table (default) | json
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct TargetLinksArgs {
    pub id: String,
    /// Output format: table (default) | json
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct LinkListArgs {
    /// match | possible_match | no_match | possible_duplicate
    #[arg(long)]
    pub outcome: Option<String>,
    #[arg(long, default_value = "50")]
    pub limit: usize,
    /// Output format: table (default) | json
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Golden record id
    pub golden: String,
    /// Target resource id
    pub target: String,
    /// match | possible_match | no_match
    #[arg(long, default_value = "match")]
    pub outcome: String,
    #[arg(long)]
    pub txn: Option<String>,
}

#[derive(Args, Debug)]
pub struct UnlinkArgs {
    pub golden: String,
    pub target: String,
    #[arg(long)]
    pub txn: Option<String>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Golden record that absorbs the other
    pub survivor: String,
    /// Golden record merged away
    pub loser: String,
    #[arg(long)]
    pub txn: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ReviewCommands {
    /// Pending review items, oldest first
    List(ReviewListArgs),
    /// Decide a pending item
    Resolve(ReviewResolveArgs),
}

#[derive(Args, Debug)]
pub struct ReviewListArgs {
    #[arg(long, default_value = "50")]
    pub limit: usize,
    /// Output format: table (default) | json
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct ReviewResolveArgs {
    pub golden: String,
    pub target: String,
    /// match | no_match (merge | not_duplicate for duplicate suspicions)
    pub decision: String,
    #[arg(long)]
    pub txn: Option<String>,
}

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Only entries newer than this, e.g. "24h", "7d", "1h30m"
    #[arg(long)]
    pub since: Option<String>,
    #[arg(long)]
    pub golden: Option<String>,
    #[arg(long)]
    pub target: Option<String>,
    #[arg(long)]
    pub txn: Option<String>,
    #[arg(long, default_value = "50")]
    pub limit: usize,
    /// Output format: table (default) | json
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    Validate,
    Show,
}

// --- Service helpers ---

/// Open the link service and resource store described by `config`
pub fn open_service(config: &MdmConfig) -> Result<(Service, Arc<RedbRepository>)> {
    config.ensure_data_dir()?;
    let repository = Arc::new(
        RedbRepository::open(config.resources_path())
            .with_context(|| format!("Failed to open {:?}", config.resources_path()))?,
    );
    let service = LinkService::open(config.db_path(), repository.clone(), config.linking.clone())
        .with_context(|| format!("Failed to open {:?}", config.db_path()))?;
    Ok((service, repository))
}

pub fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| anyhow::anyhow!("Invalid UUID: {}", s))
}

pub fn context(reason: ReasonCode, txn: Option<String>) -> TransactionContext {
    match txn {
        Some(id) => TransactionContext::new(id, reason),
        None => TransactionContext::generate(reason),
    }
}

// --- Table printing helpers ---

pub fn print_link_table(links: &[Link]) {
    if links.is_empty() {
        println!("(no links)");
        return;
    }
    println!(
        "{:<36}  {:<36}  {:<18}  {:<6}  {:<5}",
        "GOLDEN", "TARGET", "OUTCOME", "SOURCE", "SCORE"
    );
    println!("{}", "─".repeat(110));
    for l in links {
        let score = l
            .score
            .map(|s| format!("{:.3}", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<36}  {:<18}  {:<6}  {:<5}",
            l.golden, l.target.id, l.outcome, l.source, score
        );
    }
}

pub fn print_links(links: &[Link], format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(links)?),
        _ => print_link_table(links),
    }
    Ok(())
}
