use super::open_service;
use anyhow::Result;
use mdm_core::MatchOutcome;
use mdm_link_server::config::MdmConfig;

pub fn run(config: MdmConfig) -> Result<()> {
    let (service, repository) = open_service(&config)?;
    let stats = service.stats()?;
    let db_mb = stats.db_size_bytes as f64 / 1_048_576.0;

    println!();
    println!("Link Graph Overview");
    println!("{}", "─".repeat(50));
    println!("Resources:       {:>8}", repository.len()?);
    println!("Golden records:  {:>8}", stats.golden_count);
    println!("  merged away    {:>8}", stats.merged_golden_count);
    println!("Links:           {:>8}", stats.link_count);
    for outcome in MatchOutcome::all() {
        let count = stats.link_counts_by_outcome.get(&outcome).copied().unwrap_or(0);
        println!("  {:18} {:>8}", outcome, count);
    }
    println!("Review queue:    {:>8}", service.queue().len());
    println!("DB Size: {:>7.1} MB", db_mb);
    println!("{}", "─".repeat(50));
    println!();

    Ok(())
}
