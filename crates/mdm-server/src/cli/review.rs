use super::{context, open_service, parse_uuid, ReviewCommands, ReviewListArgs, ReviewResolveArgs};
use anyhow::Result;
use mdm_core::{LinkKey, ReasonCode, Resolution, ReviewDecision};
use mdm_link_server::config::MdmConfig;

pub fn run(cmd: ReviewCommands, config: MdmConfig) -> Result<()> {
    match cmd {
        ReviewCommands::List(args) => list(args, config),
        ReviewCommands::Resolve(args) => resolve(args, config),
    }
}

fn list(args: ReviewListArgs, config: MdmConfig) -> Result<()> {
    let (service, _) = open_service(&config)?;
    let mut items = service.queue().pending();
    items.truncate(args.limit);

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("(review queue is empty)");
        return Ok(());
    }
    println!(
        "{:<36}  {:<36}  {:<18}  {:<5}  {}",
        "GOLDEN", "TARGET", "OUTCOME", "SCORE", "QUEUED"
    );
    println!("{}", "─".repeat(120));
    for item in &items {
        let score = item
            .score
            .map(|s| format!("{:.3}", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<36}  {:<18}  {:<5}  {}",
            item.key.golden,
            item.key.target,
            item.outcome,
            score,
            item.enqueued_at.format("%Y-%m-%dT%H:%M:%SZ")
        );
    }
    println!();
    println!("{} of {} pending", items.len(), service.queue().len());
    Ok(())
}

fn resolve(args: ReviewResolveArgs, config: MdmConfig) -> Result<()> {
    let (service, _) = open_service(&config)?;
    let key = LinkKey::new(parse_uuid(&args.golden)?, parse_uuid(&args.target)?);
    let decision: ReviewDecision = args.decision.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let ctx = context(ReasonCode::ReviewDecision, args.txn);

    match service.resolve_review(key, decision, &ctx)? {
        Resolution::Linked(update) => println!(
            "{} now {} {} [{}]",
            key, update.link.outcome, update.link.source, ctx.transaction_id
        ),
        Resolution::Merged(merge) => println!(
            "Merged {} into {} ({} links re-pointed) [{}]",
            merge.loser, merge.survivor, merge.repointed, ctx.transaction_id
        ),
    }
    Ok(())
}
