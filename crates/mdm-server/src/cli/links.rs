use super::{
    context, open_service, parse_uuid, print_links, LinkArgs, LinkListArgs, LinksCommands,
    UnlinkArgs,
};
use anyhow::Result;
use mdm_core::{LinkFilter, LinkSource, MatchOutcome, ReasonCode, ResourceRef};
use mdm_link_server::config::MdmConfig;

pub fn run(cmd: LinksCommands, config: MdmConfig) -> Result<()> {
    let (service, _) = open_service(&config)?;
    match cmd {
        LinksCommands::Golden(args) => {
            let links = service.links_for_golden(parse_uuid(&args.id)?)?;
            print_links(&links, &args.format)
        }
        LinksCommands::Target(args) => {
            let links = service.links_for_target(parse_uuid(&args.id)?)?;
            print_links(&links, &args.format)
        }
        LinksCommands::List(args) => list(&service, args),
    }
}

fn list(service: &super::Service, args: LinkListArgs) -> Result<()> {
    let mut filter = LinkFilter::new().with_limit(args.limit);
    if let Some(ref outcome) = args.outcome {
        let outcome: MatchOutcome = outcome.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        filter = filter.with_outcomes(vec![outcome]);
    }
    let links = service.store().list_links(filter)?;
    print_links(&links, &args.format)
}

/// `mdm link`: an operator decision, recorded as MANUAL
pub fn link(args: LinkArgs, config: MdmConfig) -> Result<()> {
    let (service, _) = open_service(&config)?;
    let golden = service.get_golden(parse_uuid(&args.golden)?)?;
    let outcome: MatchOutcome = args.outcome.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    if outcome == MatchOutcome::PossibleDuplicate {
        anyhow::bail!("Duplicate suspicions are raised by scoring; use `mdm merge` or `mdm review resolve`");
    }

    // Targets always share the golden record's type
    let target = ResourceRef::new(parse_uuid(&args.target)?, golden.resource_type.clone());
    let ctx = context(ReasonCode::ManualLink, args.txn);
    let update = service.update_link(golden.id, &target, outcome, LinkSource::Manual, None, &ctx)?;

    println!(
        "{} {} -> {} [{}]",
        update.link.outcome, update.link.golden, update.link.target, ctx.transaction_id
    );
    for retracted in &update.retracted {
        println!("  retracted MATCH to {}", retracted.golden);
    }
    Ok(())
}

/// `mdm unlink`
pub fn unlink(args: UnlinkArgs, config: MdmConfig) -> Result<()> {
    let (service, _) = open_service(&config)?;
    let ctx = context(ReasonCode::ManualUnlink, args.txn);
    let removed = service.delete_link(parse_uuid(&args.golden)?, parse_uuid(&args.target)?, &ctx)?;
    println!(
        "Deleted {} link {} [{}]",
        removed.outcome,
        removed.key(),
        ctx.transaction_id
    );
    Ok(())
}
