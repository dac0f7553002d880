use super::{context, open_service, parse_uuid, MergeArgs};
use anyhow::Result;
use mdm_core::ReasonCode;
use mdm_link_server::config::MdmConfig;

pub fn run(args: MergeArgs, config: MdmConfig) -> Result<()> {
    let (service, _) = open_service(&config)?;
    let ctx = context(ReasonCode::ManualMerge, args.txn);
    let outcome = service.merge_golden_records(parse_uuid(&args.survivor)?, parse_uuid(&args.loser)?, &ctx)?;

    if outcome.already_merged {
        println!("{} was already merged into {}", outcome.loser, outcome.survivor);
        return Ok(());
    }

    let survivor = service.get_golden(outcome.survivor)?;
    println!(
        "Merged {} into {} (version {})",
        outcome.loser, outcome.survivor, survivor.version
    );
    println!("  links re-pointed: {}", outcome.repointed);
    println!("  links dropped:    {}", outcome.dropped);
    println!("  transaction:      {}", ctx.transaction_id);
    Ok(())
}
