use super::{context, open_service, IngestArgs};
use anyhow::{Context, Result};
use mdm_core::{Resource, ResourceRef, ResourceType};
use mdm_link_server::config::MdmConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use uuid::Uuid;

/// One line of the ingest file. The id is generated when absent.
#[derive(Debug, Deserialize)]
struct IngestRecord {
    id: Option<Uuid>,
    resource_type: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

impl IngestRecord {
    fn into_resource(self) -> Result<Resource> {
        let resource_type = ResourceType::new(&self.resource_type).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Resource {
            reference: ResourceRef::new(self.id.unwrap_or_else(Uuid::now_v7), resource_type),
            attributes: self.attributes,
        })
    }
}

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    new_golden: usize,
    matched: usize,
    possible: usize,
    duplicates: usize,
    pinned: usize,
    failed: usize,
}

pub fn run(args: IngestArgs, config: MdmConfig) -> Result<()> {
    let (service, repository) = open_service(&config)?;
    let ctx = context(config.ingest_reason()?, args.txn);

    let file = File::open(&args.path).with_context(|| format!("Failed to open {:?}", args.path))?;
    let mut tally = Tally::default();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let result = serde_json::from_str::<IngestRecord>(&line)
            .map_err(anyhow::Error::from)
            .and_then(IngestRecord::into_resource)
            .and_then(|resource| {
                repository.put(&resource)?;
                Ok(service.process_candidate(&resource, &ctx)?)
            });

        match result {
            Ok(outcome) => {
                tally.processed += 1;
                if outcome.manual_retained {
                    tally.pinned += 1;
                } else if outcome.created_golden.is_some() {
                    tally.new_golden += 1;
                } else if outcome.matched.is_some() {
                    tally.matched += 1;
                }
                tally.possible += outcome.possible_matches.len();
                tally.duplicates += outcome.possible_duplicates.len();
            }
            Err(e) if args.fail_fast => {
                return Err(e.context(format!("line {}", line_no)));
            }
            Err(e) => {
                tally.failed += 1;
                tracing::warn!("line {}: {:#}", line_no, e);
            }
        }
    }

    tracing::info!(
        "Ingest of {:?} finished [txn={}]",
        args.path,
        ctx.transaction_id
    );

    println!();
    println!("Ingest Summary");
    println!("{}", "─".repeat(50));
    println!("Processed:           {:>8}", tally.processed);
    println!("  new golden records {:>8}", tally.new_golden);
    println!("  matched existing   {:>8}", tally.matched);
    println!("  pinned by operator {:>8}", tally.pinned);
    println!("Possible matches:    {:>8}", tally.possible);
    println!("Possible duplicates: {:>8}", tally.duplicates);
    println!("Failed lines:        {:>8}", tally.failed);
    println!("Review queue:        {:>8}", service.queue().len());
    println!("Transaction:         {}", ctx.transaction_id);
    println!("{}", "─".repeat(50));
    println!();

    Ok(())
}
