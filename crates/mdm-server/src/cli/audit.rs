use super::{open_service, parse_uuid, AuditArgs};
use anyhow::Result;
use chrono::{Duration, Utc};
use mdm_core::AuditFilter;
use mdm_link_server::config::MdmConfig;

pub fn run(args: AuditArgs, config: MdmConfig) -> Result<()> {
    if !config.db_path().exists() {
        anyhow::bail!(
            "Database not found at {:?}. Run `mdm ingest` first.",
            config.db_path()
        );
    }
    let (service, _) = open_service(&config)?;

    let filter = AuditFilter {
        since: args.since.as_deref().map(parse_since).transpose()?,
        golden_id: args.golden.as_deref().map(parse_uuid).transpose()?,
        target_id: args.target.as_deref().map(parse_uuid).transpose()?,
        transaction_id: args.txn.clone(),
        action: None,
        limit: Some(args.limit),
    };

    let entries = service.audit().query(filter)?;

    if entries.is_empty() {
        println!("(no audit entries found)");
        return Ok(());
    }

    match args.format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!(
                "{:<20}  {:<16}  {:<36}  {:<16}  {}",
                "TIME", "ACTION", "GOLDEN", "REASON", "TRANSACTION"
            );
            println!("{}", "─".repeat(120));
            for entry in &entries {
                println!(
                    "{:<20}  {:<16}  {:<36}  {:<16}  {}",
                    entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                    entry.action.to_string(),
                    entry.golden_id,
                    entry.reason.to_string(),
                    entry.transaction_id,
                );
                if let Some(target) = entry.target_id {
                    println!("  target {}", target);
                }
                if let Some(ref details) = entry.details {
                    println!("  → {}", details);
                }
            }
            println!();
            println!("{} entries", entries.len());
        }
    }

    Ok(())
}

/// Parse a relative age like "24h", "7d", "1h30m" into the UTC timestamp that long ago.
fn parse_since(s: &str) -> Result<chrono::DateTime<Utc>> {
    let s = s.trim();
    let mut remaining = s;
    let mut total_seconds: i64 = 0;

    while !remaining.is_empty() {
        let split_at = remaining.find(|c: char| c.is_alphabetic()).ok_or_else(|| {
            anyhow::anyhow!("Cannot parse duration '{}': expected format like '24h', '7d', '1h30m'", s)
        })?;

        let num: i64 = remaining[..split_at]
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid number in duration '{}'", s))?;

        let rest = &remaining[split_at..];
        let unit_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let secs = match &rest[..unit_end] {
            "s" => num,
            "m" => num * 60,
            "h" => num * 3600,
            "d" => num * 86400,
            "w" => num * 7 * 86400,
            unit => anyhow::bail!("Unknown time unit '{}' in duration '{}'", unit, s),
        };
        total_seconds += secs;
        remaining = &rest[unit_end..];
    }

    Ok(Utc::now() - Duration::seconds(total_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_since() {
        let now = Utc::now();
        let t = parse_since("1h30m").unwrap();
        let age = (now - t).num_seconds();
        assert!((5399..=5401).contains(&age));

        assert!(parse_since("10x").is_err());
        assert!(parse_since("h").is_err());
    }
}
