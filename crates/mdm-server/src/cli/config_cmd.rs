use crate::cli::ConfigCommands;
use anyhow::{Context, Result};
use mdm_link_server::config::MdmConfig;
use std::path::{Path, PathBuf};

/// `mdm config validate|show`
pub fn run(cmd: ConfigCommands, config_path: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    match cmd {
        ConfigCommands::Validate => validate(config_path),
        ConfigCommands::Show => show(config_path, data_dir),
    }
}

fn validate(config_path: &Path) -> Result<()> {
    let config = MdmConfig::load(config_path)?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("{}: {}", config_path.display(), problem);
        }
        anyhow::bail!("{} problem(s) in {}", problems.len(), config_path.display());
    }

    let linking = &config.linking;
    println!(
        "{}: ok ({} match rules, no_match < {:.2} <= possible < {:.2} <= match, blocking on {})",
        config_path.display(),
        linking.matching.rules.len(),
        linking.matching.no_match_threshold,
        linking.matching.match_threshold,
        linking.candidates.blocking_attributes.join(", ")
    );
    Ok(())
}

/// Print the configuration commands will run with, overrides applied
fn show(config_path: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    let source = if config_path.exists() {
        config_path.display().to_string()
    } else {
        "built-in defaults".to_string()
    };
    let config = MdmConfig::load_or_default(config_path)?.with_data_dir(data_dir);

    println!("# effective configuration from {}", source);
    println!("# link database:  {}", config.db_path().display());
    println!("# resource store: {}", config.resources_path().display());
    print!(
        "{}",
        toml::to_string_pretty(&config).context("Failed to render configuration as TOML")?
    );
    Ok(())
}
