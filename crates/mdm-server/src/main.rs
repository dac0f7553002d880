mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use mdm_link_server::config::MdmConfig;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    // Config commands report on the file itself, so they skip the validation below
    let command = match args.command {
        Commands::Config(cmd) => return cli::config_cmd::run(cmd, &args.config, args.data_dir),
        command => command,
    };

    let config = MdmConfig::load_or_default(&args.config)?.with_data_dir(args.data_dir);
    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
    }
    tracing::debug!("Data: {:?}", config.data_dir);

    match command {
        Commands::Ingest(args) => cli::ingest::run(args, config),
        Commands::Links(cmd) => cli::links::run(cmd, config),
        Commands::Link(args) => cli::links::link(args, config),
        Commands::Unlink(args) => cli::links::unlink(args, config),
        Commands::Merge(args) => cli::merge::run(args, config),
        Commands::Review(cmd) => cli::review::run(cmd, config),
        Commands::Audit(args) => cli::audit::run(args, config),
        Commands::Stats => cli::stats::run(config),
        Commands::Config(_) => Ok(()),
    }
}
