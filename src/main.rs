//! ghb CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ghb::cli::{Cli, Commands};
use ghb::{commands, config};

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ghb=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("ghb: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> ghb::Result<()> {
    let (cfg, source) = config::load()?;

    match cli.command {
        Commands::Setup { user } => commands::setup(&cfg, &user),
        Commands::Add {
            entity,
            project,
            url,
            token,
            labels,
        } => commands::add(&cfg, entity.entity(), project, url, token, labels),
        Commands::Delete {
            entity,
            project,
            number,
            keep,
            force,
            token,
        } => commands::delete(&cfg, entity.entity(), project, number, keep, force, token),
        Commands::List { verbose } => commands::list(&cfg, verbose),
        Commands::Status { verbose } => commands::status(&cfg, source.as_deref(), verbose),
        Commands::Start => commands::start(&cfg),
        Commands::Stop => commands::stop(&cfg),
        Commands::Restart => commands::restart(&cfg),
        Commands::Configcheck { list } => commands::configcheck(&cfg, source.as_deref(), list),
        Commands::Pat {
            entity,
            set,
            expires,
            delete,
            all,
        } => commands::pat(&cfg, entity.entity(), set, expires, delete, all),
    }
}
