use clap::Parser;
use tracing_subscriber::EnvFilter;

use hm_host::app::{run_interactive, App};
use hm_host::cli::{load_config, Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to the interactive chat when no subcommand is given.
        None | Some(Command::Chat) => {
            init_tracing();
            let (config, path) = load_config(cli.config.as_ref())?;
            report_config_issues(&config, &path)?;
            let app = App::bootstrap(config)?;
            tracing::info!(workspace = %app.workspace().display(), "hivemind starting");
            run_interactive(app).await
        }
        Some(Command::Version) => {
            println!("hivemind {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::ConfigCheck) => {
            let (config, path) = load_config(cli.config.as_ref())?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if config.is_valid() {
                println!("{}: ok", path.display());
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn report_config_issues(
    config: &hm_domain::config::Config,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let issues = config.validate();
    for issue in &issues {
        tracing::warn!(config = %path.display(), "{issue}");
    }
    if !config.is_valid() {
        anyhow::bail!("configuration has errors: {}", path.display());
    }
    Ok(())
}
