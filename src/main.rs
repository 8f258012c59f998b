// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::{error, info, warn};

use loadgauge::cli::{
    effective_logging, fatal_line, handle_factories, handle_generate_config, handle_validate, load_run_config,
    run_analyze, run_monitor, run_publish, Cli, Commands,
};
use loadgauge::logging::init_logging;
use loadgauge::{PerfError, ENGINE_FULL_NAME, ENGINE_VERSION};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that need neither configuration nor logging
    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Factories) => {
            handle_factories();
            return Ok(());
        }
        None => {
            println!("{ENGINE_FULL_NAME} v{ENGINE_VERSION}: no subcommand given, see --help");
            return Ok(());
        }
        _ => {}
    }

    // A publisher reports every fatal error on stdout, setup failures included
    let is_publish = matches!(cli.command, Some(Commands::Publish(_)));
    let setup = load_run_config(&cli.config).and_then(|(config, defaulted)| {
        init_logging(&effective_logging(&cli, &config.logging))?;
        Ok((config, defaulted))
    });
    let (config, config_missing) = match setup {
        Ok(setup) => setup,
        Err(e) if is_publish => publisher_failed(&e),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to set up from {}", cli.config.display()));
        }
    };

    info!(target: "loadgauge::init", version = ENGINE_VERSION, "{ENGINE_FULL_NAME}");
    if config_missing {
        warn!(target: "loadgauge::init", path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Some(Commands::Publish(args)) => {
            if let Err(e) = run_publish(&args, &config).await {
                publisher_failed(&e);
            }
        }
        Some(Commands::Monitor(args)) => {
            run_monitor(&args, &config).await.context("Monitoring session failed")?;
        }
        Some(Commands::Analyze(args)) => {
            run_analyze(&args, &config).context("Analysis failed")?;
        }
        _ => {}
    }

    Ok(())
}

fn publisher_failed(e: &PerfError) -> ! {
    error!(
        target: "loadgauge::cli",
        category = e.category(),
        hint = ?e.recovery_hint(),
        error = %e,
        "Publisher failed"
    );
    println!("{}", fatal_line(e));
    std::process::exit(1)
}
