use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "soar-cli")]
#[command(about = "SOAR command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile suggestions for one audit type from its findings fixture.
    Sync {
        #[arg(default_value = "prerender")]
        audit_type: String,
    },
    /// Print a digest of recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        audit_type: "prerender".to_string(),
    }) {
        Commands::Sync { audit_type } => {
            let summary = soar_sync::run_sync_once_from_env(&audit_type).await?;
            println!(
                "sync complete: run_id={} audit={} created={} updated={} outdated={} reports={}",
                summary.run_id,
                summary.audit_type,
                summary.created,
                summary.updated,
                summary.outdated,
                summary.reports_dir
            );
        }
        Commands::Report { runs } => {
            println!("{}", soar_sync::report_recent_markdown(runs, None)?);
        }
    }

    Ok(())
}
