use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ipeds_canonical::config::PipelineConfig;
use ipeds_canonical::logging;
use ipeds_canonical::pipeline;
use ipeds_canonical::pipeline::provenance::RunContext;

#[derive(Parser)]
#[command(name = "ipeds_canonical")]
#[command(about = "Canonical long-format pipeline for IPEDS graduation-rate extracts")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to a TOML config file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the wide graduation-rate extract path
    #[arg(long, global = true)]
    wide_csv: Option<PathBuf>,

    /// Override the institutional-characteristics extract path
    #[arg(long, global = true)]
    institutions_csv: Option<PathBuf>,

    /// Override the processed output directory
    #[arg(long, global = true)]
    out_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reshape the wide extract into the canonical long table
    Extract,
    /// Join institutional metadata onto the long table
    Enrich,
    /// Derive the latest and summary tables and write the provenance record
    Build,
    /// Run extract, enrich, and build in order
    Run,
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();

    let cli = Cli::parse();

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.wide_csv {
        config.inputs.wide_csv = path;
    }
    if let Some(path) = cli.institutions_csv {
        config.inputs.institutions_csv = path;
    }
    if let Some(path) = cli.out_dir {
        config.outputs.processed_dir = path;
    }

    let ctx = RunContext::new(config.load_ts);

    match cli.command {
        Commands::Extract => {
            println!("🔄 Extracting canonical long table...");
            let receipt = pipeline::run_extract(&config, &ctx)?;
            println!(
                "✅ Extracted {} long rows from {} wide rows ({} dropped)",
                receipt.counts.long_rows.unwrap_or(0),
                receipt.counts.wide_rows.unwrap_or(0),
                receipt.counts.dropped_rows.unwrap_or(0)
            );
        }
        Commands::Enrich => {
            println!("🔄 Enriching with institutional metadata...");
            let receipt = pipeline::run_enrich(&config, &ctx)?;
            println!(
                "✅ Enriched {} rows ({} institutions missing metadata)",
                receipt.counts.enriched_rows.unwrap_or(0),
                receipt.validation.missing_metadata
            );
        }
        Commands::Build => {
            println!("🔄 Building canonical outputs...");
            let record = pipeline::run_build(&config, &ctx)?;
            println!(
                "✅ Built outputs: latest={} summary={} (completed: {})",
                record.counts.latest_rows.unwrap_or(0),
                record.counts.summary_rows.unwrap_or(0),
                record.completed
            );
        }
        Commands::Run => {
            println!("🔄 Running full pipeline...");
            let record = pipeline::run_all(&config, &ctx)?;
            println!("\n📊 Pipeline results:");
            println!("   Long rows: {}", record.counts.long_rows.unwrap_or(0));
            println!("   Latest rows: {}", record.counts.latest_rows.unwrap_or(0));
            println!("   Summary rows: {}", record.counts.summary_rows.unwrap_or(0));
            println!("   Missing metadata: {}", record.enrichment.missing_count);
            println!("   Validation issues: {}", record.validation.total_issues);
            println!("   Completed: {}", record.completed);
        }
    }

    Ok(())
}
