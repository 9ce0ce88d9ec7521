//! Indexing pipeline CLI.
//!
//! ```text
//! indexing-pipeline --config pipeline.toml run
//! indexing-pipeline --config pipeline.toml schedule-once
//! indexing-pipeline --config pipeline.toml trigger --shop demo.myshopify.com
//! indexing-pipeline --config pipeline.toml encrypt "$(cat service-account.json)"
//! ```
//!
//! Connection settings may also come from `PIPELINE_REDIS_URL`, `PIPELINE_SQL_URL`
//! and `PIPELINE_ENCRYPTION_KEY`.

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use indexing_pipeline::{Cipher, IndexingPipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "indexing-pipeline", version, about = "Search engine indexing pipeline")]
struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and every worker pool until Ctrl-C
    Run,
    /// Publish jobs for every shop with pending work, then exit
    ScheduleOnce,
    /// Publish a job for one shop, then exit
    Trigger {
        #[arg(long)]
        shop: String,
    },
    /// Encrypt a credential for storage in a shop profile
    Encrypt { plaintext: String },
    /// Print stream backlogs
    Status,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .init();
    }
}

fn load_config(path: Option<&str>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_json);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => {
            let mut pipeline = IndexingPipeline::new(config);
            pipeline.start().await?;
            tokio::signal::ctrl_c().await?;
            info!("Ctrl-C received");
            pipeline.shutdown().await;
        }
        Command::ScheduleOnce => {
            let mut pipeline = IndexingPipeline::new(config);
            let report = pipeline.schedule_once().await?;
            println!(
                "scheduled={} skipped={} failed={}",
                report.scheduled, report.skipped, report.failed
            );
        }
        Command::Trigger { shop } => {
            let mut pipeline = IndexingPipeline::new(config);
            let id = pipeline.trigger_shop(&shop).await?;
            println!("{}", id);
        }
        Command::Encrypt { plaintext } => {
            let key = config
                .encryption_key
                .as_deref()
                .ok_or("encryption_key is not configured")?;
            println!("{}", Cipher::from_hex(key)?.encrypt(&plaintext)?);
        }
        Command::Status => {
            let mut pipeline = IndexingPipeline::new(config);
            pipeline.connect().await?;
            let status = pipeline.status().await;
            let show = |v: Option<u64>| v.map_or_else(|| "unreachable".to_string(), |n| n.to_string());
            println!("jobs      {}", show(status.jobs_backlog));
            println!("batches   {}", show(status.batches_backlog));
            println!("outcomes  {}", show(status.outcomes_backlog));
            if status.batches_backlog.is_none() {
                warn!("Stream backlog unavailable");
            }
        }
    }
    Ok(())
}
