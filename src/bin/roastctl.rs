//! roastctl - inspect detection jobs and run offline detections

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;

use roastwatch::annotate::{annotate, encode_jpeg};
use roastwatch::config::RoastwatchConfig;
use roastwatch::images::{decode_image, RESULT_JPEG_QUALITY};
use roastwatch::{JobId, JobStore, SqliteJobStore};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the job database (defaults to the configured db_path).
    #[arg(long, env = "ROASTWATCH_DB_PATH")]
    db_path: Option<String>,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List detection jobs, newest first.
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        per_page: u32,
    },
    /// Print one detection job as JSON.
    Show { id: JobId },
    /// Print aggregate statistics as JSON.
    Stats,
    /// Run the configured detector on a local image without recording a job.
    Detect {
        image: PathBuf,
        /// Where to write the annotated JPEG.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(args.ui, is_tty, stdout_is_tty);

    let mut config = RoastwatchConfig::load()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    match args.command {
        Command::List { page, per_page } => {
            let store = open_store(&ui, &config)?;
            let page = store.list(page, per_page)?;
            for job in &page.items {
                println!(
                    "{:>6}  {:<10}  {:<14}  {:>3}  {}  {}",
                    job.id.0,
                    job.status.as_str(),
                    job.capture_method.as_str(),
                    job.detections_count,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.filename
                );
            }
            eprintln!(
                "page {} of {} ({} jobs)",
                page.page,
                page.pages.max(1),
                page.total
            );
        }
        Command::Show { id } => {
            let store = open_store(&ui, &config)?;
            let job = store.get(id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Stats => {
            let store = open_store(&ui, &config)?;
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Detect { image, output } => {
            let detector = {
                let mut stage = ui.stage("Load detector");
                let detector = config.build_detector();
                stage.set_detail(detector.backend_name());
                detector
            };
            let frame = {
                let _stage = ui.stage("Decode image");
                let bytes = std::fs::read(&image)
                    .map_err(|e| anyhow!("failed to read {}: {}", image.display(), e))?;
                decode_image(&bytes)?
            };
            let result = {
                let mut stage = ui.stage("Detect");
                let result = detector.infer(&frame)?;
                stage.set_detail(format!("{} objects", result.count()));
                result
            };
            if let Some(output) = output {
                let _stage = ui.stage("Write annotated image");
                let annotated = annotate(&frame, &result);
                std::fs::write(&output, encode_jpeg(&annotated, RESULT_JPEG_QUALITY)?)
                    .map_err(|e| anyhow!("failed to write {}: {}", output.display(), e))?;
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn open_store(ui: &ui::Ui, config: &RoastwatchConfig) -> Result<SqliteJobStore> {
    let _stage = ui.stage("Open job store");
    SqliteJobStore::open(&config.db_path)
        .map_err(|e| anyhow!("failed to open job store {}: {}", config.db_path, e))
}
