//! urltrack CLI
//!
//! Background service and maintenance tools for per-site URL visit
//! tracking.

mod config;
mod service;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use urltrack_core::{MergeOutcome, RecordFileStat, Site, SiteOptions};
use urltrack_formats::{read_fprints, RecordReader};

use config::ServiceConfig;
use service::{unix_now, Service};

#[derive(Parser)]
#[command(name = "urltrack")]
#[command(version, about = "Per-site URL visit tracking service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracking service (pipe receiver + periodic flush/merge)
    Serve {
        /// Service config file (YAML or TOML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write a starter configuration file
    InitConfig {
        /// Output path (.yaml, .yml or .toml)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Consolidate one site's snapshot files now
    Merge {
        /// Service config file
        #[arg(short, long)]
        config: PathBuf,

        /// Site name as configured
        #[arg(short, long)]
        site: String,
    },

    /// Print records from a record file
    Inspect {
        /// Path to a record file (data_base, data_current or a temp file)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Number of records to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Print retention statistics for a record file
    Stats {
        /// Path to a record file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Show the age cutoff that would shrink the file to this many
        /// records
        #[arg(long, default_value = "0")]
        maxsize: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve { config } => {
            let config = ServiceConfig::load(&config)?;
            let service = Service::open(config)?;
            service.run()
        }
        Commands::InitConfig { output } => {
            ServiceConfig::example().save(&output)?;
            println!("Wrote starter config to {}", output.display());
            Ok(())
        }
        Commands::Merge { config, site } => run_merge(&config, &site),
        Commands::Inspect { input, limit } => run_inspect(&input, limit),
        Commands::Stats { input, maxsize } => run_stats(&input, maxsize),
    }
}

fn run_merge(config_path: &PathBuf, site_name: &str) -> Result<()> {
    let config = ServiceConfig::load(config_path)?;
    let site_config = config
        .site_by_name(site_name)
        .with_context(|| format!("No site named {} in config", site_name))?;

    let dir = config
        .data_dir
        .join(urltrack_core::sanitize_site_id(&site_config.name));
    let now = unix_now();
    let site = Site::open(
        &dir,
        SiteOptions {
            table_capacity: site_config.table_capacity,
            max_retained: site_config.max_retained,
            max_temp_bytes: site_config.max_temp_bytes,
            keep_after_flush: site_config.keep_after_flush,
        },
        now,
    )?;

    let obsoleted = match &site_config.obsolete_fprints {
        Some(path) if path.exists() => {
            let mut fps = read_fprints(path)?;
            fps.sort_unstable();
            fps
        }
        _ => Vec::new(),
    };
    let cutdown = if config.schedule.retention_days == 0 {
        0
    } else {
        now - config.schedule.retention_days as i64 * 86_400
    };

    let MergeOutcome {
        retained,
        dropped_old,
        dropped_obsolete,
        dropped_inputs,
        ..
    } = site.consolidate(&obsoleted, cutdown, now)?;

    println!("Site:             {}", site_name);
    println!("Retained:         {}", retained);
    println!("Dropped (old):    {}", dropped_old);
    println!("Dropped (filter): {}", dropped_obsolete);
    if dropped_inputs > 0 {
        println!("Unreadable inputs dropped: {}", dropped_inputs);
    }
    Ok(())
}

fn run_inspect(input: &PathBuf, limit: usize) -> Result<()> {
    let reader = RecordReader::open(input)
        .with_context(|| format!("Failed to open {}", input.display()))?;

    for (i, entry) in reader.enumerate() {
        if i >= limit {
            println!("...");
            break;
        }
        let (fp, record) = entry?;
        println!(
            "{:#018x}  access={:<6} change={:<4} first={} last={} content={}  {}",
            fp,
            record.count_access,
            record.count_change,
            record.first_appear,
            record.last_access,
            record.last_content,
            record.url
        );
    }
    Ok(())
}

fn run_stats(input: &PathBuf, maxsize: u64) -> Result<()> {
    let reader = RecordReader::open(input)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let records: Vec<_> = reader.collect::<urltrack_formats::Result<Vec<_>>>()?;

    let newest = records.iter().map(|(_, r)| r.last_access).max().unwrap_or(0);
    let mut stat = RecordFileStat::new(newest);
    for (_, record) in &records {
        stat.add_record(record);
    }

    println!("Records:          {}", stat.total());
    println!("Newest access:    {}", stat.newest());
    println!("Max access count: {}", stat.max_count_access());
    if maxsize > 0 {
        println!(
            "Cutoff for {} records: {}",
            maxsize,
            stat.cutdown_time(maxsize)
        );
    }
    Ok(())
}
