//! Prints the structure and contents of a chronofile database.
//!
//! The file is always opened read-only, so it is safe to point this at a
//! database that a live process is writing.

use alopex_chronofile::format::{FragmentHeader, IoPolicy, FRAGMENT_HEADER_SIZE, TOC_SIZE};
use alopex_chronofile::{DatabaseConfig, TimeSeriesDatabase};
use anyhow::{bail, Context};
use clap::Parser;
use std::fs::File;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, Parser)]
#[command(about, version)]
struct Config {
    /// Database file to inspect.
    pub path: PathBuf,

    /// Only show this column group.
    #[arg(long)]
    pub group: Option<String>,

    /// Print rows with timestamps at or after this value.
    #[arg(long)]
    pub from: Option<i64>,

    /// Print rows with timestamps at or before this value.
    #[arg(long)]
    pub to: Option<i64>,

    /// List every data fragment of each group.
    #[arg(long)]
    pub fragments: bool,

    /// Seconds to wait for a lock held by a writer.
    #[arg(long, default_value_t = 5)]
    pub lock_timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let mut db_config = DatabaseConfig::default().read_only();
    db_config.lock_timeout = std::time::Duration::from_secs(config.lock_timeout_secs);

    let db = TimeSeriesDatabase::open_with_config(&config.path, b"", db_config.clone())
        .with_context(|| format!("failed to open {}", config.path.display()))?;

    let header = db.header()?;
    println!("file:     {}", db.path().display());
    println!("version:  {}", header.version.as_i32());
    println!("metadata: {}", String::from_utf8_lossy(&header.metadata));

    let groups = db.columns_info()?;
    if let Some(name) = &config.group {
        if !groups.iter().any(|g| g.group_name() == name) {
            bail!("no column group named '{}'", name);
        }
    }

    let file = File::open(&config.path)?;
    let policy = IoPolicy {
        lock_timeout: db_config.lock_timeout,
        sync_mode: db_config.sync_mode,
    };
    let data_start = header.toc_offset() + TOC_SIZE;

    for info in &groups {
        if config.group.as_deref().is_some_and(|g| g != info.group_name()) {
            continue;
        }
        println!();
        println!(
            "group {:?} @ {}: sample {} ms, columns [{}]",
            info.group_name(),
            info.location(),
            info.sample_time_millis(),
            info.column_names().join(", ")
        );

        if config.fragments {
            let max_hops = file.metadata()?.len() / FRAGMENT_HEADER_SIZE + 1;
            let mut offset = info.first_data_fragment();
            let mut hops = 0;
            while offset != 0 {
                hops += 1;
                if hops > max_hops {
                    bail!("fragment chain of '{}' does not terminate", info.group_name());
                }
                let fragment = FragmentHeader::read_at(&file, offset, data_start, &policy)?;
                let last = fragment.read_last_timestamp(&file, header.version)?;
                println!(
                    "  fragment @ {:>10}: {:>6} rows, start {}, last {}",
                    offset,
                    fragment.row_count,
                    fragment.start_time_millis,
                    last.map_or_else(|| "-".to_string(), |ts| ts.to_string())
                );
                offset = fragment.next_data_fragment;
            }
        }

        if config.from.is_some() || config.to.is_some() {
            let from = config.from.unwrap_or(i64::MIN);
            let to = config.to.unwrap_or(i64::MAX);
            let rows = db.read(info.group_name(), from, to)?;
            for (ts, values) in rows.iter() {
                println!("  {:>16} | {:?}", ts, values);
            }
            println!("  ({} rows)", rows.len());
        }
    }

    db.close()?;
    Ok(())
}
