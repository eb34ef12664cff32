use crate::output;

use std::path::PathBuf;

use clap::{Args, Subcommand};
use color_eyre::Result;

use pipeline_engine::{CacheManager, EngineConfig};

/// Inspect or clear the cache store
#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Cache store directory
    #[arg(long, value_name = "DIR", env = "CIRUN_CACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List entries, oldest first
    List,
    /// Remove one entry
    Remove {
        /// Exact cache key
        key: String,
    },
    /// Remove every entry
    Clear,
}

pub fn execute(args: CacheArgs) -> Result<()> {
    let mut config = EngineConfig::from_env()?;
    if let Some(dir) = args.cache_dir {
        config = config.with_cache_dir(dir);
    }

    let cache = CacheManager::open(config.cache)?;

    match args.command {
        CacheCommand::List => {
            let entries = cache.entries();
            output::status(
                "Cache",
                &format!(
                    "{} ({} of {} entries)",
                    cache.root().display(),
                    entries.len(),
                    cache.capacity()
                ),
            );

            for entry in &entries {
                println!(
                    "  {}  {:>10}  {}",
                    entry.last_write.format("%Y-%m-%d %H:%M:%S"),
                    format_size(entry.size_bytes),
                    entry.key
                );
            }

            if entries.is_empty() {
                output::info("Cache is empty");
            }
        }

        CacheCommand::Remove { key } => {
            if cache.remove(&key)? {
                output::success(&format!("Removed '{}'", key));
            } else {
                output::warning(&format!("No entry for '{}'", key));
            }
        }

        CacheCommand::Clear => {
            let count = cache.len();
            cache.purge()?;
            output::success(&format!("Removed {} entries", count));
        }
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
