use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use streamcore::PathManager;
use streamcore::config::Config;
use streamcore::record::cleaner::{Cleaner, CleanerEntry};

#[derive(Parser)]
#[command(
    name = "streamcored",
    about = "Standalone media routing daemon: path manager, recording agent and retention cleaner"
)]
struct Args {
    /// Path configuration file (TOML)
    #[arg(default_value = "streamcored.toml")]
    config: PathBuf,

    /// Starting port/offset fed to per-path RTP allocation
    #[arg(long, default_value_t = 0)]
    random_start: u32,
}

fn run(args: Args) -> streamcore::Result<()> {
    let contents = std::fs::read_to_string(&args.config).map_err(streamcore::CoreError::Io)?;
    let config = Config::from_toml_str(&contents)?;

    let cleaner_entries: Vec<CleanerEntry> = config
        .paths
        .iter()
        .filter_map(|p| {
            p.record
                .as_ref()
                .map(|r| CleanerEntry::from_record_config(&p.name, r))
        })
        .collect();

    let manager = PathManager::new(config, args.random_start)?;
    let _cleaner = if cleaner_entries.is_empty() {
        None
    } else {
        Some(Cleaner::spawn(cleaner_entries))
    };

    tracing::info!(paths = ?manager.path_names(), "streamcored running, press Enter to stop");
    let mut input = String::new();
    io::stdin().read_line(&mut input).ok();

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "streamcored exited with an error");
            ExitCode::FAILURE
        }
    }
}
