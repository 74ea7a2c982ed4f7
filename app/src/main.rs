mod report;

use std::path::PathBuf;

use anyhow::{Context as _, anyhow};
use clap::Parser;
use dbprobe_core::settings::Settings;
use dbprobe_db::{Checker, PostgresProber};
use dbprobe_storage::{RecordReader, SettingsStore};
use directories::BaseDirs;
use report::TerminalReporter;

type Result<T> = anyhow::Result<T>;

/// Check that every database listed in a CSV file accepts a connection.
#[derive(Debug, Parser)]
#[command(name = "dbprobe", version)]
struct Cli {
    /// CSV file with a header line; host, port, database, user and password
    /// are read from columns 2, 3, 5, 6 and 7.
    file: Option<PathBuf>,

    /// Skip lines that start with this character.
    #[arg(long, env = "DBPROBE_COMMENT")]
    comment: Option<char>,

    /// Accept rows whose column count differs from the header.
    #[arg(long)]
    flexible: bool,

    /// Number of targets probed at once.
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Settings file. Defaults to settings.json in the user config directory.
    #[arg(long, env = "DBPROBE_CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("dbprobe failed: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let file = cli
        .file
        .clone()
        .ok_or_else(|| anyhow!("Must pass in filename of CSV file to read."))?;
    let settings = resolve_settings(&cli)?;

    let reader = RecordReader::new(&settings).context("Invalid reader settings")?;
    let records = reader
        .read_path(&file)
        .context("Problem getting records")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let prober = PostgresProber::new().context("Failed to set up TLS client")?;
    let checker = Checker::new(prober).with_workers(settings.workers);
    let mut reporter = TerminalReporter::stdout();
    runtime.block_on(checker.run(records, &mut reporter));

    tracing::info!(
        reachable = reporter.reachable(),
        unreachable = reporter.unreachable(),
        "Finished"
    );
    Ok(())
}

fn init_tracing() {
    use std::sync::OnceLock;
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Defaults, then the settings file, then command-line flags.
fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let store = match &cli.config {
        Some(path) => Some(SettingsStore::at(path)),
        None => resolve_config_dir().map(|dir| SettingsStore::new(&dir)),
    };
    let mut settings = match store {
        Some(store) => store
            .load()
            .with_context(|| format!("Failed to load {}", store.path().display()))?,
        None => {
            tracing::warn!("Unable to determine config directory, using default settings");
            Settings::default()
        }
    };

    if cli.comment.is_some() {
        settings.comment = cli.comment;
    }
    if cli.flexible {
        settings.flexible = true;
    }
    if let Some(workers) = cli.workers {
        settings.workers = workers;
    }
    if settings.workers == 0 {
        tracing::warn!("workers must be at least 1, probing sequentially");
        settings.workers = 1;
    }
    Ok(settings)
}

fn resolve_config_dir() -> Option<PathBuf> {
    let base_dirs = BaseDirs::new()?;
    Some(base_dirs.config_dir().join("dbprobe"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dbprobe").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("settings.json");
        std::fs::write(&config, r##"{"comment": "#", "workers": 2}"##).unwrap();

        let cli = parse(&[
            "targets.csv",
            "--config",
            config.to_str().unwrap(),
            "--comment",
            ";",
            "--flexible",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.comment, Some(';'));
        assert!(settings.flexible);
        assert_eq!(settings.workers, 2);
    }

    #[test]
    fn missing_settings_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("absent.json");
        let cli = parse(&["--config", config.to_str().unwrap(), "-j", "0"]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.comment, None);
        assert_eq!(settings.workers, 1);
        assert!(cli.file.is_none());
    }
}
