//! nvmex: NVIDIA GPU metrics in Prometheus text format.
//!
//! One-shot by default: a single scrape is printed to stdout. With
//! `--foreground` the exporter serves `http://<source>:<port>/metrics`
//! until interrupted.
//!
//! Exit codes: 0 ok, 95 fatal, 96 configuration, 100 permission,
//! 101 temporarily disabled (no driver or no devices), 1 anything else.

use anyhow::{Context, Result};
use clap::Parser;
use nvmex::config::Config;
use nvmex::logging::{self, LogLevel};
use nvmex::query::NvmlBackend;
use nvmex::scrape::{ScrapeOptions, Session};
use nvmex::{server, ExporterError};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// nvmex: capability-adaptive NVIDIA GPU metrics exporter
#[derive(Parser, Debug)]
#[command(name = "nvmex")]
#[command(version)]
#[command(about = "NVIDIA GPU metrics exporter for Prometheus", long_about = None)]
struct Cli {
    /// Omit HELP and TYPE comments
    #[arg(short = 'c', long)]
    compact: bool,

    /// Comma separated metric families to skip, e.g. fan,nvlink
    #[arg(short = 'n', long, value_name = "LIST")]
    no_metrics: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (default: all interfaces)
    #[arg(short, long)]
    source: Option<String>,

    /// Log level: TRACE, DEBUG, INFO, WARN, ERROR, FATAL
    #[arg(short, long, value_name = "LEVEL")]
    verbosity: Option<String>,

    /// Append log output to this file
    #[arg(short, long)]
    logfile: Option<PathBuf>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not emit per-collector scrape durations
    #[arg(long)]
    no_scrapetime: bool,

    /// Do not emit the total scrape duration
    #[arg(long)]
    no_scrapetime_all: bool,

    /// Serve HTTP instead of printing one scrape
    #[arg(short, long)]
    foreground: bool,
}

impl Cli {
    /// Loads the configuration file and applies the command line on top.
    fn config(&self) -> Result<Config> {
        let mut config = match (&self.config, Config::default_path()) {
            (Some(path), _) => Config::load(path)?,
            (None, Some(path)) if path.exists() => Config::load(path)?,
            _ => Config::default(),
        };
        let global = &mut config.global;
        global.compact |= self.compact;
        if self.no_scrapetime {
            global.scrape_time = false;
        }
        if self.no_scrapetime_all {
            global.scrape_time_all = false;
        }
        if let Some(port) = self.port {
            global.port = port;
        }
        if let Some(source) = &self.source {
            global.source = Some(source.clone());
        }
        if let Some(level) = &self.verbosity {
            global.log_level.clone_from(level);
        }
        if let Some(file) = &self.logfile {
            global.logfile = Some(file.clone());
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<ExporterError>().map_or(1, ExporterError::exit_code);
            error!("{e:#}");
            eprintln!("nvmex: {e:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.config()?;
    let level: LogLevel = config.log_level()?;
    logging::init(level, config.global.logfile.as_deref())?;

    let mut selection = config.selection()?;
    if let Some(list) = &cli.no_metrics {
        selection.disable_list(list)?;
    }
    let options = ScrapeOptions::from_config(&config, &selection);

    let backend = NvmlBackend::init()?;
    let mut session = Session::new(backend, options, &selection)?;

    if !cli.foreground {
        let text = session.scrape();
        session.teardown();
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(text.as_bytes()).context("writing metrics to stdout")?;
        return stdout.flush().context("writing metrics to stdout");
    }

    let addr = server::bind_addr(config.global.source.as_deref(), config.global.port)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    runtime.block_on(server::run(session, addr))?;
    info!("exporter stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "global:\n  port: 9100\n  source: 10.0.0.1\n  log_level: WARN\n").unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::parse_from(["nvmex", "--config", path]);
        let config = cli.config().unwrap();
        assert_eq!(config.global.port, 9100);
        assert!(config.global.scrape_time);

        let cli = Cli::parse_from([
            "nvmex", "--config", path, "-c", "-p", "9500", "--no-scrapetime", "-v", "debug",
        ]);
        let config = cli.config().unwrap();
        assert!(config.global.compact);
        assert!(!config.global.scrape_time);
        assert_eq!(config.global.port, 9500);
        assert_eq!(config.global.source.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.log_level().unwrap(), LogLevel::Debug);
        assert!(config.global.scrape_time_all);
        assert!(!cli.foreground);
    }

    #[test]
    fn test_no_scrapetime_all_flag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "global:\n  port: 9100\n").unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::parse_from(["nvmex", "--config", path, "--no-scrapetime-all"]);
        let config = cli.config().unwrap();
        assert!(!config.global.scrape_time_all);
        assert!(config.global.scrape_time, "per-collector durations stay on");

        let selection = config.selection().unwrap();
        let options = ScrapeOptions::from_config(&config, &selection);
        assert!(options.scrape_time);
        assert!(!options.scrape_time_all);
    }

    #[test]
    fn test_config_error_exit_code() {
        let cli = Cli::parse_from(["nvmex", "--config", "/nonexistent/nvmex.yaml"]);
        let err = cli.config().unwrap_err();
        let code = err.downcast_ref::<ExporterError>().map_or(1, ExporterError::exit_code);
        assert_eq!(code, 96);
    }
}
