// ============================================================================
// CLI & COMMAND LINE INTERFACE
// ============================================================================
// Subcommands:
// - publish: one generator process driving load at a target rate
// - monitor: one sampling session against a live platform
// - analyze: offline statistics over previously captured raw series
// - factories / validate / generate-config: helpers
// ============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use crate::artifacts::ArtifactPaths;
use crate::config::{LoggingConfig, PerfConfig};
use crate::connection::{ConnectionParams, PlatformClient};
use crate::error::{ConfigError, PerfError, PerfResult};
use crate::factory::{FactoryDescriptor, FactoryRegistry};
use crate::generator::{GeneratorReport, LoadGenerator};
use crate::series::{read_csv, FrozenSeries};
use crate::session::{Finalizer, MonitoringSession, SessionReport};
use crate::sink::{HttpSink, LogSink, ResourceKind, Sink};
use crate::stats::CheckStatus;
use crate::types::SourceSet;
use crate::{DEFAULT_PROCESSING_MODE, FATAL_LINE_PREFIX};

// ----------------------------------------------------------------------------
// Argument parser
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "loadgauge",
    version,
    about = "Rate-controlled load generation and queue-stability telemetry",
    long_about = "loadgauge drives synthetic events at a target rate against a platform under \
                  test, samples its internal status while the load runs and reports summary \
                  statistics and queue stability verdicts."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "loadgauge.toml", env = "LOADGAUGE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "LOADGAUGE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "LOADGAUGE_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish generated events at a fixed rate per source
    Publish(PublishArgs),

    /// Sample platform status until the duration elapses or Ctrl-C
    Monitor(MonitorArgs),

    /// Compute statistics and verdicts from captured raw series
    Analyze(AnalyzeArgs),

    /// List the registered event factories
    Factories,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Platform base URL; https is assumed when no scheme is given
    #[arg(long, env = "LOADGAUGE_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "LOADGAUGE_USERNAME", default_value = "")]
    pub username: String,

    #[arg(long, env = "LOADGAUGE_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,
}

impl ConnectionArgs {
    pub fn params(&self) -> Result<ConnectionParams, ConfigError> {
        let base_url = self
            .base_url
            .clone()
            .ok_or_else(|| ConfigError::invalid_value("base_url", "a platform URL is required"))?;
        Ok(ConnectionParams {
            base_url,
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    pub fn client(&self, config: &PerfConfig) -> Result<PlatformClient, ConfigError> {
        PlatformClient::new(&self.params()?, &config.connection)
    }
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// JSON list of source identifiers, e.g. '["101","102"]'
    #[arg(long)]
    pub sources: String,

    /// Events per source per second
    #[arg(long)]
    pub per_source_rate: f64,

    #[arg(long, default_value = "/measurement/measurements")]
    pub resource_path: String,

    #[arg(long, default_value = DEFAULT_PROCESSING_MODE)]
    pub processing_mode: String,

    /// Run time in seconds; runs until Ctrl-C when omitted
    #[arg(long)]
    pub duration: Option<f64>,

    /// JSON factory descriptor: {"className": ..., "constructorParams": [...]}
    #[arg(long, default_value = r#"{"className":"default","constructorParams":[]}"#)]
    pub factory: String,

    /// Log requests instead of sending them
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Sampling time in seconds; samples until Ctrl-C when omitted
    #[arg(long)]
    pub duration: Option<f64>,

    /// 1-based session number, used to suffix the output files
    #[arg(long, default_value_t = 1)]
    pub session: usize,

    /// Output directory override
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// Directory holding the raw CSV series (default: the configured output dir)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    pub session: usize,

    /// Directory receiving the summary files (default: the input dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

/// Logging settings after applying `--log-level` and `--debug`
pub fn effective_logging(cli: &Cli, config: &LoggingConfig) -> LoggingConfig {
    let mut logging = config.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if cli.debug {
        logging.level = "debug".into();
    }
    logging
}

/// Seconds from the command line; `None` means unbounded
pub fn parse_duration_secs(secs: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    secs.map(|s| {
        if !(s.is_finite() && s > 0.0) {
            return Err(ConfigError::invalid_value("duration", format!("must be positive, got {s}")));
        }
        Duration::try_from_secs_f64(s).map_err(|e| ConfigError::invalid_value("duration", e.to_string()))
    })
    .transpose()
}

/// Configuration for a run: the file when it exists, defaults otherwise.
/// The flag is set when defaults were used.
pub fn load_run_config(path: &Path) -> PerfResult<(PerfConfig, bool)> {
    if !path.exists() {
        return Ok((PerfConfig::default(), true));
    }
    Ok((PerfConfig::load(path)?, false))
}

/// Line printed on stdout when a publisher run cannot go on
pub fn fatal_line(error: &dyn std::fmt::Display) -> String {
    format!("{FATAL_LINE_PREFIX} {error}")
}

pub fn handle_validate(config_path: &Path, verbose: bool) -> PerfResult<()> {
    println!("Validating configuration file: {}", config_path.display());
    let config = PerfConfig::load(config_path)?;
    println!("Configuration is valid");
    if verbose {
        println!("{config:#?}");
    }
    Ok(())
}

pub fn handle_generate_config(output: Option<&Path>) -> PerfResult<()> {
    let rendered = PerfConfig::generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, rendered)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

pub fn handle_factories() {
    let registry = FactoryRegistry::builtin();
    for (name, summary) in registry.describe() {
        println!("  {name:<16} {summary}");
    }
}

/// Resolve every publish argument into a ready generator. Nothing is sent.
pub fn build_publisher(args: &PublishArgs, config: &PerfConfig) -> Result<LoadGenerator, ConfigError> {
    let sources = SourceSet::from_json(&args.sources)?;
    let resource = ResourceKind::from_path(&args.resource_path)?;
    let descriptor = FactoryDescriptor::from_json(&args.factory)?;
    let factory = FactoryRegistry::builtin().create(&descriptor)?;
    let duration = parse_duration_secs(args.duration)?;

    let sink: Arc<dyn Sink> = if args.dry_run {
        Arc::new(LogSink)
    } else {
        Arc::new(HttpSink::new(args.connection.client(config)?))
    };

    LoadGenerator::new(
        sources,
        args.per_source_rate,
        duration,
        factory,
        sink,
        resource,
        args.processing_mode.as_str(),
    )?
    .with_settings(config.generator.clone())
}

/// Announce the run on stdout, then publish until done or interrupted
pub async fn run_publish(args: &PublishArgs, config: &PerfConfig) -> PerfResult<GeneratorReport> {
    let generator = build_publisher(args, config)?;

    println!("{}", generator.startup_line());
    std::io::stdout().flush()?;

    let stop = generator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "loadgauge::cli", "Interrupt received, stopping publisher");
            stop.stop();
        }
    });

    let report = generator.run().await?;
    info!(
        target: "loadgauge::cli",
        total_sent = report.total_sent,
        abandoned = report.abandoned,
        achieved_rate = report.achieved_rate(),
        stop_reason = %report.stop_reason,
        "Publisher finished"
    );
    Ok(report)
}

pub async fn run_monitor(args: &MonitorArgs, config: &PerfConfig) -> PerfResult<SessionReport> {
    let mut config = config.clone();
    if let Some(dir) = &args.output {
        config.output.dir = dir.clone();
    }
    let duration = parse_duration_secs(args.duration)?;
    let finalizer = Finalizer::from_config(&config)?;
    let client = args.connection.client(&config)?;

    let session = MonitoringSession::from_config(&config, &client, args.session).await;
    match duration {
        Some(d) => tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = tokio::signal::ctrl_c() => info!(target: "loadgauge::cli", "Interrupt received"),
        },
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(target: "loadgauge::cli", error = %e, "Cannot wait for Ctrl-C, stopping now");
            }
        }
    }

    let report = session.finish(&finalizer).await;
    print_report(&report, args.format)?;
    Ok(report)
}

pub fn run_analyze(args: &AnalyzeArgs, config: &PerfConfig) -> PerfResult<SessionReport> {
    let input_dir = args.input.clone().unwrap_or_else(|| config.output.dir.clone());
    let output_dir = args.output.clone().unwrap_or_else(|| input_dir.clone());
    let inputs = ArtifactPaths::for_session(&input_dir, args.session);
    let outputs = ArtifactPaths::for_session(&output_dir, args.session);

    let primary = read_csv(&inputs.raw_csv)?;
    let companion = if inputs.cpu_csv.exists() {
        Some(read_csv(&inputs.cpu_csv)?)
    } else {
        None
    };
    info!(
        target: "loadgauge::cli",
        raw_data = %inputs.raw_csv.display(),
        samples = primary.len(),
        companion = companion.is_some(),
        "Loaded captured series"
    );

    let series: Vec<&FrozenSeries> = std::iter::once(&primary).chain(companion.as_ref()).collect();
    let report = Finalizer::from_config(config)?.run(&series, Some(&outputs));
    print_report(&report, args.format)?;
    Ok(report)
}

/// Human or JSON rendering of a session report on stdout
pub fn print_report(report: &SessionReport, format: ReportFormat) -> PerfResult<()> {
    if format == ReportFormat::Json {
        let text = serde_json::to_string_pretty(report).map_err(|e| PerfError::Internal(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    if let Some(id) = report.session_id {
        println!("Session {id}");
    }
    println!("  samples: {}", report.samples);
    if let Some(reason) = &report.stats_error {
        println!("  statistics unavailable: {reason}");
    }
    for queue in &report.queues {
        match queue.verdict.trend() {
            Some(trend) => println!("  queue {:<8} {:?}", queue.label, trend),
            None => println!("  queue {:<8} insufficient data", queue.label),
        }
        for breach in &queue.limit_breaches {
            println!(
                "    {} {:.1} >= {:.1} (80% of capacity)",
                breach.statistic, breach.value, breach.limit
            );
        }
    }
    for check in &report.checks {
        let mark = match check.status {
            CheckStatus::Passed => "ok",
            CheckStatus::Failed => "FAILED",
            CheckStatus::Skipped => "skipped",
        };
        println!("  check {}({}) <= {}: {mark}", check.statistic, check.metric, check.max);
    }
    for failure in &report.sampler_failures {
        println!("  sampler stopped early: {failure}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;
    use crate::stability::QueueTrend;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from([
            "loadgauge",
            "publish",
            "--sources",
            r#"["101","102"]"#,
            "--per-source-rate",
            "2.5",
            "--duration",
            "30",
            "--dry-run",
        ])
        .unwrap();
        let Some(Commands::Publish(args)) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.resource_path, "/measurement/measurements");
        assert_eq!(args.processing_mode, "CEP");
        assert_eq!(args.duration, Some(30.0));

        let generator = build_publisher(&args, &PerfConfig::default()).unwrap();
        assert_eq!(generator.aggregate_rate(), 5.0);
        assert_eq!(
            generator.startup_line(),
            r#"Started publishing measurements with rate of 2.5 objects per source per second, with processing mode CEP to sources: ["101", "102"]"#
        );
    }

    #[rstest]
    #[case::unknown_factory(r#"{"className":"nope","constructorParams":[]}"#, "/measurement/measurements", "1")]
    #[case::bad_resource(r#"{"className":"default","constructorParams":[]}"#, "/inventory/managedObjects", "1")]
    #[case::bad_rate(r#"{"className":"default","constructorParams":[]}"#, "/event/events", "0")]
    fn test_publish_config_errors(#[case] factory: &str, #[case] resource: &str, #[case] rate: &str) {
        let cli = Cli::try_parse_from([
            "loadgauge",
            "publish",
            "--sources",
            r#"["a"]"#,
            "--per-source-rate",
            rate,
            "--resource-path",
            resource,
            "--factory",
            factory,
            "--dry-run",
        ])
        .unwrap();
        let Some(Commands::Publish(args)) = cli.command else {
            panic!("expected publish");
        };
        assert!(build_publisher(&args, &PerfConfig::default()).is_err());
    }

    #[test]
    fn test_live_publish_requires_base_url() {
        let args = PublishArgs {
            connection: ConnectionArgs {
                base_url: None,
                username: String::new(),
                password: String::new(),
            },
            sources: r#"["a"]"#.into(),
            per_source_rate: 1.0,
            resource_path: "/measurement/measurements".into(),
            processing_mode: "CEP".into(),
            duration: None,
            factory: r#"{"className":"default","constructorParams":[]}"#.into(),
            dry_run: false,
        };
        assert!(matches!(
            build_publisher(&args, &PerfConfig::default()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[rstest]
    #[case(None, Ok(None))]
    #[case(Some(1.5), Ok(Some(Duration::from_millis(1500))))]
    #[case(Some(0.0), Err(()))]
    #[case(Some(f64::NAN), Err(()))]
    fn test_parse_duration(#[case] input: Option<f64>, #[case] expected: Result<Option<Duration>, ()>) {
        assert_eq!(parse_duration_secs(input).map_err(|_| ()), expected);
    }

    #[test]
    fn test_effective_logging() {
        let cli = Cli::try_parse_from(["loadgauge", "--debug", "factories"]).unwrap();
        let logging = effective_logging(&cli, &LoggingConfig::default());
        assert_eq!(logging.level, "debug");
    }

    #[test]
    fn test_run_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, defaulted) = load_run_config(&dir.path().join("absent.toml")).unwrap();
        assert!(defaulted);
        assert_eq!(config, PerfConfig::default());
    }

    #[test]
    fn test_broken_config_yields_fatal_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadgauge.toml");
        std::fs::write(&path, "[generator]\nmax_batch_size = \"many\"\n").unwrap();

        let err = load_run_config(&path).unwrap_err();
        let line = fatal_line(&err);
        assert!(line.starts_with("ERROR: publisher failed: "), "{line}");
        assert!(line.contains("Configuration error"), "{line}");
    }

    #[test]
    fn test_analyze_offline() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("perf_raw_data.csv");
        let mut text = String::from("timestamp,correlator_iq_size,cep_proxy_requests_failed\n");
        for i in 0..20 {
            text.push_str(&format!("{i}.000,{},{}\n", 10 + i % 3, 0));
        }
        std::fs::write(&raw, text).unwrap();

        let args = AnalyzeArgs {
            input: Some(dir.path().to_path_buf()),
            session: 1,
            output: None,
            format: ReportFormat::Json,
        };
        let report = run_analyze(&args, &PerfConfig::default()).unwrap();
        assert_eq!(report.samples, 20);
        assert_eq!(report.queues.len(), 2);
        assert_eq!(report.queues[0].verdict.trend(), Some(QueueTrend::Stable));
        assert!(report.is_clean());
        assert!(dir.path().join("perf_statistics.json").exists());
        assert!(dir.path().join("perf_counters.json").exists());
    }

    #[test]
    fn test_analyze_offline_flags_growing_queue_with_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut text = String::from("timestamp,correlator_iq_size\n");
        for i in 0..100 {
            text.push_str(&format!("{i}.000,{}\n", 100 * i));
        }
        std::fs::write(dir.path().join("perf_raw_data.csv"), text).unwrap();

        let args = AnalyzeArgs {
            input: Some(dir.path().to_path_buf()),
            session: 1,
            output: None,
            format: ReportFormat::Json,
        };
        let report = run_analyze(&args, &PerfConfig::default()).unwrap();
        assert_eq!(report.queues[0].metric, "correlator_iq_size");
        assert_eq!(report.queues[0].verdict.trend(), Some(QueueTrend::Diverging));
        assert!(!report.is_clean());
    }
}
