//! `spark-serial`：从串口设备（或标准输入）读取文本行并逐行写到标准输出。
//!
//! 行写到标准输出，诊断日志写到标准错误；Ctrl-C 触发排空与关闭。

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use spark_serial_core::{Cancellation, DelimiterMode, SerialError};
use spark_serial_tokio::{ConsoleSink, DeviceSource, HostConfig, host, logging, signal};
use tracing::info;

/// Read newline-terminated lines from a serial device and print them.
#[derive(Parser, Debug)]
#[command(name = "spark-serial")]
#[command(version)]
struct Cli {
    /// Device path to read from; `-` reads standard input.
    #[arg(long, short = 'd')]
    device: Option<String>,

    /// TOML configuration file with `[device]` and `[serial]` tables.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Idle timer period in milliseconds.
    #[arg(long, value_name = "MS")]
    idle_ms: Option<u64>,

    /// Disable the idle timer.
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "idle_ms")]
    no_timer: bool,

    /// Only honor the first delimiter of each received chunk.
    #[arg(long, action = ArgAction::SetTrue)]
    first_delimiter_only: bool,

    /// Maximum line length in bytes; longer lines are discarded.
    #[arg(long, value_name = "BYTES")]
    line_capacity: Option<usize>,

    /// Maximum bytes delivered by one read.
    #[arg(long, value_name = "BYTES")]
    raw_capacity: Option<usize>,

    /// Upper bound for draining each request at shutdown, in milliseconds.
    #[arg(long, value_name = "MS")]
    drain_timeout_ms: Option<u64>,

    /// Log filter directive (overrides `RUST_LOG`).
    #[arg(long, value_name = "FILTER")]
    log: Option<String>,
}

impl Cli {
    fn host_config(&self) -> Result<HostConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                HostConfig::from_toml_str(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => HostConfig::default(),
        };

        if let Some(device) = &self.device {
            config.source = DeviceSource::from_arg(device);
        }
        let mut settings = config.settings.clone();
        if let Some(ms) = self.idle_ms {
            settings = settings.with_idle_period(Some(Duration::from_millis(ms)));
        }
        if self.no_timer {
            settings = settings.with_idle_period(None);
        }
        if self.first_delimiter_only {
            settings = settings.with_delimiter_mode(DelimiterMode::FirstPerChunk);
        }
        if let Some(bytes) = self.line_capacity {
            settings = settings.with_line_capacity(bytes);
        }
        if let Some(bytes) = self.raw_capacity {
            settings = settings.with_raw_capacity(bytes);
        }
        if let Some(ms) = self.drain_timeout_ms {
            settings = settings.with_drain_timeout(Some(Duration::from_millis(ms)));
        }
        config.settings = settings;
        Ok(config)
    }
}

fn explain(err: &SerialError, source: &DeviceSource) -> String {
    let device = match source {
        DeviceSource::Stdin => "standard input".to_owned(),
        DeviceSource::Path(path) => path.display().to_string(),
    };
    match err.root_cause() {
        SerialError::DeviceInUse { .. } => {
            format!("cannot open {device}: the device is in use by another program")
        }
        SerialError::DeviceOpen { detail, .. } => format!("cannot open {device}: {detail}"),
        SerialError::Config(config) => format!("invalid settings: {config}"),
        other => format!("could not start reading {device}: {other}"),
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::install(cli.log.as_deref()).context("failed to install logging")?;
    let config = cli.host_config()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let cancellation = Cancellation::new();
        let _signal = signal::install_ctrl_c(cancellation.child());

        match host::run(&config, ConsoleSink::stdout(), cancellation).await {
            Ok(report) => {
                let stats = report.stats();
                info!(
                    lines = stats.lines,
                    drops = stats.drops,
                    idle_ticks = stats.idle_ticks,
                    forced = report.forced_count(),
                    "shutdown complete"
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(err) if err.is_setup_failure() => {
                eprintln!("spark-serial: {}", explain(&err, &config.source));
                Ok(ExitCode::FAILURE)
            }
            Err(err) => Err(err).context("serial loop failed"),
        }
    })
}
