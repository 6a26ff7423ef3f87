use anyhow::Result;
use clap::Parser;
use lab_events::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

/// Streams container lifecycle, interface and traffic events of a lab.
#[derive(Debug, Parser)]
#[command(name = "lab-events", version)]
struct Cli {
    /// TOML config file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Output format: plain or json
    #[arg(short, long)]
    format: Option<String>,

    /// Container runtime
    #[arg(long)]
    runtime: Option<String>,

    /// Emit container and interface snapshots before streaming
    #[arg(long)]
    initial_state: bool,

    /// Emit periodic interface counter events
    #[arg(long)]
    interface_stats: bool,

    /// Interface stats interval in milliseconds
    #[arg(long, value_name = "MS")]
    stats_interval: Option<u64>,

    /// Sample per-protocol traffic counters with tc + eBPF
    #[arg(long)]
    traffic: bool,

    /// Traffic sample interval in milliseconds
    #[arg(long, value_name = "MS")]
    traffic_interval: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut config::AppConfig) {
        if let Some(format) = &self.format {
            config.stream.format = format.clone();
        }
        if let Some(runtime) = &self.runtime {
            config.stream.runtime = runtime.clone();
        }
        config.stream.include_initial_state |= self.initial_state;
        config.interfaces.include_stats |= self.interface_stats;
        if let Some(ms) = self.stats_interval {
            config.interfaces.stats_interval_ms = ms;
        }
        config.traffic.enabled |= self.traffic;
        if let Some(ms) = self.traffic_interval {
            config.traffic.interval_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut app_config = config::AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut app_config);
    app_config.validate()?;

    anyhow::ensure!(
        nix::unistd::geteuid().is_root(),
        "lab-events must run as root to enter container network namespaces"
    );

    let runtime = Arc::new(runtime::DockerRuntime::connect(
        &app_config.runtime.docker_socket,
        app_config.runtime.timeout_secs,
    )?);
    let pipeline = events::Pipeline::new(
        runtime,
        Arc::new(netlink::NetlinkMonitor),
        app_config.stream_options(),
    )
    .with_traffic(traffic::TcBpfBackend::new(app_config.traffic_backend()));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => {}
                            _ = sigterm.recv() => {}
                        }
                    }
                    Err(_) => {
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            tracing::info!("Received shutdown signal");
            cancel.cancel();
        }
    });

    tracing::info!(
        runtime = %app_config.stream.runtime,
        format = %app_config.stream.format,
        traffic = app_config.traffic.enabled,
        "Streaming lab events"
    );
    pipeline.run(cancel, std::io::stdout()).await?;
    Ok(())
}
