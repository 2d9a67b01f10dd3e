use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use argot::{
    config::{
        ControllerConfig, INGRESS_CLASS_DEFAULT, REPAIR_JITTER_DEFAULT, REPAIR_STEPS_DEFAULT, TAG_LIMIT_DEFAULT,
        WORKERS_DEFAULT, parse_duration,
    },
    controller::Controller,
    metrics::{self, Metrics},
    queue::WorkQueue,
    repair::RepairBackoff,
    secret::{OriginSecrets, SecretRef, SecretResolver},
    simpleevent::SimpleEventRecorder,
    tunnel::deployment::{DEFAULT_CLOUDFLARED_IMAGE, DeploymentTransport},
    watch::KubeCache,
};
use clap::{Parser, Subcommand};
use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use log::{LevelFilter, error, info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "controller", about = "Exposes Kubernetes Ingresses through Argo tunnels")]
struct Args {
    /// Log verbosity, from 0 (off) to 5 (debug).
    #[arg(short = 'v', default_value_t = 3, global = true, value_parser = clap::value_parser!(u8).range(0..=5))]
    verbosity: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the controller version.
    Version,

    /// Couple Ingresses of the configured class to tunnels.
    Couple(CoupleArgs),
}

#[derive(clap::Args, Debug)]
struct CoupleArgs {
    /// Use the in-cluster service account configuration.
    #[arg(long)]
    incluster: bool,

    /// Path to a kubeconfig, when not running inside a cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    #[arg(long, default_value = INGRESS_CLASS_DEFAULT)]
    ingress_class: String,

    /// Origin certificate secret `<namespace>/<name>` for hosts without a more specific one.
    #[arg(long)]
    default_origin_secret: Option<SecretRef>,

    /// YAML file with host specific origin certificate secrets.
    #[arg(long)]
    origin_secret_config: Option<PathBuf>,

    #[arg(long)]
    metrics_enable: bool,

    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_address: SocketAddr,

    /// Maximum number of concurrent metrics requests.
    #[arg(long, default_value_t = 512)]
    connection_limit: usize,

    /// Base delay between tunnel repair attempts.
    #[arg(long, default_value = "1s", value_parser = duration)]
    repair_delay: Duration,

    /// Jitter as a fraction of the repair delay.
    #[arg(long, default_value_t = REPAIR_JITTER_DEFAULT)]
    repair_jitter: f64,

    /// Number of exponential steps before a tunnel is marked failed.
    #[arg(long, default_value_t = REPAIR_STEPS_DEFAULT)]
    repair_steps: u32,

    #[arg(long, default_value = "10m", value_parser = duration)]
    resync_period: Duration,

    /// Number of tags allowed per tunnel.
    #[arg(long, default_value_t = TAG_LIMIT_DEFAULT)]
    tag_limit: usize,

    /// Restrict resource watches to this namespace.
    #[arg(long)]
    watch_namespace: Option<String>,

    #[arg(long, default_value_t = WORKERS_DEFAULT)]
    workers: usize,

    /// Upper bound for opening, closing or checking a single tunnel.
    #[arg(long, default_value = "30s", value_parser = duration)]
    operation_timeout: Duration,

    #[arg(long, default_value = DEFAULT_CLOUDFLARED_IMAGE)]
    cloudflared_image: String,
}

fn duration(value: &str) -> argot::Result<Duration> {
    parse_duration(value)
}

/// Levels in logrus order (panic, fatal, error, warn, info, debug). Panic and fatal have no
/// `log` counterpart and map to off and error.
fn level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Off,
        1 | 2 => LevelFilter::Error,
        3 => LevelFilter::Warn,
        4 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn version_line(program: Option<String>) -> String {
    let name = program
        .as_deref()
        .and_then(|p| Path::new(p).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("controller");
    format!(
        "{name} {} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

impl CoupleArgs {
    fn config(&self) -> anyhow::Result<ControllerConfig> {
        let secret_groups = match &self.origin_secret_config {
            Some(path) => {
                OriginSecrets::from_file(path)
                    .with_context(|| format!("Failed to load origin secret config `{}`", path.display()))?
                    .groups
            }
            None => Vec::new(),
        };
        let config = ControllerConfig {
            ingress_class: self.ingress_class.clone(),
            default_secret: self.default_origin_secret.clone(),
            secret_groups,
            resync_period: self.resync_period,
            watch_namespace: self.watch_namespace.clone().filter(|ns| !ns.is_empty()),
            workers: self.workers,
            repair: RepairBackoff {
                delay: self.repair_delay,
                jitter: self.repair_jitter,
                steps: self.repair_steps,
            },
            tag_limit: self.tag_limit,
            operation_timeout: self.operation_timeout,
            ..Default::default()
        };
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    async fn client(&self) -> anyhow::Result<Client> {
        let config = if self.incluster {
            Config::incluster().context("Failed to load in-cluster configuration")?
        } else if let Some(path) = &self.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig `{}`", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Invalid kubeconfig")?
        } else {
            Config::infer().await.context("Failed to infer Kubernetes configuration")?
        };
        Client::try_from(config).context("Failed to create Kubernetes client")
    }
}

async fn couple(args: CoupleArgs) -> anyhow::Result<()> {
    let config = args.config()?;
    let client = args.client().await?;
    info!(
        "Coupling Ingresses of class `{}` in {}",
        config.ingress_class,
        config
            .watch_namespace
            .as_deref()
            .map_or("all namespaces".to_string(), |ns| format!("namespace `{ns}`"))
    );
    if config.default_secret.is_none() && config.secret_groups.is_empty() {
        warn!("No origin secrets configured, every Ingress will be rejected");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.cancel();
        }
    });

    let metrics = Arc::new(Metrics::new()?);
    let metrics_listener = if args.metrics_enable {
        let listener = metrics::bind(args.metrics_address)
            .await
            .with_context(|| format!("Cannot open metrics listener on `{}`", args.metrics_address))?;
        Some(listener)
    } else {
        None
    };
    let transport = Arc::new(DeploymentTransport::new(client.clone(), args.cloudflared_image.clone()));
    let events = SimpleEventRecorder::from_client(client.clone(), "argot-controller");

    // Stopped only after the engine has torn down every tunnel.
    let watches_stop = CancellationToken::new();
    let queue = Arc::new(WorkQueue::new());
    let resolver = SecretResolver::new(&config.secret_groups, config.default_secret.clone())
        .context("Invalid origin secret configuration")?;
    let (cache, mut watches) = KubeCache::start(client, &config, resolver, queue.clone(), watches_stop.clone());
    info!("Waiting for the initial sync of watched resources");
    tokio::select! {
        ready = cache.wait_until_ready() => ready.context("Watches stopped before the initial sync")?,
        _ = shutdown.cancelled() => {
            watches_stop.cancel();
            return Ok(());
        }
    }

    let failure_watch = tokio::spawn({
        let (transport, stop) = (transport.clone(), watches_stop.clone());
        async move { transport.watch_failures(stop).await }
    });
    let metrics_server = metrics_listener.map(|listener| {
        tokio::spawn(metrics::serve(
            metrics.clone(),
            listener,
            args.connection_limit,
            shutdown.clone(),
        ))
    });

    let controller = Controller::new(config, queue, Arc::new(cache), transport, metrics)?.with_events(events);
    controller.run(shutdown).await?;

    watches_stop.cancel();
    while let Some(result) = watches.join_next().await {
        if let Err(e) = result {
            warn!("Watch terminated abnormally: {e}");
        }
    }
    if let Err(e) = failure_watch.await {
        warn!("Tunnel failure watch terminated abnormally: {e}");
    }
    if let Some(server) = metrics_server {
        match server.await {
            Ok(Err(e)) => error!("Metrics server failed: {e}"),
            Err(e) => warn!("Metrics server terminated abnormally: {e}"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(level(args.verbosity))
        .parse_default_env()
        .init();

    match args.command {
        Command::Version => {
            println!("{}", version_line(std::env::args().next()));
            Ok(())
        }
        Command::Couple(couple_args) => couple(couple_args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_verbosity_logs_warnings() {
        assert_eq!(level(3), LevelFilter::Warn);
        assert_eq!(level(0), LevelFilter::Off);
        assert_eq!(level(4), LevelFilter::Info);
        assert_eq!(level(5), LevelFilter::Debug);
    }

    #[test]
    fn version_names_program_and_platform() {
        let line = version_line(Some("/usr/local/bin/argot".into()));
        assert_eq!(
            line,
            format!(
                "argot {} {}/{}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            )
        );
        assert!(version_line(None).starts_with("controller "));
    }
}
