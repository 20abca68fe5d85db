use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turnstile::config::{GatewayConfig, LoggingConfig};
use turnstile::gateway::{EchoForwarder, GatewayContext, InboundRequest, Method};

#[derive(Parser)]
#[command(name = "turnstile")]
#[command(version)]
#[command(about = "Rate-limited, caching request gateway", long_about = None)]
struct Cli {
    /// YAML configuration file; TURNSTILE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive requests for one principal through the gateway against a simulated downstream
    Simulate(SimulateArgs),

    /// Check the rate limit store and the response cache
    Health,

    /// Print the effective configuration and exit
    CheckConfig,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// API key of the calling principal
    #[arg(short, long)]
    principal: String,

    /// Logical request path
    #[arg(long, default_value = "api/v1/resource")]
    path: String,

    /// Request method
    #[arg(short, long, default_value = "GET")]
    method: Method,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value = "10")]
    requests: u32,

    /// Pause between requests in milliseconds
    #[arg(long, default_value = "0")]
    interval_ms: u64,

    /// Simulated downstream latency in milliseconds
    #[arg(long, default_value = "0")]
    latency_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);
    log_config_source(cli.config.as_deref());

    match cli.command {
        Commands::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Health => health(config).await,
        Commands::Simulate(args) => simulate(config, args).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Logs go to stderr so stdout stays machine-readable
    if logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Configuration is loaded before the subscriber exists, so its origin is
/// reported afterwards.
fn log_config_source(path: Option<&Path>) {
    match path {
        Some(path) => info!(path = %path.display(), "Loaded gateway configuration"),
        None => info!("Loaded gateway configuration from defaults and environment"),
    }
}

async fn health(config: GatewayConfig) -> anyhow::Result<()> {
    let context = GatewayContext::connect(config).await?;
    let report = context.gateway(Arc::new(EchoForwarder::new())).health().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    context.shutdown().await;

    if report.status != "ok" {
        anyhow::bail!("gateway is {}", report.status);
    }
    Ok(())
}

async fn simulate(config: GatewayConfig, args: SimulateArgs) -> anyhow::Result<()> {
    info!("Starting Turnstile simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let context = GatewayContext::connect(config).await?;
    let latency = Duration::from_millis(args.latency_ms);
    let forwarder = Arc::new(EchoForwarder::with_latency(latency));
    let gateway = context.gateway(forwarder);
    let interval = Duration::from_millis(args.interval_ms);

    let run = async {
        for n in 1..=args.requests {
            let request = InboundRequest::new(&args.principal, args.method, &args.path);
            match gateway.handle(request).await {
                Ok(admission) => println!("{}", serde_json::to_string(&admission)?),
                Err(e) => {
                    error!(request = n, error = %e, "Request failed");
                    let line = serde_json::json!({ "outcome": "error", "error": e.to_string() });
                    println!("{}", line);
                }
            }

            if n < args.requests && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = run => result?,
        _ = shutdown_signal() => warn!("Simulation interrupted"),
    }

    match context.cache().get_stats().await {
        Ok(stats) => {
            let line = serde_json::json!({ "cache": stats, "hit_ratio": stats.hit_ratio() });
            println!("{}", line);
        }
        Err(e) => warn!(error = %e, "Failed to read cache statistics"),
    }

    context.shutdown().await;
    info!("Turnstile simulation finished");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;

    /// In-memory log sink.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logged(f: impl FnOnce()) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, f);

        let bytes = captured.0.lock().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_config_source_is_logged() {
        let output = logged(|| log_config_source(Some(Path::new("/etc/turnstile.yaml"))));
        assert!(output.contains("Loaded gateway configuration"));
        assert!(output.contains("/etc/turnstile.yaml"));

        let output = logged(|| log_config_source(None));
        assert!(output.contains("defaults and environment"));
    }

    #[test]
    fn test_config_flag_is_global() {
        let cli = Cli::try_parse_from(["turnstile", "health", "--config", "gw.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gw.yaml")));
        assert!(matches!(cli.command, Commands::Health));
    }

    #[test]
    fn test_simulate_arguments() {
        let cli = Cli::try_parse_from([
            "turnstile",
            "simulate",
            "--principal",
            "user_free_1",
            "--method",
            "post",
            "-n",
            "3",
        ])
        .unwrap();

        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.principal, "user_free_1");
                assert_eq!(args.method, Method::Post);
                assert_eq!(args.requests, 3);
                assert_eq!(args.path, "api/v1/resource");
            }
            _ => panic!("expected simulate"),
        }
    }
}
