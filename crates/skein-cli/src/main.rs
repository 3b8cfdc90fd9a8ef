//! # Skein CLI Entry Point
//!
//! Main binary for the skein task coordinator. Runs a coordinator or makes a
//! single task call through one.
//!
//! ## Usage
//!
//! ```bash
//! # Start a coordinator on the default namespace
//! skein coordinator --socket-dir /run/skein -b 0.0.0.0:8080
//!
//! # Start one that advertises a public relay URL
//! skein coordinator --advertise-url http://node1.example.com:8080
//!
//! # Call a task through the internal socket (outputs raw JSON)
//! skein call zfs.list -a '{"pool": "tank"}'
//!
//! # Call a task through the external HTTP endpoint
//! skein call --url http://127.0.0.1:8080 ping
//! ```
//!
//! ## Logging
//!
//! `coordinator` logs at `info` by default; set `RUST_LOG` to override.
//! `call` never logs so its stdout stays pipeable.

use anyhow::Result;
use argh::FromArgs;
use skein_client::SkeinClient;
use skein_coordinator::{Coordinator, CoordinatorConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted when `--advertise-url` is not given.
const ADVERTISE_URL_ENV: &str = "SKEIN_ADVERTISE_URL";

/// Validates that a URL string starts with http:// or https://
///
/// # Arguments
///
/// * `url` - The URL string to validate
/// * `description` - Human-readable description of what the URL is for (e.g., "advertise URL")
fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

#[derive(FromArgs)]
/// skein - asynchronous task coordinator
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Coordinator**: run the request router, tracker and stream relay
/// - **Call**: run one task and print its result (unix-friendly JSON output)
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Coordinator(CoordinatorArgs),
    Call(CallArgs),
}

/// Arguments for starting a coordinator.
///
/// The coordinator binds its internal socket at
/// `<socket-dir>/coordinator/<service>.sock`, its response socket at
/// `<socket-dir>/response/<service>.sock`, and the external HTTP endpoint
/// on `--bind`. Providers are discovered under `<socket-dir>/<task>/`.
///
/// # Example
///
/// ```bash
/// skein coordinator --socket-dir /run/skein -b 0.0.0.0:8080 --request-timeout-ms 60000
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "coordinator")]
/// start a skein coordinator
struct CoordinatorArgs {
    /// root of the socket namespace shared with providers
    #[argh(option, short = 'd', long = "socket-dir", default = "\"/run/skein\".into()")]
    socket_dir: String,

    /// service name the coordinator's own sockets are named after
    #[argh(option, short = 's', long = "service", default = "\"coordinator\".into()")]
    service: String,

    /// address to bind the external HTTP endpoint to
    ///
    /// Defaults to "0.0.0.0:8080" for accessibility from other machines.
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// externally reachable base URL used in relayed stream addresses
    ///
    /// Overrides auto-detection. If not set, tries SKEIN_ADVERTISE_URL env
    /// var, then derives it from the bound address.
    #[argh(option, long = "advertise-url")]
    advertise_url: Option<String>,

    /// completion bound in milliseconds for requests without their own
    #[argh(option, long = "request-timeout-ms", default = "30000")]
    request_timeout_ms: u64,

    /// how often expired requests are reclaimed, in milliseconds
    #[argh(option, long = "sweep-interval-ms", default = "1000")]
    sweep_interval_ms: u64,

    /// bound in milliseconds on handing a request to one provider
    #[argh(option, long = "transmit-timeout-ms", default = "5000")]
    transmit_timeout_ms: u64,

    /// how long in-flight HTTP connections may drain on shutdown, in milliseconds
    #[argh(option, long = "drain-timeout-ms", default = "10000")]
    drain_timeout_ms: u64,

    /// how long a stream producer may stall before the stream is dropped, in milliseconds
    #[argh(option, long = "stream-idle-timeout-ms", default = "30000")]
    stream_idle_timeout_ms: u64,
}

/// Arguments for running a single task.
///
/// Outputs the task's result as raw JSON (no pretty-printing) to stdout.
/// A streamed result prints `{"stream_url": ...}` instead. Errors go to
/// stderr with a non-zero exit code.
///
/// # Examples
///
/// ```bash
/// skein call ping
/// skein call zfs.list -a '{"pool": "tank"}' | jq '.datasets'
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// run a task through a coordinator
struct CallArgs {
    /// name of the task to run
    #[argh(positional)]
    task: String,

    /// JSON string containing arguments for the task
    ///
    /// Defaults to `{}`.
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,

    /// root of the socket namespace the coordinator runs in
    #[argh(option, short = 'd', long = "socket-dir", default = "\"/run/skein\".into()")]
    socket_dir: String,

    /// service name of the coordinator to call
    #[argh(option, short = 's', long = "service", default = "\"coordinator\".into()")]
    service: String,

    /// external URL of the coordinator; uses the internal socket when unset
    #[argh(option, long = "url")]
    url: Option<String>,

    /// how long to wait for the final result, in milliseconds
    #[argh(option, short = 't', long = "timeout-ms", default = "30000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call keeps stdout clean for piping into jq and friends
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Coordinator(args) => run_coordinator(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

/// Builds the coordinator configuration from flags.
///
/// Advertise URL priority: flag > `env_advertise` > derived at start from
/// the bound address.
fn coordinator_config(args: &CoordinatorArgs, env_advertise: Option<String>) -> Result<CoordinatorConfig> {
    let external_addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let advertise_url = args.advertise_url.clone().or(env_advertise);
    if let Some(url) = &advertise_url {
        validate_http_url(url, "advertise URL")?;
    }

    let config = CoordinatorConfig {
        socket_dir: PathBuf::from(&args.socket_dir),
        service_name: args.service.clone(),
        external_addr,
        advertise_url,
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        transmit_timeout: Duration::from_millis(args.transmit_timeout_ms),
        drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        stream_idle_timeout: Duration::from_millis(args.stream_idle_timeout_ms),
    };
    config.validate()?;
    Ok(config)
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<()> {
    let config = coordinator_config(&args, std::env::var(ADVERTISE_URL_ENV).ok())?;
    tracing::info!("Starting skein coordinator '{}'", config.service_name);
    tracing::info!("Socket namespace: {}", config.socket_dir.display());

    let coordinator = Coordinator::new(config)?;
    let addr = coordinator.start().await?;
    tracing::info!("External endpoint listening on {}", addr);

    coordinator.stop_on_signal().await?;
    Ok(())
}

/// Executes the `call` subcommand.
///
/// No tracing is initialized for this command.
async fn run_call(args: CallArgs) -> Result<()> {
    let args_value: serde_json::Value = serde_json::from_str(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;

    let client = match &args.url {
        Some(url) => {
            validate_http_url(url, "coordinator URL")?;
            SkeinClient::external(url.clone())?
        }
        None => SkeinClient::internal(&args.socket_dir, &args.service)?,
    }
    .with_timeout(Duration::from_millis(args.timeout_ms));

    let response = client.call(&args.task, args_value).await?;
    let output = match (response.result, response.stream_url) {
        (Some(result), _) => result,
        (None, Some(stream_url)) => serde_json::json!({ "stream_url": stream_url }),
        (None, None) => serde_json::Value::Null,
    };

    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;

    fn parse_coordinator(args: &[&str]) -> CoordinatorArgs {
        let mut full = vec!["coordinator"];
        full.extend_from_slice(args);
        match Cli::from_args(&["skein"], &full).unwrap().command {
            Commands::Coordinator(args) => args,
            _ => panic!("Expected Coordinator command"),
        }
    }

    #[test]
    fn test_cli_parse_coordinator_defaults() {
        let args = parse_coordinator(&[]);
        assert_eq!(args.socket_dir, "/run/skein");
        assert_eq!(args.service, "coordinator");
        assert_eq!(args.bind, "0.0.0.0:8080");
        assert!(args.advertise_url.is_none());
        assert_eq!(args.request_timeout_ms, 30000);
        assert_eq!(args.sweep_interval_ms, 1000);
        assert_eq!(args.transmit_timeout_ms, 5000);
        assert_eq!(args.drain_timeout_ms, 10000);
        assert_eq!(args.stream_idle_timeout_ms, 30000);
    }

    #[test]
    fn test_cli_parse_coordinator_flags() {
        let args = parse_coordinator(&[
            "-d", "/tmp/skein",
            "-s", "edge",
            "-b", "127.0.0.1:9000",
            "--advertise-url", "http://node1:9000",
            "--request-timeout-ms", "5000",
        ]);
        assert_eq!(args.socket_dir, "/tmp/skein");
        assert_eq!(args.service, "edge");
        assert_eq!(args.bind, "127.0.0.1:9000");
        assert_eq!(args.advertise_url, Some("http://node1:9000".to_string()));
        assert_eq!(args.request_timeout_ms, 5000);
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(&["skein"], &["call", "ping"]).unwrap();
        match args.command {
            Commands::Call(CallArgs { task, args, socket_dir, service, url, timeout_ms }) => {
                assert_eq!(task, "ping");
                assert_eq!(args, "{}"); // default
                assert_eq!(socket_dir, "/run/skein");
                assert_eq!(service, "coordinator");
                assert!(url.is_none());
                assert_eq!(timeout_ms, 30000);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_external() {
        let args: Cli = Cli::from_args(&["skein"], &[
            "call",
            "zfs.list",
            "-a", "{\"pool\":\"tank\"}",
            "--url", "http://127.0.0.1:8080",
            "-t", "500",
        ]).unwrap();
        match args.command {
            Commands::Call(CallArgs { task, args, url, timeout_ms, .. }) => {
                assert_eq!(task, "zfs.list");
                assert_eq!(args, "{\"pool\":\"tank\"}");
                assert_eq!(url, Some("http://127.0.0.1:8080".to_string()));
                assert_eq!(timeout_ms, 500);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_call_requires_task() {
        assert!(Cli::from_args(&["skein"], &["call"]).is_err());
    }

    #[test]
    fn test_advertise_url_priority() {
        let flagged = parse_coordinator(&["--advertise-url", "http://flag:1"]);
        let config = coordinator_config(&flagged, Some("http://env:2".into())).unwrap();
        assert_eq!(config.advertise_url.as_deref(), Some("http://flag:1"));

        let plain = parse_coordinator(&[]);
        let config = coordinator_config(&plain, Some("http://env:2".into())).unwrap();
        assert_eq!(config.advertise_url.as_deref(), Some("http://env:2"));

        let config = coordinator_config(&plain, None).unwrap();
        assert!(config.advertise_url.is_none());
    }

    #[test]
    fn test_coordinator_config_rejects_bad_input() {
        assert!(coordinator_config(&parse_coordinator(&["-b", "not-an-addr"]), None).is_err());
        assert!(coordinator_config(&parse_coordinator(&["--advertise-url", "node1:8080"]), None).is_err());
        assert!(coordinator_config(&parse_coordinator(&["-d", "relative/dir"]), None).is_err());
        assert!(coordinator_config(&parse_coordinator(&["--sweep-interval-ms", "0"]), None).is_err());
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:8080", "test").is_ok());
        assert!(validate_http_url("https://example.com", "test").is_ok());
        assert!(validate_http_url("127.0.0.1:8080", "test").is_err());
    }
}
