use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::gate::{Handler, Request, RequestGate, StatusHandler};
use turnstile::ratelimit::{KeyedLimiterRegistry, RuleSet};

/// Token-bucket admission control for HTTP requests.
///
/// Reads `<ip> <method> <path>` lines from stdin, runs each through the gate
/// and prints the outcome as a JSON object per line.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version)]
struct Cli {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule file; overrides `rules.path` from the configuration
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Validate the configuration and rules, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config)?;

    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules_path = cli
        .rules
        .or_else(|| config.rules.path.clone())
        .context("no rule file given; pass --rules or set rules.path")?;
    let rules = RuleSet::from_file(&rules_path)
        .with_context(|| format!("failed to load rules from {}", rules_path.display()))?;

    if cli.check {
        println!(
            "{}: {} rule(s), {} whitelist range(s)",
            rules_path.display(),
            rules.len(),
            rules.whitelist().len()
        );
        return Ok(());
    }

    let registry = Arc::new(KeyedLimiterRegistry::with_key_warning_threshold(
        config.registry.key_warning_threshold,
    ));
    let gate = RequestGate::new(registry, Arc::new(rules), StatusHandler::default())
        .with_whitelist_scope(config.rules.whitelist_scope);
    info!(whitelist_scope = ?config.rules.whitelist_scope, "Request gate ready");

    let lines = spawn_stdin_reader()?;
    let mut stdout = io::stdout().lock();
    serve(&gate, lines, &mut stdout, shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(config: &TurnstileConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("turnstile={}", config.logging.level).parse()?);

    // Decisions go to stdout, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Read stdin on a dedicated thread.
///
/// A blocked read cannot be cancelled, so it must not live on the runtime's
/// blocking pool: the runtime would wait for it on shutdown. The thread is
/// left behind when the process exits.
fn spawn_stdin_reader() -> io::Result<mpsc::Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel(STDIN_BUFFER);
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

const STDIN_BUFFER: usize = 64;

/// Replay request lines until the input ends or `shutdown` resolves.
async fn serve<H, W, F>(
    gate: &RequestGate<H>,
    lines: mpsc::Receiver<io::Result<String>>,
    out: &mut W,
    shutdown: F,
) -> anyhow::Result<()>
where
    H: Handler,
    W: Write,
    F: Future<Output = ()>,
{
    tokio::select! {
        result = replay_lines(gate, lines, out) => result,
        _ = shutdown => Ok(()),
    }
}

/// Feed request lines through the gate, writing one JSON record per request.
async fn replay_lines<H: Handler, W: Write>(
    gate: &RequestGate<H>,
    mut lines: mpsc::Receiver<io::Result<String>>,
    out: &mut W,
) -> anyhow::Result<()> {
    while let Some(line) = lines.recv().await {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request = match parse_request_line(line) {
            Ok(request) => request,
            Err(reason) => {
                warn!(line = %line, reason = %reason, "Skipping malformed request line");
                continue;
            }
        };

        let mut record = serde_json::json!({
            "client": request.client_ip.to_string(),
            "method": request.method,
            "path": request.path,
        });
        let response = gate.handle(request).await;
        record["response"] = serde_json::to_value(&response)?;
        writeln!(out, "{}", record)?;
    }

    Ok(())
}

fn parse_request_line(line: &str) -> Result<Request, String> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(ip), Some(method), Some(path), None) => {
            let ip = ip
                .parse()
                .map_err(|e| format!("invalid client address '{}': {}", ip, e))?;
            Ok(Request::new(ip, method, path))
        }
        _ => Err("expected '<ip> <method> <path>'".to_string()),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let request = parse_request_line("10.0.0.1 GET /api/users").unwrap();

        assert_eq!(request.client_ip.to_string(), "10.0.0.1");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/users");
    }

    #[test]
    fn test_parse_request_line_rejects_bad_input() {
        assert!(parse_request_line("10.0.0.1 GET").is_err());
        assert!(parse_request_line("10.0.0.1 GET / extra").is_err());
        assert!(parse_request_line("not-an-ip GET /").is_err());
    }

    fn test_gate() -> RequestGate<StatusHandler> {
        let rules = RuleSet::parse("ratelimit GET 1 1 hour").unwrap();
        RequestGate::new(
            Arc::new(KeyedLimiterRegistry::new()),
            Arc::new(rules),
            StatusHandler::default(),
        )
    }

    fn records(out: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_replay_until_input_ends() {
        let gate = test_gate();
        let (tx, rx) = mpsc::channel(8);
        for line in ["10.0.0.1 GET /", "# comment", "garbage", "10.0.0.1 GET /"] {
            tx.send(Ok(line.to_string())).await.unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        serve(&gate, rx, &mut out, std::future::pending()).await.unwrap();

        let records = records(&out);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["response"]["status"], 200);
        assert_eq!(records[1]["response"]["status"], 429);
        assert_eq!(records[1]["client"], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_shutdown_stops_replay_while_input_stays_open() {
        let gate = test_gate();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok("10.0.0.1 GET /".to_string())).await.unwrap();

        let mut out = Vec::new();
        let shutdown = tokio::time::sleep(std::time::Duration::from_millis(50));
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            serve(&gate, rx, &mut out, shutdown),
        )
        .await
        .expect("shutdown should end the replay")
        .unwrap();

        assert_eq!(records(&out).len(), 1);
        // Input stayed open until here, so only the shutdown ended the replay
        drop(tx);
    }

    #[tokio::test]
    async fn test_read_error_ends_replay() {
        let gate = test_gate();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Err(io::Error::new(io::ErrorKind::InvalidData, "not utf-8")))
            .await
            .unwrap();

        let mut out = Vec::new();
        assert!(serve(&gate, rx, &mut out, std::future::pending()).await.is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["turnstile", "--rules", "rules.conf", "--check"]);

        assert_eq!(cli.rules, Some(PathBuf::from("rules.conf")));
        assert!(cli.config.is_none());
        assert!(cli.check);
    }
}
