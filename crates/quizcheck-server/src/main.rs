//! `quizcheck`: serve, query and exercise the checker.
//!
//! # Examples
//!
//! ```bash
//! # Serve the checks under ./testbank on the default port
//! quizcheck serve --testbank ./testbank
//!
//! # Grade a file against a running service
//! quizcheck check --addr http://127.0.0.1:32453 --id add_ok solution.py
//!
//! # Grade locally, without a service
//! quizcheck run --testbank ./testbank --id add_ok < solution.py
//!
//! # Show what a test bank contains
//! quizcheck list --testbank ./testbank
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use quizcheck::{CheckRegistry, CheckRequest, CheckResult};
use quizcheck_server::{Admission, CheckerService, Client, EngineArgs, LogFormat, ServeArgs};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Grade untrusted Python submissions against registered checks.
#[derive(Parser, Debug)]
#[command(name = "quizcheck")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log format
    #[arg(long, global = true, env = "QUIZCHECK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Logfmt)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gRPC checker service
    Serve(ServeArgs),
    /// Grade a submission on a running service
    Check(CheckArgs),
    /// Grade a submission locally, without a service
    Run(RunArgs),
    /// List the checks in a test bank
    List(ListArgs),
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Service address
    #[arg(long, env = "QUIZCHECK_ADDR", default_value = "http://127.0.0.1:32453")]
    addr: String,

    /// Check id
    #[arg(long)]
    id: String,

    /// Source file (reads stdin when omitted)
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    engine: EngineArgs,

    /// Check id
    #[arg(long)]
    id: String,

    /// Source file (reads stdin when omitted)
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Test bank directories or files (repeatable, or comma separated)
    #[arg(long = "testbank", env = "QUIZCHECK_TESTBANK", value_delimiter = ',', required = true)]
    testbank: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let otlp_endpoint = match &cli.command {
        Command::Serve(args) => args.otlp_endpoint.clone(),
        _ => None,
    };
    let _telemetry = quizcheck_server::telemetry::init(cli.log_format, otlp_endpoint.as_deref())?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Check(args) => check(args).await,
        Command::Run(args) => run(args).await,
        Command::List(args) => list(&args),
    }
}

async fn serve(args: ServeArgs) -> Result<ExitCode> {
    if let Some(addr) = args.metrics_listen {
        quizcheck_server::telemetry::install_metrics(addr)?;
    }

    let sandbox = args.engine.sandbox()?;
    match sandbox.interpreter_version().await {
        Ok(version) => tracing::info!(python = %sandbox.python().display(), %version, "Using interpreter"),
        Err(e) => tracing::warn!(error = %e, "Interpreter is not runnable, every request will fail"),
    }

    let registry = Arc::new(args.engine.load_registry()?);
    metrics::gauge!("quizcheck_checks_loaded").set(registry.len() as f64);
    let grader = quizcheck::Grader::new(Arc::clone(&registry), Arc::new(sandbox))
        .with_time_bounds(args.engine.time_bounds());

    let admission = Arc::new(Admission::new(args.max_in_flight(), args.admission_policy()));
    tracing::info!(
        checks = registry.len(),
        max_in_flight = admission.limit(),
        policy = ?admission.policy(),
        "Starting checker service"
    );
    let service =
        CheckerService::new(grader, Arc::clone(&admission), args.engine.request_limits());

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(log_failure(
        "signal handler",
        handle_signals(registry, shutdown.clone()),
    ));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let served = quizcheck_server::serve(listener, service, shutdown.clone()).await;

    shutdown.cancel();
    admission.close();
    if let Err(e) = signals.await {
        tracing::warn!(error = %e, "Signal handler task failed");
    }
    served.context("checker service failed")?;
    tracing::info!("Checker service stopped");
    Ok(ExitCode::SUCCESS)
}

/// Await `task`, logging its error as soon as it fails rather than when
/// someone joins it.
async fn log_failure<F>(name: &'static str, task: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = task.await;
    if let Err(e) = &result {
        tracing::error!(task = name, error = %format!("{e:#}"), "Background task stopped early");
    }
    result
}

/// SIGHUP reloads the test bank; SIGINT and SIGTERM begin a graceful shutdown.
async fn handle_signals(registry: Arc<CheckRegistry>, shutdown: CancellationToken) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                let registry = Arc::clone(&registry);
                match tokio::task::spawn_blocking(move || registry.reload()).await {
                    Ok(Ok(checks)) => {
                        metrics::gauge!("quizcheck_checks_loaded").set(checks.len() as f64);
                    }
                    Ok(Err(e)) => tracing::error!(error = %e, "Reload failed, keeping previous test bank"),
                    Err(e) => tracing::error!(error = %e, "Reload task failed"),
                }
            }
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            () = shutdown.cancelled() => return Ok(()),
        }
    }
    tracing::info!("Shutdown requested, draining in-flight requests");
    shutdown.cancel();
    Ok(())
}

async fn check(args: CheckArgs) -> Result<ExitCode> {
    let source = read_source(args.file.as_deref())?;
    let mut client = Client::connect(args.addr).await?;
    let result = client.run_tests(args.id, source).await?;
    Ok(report(&result))
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let source = read_source(args.file.as_deref())?;
    let request = CheckRequest::new(args.id, source);
    args.engine.request_limits().validate(&request)?;

    let grader = args.engine.grader()?;
    let result = grader.grade(&request).await;
    Ok(report(&result))
}

fn list(args: &ListArgs) -> Result<ExitCode> {
    let mut bank = quizcheck::TestBank::new();
    for path in &args.testbank {
        bank.add_path(path)?;
    }
    let checks = bank.load()?;
    for check in checks.iter() {
        let mut line = check.id.clone();
        if !check.aliases.is_empty() {
            line.push_str(&format!(" ({})", check.aliases.join(", ")));
        }
        if let Some(description) = &check.description {
            line.push_str(&format!("  {description}"));
        }
        println!("{line}");
    }
    for group in checks.groups() {
        let mut line = format!("{}  [{}]", group.id, group.checks.join(", "));
        if let Some(description) = &group.description {
            line.push_str(&format!("  {description}"));
        }
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}

fn read_source(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("failed to read source from stdin")?;
            Ok(source)
        }
    }
}

/// Print the verdict; the exit code is the status code.
fn report(result: &CheckResult) -> ExitCode {
    print!("{}", result.response);
    if !result.response.is_empty() && !result.response.ends_with('\n') {
        println!();
    }
    if !result.status.is_success() {
        eprintln!("{}: {}", result.status, result.error_text());
    }
    if let Some(score) = result.score {
        eprintln!("passed {}/{}", score.passed, score.total);
    }
    ExitCode::from(u8::try_from(result.status.code()).unwrap_or(u8::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::{self, Write};
    use std::sync::Mutex;
    use std::time::Duration;

    use tracing::instrument::WithSubscriber;

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn early_task_failure_is_logged_without_a_join() {
        let sink = Sink::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let sink = sink.clone();
                move || sink.clone()
            })
            .with_ansi(false)
            .finish();

        let task = tokio::spawn(
            log_failure("signal handler", async {
                Err(anyhow::anyhow!("no signal driver")).context("failed to install SIGHUP handler")
            })
            .with_subscriber(subscriber),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sink.text().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "nothing was logged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let logged = sink.text();
        assert!(logged.contains("ERROR"), "{logged}");
        assert!(logged.contains("signal handler"), "{logged}");
        assert!(logged.contains("failed to install SIGHUP handler: no signal driver"), "{logged}");

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn clean_exit_logs_nothing() {
        let sink = Sink::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let sink = sink.clone();
                move || sink.clone()
            })
            .finish();
        log_failure("signal handler", async { Ok(()) })
            .with_subscriber(subscriber)
            .await
            .unwrap();
        assert!(sink.text().is_empty());
    }
}
