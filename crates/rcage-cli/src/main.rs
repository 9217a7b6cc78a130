//! rcage CLI
//!
//! Runs R snippets through a session pool, either one-shot or as a
//! JSON-lines gateway on stdin/stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rcage::{
    CodeValidator, Config, EXAMPLE_CONFIG, ExecuteOptions, ExecutionResult, Gateway, Row,
    ServerMessage, SessionPool, Verdict,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rcage")]
#[command(about = "Run untrusted R snippets in pooled interpreter sessions")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: rcage.toml)
        #[arg(short, long, default_value = "rcage.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Serve JSON-lines requests on stdin, replies on stdout
    Serve {
        /// Session id for this connection (default: derived from the pid)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Run an R file
    Run {
        /// R source file
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// JSON file with an array of row objects, bound to `data`
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Session id
        #[arg(short, long, default_value = "cli")]
        session: String,

        /// Wall-clock timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Generate code from a prompt and run it
    Prompt {
        /// Natural-language request, e.g. "histogram of price"
        text: String,

        /// JSON file with an array of row objects, bound to `data`
        #[arg(short, long)]
        data: PathBuf,

        /// Wall-clock timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Validate an R file without running it
    Check {
        /// R source file
        #[arg(value_name = "FILE")]
        source: PathBuf,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // stdout carries results and gateway replies
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Init { output, force } = &cli.command {
        return init_config(output, *force).await;
    }

    if let Some(path) = &cli.config {
        info!(?path, "loading configuration");
    } else {
        debug!("using default configuration");
    }
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Serve { session } => serve(&config, session).await,
        Commands::Run {
            source,
            data,
            session,
            timeout_ms,
        } => run_file(&config, &source, data.as_deref(), &session, timeout_ms).await,
        Commands::Prompt {
            text,
            data,
            timeout_ms,
        } => run_prompt(&config, &text, &data, timeout_ms).await,
        Commands::Check { source } => check_file(&config, &source).await,
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn serve(config: &Config, session: Option<String>) -> Result<()> {
    let pool = Arc::new(SessionPool::new(config));
    if !pool.initialize().await {
        warn!("serving without an interpreter; executions will be refused");
    }
    let gateway = Gateway::new(pool.clone());
    let session_id = session.unwrap_or_else(|| format!("cli-{}", std::process::id()));

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let mut line = serde_json::to_vec(&message).context("failed to encode reply")?;
            line.push(b'\n');
            stdout.write_all(&line).await.context("failed to write reply")?;
            stdout.flush().await.context("failed to flush stdout")?;
        }
        anyhow::Ok(())
    });

    let _ = tx
        .send(ServerMessage::Connected {
            session_id: session_id.clone(),
        })
        .await;
    info!(session = %session_id, "serving on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let gateway = gateway.clone();
                    let tx = tx.clone();
                    let session_id = session_id.clone();
                    tasks.spawn(async move {
                        gateway.handle_raw(&session_id, &line, &tx).await;
                    });
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                interrupted = true;
                break;
            }
        }
    }

    // on EOF let in-flight requests finish; on interrupt cut them short
    if interrupted {
        pool.cleanup().await;
        while tasks.join_next().await.is_some() {}
    } else {
        while tasks.join_next().await.is_some() {}
        pool.cleanup().await;
    }

    drop(tx);
    writer.await.context("reply writer panicked")??;
    Ok(())
}

async fn run_file(
    config: &Config,
    source: &Path,
    data: Option<&Path>,
    session: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let code = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;

    let mut options = ExecuteOptions::new();
    if let Some(path) = data {
        options = options.with_data(read_rows(path).await?);
    }
    if let Some(ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    let pool = start_pool(config).await?;
    info!(session, "running file");
    let result = pool.execute_code(session, &code, options).await;
    pool.cleanup().await;

    report(&result.context("execution failed")?)
}

async fn run_prompt(
    config: &Config,
    text: &str,
    data: &Path,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let mut options = ExecuteOptions::new().with_data(read_rows(data).await?);
    if let Some(ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    let pool = start_pool(config).await?;
    let outcome = pool.execute_prompt("cli", text, options).await;
    pool.cleanup().await;

    let outcome = outcome.context("prompt execution failed")?;
    eprintln!("# generated code\n{}", outcome.code.trim_end());
    report(&outcome.result)
}

async fn check_file(config: &Config, source: &Path) -> Result<()> {
    let code = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;

    let validator = CodeValidator::new(&config.validator);
    match validator.validate(&code) {
        Verdict::Safe => {
            println!("OK");
            Ok(())
        }
        Verdict::Unsafe(violation) => {
            println!("Rejected ({:?}): {}", violation.category, violation.reason);
            std::process::exit(1);
        }
    }
}

async fn start_pool(config: &Config) -> Result<Arc<SessionPool>> {
    let pool = Arc::new(SessionPool::new(config));
    if !pool.initialize().await {
        anyhow::bail!(
            "interpreter '{}' is not available; install R or set [interpreter].path",
            config.interpreter.path
        );
    }
    Ok(pool)
}

async fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read data file '{}'", path.display()))?;
    serde_json::from_str(&content).context("data file must be a JSON array of objects")
}

fn report(result: &ExecutionResult) -> Result<()> {
    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }

    info!(
        elapsed = format_args!("{:.3}s", result.elapsed.as_secs_f64()),
        inline_image = result.has_inline_image(),
        "execution result"
    );

    if let Some(error) = result.reported_error() {
        debug!(error, "code raised an error");
        std::process::exit(1);
    }
    Ok(())
}

fn show_config(config: &Config) {
    println!("Interpreter:");
    println!("  Path: {}", config.interpreter.path);
    println!("  Args: {:?}", config.interpreter.args);
    println!("  Memory limit: {}", config.interpreter.memory_limit);
    println!("  Start timeout: {:?}", config.interpreter.start_timeout());
    println!();
    println!("Pool:");
    println!("  Max sessions: {}", config.pool.max_sessions);
    println!("  Idle timeout: {:?}", config.pool.idle_timeout());
    println!("  Reap interval: {:?}", config.pool.reap_interval());
    println!("  Shutdown grace: {:?}", config.pool.shutdown_grace());
    println!();
    println!("Session:");
    println!("  Default timeout: {:?}", config.session.default_timeout());
    println!();
    println!("Validator:");
    println!("  Max code length: {}", config.validator.max_code_length);
    println!(
        "  Extra allowed packages: {:?}",
        config.validator.extra_allowed_packages
    );
    println!(
        "  Extra denied functions: {:?}",
        config.validator.extra_denied_functions
    );
}

async fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
