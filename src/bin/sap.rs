//! SAP CLI - submit text for analysis and inspect the backend connection
//!
//! Usage:
//!   sap analyze [--text <TEXT>] [--file <FILE.txt>]... [--question <Q>] [OPTIONS]
//!   sap test-connection [OPTIONS]
//!   sap watch [--report-every <SECS>] [OPTIONS]
//!   sap about [OPTIONS]
//!
//! Example:
//!   sap analyze --file essay.txt --question "Is the tone formal?" --export result.json
//!   sap analyze --file a.txt --file b.txt --audit-export audit.json

use anyhow::{Context, Result};
use colored::Colorize;
use sap_client::export::{write_json, ResultExport};
use sap_client::pipeline::{AnalysisInput, RejectReason, SubmitOutcome, UploadedFile};
use sap_client::probe::ConnectionState;
use sap_client::{AnalysisSession, ClientConfig};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_REPORT_EVERY_SECS: u64 = 30;

fn print_usage() {
    eprintln!(
        r#"
{} - Submit text to the analysis backend

{}
    sap <COMMAND> [OPTIONS]

{}
    analyze           Analyze typed text and/or .txt files
    test-connection   Check that the analysis endpoint answers
    watch             Keep the backend connection warm until Ctrl-C
    about             Show the backend readme

{}
    -t, --text <TEXT>          Text to analyze
    -f, --file <FILE.txt>      File to analyze (repeatable, one analysis per file)
    -q, --question <Q>         Optional question sent with the text
    --export <PATH>            Write the last result as JSON
    --audit-export <PATH>      Write the audit ledger as JSON
    --report-every <SECS>      Status line period for watch (default: 30)
    -c, --config <PATH>        TOML configuration file
    -u, --url <URL>            Backend base URL (or set SAP_BACKEND_URL)
    -v, --verbose              Log progress (-vv for debug)
    -h, --help                 Print this help message

{}
    sap analyze --text "Some words to look at"
    sap analyze --file essay.txt --question "Is the tone formal?" --export result.json
    sap test-connection --url http://localhost:8000
"#,
        "SAP CLI".bold(),
        "USAGE:".bold(),
        "COMMANDS:".bold(),
        "OPTIONS:".bold(),
        "EXAMPLES:".bold(),
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Analyze,
    TestConnection,
    Watch,
    About,
}

struct CliArgs {
    command: Command,
    text: Option<String>,
    files: Vec<PathBuf>,
    question: Option<String>,
    export: Option<PathBuf>,
    audit_export: Option<PathBuf>,
    report_every: u64,
    config: Option<PathBuf>,
    url: Option<String>,
    verbose: u8,
}

fn parse_args() -> Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(if args.iter().any(|a| a == "--help" || a == "-h") {
            0
        } else {
            1
        });
    }

    let command = match args[1].as_str() {
        "analyze" => Command::Analyze,
        "test-connection" => Command::TestConnection,
        "watch" => Command::Watch,
        "about" => Command::About,
        other => anyhow::bail!("Unknown command: {other} (try --help)"),
    };

    let mut parsed = CliArgs {
        command,
        text: None,
        files: Vec::new(),
        question: None,
        export: None,
        audit_export: None,
        report_every: DEFAULT_REPORT_EVERY_SECS,
        config: None,
        url: None,
        verbose: 0,
    };

    let mut i = 2;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || -> Result<String> {
            i += 1;
            args.get(i)
                .cloned()
                .with_context(|| format!("Missing value for {flag}"))
        };

        match flag {
            "--text" | "-t" => parsed.text = Some(value()?),
            "--file" | "-f" => parsed.files.push(PathBuf::from(value()?)),
            "--question" | "-q" => parsed.question = Some(value()?),
            "--export" => parsed.export = Some(PathBuf::from(value()?)),
            "--audit-export" => parsed.audit_export = Some(PathBuf::from(value()?)),
            "--report-every" => {
                let raw = value()?;
                parsed.report_every = raw
                    .parse()
                    .with_context(|| format!("Invalid --report-every value: {raw}"))?;
            }
            "--config" | "-c" => parsed.config = Some(PathBuf::from(value()?)),
            "--url" | "-u" => parsed.url = Some(value()?),
            "--verbose" | "-v" => parsed.verbose = parsed.verbose.max(1),
            "-vv" => parsed.verbose = 2,
            other => anyhow::bail!("Unknown option: {other} (try --help)"),
        }
        i += 1;
    }

    Ok(parsed)
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(args: &CliArgs) -> Result<ClientConfig> {
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => ClientConfig::default(),
    };
    let config = config.with_env_overrides();
    Ok(match &args.url {
        Some(url) => config.with_base_url(url.clone()),
        None => config,
    })
}

fn print_result_box(label: &str, outcome: &SubmitOutcome) {
    eprintln!(
        "{}",
        format!("┌─ {label} ─────────────────────────────────────────────────").cyan()
    );
    match outcome {
        SubmitOutcome::Completed(result) => {
            if let Some(code) = &result.verification_code {
                eprintln!("{} {} {}", "│".cyan(), "Verification:".dimmed(), code.green().bold());
            } else {
                eprintln!("{} {}", "│".cyan(), "Not recorded (request failed)".yellow());
            }
            if let Some(data) = &result.technical_data {
                if let Ok(pretty) = serde_json::to_string_pretty(data) {
                    eprintln!("{} {}", "│".cyan(), "Technical data:".dimmed());
                    for line in pretty.lines() {
                        eprintln!("{}   {}", "│".cyan(), line.yellow());
                    }
                }
            }
        }
        SubmitOutcome::Superseded => {
            eprintln!("{} {}", "│".cyan(), "Superseded by a newer submission".yellow());
        }
        SubmitOutcome::Rejected(RejectReason::EmptyInput) => {
            eprintln!("{} {}", "│".cyan(), "Nothing to analyze: input is empty".red());
        }
    }
    eprintln!(
        "{}",
        "└────────────────────────────────────────────────────────────────".cyan()
    );

    if let SubmitOutcome::Completed(result) = outcome {
        println!("{}", result.humanized_text);
    }
    let _ = std::io::stderr().flush();
}

async fn run_analyze(session: &AnalysisSession, args: &CliArgs) -> Result<()> {
    let typed = args.text.clone().unwrap_or_default();
    let mut inputs = Vec::new();

    if args.files.is_empty() {
        inputs.push(("typed text".to_string(), AnalysisInput::typed(typed)));
    } else {
        for path in &args.files {
            match UploadedFile::from_path(path).await {
                Ok(file) => {
                    let label = file.name.clone();
                    inputs.push((label, AnalysisInput::typed(typed.clone()).with_upload(file)));
                }
                Err(e) => eprintln!("{} {}", "Skipped:".yellow().bold(), e),
            }
        }
    }

    let mut last = None;
    for (label, mut input) in inputs {
        input.question = args.question.clone();
        let outcome = session.pipeline().submit(&input).await;
        print_result_box(&label, &outcome);
        if let SubmitOutcome::Completed(result) = &outcome {
            last = Some((result.clone(), input));
        }
    }

    if let Some(path) = &args.export {
        match &last {
            Some((result, input)) => {
                write_json(path, &ResultExport::new(result, input, chrono::Utc::now()))
                    .await
                    .with_context(|| format!("Failed to export result to {}", path.display()))?;
                eprintln!("{} {}", "Exported result:".dimmed(), path.display());
            }
            None => eprintln!("{} no result to export", "Warning:".yellow()),
        }
    }

    if let Some(path) = &args.audit_export {
        let snapshot = session.ledger().export_snapshot();
        write_json(path, &snapshot)
            .await
            .with_context(|| format!("Failed to export audit log to {}", path.display()))?;
        eprintln!(
            "{} {} ({} entries)",
            "Exported audit log:".dimmed(),
            path.display(),
            snapshot.total_entries
        );
    }

    Ok(())
}

async fn run_test_connection(session: &AnalysisSession) -> Result<()> {
    eprintln!("{} {}", "Testing".dimmed(), session.config().analyze_url());

    match session.prober().test_connection().await {
        Some(report) if report.state == ConnectionState::Online => {
            eprintln!("{} {}", "✔".green().bold(), report.to_string().green());
            Ok(())
        }
        Some(report) => {
            eprintln!("{} {}", "✘".red().bold(), report.to_string().red());
            std::process::exit(1);
        }
        None => {
            eprintln!("{}", "A connection test is already running".yellow());
            Ok(())
        }
    }
}

async fn run_watch(session: &AnalysisSession, report_every: u64) -> Result<()> {
    let keep_alive = session.prober().start_keep_alive();
    eprintln!(
        "{} {} {}",
        "Keeping".dimmed(),
        session.config().health_url(),
        "warm (Ctrl-C to stop)".dimmed()
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(report_every.max(1)));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                let status = if session.prober().keep_alive_active() {
                    "active".green()
                } else {
                    "inactive".yellow()
                };
                eprintln!(
                    "{} keep-alive {}",
                    chrono::Local::now().format("%H:%M:%S").to_string().dimmed(),
                    status
                );
            }
        }
    }

    keep_alive.shutdown().await;
    eprintln!("{}", "Stopped".dimmed());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    init_logging(args.verbose)?;

    let config = load_config(&args)?;
    let session = AnalysisSession::new(config).context("Failed to create HTTP client")?;

    match args.command {
        Command::Analyze => run_analyze(&session, &args).await,
        Command::TestConnection => run_test_connection(&session).await,
        Command::Watch => run_watch(&session, args.report_every).await,
        Command::About => {
            println!("{}", session.fetch_readme().await);
            Ok(())
        }
    }
}
