use domain_analyst::config::AppConfig;
use domain_analyst::domain::DomainLoader;
use domain_analyst::llm::{CompletionProvider, OpenAiClient};
use domain_analyst::session::Session;
use domain_analyst::workflow::{OutcomeKind, QueryOutcome, ReportBasis};
use domain_analyst::AnalystError;

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "domain-analyst")]
#[command(about = "Ask business questions about domain data in plain language")]
#[command(version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs)]
struct CommonArgs {
    /// Path to metadata directory (or set ANALYST_METADATA_DIR)
    #[arg(long, global = true)]
    metadata_dir: Option<PathBuf>,

    /// Path to data directory (or set ANALYST_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Root directory for chart output (or set ANALYST_OUTPUT_DIR)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Model name (or set OPENAI_MODEL)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Python interpreter used to run analyses (or set ANALYST_PYTHON)
    #[arg(long, global = true)]
    python: Option<String>,

    /// Execution timeout in seconds (or set ANALYST_EXEC_TIMEOUT_SECS)
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available domains
    Domains,
    /// Check API key, interpreter packages, schemas and data files
    Check,
    /// Ask a single question
    Ask {
        /// Domain to analyze (e.g. banking)
        #[arg(short, long)]
        domain: String,

        /// The question in natural language
        question: String,

        /// Also print the plan and generated code
        #[arg(long)]
        verbose: bool,
    },
    /// Interactive chat with conversation memory
    Chat {
        /// Domain to start with
        #[arg(short, long)]
        domain: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args.common)?;

    match args.command {
        Commands::Domains => list_domains(&config),
        Commands::Check => run_check(&config).await,
        Commands::Ask {
            domain,
            question,
            verbose,
        } => run_ask(&config, &domain, &question, verbose).await,
        Commands::Chat { domain } => run_chat(&config, &domain).await,
    }
}

fn load_config(common: &CommonArgs) -> Result<AppConfig> {
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = &common.metadata_dir {
        config.metadata_dir = dir.clone();
    }
    if let Some(dir) = &common.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &common.output_dir {
        config.output_root = dir.clone();
    }
    if let Some(key) = &common.api_key {
        config.api_key = Some(key.clone());
    }
    if let Some(model) = &common.model {
        config.model = model.clone();
    }
    if let Some(python) = &common.python {
        config.python = python.clone();
    }
    if let Some(secs) = common.timeout {
        config.exec_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

fn open_session(config: &AppConfig) -> Result<Session> {
    let api_key = config.require_api_key().map_err(explain)?;
    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiClient::new(
        api_key.to_string(),
        config.model.clone(),
        config.base_url.clone(),
    ));
    Session::open(config, provider).map_err(explain)
}

/// Attach the remediation hint to an error for display.
fn explain(err: AnalystError) -> anyhow::Error {
    anyhow::anyhow!("{}\n  hint: {}", err, err.remediation())
}

fn list_domains(config: &AppConfig) -> Result<()> {
    let loader = DomainLoader::new(&config.metadata_dir, &config.data_dir);
    let domains = loader.available_domains()?;
    if domains.is_empty() {
        println!("No domains found under {}", config.metadata_dir.display());
        return Ok(());
    }
    for name in domains {
        match loader.load_schema(&name) {
            Ok(schema) => println!(
                "{:<12} {} ({} tables)",
                name,
                schema.domain_name,
                schema.tables.len()
            ),
            Err(e) => println!("{:<12} invalid schema: {}", name, e),
        }
    }
    Ok(())
}

async fn run_check(config: &AppConfig) -> Result<()> {
    let mut all_ok = true;
    let mut report = |label: &str, ok: bool, detail: String| {
        all_ok &= ok;
        println!("[{}] {:<22} {}", if ok { " ok " } else { "FAIL" }, label, detail);
    };

    report(
        "API key",
        config.api_key.is_some(),
        if config.api_key.is_some() {
            "set".to_string()
        } else {
            "OPENAI_API_KEY missing".to_string()
        },
    );

    match config.validate() {
        Ok(budget) => report("Configuration", true, format!("context budget {} tokens", budget.tokens())),
        Err(e) => report("Configuration", false, e.to_string()),
    }

    let packages = tokio::process::Command::new(&config.python)
        .args(["-c", "import pandas, numpy, matplotlib"])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await;
    match packages {
        Ok(output) if output.status.success() => {
            report("Interpreter packages", true, config.python.clone())
        }
        Ok(output) => report(
            "Interpreter packages",
            false,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ),
        Err(e) => report("Interpreter packages", false, format!("{}: {}", config.python, e)),
    }

    let loader = DomainLoader::new(&config.metadata_dir, &config.data_dir);
    let domains = loader.available_domains()?;
    if domains.is_empty() {
        report(
            "Domains",
            false,
            format!("no schemas under {}", config.metadata_dir.display()),
        );
    }
    for name in domains {
        match loader.load(&name) {
            Ok(domain) => report(
                &format!("Domain {}", name),
                true,
                format!("{} tables", domain.tables.len()),
            ),
            Err(e) => report(
                &format!("Domain {}", name),
                false,
                format!("{} ({})", e, e.remediation()),
            ),
        }
    }

    if all_ok {
        Ok(())
    } else {
        anyhow::bail!("environment check failed")
    }
}

async fn run_ask(config: &AppConfig, domain: &str, question: &str, verbose: bool) -> Result<()> {
    let mut session = open_session(config)?;
    session.select_domain(domain).map_err(explain)?;
    info!("Question: {}", question);

    let outcome = session.ask(question).await.map_err(explain)?;
    print_outcome(&outcome, verbose);
    Ok(())
}

async fn run_chat(config: &AppConfig, domain: &str) -> Result<()> {
    let mut session = open_session(config)?;
    let selected = session.select_domain(domain).map_err(explain)?;
    println!("Analyzing {} data. Commands: /domain <name>, /new, /charts, /clear-charts, /quit", selected.display_name());

    let stdin = io::stdin();
    loop {
        print!("\n> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) | ("/exit", _) => break,
            ("/new", _) => {
                session.new_conversation().map_err(explain)?;
                println!("Started a new conversation.");
            }
            ("/clear-charts", _) => {
                session.clear_charts().map_err(explain)?;
                println!("Charts cleared. The conversation is kept.");
            }
            ("/charts", _) => {
                let charts = session.artifacts()?;
                if charts.is_empty() {
                    println!("No charts.");
                }
                for chart in charts {
                    println!("{}", chart.display());
                }
            }
            ("/domain", name) if !name.trim().is_empty() => match session.select_domain(name.trim()) {
                Ok(domain) => println!(
                    "Switched to {}. Conversation and charts cleared.",
                    domain.display_name()
                ),
                Err(e) => println!("{}\n  hint: {}", e, e.remediation()),
            },
            _ => match session.ask(line).await {
                Ok(outcome) => print_outcome(&outcome, false),
                Err(e) if e.is_setup_error() => return Err(explain(e)),
                Err(e) => {
                    error!("Query failed: {}", e);
                    println!("{}\n  hint: {}", e, e.remediation());
                }
            },
        }
    }
    Ok(())
}

fn print_outcome(outcome: &QueryOutcome, verbose: bool) {
    if outcome.context_evicted {
        println!("(Older parts of the conversation were dropped to fit the model's context.)");
    }
    if outcome.context_clipped {
        println!("(Part of the analysis output was cut to fit the model's context.)");
    }

    if let OutcomeKind::Analysis(analysis) = &outcome.kind {
        if verbose {
            println!("\nRephrased: {}", analysis.request.rephrased);
            println!("\nPlan:\n{}", analysis.plan.render());
            println!("\nCode:\n{}", analysis.analysis_code);
        }
        if analysis.report.basis == ReportBasis::ExecutionFailed {
            if let Some(error) = analysis.execution.error_text() {
                println!("\n(The analysis did not complete: {})", error);
            }
        }
    }

    println!("\n{}", outcome.answer());

    let charts = outcome.charts();
    if !charts.is_empty() {
        println!("\nCharts:");
        for chart in charts {
            println!("  {}", chart.display());
        }
    }
}
