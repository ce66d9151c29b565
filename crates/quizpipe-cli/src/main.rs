use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quizpipe_core::{
    FetchBackend, FixedSettle, LinkExtractor, PageRenderer, SettleWait, SolveStage,
    DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_SETTLE_MS,
};
use quizpipe_local::{
    AnchorLinkExtractor, HeuristicLinkExtractor, LocalFetcher, OpenAiCompatClient,
    PlaywrightRenderer, QuizSolver, ResourceDiscoverer, SolveReport, StaticRenderer,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "quizpipe")]
#[command(about = "Render a quiz page, gather its resources, and ask for the answer", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn,quizpipe=info,quizpipe_local=info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Solve one quiz page (json by default).
    Solve(SolveCmd),
    /// Diagnose configuration (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RendererKind {
    /// Headless Chromium via Playwright (node).
    Playwright,
    /// Plain HTTP GET; no script execution.
    Static,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExtractorKind {
    Heuristic,
    Anchors,
}

#[derive(clap::Args, Debug)]
struct SolveCmd {
    /// Quiz page URL.
    #[arg(long)]
    url: String,
    #[arg(long, value_enum, default_value = "playwright")]
    renderer: RendererKind,
    #[arg(long, value_enum, default_value = "heuristic")]
    extractor: ExtractorKind,
    /// Delay after navigation before the page is read.
    #[arg(long, env = "QUIZPIPE_SETTLE_MS", default_value_t = DEFAULT_SETTLE_MS)]
    settle_ms: u64,
    /// Per-render navigation timeout.
    #[arg(long, env = "QUIZPIPE_RENDER_TIMEOUT_MS", default_value_t = 30_000)]
    render_timeout_ms: u64,
    /// Per-resource GET timeout.
    #[arg(long, env = "QUIZPIPE_FETCH_TIMEOUT_MS", default_value_t = DEFAULT_FETCH_TIMEOUT_MS)]
    fetch_timeout_ms: u64,
    #[arg(long, env = "QUIZPIPE_NODE", default_value = "node")]
    node: String,
    /// Chromium executable (default: Playwright's bundled browser).
    #[arg(long, env = "QUIZPIPE_CHROME_BIN")]
    chrome_bin: Option<String>,
    /// Connect to an already running browser instead of launching one.
    #[arg(long, env = "QUIZPIPE_RENDER_CDP_ENDPOINT")]
    cdp_endpoint: Option<String>,
    /// Model override (default: QUIZPIPE_LLM_MODEL or llama-3.3-70b-versatile).
    #[arg(long)]
    model: Option<String>,
    /// Stop once the prompt is built; do not call the answer service.
    #[arg(long)]
    no_llm: bool,
    /// Include the full prompt in json output.
    #[arg(long)]
    include_prompt: bool,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Opt-in `KEY=VALUE` loader (QUIZPIPE_ENV_FILE). Never overrides the process env and
/// never logs values.
fn load_env_file() {
    let Ok(p) = std::env::var("QUIZPIPE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn has_env(k: &str) -> bool {
    std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
}

fn build_solver(args: &SolveCmd) -> Result<QuizSolver> {
    let fetcher = LocalFetcher::new().context("build http client")?;
    let http = fetcher.client().clone();
    let fetcher: Arc<dyn FetchBackend> = Arc::new(fetcher);

    let renderer: Arc<dyn PageRenderer> = match args.renderer {
        RendererKind::Playwright => {
            let settle: Arc<dyn SettleWait> =
                Arc::new(FixedSettle(Duration::from_millis(args.settle_ms)));
            Arc::new(
                PlaywrightRenderer::new(settle)
                    .with_node_bin(args.node.clone())
                    .with_timeout_ms(args.render_timeout_ms)
                    .with_executable_path(args.chrome_bin.clone())
                    .with_cdp_endpoint(args.cdp_endpoint.clone()),
            )
        }
        RendererKind::Static => Arc::new(
            StaticRenderer::new(fetcher.clone()).with_timeout_ms(args.render_timeout_ms),
        ),
    };
    let extractor: Arc<dyn LinkExtractor> = match args.extractor {
        ExtractorKind::Heuristic => Arc::new(HeuristicLinkExtractor),
        ExtractorKind::Anchors => Arc::new(AnchorLinkExtractor),
    };
    let discoverer = ResourceDiscoverer::new(fetcher, renderer.clone())
        .with_extractor(extractor)
        .with_fetch_timeout_ms(args.fetch_timeout_ms);

    let mut solver = QuizSolver::new(renderer, discoverer);
    if !args.no_llm {
        match OpenAiCompatClient::from_env(http, args.model.clone()) {
            Ok(client) => solver = solver.with_generator(Arc::new(client)),
            Err(e) => tracing::warn!(error = %e, "answer service not configured"),
        }
    }
    Ok(solver)
}

fn solve_envelope(args: &SolveCmd, report: &SolveReport, ok: bool) -> serde_json::Value {
    let resources: Vec<serde_json::Value> = report
        .context
        .resources
        .iter()
        .map(|r| {
            serde_json::json!({
                "url": r.url,
                "chars": r.body.chars().count(),
                "origin": r.origin,
            })
        })
        .collect();
    let mut v = serde_json::json!({
        "schema_version": 1,
        "kind": "quiz_solve",
        "ok": ok,
        "url": args.url,
        "cutoff": report.context.cutoff,
        "numeric_result": report.context.numeric_result,
        "resources": resources,
        "answer_raw": report.answer_raw,
        "diagnostics": report.diagnostics,
    });
    if args.include_prompt || args.no_llm {
        v["prompt"] = serde_json::Value::String(report.prompt.clone());
    }
    v
}

async fn run_solve(args: SolveCmd) -> Result<()> {
    let solver = build_solver(&args)?;
    let t0 = std::time::Instant::now();
    let report = if args.no_llm {
        solver.prepare(&args.url).await
    } else {
        solver.solve(&args.url).await
    };
    let ok = if args.no_llm {
        report.diagnostics.stage == SolveStage::PromptReady
    } else {
        report.answer_raw.is_some()
    };
    tracing::info!(
        url = %args.url,
        ok,
        stage = ?report.diagnostics.stage,
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "solve finished"
    );

    match args.output.to_ascii_lowercase().as_str() {
        "text" if args.no_llm => println!("{}", report.prompt),
        "text" => match &report.answer_raw {
            Some(a) => println!("{a}"),
            None => anyhow::bail!(
                "no answer: {}",
                serde_json::to_string(&report.diagnostics.dispatch)?
            ),
        },
        _ => println!("{}", solve_envelope(&args, &report, ok)),
    }
    Ok(())
}

fn run_doctor(args: DoctorCmd) {
    let llm_key = has_env("QUIZPIPE_LLM_API_KEY") || has_env("GROQ_API_KEY");
    let llm_base_url = has_env("QUIZPIPE_LLM_BASE_URL");
    let v = serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": true,
        "name": "quizpipe",
        "version": env!("CARGO_PKG_VERSION"),
        "configured": {
            "llm": {
                "api_key": llm_key,
                "base_url": llm_base_url,
                "model": has_env("QUIZPIPE_LLM_MODEL"),
                "ready": llm_key || llm_base_url,
            },
            "render": {
                "node": has_env("QUIZPIPE_NODE"),
                "chrome_bin": has_env("QUIZPIPE_CHROME_BIN"),
                "cdp_endpoint": has_env("QUIZPIPE_RENDER_CDP_ENDPOINT"),
            },
            "env_file": has_env("QUIZPIPE_ENV_FILE"),
        },
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("quizpipe {}", env!("CARGO_PKG_VERSION"));
            println!("llm ready: {}", llm_key || llm_base_url);
            println!("llm api key set: {llm_key}");
        }
        _ => println!("{v}"),
    }
}

fn main() -> Result<()> {
    // Env vars are only written here, before any runtime thread exists.
    load_env_file();
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Solve(args) => run_solve(args).await?,
        Commands::Doctor(args) => run_doctor(args),
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "quizpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("quizpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
