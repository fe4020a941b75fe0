use contractflow::jobs::{JobId, JobKind, LiveLog, LogEntry, LogKind};
use contractflow::{build_workflow, Config, ProjectFile, Workflow};

use std::env;
use std::path::Path;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "contractflow-runner <command>\n\
     Commands:\n\
     - compile <project_id> <file>...\n\
     - deploy <project_id> <file>...      (compile, then deploy)\n\
     - watch <job_id> [compile|deploy]\n\
     \n\
     Uses CONTRACTFLOW_API_URL (default http://localhost:3001/api).\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    tracing::info!(
        api = %cfg.api_url,
        ws = %cfg.ws_url,
        network = %cfg.network,
        poll_interval_ms = cfg.poll.interval.as_millis() as u64,
        "contractflow runner starting"
    );

    let workflow = build_workflow(&cfg)?;
    let mut printer = LogPrinter::new(workflow.live_log());

    let action = run(&workflow, &cfg, &args);
    tokio::pin!(action);

    let result = loop {
        tokio::select! {
            res = &mut action => break res,
            _ = printer.changed() => printer.print_new(),
        }
    };
    printer.print_new();
    workflow.shutdown();

    let success = result?;
    std::process::exit(if success { 0 } else { 1 });
}

async fn run(workflow: &Workflow, cfg: &Config, args: &[String]) -> anyhow::Result<bool> {
    match args[1].as_str() {
        "compile" => {
            let files = read_files(&args[3..])?;
            let report = workflow.compile(&args[2], &files).await;
            Ok(report.success)
        }
        "deploy" => {
            let files = read_files(&args[3..])?;
            let report = workflow
                .compile_and_deploy(&args[2], &files, &cfg.network)
                .await;
            if let Some(address) = &report.contract_address {
                println!("contract_address={address}");
            }
            Ok(report.success)
        }
        "watch" => {
            let kind = match args.get(3).map(String::as_str) {
                None | Some("compile") => JobKind::Compile,
                Some("deploy") => JobKind::Deploy,
                Some(other) => {
                    eprintln!("Unknown job kind: {other}");
                    std::process::exit(2);
                }
            };
            watch(workflow, JobId::from(args[2].as_str()), kind).await
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn watch(workflow: &Workflow, job_id: JobId, kind: JobKind) -> anyhow::Result<bool> {
    let live = workflow.live_log();
    let outcome = workflow
        .reconciler()
        .reconcile(&job_id, kind, &live)
        .await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.is_success())
}

fn read_files(paths: &[String]) -> anyhow::Result<Vec<ProjectFile>> {
    if paths.is_empty() {
        anyhow::bail!("at least one source file is required\n\n{USAGE}");
    }
    paths
        .iter()
        .map(|p| {
            let content = std::fs::read_to_string(p)
                .map_err(|e| anyhow::anyhow!("failed to read {p}: {e}"))?;
            let name = Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.clone());
            Ok(ProjectFile::new(name, content))
        })
        .collect()
}

/// Prints live log lines as they are appended.
struct LogPrinter {
    live: LiveLog,
    revisions: watch::Receiver<u64>,
    printed: usize,
}

impl LogPrinter {
    fn new(live: LiveLog) -> Self {
        let revisions = live.watch();
        Self {
            live,
            revisions,
            printed: 0,
        }
    }

    async fn changed(&mut self) {
        if self.revisions.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    fn print_new(&mut self) {
        if self.live.len() < self.printed {
            // cleared
            self.printed = 0;
        }
        for entry in self.live.since(self.printed) {
            print_entry(&entry);
            self.printed += 1;
        }
    }
}

fn print_entry(entry: &LogEntry) {
    let tag = match entry.kind {
        LogKind::Info => "info",
        LogKind::Success => " ok ",
        LogKind::Error => "FAIL",
        LogKind::Warning => "warn",
    };
    println!("[{}] [{tag}] {}", entry.timestamp, entry.message);
}
