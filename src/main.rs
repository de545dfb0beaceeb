use anyhow::{Context, Result};
use clap::Parser;
use grader_worker::broker::{BrokerConnection, TcpTransport};
use grader_worker::config::WorkerConfig;
use grader_worker::fileman::{FileManager, HttpFileManager, LocalFileManager};
use grader_worker::job::{executor_loop, JobEvaluator, LogProgress};
use grader_worker::judge::{judge_files, JudgeOptions};
use std::process::ExitCode;
use std::sync::Arc;

mod opt;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts = opt::Opts::parse();
    match opts.cmd {
        opt::SubCmd::Connect(cmd) => {
            run_worker(cmd).await?;
            Ok(ExitCode::SUCCESS)
        }
        opt::SubCmd::Judge(cmd) => run_judge(cmd),
    }
}

async fn run_worker(cmd: opt::ConnectSubCmd) -> Result<()> {
    let config = Arc::new(
        WorkerConfig::load(&cmd.config)
            .with_context(|| format!("loading config from {}", cmd.config.display()))?,
    );
    tracing::info!(worker_id = config.worker_id, "starting worker");

    let fileman: Arc<dyn FileManager> = match &config.file_manager {
        Some(fm) => Arc::new(HttpFileManager::new(fm)),
        // Without a file store, URLs are treated as names in the local
        // working directory; useful for development setups.
        None => Arc::new(LocalFileManager::new(config.working_directory.clone())),
    };

    let (eval_tx, eval_rx) = tokio::sync::mpsc::channel(1);
    let (done_tx, done_rx) = tokio::sync::mpsc::channel(1);

    let evaluator = JobEvaluator::new(config.clone(), fileman);
    let executor = tokio::spawn(executor_loop(eval_rx, done_tx, evaluator, LogProgress));

    let mut connection = BrokerConnection::new(config, TcpTransport::new(), eval_tx, done_rx);
    connection.connect().await.context("connecting to broker")?;
    connection.serve().await;
    tracing::info!("broker loop terminated, shutting down");

    // Dropping the connection closes the eval channel, which stops the
    // executor after its current job.
    drop(connection);
    let _ = executor.await;
    Ok(())
}

fn run_judge(cmd: opt::JudgeSubCmd) -> Result<ExitCode> {
    let opts = JudgeOptions {
        shuffled: cmd.shuffled,
        numeric: cmd.numeric || cmd.float_tolerance > 0.0,
        float_tolerance: cmd.float_tolerance,
        ignore_case: cmd.ignore_case,
        ignore_empty_lines: !cmd.keep_empty_lines,
        allow_comments: cmd.allow_comments,
        ignore_line_ends: cmd.ignore_line_ends,
        approx_lcs_max_window: cmd.approx_window,
        log: cmd.verbose,
    };
    let verdict = judge_files(&cmd.reference, &cmd.candidate, &opts)
        .context("comparing output files")?;

    if cmd.verbose {
        for m in &verdict.mismatches {
            let position = match m.column {
                Some(column) => format!("{}:{}", m.line, column),
                None => format!("{}", m.line),
            };
            if m.diff > 0 {
                println!("{position}: missing token '{}'", m.token);
            } else {
                println!("{position}: unexpected token '{}'", m.token);
            }
        }
        if verdict.approx {
            println!("(approx)");
        }
    }
    println!("{}", verdict.result());

    if verdict.matches() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
