//! Scores every prediction of a predictions file with an external program.
//!
//! Each prediction is piped as JSON to one run of `<program>`, whose stdout must be a JSON
//! document. The collected documents are written to `<output.json>`. The first failing run
//! aborts the whole evaluation and no output is written.
mod args;

use anyhow::Context;
use forge_core::Batch;
use forge_exec::{ProcConfig, ProcUnit};
use forge_model::Prediction;
use forge_observe::{LoggerConfig, logger_init};
use serde_json::json;
use tracing::{error, info};

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = LoggerConfig::from_env()?;
    logger_init(&cfg)?;

    let args = Args::parse(std::env::args().skip(1))?;
    let batch = Batch::from_env()?;
    if let Err(e) = evaluate(&args, &batch).await {
        error!(target: "forge.evaluate", error = %format!("{e:#}"), "evaluation failed");
        return Err(e);
    }
    Ok(())
}

async fn evaluate(args: &Args, batch: &Batch) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&args.predictions)
        .await
        .with_context(|| format!("reading {}", args.predictions.display()))?;
    let predictions = Prediction::list_from_json(&raw)
        .with_context(|| format!("parsing {}", args.predictions.display()))?;
    info!(target: "forge.evaluate", count = predictions.len(), "predictions loaded");

    let unit = ProcUnit::new(
        ProcConfig::new(args.program.clone()).with_args(args.program_args.iter().cloned()),
    )?;
    info!(
        target: "forge.evaluate",
        workers = batch.worker_count().get(),
        program = %args.program,
        "scoring predictions"
    );

    let results = batch.run(unit, predictions).await?;

    let doc = json!({
        "count": results.len(),
        "results": results,
    });
    let body = serde_json::to_vec_pretty(&doc)?;
    tokio::fs::write(&args.output, body)
        .await
        .with_context(|| format!("writing {}", args.output.display()))?;

    info!(target: "forge.evaluate", output = %args.output.display(), "metrics written");
    Ok(())
}
