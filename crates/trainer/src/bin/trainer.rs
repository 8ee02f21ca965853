//! Trainer binary entry point
//!
//! Runs the synthetic job described by a JSON config on an in-process cohort.
//!
//! Usage: `trainer <config.json> [workers]`

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordinator::LocalCohort;
use runtime_core::JobConfig;
use trainer::synthetic::{synthetic_registry, LinearTarget, SgdOptimizer, SyntheticModel};
use trainer::Trainer;

const DEFAULT_WORKERS: u32 = 2;
const USAGE: &str = "usage: trainer <config.json> [workers]";

/// Config path and cohort size; the cohort needs at least one worker
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(String, u32), String> {
    let config_path = args.next().ok_or_else(|| USAGE.to_string())?;
    let workers = match args.next() {
        Some(arg) => arg
            .parse::<u32>()
            .map_err(|e| format!("invalid worker count '{}': {}; {}", arg, e, USAGE))?,
        None => DEFAULT_WORKERS,
    };
    if workers == 0 {
        return Err(format!("worker count must be at least 1; {}", USAGE));
    }
    Ok((config_path, workers))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "trainer=info,checkpoint=info,coordinator=info,runtime_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config_path, workers) = parse_args(std::env::args().skip(1))?;

    let config = JobConfig::from_file(&config_path)?;
    let learning_rate = config.dataprocesser.option_f64("learning_rate", 0.1)?;
    let trainer = Trainer::new(config, &synthetic_registry())?;

    tracing::info!(config = %config_path, workers, "Starting training job");

    let mut handles = Vec::new();
    for group in LocalCohort::new(workers).into_groups() {
        let trainer = trainer.clone();
        handles.push(tokio::spawn(async move {
            let mut ctx = trainer
                .prepare(
                    Arc::new(group),
                    SyntheticModel::default(),
                    SgdOptimizer::new(learning_rate),
                    &(),
                    LinearTarget::default(),
                )
                .await?;
            let summary = trainer.run(&mut ctx).await?;
            Ok::<_, runtime_core::Error>((ctx.identity(), summary, ctx.model().parameters()))
        }));
    }

    for handle in handles {
        let (identity, summary, (weight, bias)) = handle.await??;
        tracing::info!(
            worker = %identity,
            epochs_run = summary.epochs_run,
            optimizer_steps = summary.optimizer_steps,
            eval_loss = summary.last_eval.map(|m| m.loss),
            weight,
            bias,
            "Worker finished"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values.iter().map(|v| v.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_args_defaults_workers() {
        assert_eq!(parse_args(args(&["job.json"])).unwrap(), ("job.json".to_string(), DEFAULT_WORKERS));
        assert_eq!(parse_args(args(&["job.json", "4"])).unwrap().1, 4);
    }

    #[test]
    fn test_parse_args_rejects_empty_cohort() {
        let err = parse_args(args(&["job.json", "0"])).unwrap_err();
        assert!(err.contains("at least 1"));
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["job.json", "two"])).is_err());
    }
}
