//! End-to-end training simulation test
//!
//! Runs whole cohorts as tokio tasks over the in-process process group:
//! - Multi-epoch runs with and without evaluation
//! - Main-worker final save followed by the final barrier
//! - Barrier ordering between train and eval phases
//! - Interrupted jobs resuming from rank-scoped checkpoints
//! - Fatal coordination failures

use anyhow::Result;
use bytes::Bytes;
use coordinator::LocalCohort;
use parking_lot::Mutex;
use runtime_core::{CheckpointPolicy, DataProcesserConfig, Error, JobConfig, Phase, Stateful, WorkerIdentity};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{LocalStorage, StorageBackend};
use trainer::synthetic::{synthetic_registry, LinearTarget, SgdOptimizer, SyntheticBatch, SyntheticModel, SYNTHETIC};
use trainer::{LoopEvent, LoopObserver, Model, ModelMode, Trainer, TrainingSummary, ARTIFACT_FILE};

/// Observer that timestamps every event
#[derive(Default)]
struct TimelineRecorder {
    events: Mutex<Vec<(u32, Instant, LoopEvent)>>,
}

impl LoopObserver for TimelineRecorder {
    fn on_event(&self, worker: WorkerIdentity, event: &LoopEvent) {
        self.events.lock().push((worker.rank, Instant::now(), event.clone()));
    }
}

impl TimelineRecorder {
    fn started(&self, rank: u32, phase: Phase) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|(r, _, e)| match e {
                LoopEvent::PhaseStarted { epoch, phase: p } if *r == rank && *p == phase => Some(*epoch),
                _ => None,
            })
            .collect()
    }

    fn timestamp(&self, rank: u32, epoch: u64, event: fn(u64) -> LoopEvent) -> Option<Instant> {
        let wanted = event(epoch);
        self.events
            .lock()
            .iter()
            .find(|(r, _, e)| *r == rank && *e == wanted)
            .map(|(_, at, _)| *at)
    }

    fn artifact_saves(&self) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter(|(_, _, e)| matches!(e, LoopEvent::ArtifactSaved { .. }))
            .map(|(r, _, _)| *r)
            .collect()
    }
}

/// Synthetic model whose forward pass takes longer on higher ranks
struct SlowModel {
    inner: SyntheticModel,
    delay: Duration,
}

impl Stateful for SlowModel {
    fn state_dict(&self) -> runtime_core::Result<Bytes> {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &[u8]) -> runtime_core::Result<()> {
        self.inner.load_state_dict(state)
    }
}

impl Model for SlowModel {
    type Batch = SyntheticBatch;

    fn set_mode(&mut self, mode: ModelMode) {
        self.inner.set_mode(mode)
    }

    fn forward(&mut self, batch: &SyntheticBatch) -> runtime_core::Result<f64> {
        std::thread::sleep(self.delay);
        self.inner.forward(batch)
    }

    fn backward(&mut self, loss: f64) -> runtime_core::Result<()> {
        self.inner.backward(loss)
    }
}

impl trainer::Optimizer<SlowModel> for SgdOptimizer {
    fn step(&mut self, model: &mut SlowModel) -> runtime_core::Result<()> {
        trainer::Optimizer::<SyntheticModel>::step(self, &mut model.inner)
    }

    fn zero_grad(&mut self, model: &mut SlowModel) {
        trainer::Optimizer::<SyntheticModel>::zero_grad(self, &mut model.inner)
    }

    fn base_learning_rate(&self) -> f64 {
        trainer::Optimizer::<SyntheticModel>::base_learning_rate(self)
    }

    fn learning_rate(&self) -> f64 {
        trainer::Optimizer::<SyntheticModel>::learning_rate(self)
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        trainer::Optimizer::<SyntheticModel>::set_learning_rate(self, learning_rate)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trainer=debug,checkpoint=debug,coordinator=debug")
        .with_test_writer()
        .try_init();
}

fn job(epochs: u64, options: serde_json::Value) -> JobConfig {
    let mut dataprocesser = DataProcesserConfig::named(SYNTHETIC);
    if let serde_json::Value::Object(map) = options {
        dataprocesser.options = map;
    }
    let mut config = JobConfig::new(dataprocesser);
    config.num_train_epochs = epochs;
    config.output = None;
    config
}

fn checkpointed(mut config: JobConfig, root: &Path) -> JobConfig {
    config.checkpoint = Some(CheckpointPolicy {
        root_path: Some(root.to_path_buf()),
        model_name: Some("linear".to_string()),
    });
    config
}

/// Run a full cohort and return each worker's summary and final parameters by rank
async fn run_cohort(
    config: JobConfig,
    workers: u32,
    observer: Arc<TimelineRecorder>,
) -> Result<Vec<(TrainingSummary, (f64, f64))>> {
    init_tracing();
    let trainer = Trainer::new(config, &synthetic_registry())?.with_observer(observer);
    tracing::info!(workers, "Running cohort");

    let mut handles = Vec::new();
    for group in LocalCohort::new(workers).into_groups() {
        let trainer = trainer.clone();
        handles.push(tokio::spawn(async move {
            let mut ctx = trainer
                .prepare(
                    Arc::new(group),
                    SyntheticModel::default(),
                    SgdOptimizer::new(0.1),
                    &(),
                    LinearTarget::default(),
                )
                .await?;
            let summary = trainer.run(&mut ctx).await?;
            Ok::<_, Error>((ctx.identity().rank, summary, ctx.model().parameters()))
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await??);
    }
    results.sort_by_key(|(rank, _, _)| *rank);
    Ok(results.into_iter().map(|(_, summary, params)| (summary, params)).collect())
}

#[tokio::test]
async fn test_three_epochs_without_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = job(3, serde_json::json!({ "samples": 48, "batch_size": 4, "eval_samples": 0 }));
    config.output = Some(dir.path().join("output"));

    let recorder = Arc::new(TimelineRecorder::default());
    let results = run_cohort(config, 3, recorder.clone()).await?;

    for (rank, (summary, _)) in results.iter().enumerate() {
        let rank = rank as u32;
        assert_eq!(summary.starting_epoch, 0);
        assert_eq!(summary.epochs_run, 3);
        assert_eq!(summary.checkpoints_written, 0);
        assert_eq!(summary.artifact_saved, rank == 0);
        assert_eq!(recorder.started(rank, Phase::Training), vec![0, 1, 2]);
        assert!(recorder.started(rank, Phase::Evaluating).is_empty());
        assert!(recorder.started(rank, Phase::Checkpointing).is_empty());

        // Finalizing only finishes once the final barrier is passed
        let finished = recorder
            .events
            .lock()
            .iter()
            .filter(|(r, _, e)| {
                *r == rank && matches!(e, LoopEvent::PhaseFinished { phase: Phase::Finalizing, .. })
            })
            .count();
        assert_eq!(finished, 1);
    }

    assert_eq!(recorder.artifact_saves(), vec![0]);
    let artifact = LocalStorage::new(dir.path().join("output")).read(ARTIFACT_FILE).await?;
    let (weight, bias) = results[0].1;
    assert_eq!(artifact, SyntheticModel::new(weight, bias).state_dict()?);
    Ok(())
}

#[tokio::test]
async fn test_workers_agree_on_eval_metrics() -> Result<()> {
    let config = job(2, serde_json::json!({ "samples": 64, "batch_size": 8, "eval_samples": 32 }));
    let recorder = Arc::new(TimelineRecorder::default());
    let results = run_cohort(config, 4, recorder.clone()).await?;

    // 8 eval samples per rank form one batch, gathered from 4 ranks
    let first = results[0].0.last_eval.expect("eval configured");
    assert_eq!(first.samples, 4);
    for (summary, _) in &results {
        assert_eq!(summary.last_eval, Some(first));
    }
    for rank in 0..4 {
        assert_eq!(recorder.started(rank, Phase::Evaluating), vec![0, 1]);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_eval_starts_before_every_worker_trained() -> Result<()> {
    let config = job(2, serde_json::json!({ "samples": 24, "batch_size": 4, "eval_samples": 12 }));
    let recorder = Arc::new(TimelineRecorder::default());
    let trainer = Trainer::new(config, &synthetic_registry())?.with_observer(recorder.clone());

    let mut handles = Vec::new();
    for group in LocalCohort::new(3).into_groups() {
        let trainer = trainer.clone();
        let delay = Duration::from_millis(5 * u64::from(coordinator::ProcessGroup::rank(&group)));
        handles.push(tokio::spawn(async move {
            let model = SlowModel {
                inner: SyntheticModel::default(),
                delay,
            };
            let mut ctx = trainer
                .prepare(Arc::new(group), model, SgdOptimizer::new(0.1), &(), LinearTarget::default())
                .await?;
            trainer.run(&mut ctx).await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    let train_finished = |epoch| LoopEvent::PhaseFinished { epoch, phase: Phase::Training };
    let eval_started = |epoch| LoopEvent::PhaseStarted { epoch, phase: Phase::Evaluating };
    for epoch in 0..2 {
        let mut finished = Vec::new();
        let mut started = Vec::new();
        for rank in 0..3 {
            finished.push(recorder.timestamp(rank, epoch, train_finished).expect("train finished"));
            started.push(recorder.timestamp(rank, epoch, eval_started).expect("eval started"));
        }
        let last_finished = finished.iter().max().copied().expect("three workers");
        let first_started = started.iter().min().copied().expect("three workers");
        assert!(first_started >= last_finished, "epoch {} eval began before training ended", epoch);
    }
    Ok(())
}

#[tokio::test]
async fn test_interrupted_job_resumes_from_next_epoch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = serde_json::json!({ "samples": 128, "batch_size": 4, "eval_samples": 8 });

    // First run stops after epoch 1 completes
    let first = run_cohort(
        checkpointed(job(2, options.clone()), dir.path()),
        2,
        Arc::new(TimelineRecorder::default()),
    )
    .await?;
    for (summary, _) in &first {
        assert_eq!(summary.checkpoints_written, 2);
    }
    for rank in 0..2 {
        let record = dir
            .path()
            .join(format!("linear_{}-of-2", rank))
            .join(checkpoint::CHECKPOINT_FILE);
        assert!(record.exists(), "missing {}", record.display());
    }

    let recorder = Arc::new(TimelineRecorder::default());
    let resumed = run_cohort(checkpointed(job(4, options), dir.path()), 2, recorder.clone()).await?;

    let mut params = HashMap::new();
    for (rank, (summary, weights)) in resumed.iter().enumerate() {
        assert_eq!(summary.starting_epoch, 2);
        assert_eq!(summary.epochs_run, 2);
        assert_eq!(recorder.started(rank as u32, Phase::Training), vec![2, 3]);
        params.insert(rank, *weights);
    }
    // Each rank trains on its own shard; both must still be near the target line
    for (weight, bias) in params.values() {
        assert!((weight - 2.0).abs() < 0.5);
        assert!((bias + 0.5).abs() < 0.5);
    }
    Ok(())
}

#[tokio::test]
async fn test_one_corrupt_rank_cold_starts_the_cohort() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = serde_json::json!({ "samples": 32, "batch_size": 4, "eval_samples": 8 });

    let first = run_cohort(
        checkpointed(job(2, options.clone()), dir.path()),
        2,
        Arc::new(TimelineRecorder::default()),
    )
    .await?;
    assert!(first.iter().all(|(summary, _)| summary.checkpoints_written == 2));

    // Rank 1 loses its record; rank 0 still holds epoch 1
    let corrupted = dir.path().join("linear_1-of-2").join(checkpoint::CHECKPOINT_FILE);
    std::fs::write(&corrupted, b"garbage")?;

    let mut config = checkpointed(job(4, options), dir.path());
    config.output = Some(dir.path().join("output"));
    config.coordination.barrier_timeout = Some(Duration::from_secs(5));
    let recorder = Arc::new(TimelineRecorder::default());
    let resumed = run_cohort(config, 2, recorder.clone()).await?;

    for (rank, (summary, _)) in resumed.iter().enumerate() {
        assert_eq!(summary.starting_epoch, 0);
        assert_eq!(summary.epochs_run, 4);
        assert_eq!(recorder.started(rank as u32, Phase::Training), vec![0, 1, 2, 3]);
    }
    assert_eq!(recorder.artifact_saves(), vec![0]);
    Ok(())
}

#[tokio::test]
async fn test_missing_peer_times_out() -> Result<()> {
    let mut config = job(1, serde_json::json!({}));
    config.coordination.barrier_timeout = Some(Duration::from_millis(100));
    let trainer = Trainer::new(config, &synthetic_registry())?;

    let mut groups = LocalCohort::new(2).into_groups();
    let _never_joins = groups.pop();
    let group = groups.pop().expect("rank 0");

    let err = trainer
        .prepare(
            Arc::new(group),
            SyntheticModel::default(),
            SgdOptimizer::new(0.1),
            &(),
            LinearTarget::default(),
        )
        .await
        .err()
        .expect("coordination must fail");
    assert!(matches!(err, Error::BarrierTimeout { .. }));
    assert!(err.is_fatal());
    Ok(())
}

#[test]
fn test_unknown_dataprocesser_is_fatal() {
    let config = JobConfig::new(DataProcesserConfig::named("general"));
    let err = Trainer::new(config, &synthetic_registry()).err().expect("unknown type");
    match &err {
        Error::UnknownDataProcesser { name, known } => {
            assert_eq!(name, "general");
            assert_eq!(known, &vec![SYNTHETIC.to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.is_fatal());
}
