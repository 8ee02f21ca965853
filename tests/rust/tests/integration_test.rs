use anyhow::Result;
use checkpoint::{
    CheckpointRecord, CheckpointTarget, ColdStartReason, RecoveryManager, RecoveryOutcome,
    RecoveryTargets, CHECKPOINT_FILE,
};
use coordinator::LocalCohort;
use runtime_core::{
    CheckpointPolicy, DataProcesserConfig, JobConfig, ScheduleKind, Stateful, WorkerIdentity,
};
use std::path::Path;
use std::sync::Arc;
use trainer::synthetic::{synthetic_registry, LinearTarget, SgdOptimizer, SyntheticModel, SYNTHETIC};
use trainer::{Optimizer, Schedule, Trainer};

fn policy(root: &Path) -> CheckpointPolicy {
    CheckpointPolicy {
        root_path: Some(root.to_path_buf()),
        model_name: Some("gpt".to_string()),
    }
}

#[tokio::test]
async fn test_recovery_round_trip_is_bit_identical() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let identity = WorkerIdentity::new(1, 2, 1)?;
    let target = CheckpointTarget::resolve(Some(&policy(dir.path())), identity);

    let model = SyntheticModel::new(1.0 / 3.0, -0.1 - 0.2);
    let mut optimizer = SgdOptimizer::new(0.05);
    optimizer.set_learning_rate(0.0123);
    let mut schedule = Schedule::new(ScheduleKind::Cosine, 3, 40);
    for _ in 0..11 {
        schedule.advance();
    }

    let record = CheckpointRecord {
        epoch: 4,
        model_state: model.state_dict()?,
        optimizer_state: optimizer.state_dict()?,
        scheduler_state: Some(schedule.state_dict()?),
    };
    let written = target.store().expect("configured").write(&record).await?;
    assert!(written > record.payload_len() as u64);

    let mut fresh_model = SyntheticModel::default();
    let mut fresh_optimizer = SgdOptimizer::new(1.0);
    let mut fresh_schedule = Schedule::new(ScheduleKind::Cosine, 3, 40);
    let outcome = RecoveryManager::recover(
        &target,
        RecoveryTargets {
            model: &mut fresh_model,
            optimizer: &mut fresh_optimizer,
            scheduler: Some(&mut fresh_schedule),
        },
    )
    .await;

    assert!(outcome.is_recovered());
    assert_eq!(outcome.starting_epoch(), 5);
    assert_eq!(fresh_model.state_dict()?, model.state_dict()?);
    assert_eq!(fresh_optimizer.state_dict()?, optimizer.state_dict()?);
    assert_eq!(fresh_schedule.step(), 11);
    Ok(())
}

#[tokio::test]
async fn test_rank_directories_are_disjoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut paths = Vec::new();
    for rank in 0..4 {
        let identity = WorkerIdentity::new(rank, 4, rank % 2)?;
        let target = CheckpointTarget::resolve(Some(&policy(dir.path())), identity);
        let store = target.store().expect("configured");
        store
            .write(&CheckpointRecord {
                epoch: u64::from(rank),
                model_state: vec![rank as u8; 8].into(),
                optimizer_state: vec![0; 4].into(),
                scheduler_state: None,
            })
            .await?;
        paths.push(store.location().directory());
    }

    paths.dedup();
    assert_eq!(paths.len(), 4);
    for rank in 0..4 {
        let expected = dir.path().join(format!("gpt_{}-of-4", rank)).join(CHECKPOINT_FILE);
        assert!(expected.exists());
    }

    // Each rank reads back only its own record
    let identity = WorkerIdentity::new(2, 4, 0)?;
    let record = CheckpointTarget::resolve(Some(&policy(dir.path())), identity)
        .store()
        .expect("configured")
        .read()
        .await?;
    assert_eq!(record.epoch, 2);
    assert_eq!(&record.model_state[..], &[2u8; 8]);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_cold_start() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rank_dir = dir.path().join("gpt_0-of-1");
    std::fs::create_dir_all(&rank_dir)?;
    std::fs::write(rank_dir.join(CHECKPOINT_FILE), b"not a checkpoint at all")?;

    let mut config = JobConfig::new(DataProcesserConfig::named(SYNTHETIC));
    config.checkpoint = Some(policy(dir.path()));
    config.output = None;
    let trainer = Trainer::new(config, &synthetic_registry())?;

    let group = LocalCohort::new(1).into_groups().remove(0);
    let fresh = SyntheticModel::new(0.25, 0.75);
    let ctx = trainer
        .prepare(Arc::new(group), fresh.clone(), SgdOptimizer::new(0.1), &(), LinearTarget::default())
        .await?;

    assert_eq!(ctx.state().starting_epoch, 0);
    assert_eq!(ctx.model().parameters(), fresh.parameters());
    Ok(())
}

#[tokio::test]
async fn test_truncated_checkpoint_is_unreadable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let target = CheckpointTarget::resolve(Some(&policy(dir.path())), WorkerIdentity::single());
    let store = target.store().expect("configured");
    store
        .write(&CheckpointRecord {
            epoch: 7,
            model_state: vec![1; 64].into(),
            optimizer_state: vec![2; 64].into(),
            scheduler_state: None,
        })
        .await?;

    let path = store.location().directory().join(CHECKPOINT_FILE);
    let bytes = std::fs::read(&path)?;
    std::fs::write(&path, &bytes[..bytes.len() - 10])?;

    let mut model = SyntheticModel::default();
    let mut optimizer = SgdOptimizer::new(0.1);
    let outcome = RecoveryManager::recover(
        &target,
        RecoveryTargets {
            model: &mut model,
            optimizer: &mut optimizer,
            scheduler: None,
        },
    )
    .await;

    assert!(matches!(
        outcome,
        RecoveryOutcome::ColdStart(ColdStartReason::Unreadable(runtime_core::Error::CheckpointCorrupted { .. }))
    ));
    assert_eq!(outcome.starting_epoch(), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_root_path_skips_recovery() -> Result<()> {
    let policy = CheckpointPolicy {
        root_path: None,
        model_name: Some("gpt".to_string()),
    };
    let target = CheckpointTarget::resolve(Some(&policy), WorkerIdentity::single());
    assert!(target.is_configured());
    assert!(target.store().is_none());

    let mut model = SyntheticModel::default();
    let mut optimizer = SgdOptimizer::new(0.1);
    let outcome = RecoveryManager::recover(
        &target,
        RecoveryTargets {
            model: &mut model,
            optimizer: &mut optimizer,
            scheduler: None,
        },
    )
    .await;
    assert!(matches!(outcome, RecoveryOutcome::ColdStart(ColdStartReason::NotConfigured(_))));
    Ok(())
}

#[test]
fn test_job_config_from_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("job.json");
    std::fs::write(
        &path,
        r#"{
            "num_train_epochs": 5,
            "log_step": 10,
            "checkpoint": { "root_path": "/tmp/ckpt", "model_name": "gpt" },
            "lr_scheduler": {
                "enable": true,
                "lr_scheduler_type": "cosine_with_restarts",
                "num_warmup_steps": 100
            },
            "output": null,
            "dataprocesser": { "type": "synthetic", "samples": 512, "seed": 3 },
            "gradient_accumulation_steps": 4,
            "coordination": { "barrier_timeout_ms": 30000 }
        }"#,
    )?;

    let config = JobConfig::from_file(&path)?;
    assert_eq!(config.num_train_epochs, 5);
    assert_eq!(config.log_step, 10);
    assert!(config.output.is_none());
    assert_eq!(config.gradient_accumulation_steps, 4);
    let schedule = config.lr_scheduler.as_ref().expect("schedule");
    assert_eq!(schedule.lr_scheduler_type, ScheduleKind::CosineWithRestarts);
    assert_eq!(schedule.max_train_steps, None);
    assert_eq!(config.dataprocesser.option_u64("samples", 0)?, 512);
    assert_eq!(
        config.coordination.barrier_timeout,
        Some(std::time::Duration::from_secs(30))
    );

    Trainer::new(config, &synthetic_registry())?;
    Ok(())
}
