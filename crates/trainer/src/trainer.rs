//! Training loop controller
//!
//! Runs each epoch from the recovered starting point through
//! `num_train_epochs` as train, eval, checkpoint, barrier, then saves the final
//! artifact from the main worker. Only coordination failures and collaborator
//! errors end the loop; checkpoint and artifact writes are logged and skipped.

use bytes::Bytes;
use checkpoint::{
    CheckpointRecord, CheckpointTarget, ColdStartReason, RecoveryManager, RecoveryOutcome,
    RecoveryTargets, SaveOutcome, StateSnapshot,
};
use coordinator::{ProcessGroup, WorkerCoordinator};
use runtime_core::{Epoch, Error, JobConfig, Phase, Result, Stateful, Step, WorkerIdentity};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use storage::{LocalStorage, StorageBackend};
use tracing::{error, info, instrument, warn};

use crate::collaborators::{
    DataProcesser, DataSource, Model, ModelMode, Optimizer, PreparedData, ProcesserFactory,
};
use crate::context::WorkerContext;
use crate::metrics::{perplexity, EvalMetrics};
use crate::observer::{LoopEvent, LoopObserver, NoopObserver};
use crate::processer::DataProcesserRegistry;
use crate::schedule::Schedule;

/// File name of the final model artifact inside `output`
pub const ARTIFACT_FILE: &str = "model.bin";

/// What one worker's run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    pub starting_epoch: Epoch,
    pub epochs_run: u64,
    pub optimizer_steps: Step,
    pub last_eval: Option<EvalMetrics>,
    pub checkpoints_written: u64,
    /// True only on the main worker, and only if the write succeeded
    pub artifact_saved: bool,
}

pub struct Trainer<P> {
    config: JobConfig,
    factory: ProcesserFactory<P>,
    observer: Arc<dyn LoopObserver>,
}

impl<P> Clone for Trainer<P> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            factory: self.factory,
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<P: DataProcesser> Trainer<P> {
    /// Validate the config and resolve its data processer
    ///
    /// An unknown `dataprocesser.type` fails here, before any worker
    /// coordinates.
    pub fn new(config: JobConfig, registry: &DataProcesserRegistry<P>) -> Result<Self> {
        config.validate()?;
        let factory = registry.resolve(&config.dataprocesser)?;
        info!(
            dataprocesser = %config.dataprocesser.kind,
            num_train_epochs = config.num_train_epochs,
            gradient_accumulation_steps = config.gradient_accumulation_steps,
            "Trainer configured"
        );
        Ok(Self {
            config,
            factory,
            observer: Arc::new(NoopObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Coordinate, prepare data, bind the schedule and recover
    ///
    /// Recovery never fails this call; a missing or unusable checkpoint is a
    /// cold start at epoch 0. Every rank then shares its starting epoch, and
    /// unless all of them agree the whole cohort cold-starts from fresh state.
    pub async fn prepare<M, O>(
        &self,
        group: Arc<dyn ProcessGroup>,
        mut model: M,
        mut optimizer: O,
        tokenizer: &P::Tokenizer,
        dataset: P::Dataset,
    ) -> Result<WorkerContext<M, O, P::Source>>
    where
        M: Model<Batch = <P::Source as DataSource>::Batch>,
        O: Optimizer<M>,
    {
        let coordinator =
            WorkerCoordinator::establish(group, self.config.coordination.barrier_timeout).await?;
        let identity = coordinator.identity();

        let PreparedData { train, eval } = {
            let processer = (self.factory)(&self.config.dataprocesser, identity)?;
            processer.prepare(tokenizer, dataset)?
        };
        info!(
            rank = identity.rank,
            train_batches = train.len(),
            eval_batches = eval.as_ref().map_or(0, |e| e.len()),
            "Data prepared"
        );

        let steps_per_epoch = (train.len() as u64).div_ceil(self.config.gradient_accumulation_steps);
        let mut schedule = Schedule::build(
            self.config.lr_scheduler.as_ref(),
            steps_per_epoch,
            self.config.num_train_epochs,
        );
        apply_schedule::<M, O>(&mut optimizer, schedule.as_ref());

        let checkpoint = CheckpointTarget::resolve(self.config.checkpoint.as_ref(), identity);
        let fresh = match checkpoint.store() {
            Some(_) => Some(StateSnapshot::capture(&recovery_targets(
                &mut model,
                &mut optimizer,
                schedule.as_mut(),
            ))?),
            None => None,
        };
        let outcome = RecoveryManager::recover(
            &checkpoint,
            recovery_targets(&mut model, &mut optimizer, schedule.as_mut()),
        )
        .await;
        outcome.log();

        let recovered = outcome.is_recovered();
        let gathered = coordinator.all_gather(outcome.starting_epoch() as f64).await?;
        let starting_epochs: Vec<Epoch> = gathered.into_iter().map(|epoch| epoch as Epoch).collect();
        let outcome = outcome.reconcile(&starting_epochs);
        if let RecoveryOutcome::ColdStart(ColdStartReason::CohortDisagreement { .. }) = &outcome {
            if recovered {
                if let Some(fresh) = &fresh {
                    fresh.restore(recovery_targets(&mut model, &mut optimizer, schedule.as_mut()))?;
                }
            }
            outcome.log();
        }
        apply_schedule::<M, O>(&mut optimizer, schedule.as_ref());

        Ok(WorkerContext {
            coordinator,
            model,
            optimizer,
            schedule,
            train,
            eval,
            checkpoint,
            state: outcome.loop_state(),
        })
    }

    /// Run every remaining epoch, then finalize
    pub async fn run<M, O, S>(&self, ctx: &mut WorkerContext<M, O, S>) -> Result<TrainingSummary>
    where
        S: DataSource,
        M: Model<Batch = S::Batch>,
        O: Optimizer<M>,
    {
        let identity = ctx.identity();
        let total_epochs = self.config.num_train_epochs;
        let starting_epoch = ctx.state.starting_epoch;
        let mut summary = TrainingSummary {
            starting_epoch,
            ..Default::default()
        };

        info!(
            rank = identity.rank,
            starting_epoch,
            num_train_epochs = total_epochs,
            remaining = ctx.state.remaining_epochs(total_epochs),
            "Start training"
        );

        for epoch in starting_epoch..total_epochs {
            ctx.state.current_epoch = epoch;
            ctx.state.current_step = 0;

            self.train_epoch(ctx, epoch)?;

            if ctx.eval.is_some() {
                // No worker evaluates epoch N before every worker has trained it
                ctx.coordinator.barrier(&format!("train-{}", epoch)).await?;
                summary.last_eval = Some(self.evaluate(ctx, epoch).await?);
            }

            if ctx.checkpoint.is_configured() && self.save_checkpoint(ctx, epoch).await {
                summary.checkpoints_written += 1;
            }

            self.enter(ctx, epoch, Phase::Barrier);
            ctx.coordinator.barrier(&format!("epoch-{}", epoch)).await?;
            self.emit(identity, LoopEvent::PhaseFinished { epoch, phase: Phase::Barrier });
            self.enter(ctx, epoch, Phase::Idle);
            summary.epochs_run += 1;
        }

        summary.optimizer_steps = ctx.state.optimizer_steps;
        summary.artifact_saved = self.finalize(ctx).await?;

        let last_epoch = ctx.state.current_epoch;
        self.enter(ctx, last_epoch, Phase::Done);
        self.emit(identity, LoopEvent::Done { epochs_run: summary.epochs_run });
        info!(
            rank = identity.rank,
            epochs_run = summary.epochs_run,
            optimizer_steps = summary.optimizer_steps,
            checkpoints_written = summary.checkpoints_written,
            "Training finished"
        );
        Ok(summary)
    }

    fn train_epoch<M, O, S>(&self, ctx: &mut WorkerContext<M, O, S>, epoch: Epoch) -> Result<()>
    where
        S: DataSource,
        M: Model<Batch = S::Batch>,
        O: Optimizer<M>,
    {
        let identity = ctx.identity();
        let total_epochs = self.config.num_train_epochs;
        let accumulation = self.config.gradient_accumulation_steps;
        let steps = self.phase_length(ctx.train.len());

        info!(epoch, rank = identity.rank, steps, "Start train epoch");
        self.enter(ctx, epoch, Phase::Training);
        ctx.model.set_mode(ModelMode::Train);

        let mut start = Instant::now();
        for index in 0..steps {
            let step = index as Step;
            ctx.state.current_step = step;

            let batch = ctx.train.batch(index)?;
            let loss = ctx.model.forward(&batch)?;
            ctx.model.backward(loss)?;

            if (step + 1) % accumulation == 0 || index + 1 == steps {
                ctx.optimizer.step(&mut ctx.model)?;
                if let Some(schedule) = ctx.schedule.as_mut() {
                    schedule.advance();
                }
                apply_schedule::<M, O>(&mut ctx.optimizer, ctx.schedule.as_ref());
                ctx.optimizer.zero_grad(&mut ctx.model);
                ctx.state.optimizer_steps += 1;
            }

            if step % self.config.log_step == 0 {
                let learning_rate = ctx.optimizer.learning_rate();
                info!(
                    epoch,
                    num_train_epochs = total_epochs,
                    step,
                    steps,
                    loss,
                    ppl = perplexity(loss),
                    learning_rate,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Train"
                );
                self.emit(
                    identity,
                    LoopEvent::TrainStep {
                        epoch,
                        step,
                        loss,
                        learning_rate,
                    },
                );
                start = Instant::now();
            }
        }

        self.emit(identity, LoopEvent::PhaseFinished { epoch, phase: Phase::Training });
        Ok(())
    }

    async fn evaluate<M, O, S>(&self, ctx: &mut WorkerContext<M, O, S>, epoch: Epoch) -> Result<EvalMetrics>
    where
        S: DataSource,
        M: Model<Batch = S::Batch>,
        O: Optimizer<M>,
    {
        let identity = ctx.identity();
        let steps = self.phase_length(ctx.eval.as_ref().map_or(0, |e| e.len()));

        info!(epoch, rank = identity.rank, steps, "Start eval epoch");
        self.enter(ctx, epoch, Phase::Evaluating);
        ctx.model.set_mode(ModelMode::Eval);

        let start = Instant::now();
        let mut losses = Vec::with_capacity(steps * identity.size as usize);
        for index in 0..steps {
            let loss = eval_loss(ctx, index)?;
            losses.extend(ctx.coordinator.all_gather(loss).await?);
        }

        let metrics = EvalMetrics::from_losses(&losses);
        if metrics.is_saturated() {
            warn!(epoch, samples = metrics.samples, "Eval loss is not finite, saturated to inf");
        }
        info!(
            epoch,
            num_train_epochs = self.config.num_train_epochs,
            loss = metrics.loss,
            ppl = metrics.perplexity,
            samples = metrics.samples,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Eval"
        );

        self.emit(identity, LoopEvent::EvalCompleted { epoch, metrics });
        self.emit(identity, LoopEvent::PhaseFinished { epoch, phase: Phase::Evaluating });
        Ok(metrics)
    }

    /// Write this rank's record; true if it was written
    async fn save_checkpoint<M, O, S>(&self, ctx: &mut WorkerContext<M, O, S>, epoch: Epoch) -> bool
    where
        M: Stateful,
        O: Stateful,
    {
        let identity = ctx.identity();
        self.enter(ctx, epoch, Phase::Checkpointing);

        let outcome = match &ctx.checkpoint {
            CheckpointTarget::Disabled(reason) => SaveOutcome::Skipped(*reason),
            CheckpointTarget::Enabled(store) => match snapshot(ctx, epoch) {
                Ok(record) => {
                    info!(epoch, path = %store.describe(), "Save checkpoint");
                    ctx.checkpoint.save(&record).await
                }
                Err(e) => SaveOutcome::Failed(e),
            },
        };

        let saved = match outcome {
            SaveOutcome::Saved { path, size_bytes } => {
                info!(epoch, path = %path, size_bytes, "Save checkpoint finish");
                self.emit(
                    identity,
                    LoopEvent::CheckpointSaved {
                        epoch,
                        path,
                        size_bytes,
                    },
                );
                true
            }
            SaveOutcome::Skipped(reason) => {
                warn!(epoch, reason = %reason, "Checkpoint skipped");
                false
            }
            SaveOutcome::Failed(e) => {
                error!(epoch, error = %e, "Checkpoint save failed, continuing");
                self.emit(
                    identity,
                    LoopEvent::CheckpointFailed {
                        epoch,
                        error: e.to_string(),
                    },
                );
                false
            }
        };

        self.emit(identity, LoopEvent::PhaseFinished { epoch, phase: Phase::Checkpointing });
        saved
    }

    /// Save the artifact from the main worker, then meet every worker once more
    async fn finalize<M, O, S>(&self, ctx: &mut WorkerContext<M, O, S>) -> Result<bool>
    where
        M: Stateful,
    {
        let identity = ctx.identity();
        let epoch = ctx.state.current_epoch;
        self.enter(ctx, epoch, Phase::Finalizing);

        let mut saved = false;
        match self.config.output.as_deref() {
            None => info!(rank = identity.rank, "No output configured, skip final save"),
            Some(output) if ctx.coordinator.is_main() => {
                info!(output = %output.display(), "Start save model");
                let written = match ctx.model.state_dict() {
                    Ok(state) => save_artifact(state, output).await,
                    Err(e) => Err(e),
                };
                match written {
                    Ok((path, size_bytes)) => {
                        info!(path = %path, size_bytes, "Finish save model");
                        self.emit(identity, LoopEvent::ArtifactSaved { path, size_bytes });
                        saved = true;
                    }
                    Err(e) => error!(output = %output.display(), error = %e, "Final model save failed"),
                }
            }
            Some(_) => {}
        }

        ctx.coordinator.barrier("finalize").await?;
        self.emit(identity, LoopEvent::PhaseFinished { epoch, phase: Phase::Finalizing });
        Ok(saved)
    }

    /// Batches to process this phase; one when `abbreviated_run` is set
    fn phase_length(&self, batches: usize) -> usize {
        if self.config.abbreviated_run {
            batches.min(1)
        } else {
            batches
        }
    }

    /// Move the loop into `phase` and report it
    fn enter<M, O, S>(&self, ctx: &mut WorkerContext<M, O, S>, epoch: Epoch, phase: Phase) {
        ctx.state.phase = phase;
        self.emit(ctx.identity(), LoopEvent::PhaseStarted { epoch, phase });
    }

    fn emit(&self, identity: WorkerIdentity, event: LoopEvent) {
        self.observer.on_event(identity, &event);
    }
}

fn recovery_targets<'a, M, O>(
    model: &'a mut M,
    optimizer: &'a mut O,
    schedule: Option<&'a mut Schedule>,
) -> RecoveryTargets<'a>
where
    M: Stateful + Send,
    O: Stateful + Send,
{
    RecoveryTargets {
        model,
        optimizer,
        scheduler: schedule.map(|s| s as &mut (dyn Stateful + Send)),
    }
}

/// Set the optimizer's rate from the schedule, if one is active
fn apply_schedule<M: ?Sized, O: Optimizer<M>>(optimizer: &mut O, schedule: Option<&Schedule>) {
    if let Some(schedule) = schedule {
        let learning_rate = schedule.learning_rate(optimizer.base_learning_rate());
        optimizer.set_learning_rate(learning_rate);
    }
}

fn eval_loss<M, O, S>(ctx: &mut WorkerContext<M, O, S>, index: usize) -> Result<f64>
where
    S: DataSource,
    M: Model<Batch = S::Batch>,
{
    let eval = ctx
        .eval
        .as_ref()
        .ok_or_else(|| Error::collaborator("eval source", "not configured"))?;
    let batch = eval.batch(index)?;
    ctx.model.forward(&batch)
}

fn snapshot<M: Stateful, O: Stateful, S>(ctx: &WorkerContext<M, O, S>, epoch: Epoch) -> Result<CheckpointRecord> {
    Ok(CheckpointRecord {
        epoch,
        model_state: ctx.model.state_dict()?,
        optimizer_state: ctx.optimizer.state_dict()?,
        scheduler_state: ctx.schedule.as_ref().map(Stateful::state_dict).transpose()?,
    })
}

#[instrument(skip_all, fields(output = %output.display()))]
async fn save_artifact(state: Bytes, output: &Path) -> Result<(String, u64)> {
    let storage = LocalStorage::new(output);
    let size = storage.write(ARTIFACT_FILE, state).await?;
    Ok((storage.describe(ARTIFACT_FILE), size))
}
