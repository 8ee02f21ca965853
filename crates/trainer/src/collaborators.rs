//! Contracts for the collaborators the training loop drives
//!
//! The loop decides when these are called and what gets persisted; it never
//! looks inside a model, an optimizer or a batch.

use runtime_core::{Result, Stateful, WorkerIdentity};

/// Whether the model is training or evaluating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

/// A trainable model
pub trait Model: Stateful + Send {
    type Batch;

    fn set_mode(&mut self, mode: ModelMode);

    /// Run the forward pass and return the scalar loss
    ///
    /// In [`ModelMode::Eval`] no gradient information may be retained.
    fn forward(&mut self, batch: &Self::Batch) -> Result<f64>;

    /// Accumulate gradients for the most recent forward pass
    fn backward(&mut self, loss: f64) -> Result<()>;
}

/// An optimizer updating the parameters of `M`
pub trait Optimizer<M: ?Sized>: Stateful + Send {
    /// Apply the accumulated gradients
    fn step(&mut self, model: &mut M) -> Result<()>;

    /// Clear the accumulated gradients
    fn zero_grad(&mut self, model: &mut M);

    /// The configured learning rate a schedule multiplies
    fn base_learning_rate(&self) -> f64;

    /// The rate the next step will use
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);
}

/// A finite, restartable sequence of batches
///
/// Indexed access lets the loop re-iterate the source once per epoch.
pub trait DataSource: Send {
    type Batch;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batch(&self, index: usize) -> Result<Self::Batch>;
}

/// A data source over batches held in memory
#[derive(Debug, Clone)]
pub struct VecSource<B> {
    batches: Vec<B>,
}

impl<B> VecSource<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self { batches }
    }
}

impl<B: Clone + Send> DataSource for VecSource<B> {
    type Batch = B;

    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batch(&self, index: usize) -> Result<B> {
        self.batches.get(index).cloned().ok_or_else(|| {
            runtime_core::Error::collaborator(
                "data source",
                format!("batch {} out of range ({} batches)", index, self.batches.len()),
            )
        })
    }
}

/// Train and optional eval sources produced by a data processer
pub struct PreparedData<S> {
    pub train: S,
    pub eval: Option<S>,
}

/// Turns a raw dataset into batch sources for this worker
pub trait DataProcesser: Send {
    type Tokenizer: ?Sized;
    type Dataset;
    type Source: DataSource;

    fn prepare(
        &self,
        tokenizer: &Self::Tokenizer,
        dataset: Self::Dataset,
    ) -> Result<PreparedData<Self::Source>>;
}

/// Builds a data processer for a worker from its config section
pub type ProcesserFactory<P> =
    fn(&runtime_core::DataProcesserConfig, WorkerIdentity) -> Result<P>;
