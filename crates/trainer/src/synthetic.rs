//! Synthetic collaborators
//!
//! A one-feature linear regression, plain SGD and a seeded data processer.
//! Enough to drive the loop end to end without a tensor engine.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use runtime_core::{DataProcesserConfig, Error, Result, Stateful, WorkerIdentity};
use tracing::debug;

use crate::collaborators::{
    DataProcesser, Model, ModelMode, Optimizer, PreparedData, VecSource,
};
use crate::processer::DataProcesserRegistry;

/// Registry key of [`SyntheticProcesser`]
pub const SYNTHETIC: &str = "synthetic";

/// Inputs and regression targets of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticBatch {
    pub inputs: Vec<f64>,
    pub targets: Vec<f64>,
}

impl SyntheticBatch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// `y = weight * x + bias`, trained on mean squared error
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticModel {
    weight: f64,
    bias: f64,
    grad: (f64, f64),
    pending: Option<(f64, f64)>,
    mode: ModelMode,
}

impl SyntheticModel {
    pub fn new(weight: f64, bias: f64) -> Self {
        Self {
            weight,
            bias,
            grad: (0.0, 0.0),
            pending: None,
            mode: ModelMode::Train,
        }
    }

    /// Current `(weight, bias)`
    pub fn parameters(&self) -> (f64, f64) {
        (self.weight, self.bias)
    }

    /// Accumulated `(d_weight, d_bias)`
    pub fn gradients(&self) -> (f64, f64) {
        self.grad
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn apply_gradients(&mut self, learning_rate: f64) {
        self.weight -= learning_rate * self.grad.0;
        self.bias -= learning_rate * self.grad.1;
    }

    pub fn clear_gradients(&mut self) {
        self.grad = (0.0, 0.0);
    }
}

impl Default for SyntheticModel {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl Stateful for SyntheticModel {
    fn state_dict(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_f64_le(self.weight);
        buf.put_f64_le(self.bias);
        Ok(buf.freeze())
    }

    fn load_state_dict(&mut self, state: &[u8]) -> Result<()> {
        if state.len() != 16 {
            return Err(Error::StateDict {
                component: "model".to_string(),
                message: format!("expected 16 bytes, got {}", state.len()),
            });
        }
        let mut buf = state;
        self.weight = buf.get_f64_le();
        self.bias = buf.get_f64_le();
        self.grad = (0.0, 0.0);
        self.pending = None;
        Ok(())
    }
}

impl Model for SyntheticModel {
    type Batch = SyntheticBatch;

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
        self.pending = None;
    }

    fn forward(&mut self, batch: &SyntheticBatch) -> Result<f64> {
        if batch.is_empty() || batch.inputs.len() != batch.targets.len() {
            return Err(Error::collaborator(
                "model",
                format!(
                    "malformed batch: {} inputs, {} targets",
                    batch.inputs.len(),
                    batch.targets.len()
                ),
            ));
        }

        let n = batch.len() as f64;
        let (mut loss, mut d_weight, mut d_bias) = (0.0, 0.0, 0.0);
        for (x, y) in batch.inputs.iter().zip(&batch.targets) {
            let err = self.weight * x + self.bias - y;
            loss += err * err;
            d_weight += 2.0 * err * x;
            d_bias += 2.0 * err;
        }

        self.pending = match self.mode {
            ModelMode::Train => Some((d_weight / n, d_bias / n)),
            ModelMode::Eval => None,
        };
        Ok(loss / n)
    }

    fn backward(&mut self, _loss: f64) -> Result<()> {
        let (d_weight, d_bias) = self.pending.take().ok_or_else(|| {
            Error::collaborator("model", "backward called without a training forward pass")
        })?;
        self.grad.0 += d_weight;
        self.grad.1 += d_bias;
        Ok(())
    }
}

/// Stochastic gradient descent with a schedulable rate
#[derive(Debug, Clone, PartialEq)]
pub struct SgdOptimizer {
    base_learning_rate: f64,
    learning_rate: f64,
    steps: u64,
}

impl SgdOptimizer {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            base_learning_rate: learning_rate,
            learning_rate,
            steps: 0,
        }
    }

    /// Updates applied so far, including those before a recovery
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Stateful for SgdOptimizer {
    fn state_dict(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_f64_le(self.base_learning_rate);
        buf.put_f64_le(self.learning_rate);
        buf.put_u64_le(self.steps);
        Ok(buf.freeze())
    }

    fn load_state_dict(&mut self, state: &[u8]) -> Result<()> {
        if state.len() != 24 {
            return Err(Error::StateDict {
                component: "optimizer".to_string(),
                message: format!("expected 24 bytes, got {}", state.len()),
            });
        }
        let mut buf = state;
        self.base_learning_rate = buf.get_f64_le();
        self.learning_rate = buf.get_f64_le();
        self.steps = buf.get_u64_le();
        Ok(())
    }
}

impl Optimizer<SyntheticModel> for SgdOptimizer {
    fn step(&mut self, model: &mut SyntheticModel) -> Result<()> {
        model.apply_gradients(self.learning_rate);
        self.steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self, model: &mut SyntheticModel) {
        model.clear_gradients();
    }

    fn base_learning_rate(&self) -> f64 {
        self.base_learning_rate
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }
}

/// Ground truth the synthetic samples are drawn around
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTarget {
    pub weight: f64,
    pub bias: f64,
}

impl Default for LinearTarget {
    fn default() -> Self {
        Self {
            weight: 2.0,
            bias: -0.5,
        }
    }
}

/// Seeded sample generator sharded by rank
///
/// Every rank draws the same global stream and keeps every `size`-th sample
/// starting at its rank. The remainder is dropped so all ranks see the same
/// number of batches.
#[derive(Debug, Clone)]
pub struct SyntheticProcesser {
    samples: usize,
    eval_samples: usize,
    batch_size: usize,
    seed: u64,
    noise: f64,
    identity: WorkerIdentity,
}

impl SyntheticProcesser {
    fn shard(&self, total: usize, seed: u64, target: LinearTarget) -> Vec<SyntheticBatch> {
        let size = self.identity.size as usize;
        let rank = self.identity.rank as usize;
        let per_rank = total / size;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut points = Vec::with_capacity(per_rank);
        for index in 0..per_rank * size {
            let x: f64 = rng.gen_range(-1.0..1.0);
            let jitter: f64 = rng.gen_range(-1.0..1.0);
            if index % size == rank {
                points.push((x, target.weight * x + target.bias + self.noise * jitter));
            }
        }

        points
            .chunks(self.batch_size)
            .map(|chunk| SyntheticBatch {
                inputs: chunk.iter().map(|(x, _)| *x).collect(),
                targets: chunk.iter().map(|(_, y)| *y).collect(),
            })
            .collect()
    }
}

impl DataProcesser for SyntheticProcesser {
    type Tokenizer = ();
    type Dataset = LinearTarget;
    type Source = VecSource<SyntheticBatch>;

    fn prepare(
        &self,
        _tokenizer: &(),
        target: LinearTarget,
    ) -> Result<PreparedData<VecSource<SyntheticBatch>>> {
        let train = self.shard(self.samples, self.seed, target);
        let eval = (self.eval_samples > 0)
            .then(|| self.shard(self.eval_samples, self.seed.wrapping_add(1), target));

        debug!(
            rank = self.identity.rank,
            train_batches = train.len(),
            eval_batches = eval.as_ref().map_or(0, Vec::len),
            "Synthetic data generated"
        );
        Ok(PreparedData {
            train: VecSource::new(train),
            eval: eval.map(VecSource::new),
        })
    }
}

/// Factory registered under [`SYNTHETIC`]
///
/// Options: `samples` (256), `eval_samples` (64, 0 disables evaluation),
/// `batch_size` (16), `seed` (42), `noise` (0.01).
pub fn build_synthetic(
    config: &DataProcesserConfig,
    identity: WorkerIdentity,
) -> Result<SyntheticProcesser> {
    let batch_size = config.option_u64("batch_size", 16)? as usize;
    if batch_size == 0 {
        return Err(Error::InvalidConfig {
            message: "dataprocesser.batch_size must be at least 1".to_string(),
        });
    }
    Ok(SyntheticProcesser {
        samples: config.option_u64("samples", 256)? as usize,
        eval_samples: config.option_u64("eval_samples", 64)? as usize,
        batch_size,
        seed: config.option_u64("seed", 42)?,
        noise: config.option_f64("noise", 0.01)?,
        identity,
    })
}

/// Registry with the synthetic processer registered
pub fn synthetic_registry() -> DataProcesserRegistry<SyntheticProcesser> {
    DataProcesserRegistry::new().register(SYNTHETIC, build_synthetic)
}
