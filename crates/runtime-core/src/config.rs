//! Job configuration types
//!
//! A [`JobConfig`] is loaded once from JSON when the job starts and is read-only
//! afterwards. Every field has the default the training loop expects, so a
//! minimal config only names the data processer.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Total number of epochs to train
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: u64,

    /// Emit a training log line every N steps
    #[serde(default = "default_log_step")]
    pub log_step: u64,

    /// Checkpoint policy; absent disables save and recovery
    #[serde(default)]
    pub checkpoint: Option<CheckpointPolicy>,

    /// Learning-rate schedule policy; absent keeps the optimizer's raw rate
    #[serde(default)]
    pub lr_scheduler: Option<SchedulePolicy>,

    /// Final model artifact directory; `null` disables the final save
    #[serde(default = "default_output")]
    pub output: Option<PathBuf>,

    /// Data processer selection and options
    pub dataprocesser: DataProcesserConfig,

    /// Number of micro-batches accumulated per optimizer step
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: u64,

    /// Process a single batch per phase and epoch (smoke-test mode)
    #[serde(default)]
    pub abbreviated_run: bool,

    /// Cohort coordination settings
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

fn default_num_train_epochs() -> u64 {
    1
}

fn default_log_step() -> u64 {
    1
}

fn default_output() -> Option<PathBuf> {
    Some(PathBuf::from("./output"))
}

fn default_gradient_accumulation_steps() -> u64 {
    1
}

impl JobConfig {
    /// Create a config with defaults for everything but the data processer
    pub fn new(dataprocesser: DataProcesserConfig) -> Self {
        Self {
            num_train_epochs: default_num_train_epochs(),
            log_step: default_log_step(),
            checkpoint: None,
            lr_scheduler: None,
            output: default_output(),
            dataprocesser,
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            abbreviated_run: false,
            coordination: CoordinationConfig::default(),
        }
    }

    /// Parse and validate a config from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: JobConfig = serde_json::from_str(json).map_err(|e| Error::InvalidConfig {
            message: format!("failed to parse job config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading job config");
        let contents = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&contents)
    }

    /// Check the invariants the training loop relies on
    pub fn validate(&self) -> Result<()> {
        if self.log_step == 0 {
            return Err(Error::InvalidConfig {
                message: "log_step must be at least 1".to_string(),
            });
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(Error::InvalidConfig {
                message: "gradient_accumulation_steps must be at least 1".to_string(),
            });
        }
        if self.dataprocesser.kind.is_empty() {
            return Err(Error::InvalidConfig {
                message: "dataprocesser.type must be set".to_string(),
            });
        }
        if let Some(schedule) = &self.lr_scheduler {
            if let Some(max) = schedule.max_train_steps {
                if schedule.enable && schedule.num_warmup_steps > max {
                    return Err(Error::InvalidConfig {
                        message: format!(
                            "num_warmup_steps ({}) exceeds max_train_steps ({})",
                            schedule.num_warmup_steps, max
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Where rank-scoped checkpoints are kept
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// Root directory shared by every rank
    #[serde(default)]
    pub root_path: Option<PathBuf>,

    /// Job name used as the directory prefix
    #[serde(default)]
    pub model_name: Option<String>,
}

/// Learning-rate schedule policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePolicy {
    /// Whether a schedule is applied at all
    #[serde(default)]
    pub enable: bool,

    /// Schedule shape
    #[serde(default)]
    pub lr_scheduler_type: ScheduleKind,

    /// Linear warmup length in optimizer steps
    #[serde(default)]
    pub num_warmup_steps: u64,

    /// Total optimizer steps; derived from the epoch length when absent
    #[serde(default)]
    pub max_train_steps: Option<u64>,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            enable: false,
            lr_scheduler_type: ScheduleKind::default(),
            num_warmup_steps: 0,
            max_train_steps: None,
        }
    }
}

/// Supported schedule shapes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Warmup then linear decay to zero
    #[default]
    Linear,

    /// Warmup then half-cosine decay to zero
    Cosine,

    /// Warmup then one hard-restart cosine cycle
    CosineWithRestarts,

    /// Constant multiplier of one
    Constant,

    /// Warmup then constant
    ConstantWithWarmup,
}

/// Data processer selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProcesserConfig {
    /// Registry key of the processer
    #[serde(rename = "type")]
    pub kind: String,

    /// Processer specific options
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl DataProcesserConfig {
    /// Processer config with no options
    pub fn named(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: serde_json::Map::new(),
        }
    }

    /// Read an unsigned option, falling back to a default
    pub fn option_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.options.get(key) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| Error::InvalidConfig {
                message: format!("dataprocesser.{} must be an unsigned integer", key),
            }),
        }
    }

    /// Read a float option, falling back to a default
    pub fn option_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.options.get(key) {
            None => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| Error::InvalidConfig {
                message: format!("dataprocesser.{} must be a number", key),
            }),
        }
    }
}

/// Cohort coordination configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Timeout for barriers and gathers; absent waits forever
    #[serde(default, rename = "barrier_timeout_ms", with = "millis_serde")]
    pub barrier_timeout: Option<Duration>,
}

/// Optional duration serialized as milliseconds
mod millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
