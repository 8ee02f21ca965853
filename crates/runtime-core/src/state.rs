//! State-dict contract for objects captured in checkpoints

use crate::Result;
use bytes::Bytes;

/// An object whose state can be captured and restored as an opaque blob
///
/// The model, optimizer and learning-rate schedule all implement this; the
/// checkpoint layer never looks inside the bytes.
pub trait Stateful {
    /// Serialize the current state
    fn state_dict(&self) -> Result<Bytes>;

    /// Replace the current state with a previously captured one
    fn load_state_dict(&mut self, state: &[u8]) -> Result<()>;
}
