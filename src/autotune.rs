//! Named runtime parameters on built indexes.

use tracing::debug;

use crate::error::{QuiverError, Result};
use crate::index::AnyIndex;

/// Sets engine parameters by name, e.g. `nprobe`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterSpace;

impl ParameterSpace {
    pub fn new() -> Self {
        Self
    }

    /// Float indexes delegate to the engine, which rejects names it does not
    /// know. Binary indexes are not tunable.
    pub fn set_index_parameter(&self, index: &mut AnyIndex, name: &str, value: f64) -> Result<()> {
        match index {
            AnyIndex::Float(index) => {
                index.native_mut()?.set_parameter(name, value)?;
                debug!(name, value, "set index parameter");
                Ok(())
            }
            AnyIndex::Binary(_) => Err(QuiverError::invalid(
                "binary indexes not supported for auto-tuning",
            )),
        }
    }
}
