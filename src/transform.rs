//! Owned handles over engine vector transforms.

use tracing::debug;

use crate::error::{QuiverError, Result};
use crate::index::traits::{VectorEngine, VectorTransform};

/// An exclusively owned transform. Like [`crate::index::Index`], releasing is
/// idempotent and a released transform rejects every operation.
pub struct Transform {
    native: Option<Box<dyn VectorTransform>>,
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.native {
            Some(t) => f
                .debug_struct("Transform")
                .field("d_in", &t.d_in())
                .field("d_out", &t.d_out())
                .field("trained", &t.is_trained())
                .finish(),
            None => f.debug_struct("Transform").field("released", &true).finish(),
        }
    }
}

impl Transform {
    /// PCA from `d_in` down to `d_out` dimensions.
    pub fn pca(
        engine: &dyn VectorEngine,
        d_in: usize,
        d_out: usize,
        eigen_power: f32,
        random_rotation: bool,
    ) -> Result<Self> {
        let native = engine
            .pca_matrix(d_in, d_out, eigen_power, random_rotation)
            .map_err(|e| QuiverError::Construction(e.message))?;
        debug!(d_in, d_out, eigen_power, random_rotation, "created PCA transform");
        Ok(Self::from_native(native))
    }

    pub fn from_native(native: Box<dyn VectorTransform>) -> Self {
        Self {
            native: Some(native),
        }
    }

    fn native(&self) -> Result<&dyn VectorTransform> {
        self.native
            .as_deref()
            .ok_or_else(|| QuiverError::invalid("transform has been released"))
    }

    /// Engine structure behind the handle, for engine-specific accessors.
    pub fn as_native(&self) -> Option<&dyn VectorTransform> {
        self.native.as_deref()
    }

    pub fn d_in(&self) -> usize {
        self.native.as_ref().map_or(0, |t| t.d_in())
    }

    pub fn d_out(&self) -> usize {
        self.native.as_ref().map_or(0, |t| t.d_out())
    }

    pub fn is_trained(&self) -> bool {
        self.native.as_ref().is_some_and(|t| t.is_trained())
    }

    pub fn is_released(&self) -> bool {
        self.native.is_none()
    }

    fn count_vectors(&self, x: &[f32]) -> Result<usize> {
        let d_in = self.native()?.d_in();
        if x.is_empty() {
            return Err(QuiverError::invalid("no vectors supplied"));
        }
        if d_in == 0 || x.len() % d_in != 0 {
            return Err(QuiverError::DimensionMismatch {
                expected: d_in,
                actual: x.len(),
            });
        }
        Ok(x.len() / d_in)
    }

    pub fn train(&mut self, x: &[f32]) -> Result<()> {
        let n = self.count_vectors(x)?;
        self.native
            .as_deref_mut()
            .ok_or_else(|| QuiverError::invalid("transform has been released"))?
            .train(n, x)?;
        Ok(())
    }

    /// Transform every vector of `x`, returning `n * d_out` floats.
    pub fn apply(&self, x: &[f32]) -> Result<Vec<f32>> {
        let n = self.count_vectors(x)?;
        Ok(self.native()?.apply(n, x)?)
    }

    pub fn release(&mut self) {
        if self.native.take().is_some() {
            debug!("released transform");
        }
    }
}
