//! Precision policy shared by projections and normalisation layers.
//!
//! Parameters may live in `f16`/`bf16` while matmuls run in `f32`. Statistics
//! (mean, variance) are always gathered in [`PrecisionPolicy::reduction`], and
//! outputs are returned in [`PrecisionPolicy::storage`].

use candle_core::{DType, Result, Tensor};

/// Describes how tensors are cast during the phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Half-precision parameters compute in `f32`; everything reduces in `f32`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Comparison tolerance appropriate for values stored in `storage`.
    pub fn tolerance(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F64 => 1e-7,
            _ => 1e-5,
        }
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
