//! Per-layer incremental decoding state.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::Tensor;

use crate::core::{AttentionError, Result};

/// Previously projected keys and values, each `[batch, heads, len, head_dim]`.
///
/// Callers hand the state to the engine as `&mut` for the duration of a call;
/// the type is `Send` but deliberately not `Sync`.
#[derive(Debug, Default)]
pub struct IncrementalState {
    entry: Option<(Tensor, Tensor)>,
    _not_sync: PhantomData<Cell<()>>,
}

impl IncrementalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Number of cached positions; zero when empty.
    pub fn len(&self) -> usize {
        self.entry
            .as_ref()
            .and_then(|(key, _)| key.dims().get(2).copied())
            .unwrap_or(0)
    }

    pub fn prev_key(&self) -> Option<&Tensor> {
        self.entry.as_ref().map(|(key, _)| key)
    }

    pub fn prev_value(&self) -> Option<&Tensor> {
        self.entry.as_ref().map(|(_, value)| value)
    }

    /// Drops the cached entry.
    pub fn reset(&mut self) {
        self.entry = None;
    }

    /// Keeps the batch rows named by `batch_indices`, in that order.
    pub fn reorder(&mut self, batch_indices: &[u32]) -> Result<()> {
        let Some((key, value)) = self.entry.as_ref() else {
            return Ok(());
        };
        let batch = key.dim(0)?;
        if let Some(bad) = batch_indices.iter().find(|&&i| i as usize >= batch) {
            return Err(AttentionError::shape(format!(
                "reorder index {bad} out of range for cached batch {batch}"
            )));
        }
        let indices = Tensor::new(batch_indices, key.device())?;
        let key = key.index_select(&indices, 0)?;
        let value = value.index_select(&indices, 0)?;
        log::debug!(
            "incremental state reordered batch {batch} -> {}",
            batch_indices.len()
        );
        self.entry = Some((key, value));
        Ok(())
    }

    /// Appends `key`/`value` (`[batch, heads, new_len, head_dim]`) to the cached
    /// entry without storing the result.
    pub(crate) fn extend(&self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let Some((prev_key, prev_value)) = self.entry.as_ref() else {
            return Ok((key.clone(), value.clone()));
        };
        let (pb, ph, prev_len, pd) = prev_key.dims4()?;
        let (b, h, _, d) = key.dims4()?;
        if (pb, ph, pd) != (b, h, d) || prev_value.dims() != prev_key.dims() {
            return Err(AttentionError::shape(format!(
                "cached entry [{pb}, {ph}, {prev_len}, {pd}] does not match step [{b}, {h}, _, {d}]"
            )));
        }
        let key = Tensor::cat(&[prev_key, &key.to_dtype(prev_key.dtype())?], 2)?;
        let value = Tensor::cat(&[prev_value, &value.to_dtype(prev_value.dtype())?], 2)?;
        Ok((key, value))
    }

    /// Replaces the cached entry with tensors produced by [`Self::extend`].
    pub(crate) fn store(&mut self, key: Tensor, value: Tensor) {
        log::debug!(
            "incremental state holds {} -> {} positions",
            self.len(),
            key.dims().get(2).copied().unwrap_or(0)
        );
        self.entry = Some((key, value));
    }

    /// [`Self::extend`] followed by [`Self::store`].
    #[cfg(test)]
    pub(crate) fn merge(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let (key, value) = self.extend(key, value)?;
        self.store(key.clone(), value.clone());
        Ok((key, value))
    }
}
