//! Multi-head attention layer.
//!
//! [`MultiheadAttention::forward`] runs the full pipeline for one call:
//! project q/k/v (the query is scaled by `head_dim^-0.5`), optionally prune,
//! split into heads, merge any incremental state, apply the position encoder,
//! compute attention on the configured backend, merge heads, optionally
//! normalise and apply the output projection.

use std::sync::{Arc, OnceLock};

use candle_core::{DType, Device, Tensor};
use mha_embedding::XPos;
use mha_layers::norm::build_layer_norm;
use mha_layers::{
    Linear, LinearLayer, NormConfig, NormalizationLayer, PrecisionPolicy as LayerPrecision,
};

use crate::core::{
    Attention, AttentionError, BackendSelection, Config, MaskSet, Result, ScoreParams,
};
use crate::fused::{pack_qkv, CpuFlashKernel, FusedKernel, FusedParams};
use crate::interop::{AttentionShape, PositionEncoder, Projection};
use crate::kv_cache::IncrementalState;
use crate::reference::ExactAttention;
use crate::sparsity::prune;

/// The four projections of an attention layer.
#[derive(Debug, Clone)]
pub struct Projections {
    pub q: Projection,
    pub k: Projection,
    pub v: Projection,
    pub out: Projection,
}

impl Projections {
    pub fn new(q: Projection, k: Projection, v: Projection, out: Projection) -> Self {
        Self { q, k, v, out }
    }

    /// Wraps four dense layers sharing one precision policy.
    pub fn from_layers(
        q: Arc<dyn LinearLayer>,
        k: Arc<dyn LinearLayer>,
        v: Arc<dyn LinearLayer>,
        out: Arc<dyn LinearLayer>,
        policy: LayerPrecision,
    ) -> Self {
        Self {
            q: Projection::new(q, policy),
            k: Projection::new(k, policy),
            v: Projection::new(v, policy),
            out: Projection::new(out, policy),
        }
    }

    /// Identity projections; useful for probing the attention core.
    pub fn identity(embed_dim: usize, dtype: DType, device: &Device) -> Result<Self> {
        let layer: Arc<dyn LinearLayer> = Arc::new(Linear::identity(embed_dim, dtype, device)?);
        Ok(Self::from_layers(
            layer.clone(),
            layer.clone(),
            layer.clone(),
            layer,
            LayerPrecision::from_parameter_dtype(dtype),
        ))
    }

    fn check(&self, embed_dim: usize) -> Result<()> {
        for (role, projection) in [("q", &self.q), ("k", &self.k), ("v", &self.v)] {
            if projection.output_dim() != embed_dim {
                return Err(AttentionError::config(format!(
                    "{role} projection produces {} features, expected {embed_dim}",
                    projection.output_dim()
                )));
            }
        }
        if self.q.input_dim() != embed_dim {
            return Err(AttentionError::config(format!(
                "q projection consumes {} features, expected {embed_dim}",
                self.q.input_dim()
            )));
        }
        if self.out.input_dim() != embed_dim || self.out.output_dim() != embed_dim {
            return Err(AttentionError::config(format!(
                "out projection must map {embed_dim} -> {embed_dim}, got {} -> {}",
                self.out.input_dim(),
                self.out.output_dim()
            )));
        }
        Ok(())
    }
}

/// Optional inputs of a forward call.
#[derive(Debug, Default)]
pub struct AttentionInputs<'a> {
    /// Keys/values from earlier decoding steps; read, extended and written back.
    pub incremental_state: Option<&'a mut IncrementalState>,
    /// `[batch, src_len]`, non-zero marks a padded key.
    pub key_padding_mask: Option<&'a Tensor>,
    /// Additive float mask broadcastable to `[batch, heads, tgt_len, src_len]`.
    pub attn_mask: Option<&'a Tensor>,
    /// Bias added to the normalised weights, `batch * heads * tgt * src` elements.
    pub rel_pos: Option<&'a Tensor>,
    /// `key`/`value` are already projected; skip their projections.
    pub precomputed_kv: bool,
    /// Enables dropout.
    pub training: bool,
}

/// Result of a forward call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, tgt_len, embed_dim]`.
    pub output: Tensor,
    /// `[batch, heads, tgt_len, src_len]`; `None` on the fused backend.
    pub weights: Option<Tensor>,
}

/// Multi-head scaled dot-product attention.
pub struct MultiheadAttention {
    config: Config,
    head_dim: usize,
    scaling: f64,
    projections: Projections,
    inner_norm: Option<Arc<dyn NormalizationLayer>>,
    position: Option<Arc<dyn PositionEncoder>>,
    fused: Arc<dyn FusedKernel>,
    first_call: OnceLock<()>,
}

impl std::fmt::Debug for MultiheadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiheadAttention")
            .field("config", &self.config)
            .field("projections", &self.projections)
            .field("inner_norm", &self.inner_norm.is_some())
            .field("position", &self.position.is_some())
            .finish()
    }
}

impl MultiheadAttention {
    /// Applies environment overrides, validates `config` and builds the layer.
    ///
    /// With `xpos_rel_pos` on a self-attention layer an [`XPos`] encoder is
    /// installed; with `subln` on a self-attention layer a LayerNorm over the
    /// merged heads is built on `device`.
    pub fn new(mut config: Config, projections: Projections, device: &Device) -> Result<Self> {
        config.apply_env_overrides();
        config.validate()?;
        projections.check(config.embed_dim)?;

        let head_dim = config.head_dim();
        let position: Option<Arc<dyn PositionEncoder>> =
            if config.self_attention && config.xpos_rel_pos {
                let xpos = XPos::new(head_dim, config.xpos_scale_base)
                    .map_err(|err| AttentionError::config(err.to_string()))?;
                Some(Arc::new(xpos))
            } else {
                None
            };
        let inner_norm = if config.self_attention && config.subln {
            Some(build_layer_norm(
                config.norm_backend,
                NormConfig::new(config.embed_dim, config.layernorm_eps),
                DType::F32,
                device,
            )?)
        } else {
            None
        };

        Ok(Self {
            scaling: (head_dim as f64).powf(-0.5),
            head_dim,
            config,
            projections,
            inner_norm,
            position,
            fused: Arc::new(CpuFlashKernel::new()),
            first_call: OnceLock::new(),
        })
    }

    /// Replaces the position encoder; only consulted for self-attention.
    pub fn with_position_encoder(mut self, encoder: Arc<dyn PositionEncoder>) -> Self {
        self.position = Some(encoder);
        self
    }

    pub fn with_fused_kernel(mut self, kernel: Arc<dyn FusedKernel>) -> Self {
        self.fused = kernel;
        self
    }

    /// Replaces the LayerNorm applied before the output projection.
    pub fn with_inner_norm(mut self, norm: Arc<dyn NormalizationLayer>) -> Result<Self> {
        let hidden = norm.config().hidden_size;
        if hidden != self.config.embed_dim {
            return Err(AttentionError::config(format!(
                "inner norm normalises {hidden} features, expected {}",
                self.config.embed_dim
            )));
        }
        self.inner_norm = Some(norm);
        Ok(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Factor applied to projected queries.
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Runs one attention call.
    ///
    /// With an incremental state the new keys/values are appended to the
    /// cache, which is only written back once the whole call succeeds. XPos
    /// then places the query at offset `src_len - tgt_len` of the merged key
    /// window (merged length - 1 for a single-token step), so a multi-token
    /// prefill followed by single-token decoding lines up with one full call.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        inputs: AttentionInputs<'_>,
    ) -> Result<AttentionOutput> {
        self.log_first_call();

        let AttentionInputs {
            incremental_state,
            key_padding_mask,
            attn_mask,
            rel_pos,
            precomputed_kv,
            training,
        } = inputs;
        let cached_len = incremental_state.as_ref().map_or(0, |state| state.len());
        let (batch, tgt_len, src_len) = self.preflight(query, key, value, precomputed_kv)?;
        let total_src = src_len + cached_len;
        self.check_optional_inputs(
            batch,
            tgt_len,
            total_src,
            key_padding_mask,
            rel_pos,
            incremental_state.is_some(),
            attn_mask.is_some(),
        )?;

        let mut q = self.projections.q.transform(query)?.affine(self.scaling, 0.0)?;
        let (mut k, mut v) = if precomputed_kv {
            (key.clone(), value.clone())
        } else {
            (
                self.projections.k.transform(key)?,
                self.projections.v.transform(value)?,
            )
        };
        if let Some(ratio) = self.config.sparsity {
            q = prune(&q, ratio)?;
            k = prune(&k, ratio)?;
            v = prune(&v, ratio)?;
        }

        let shape = AttentionShape {
            batch,
            num_heads: self.config.num_heads,
            head_dim: self.head_dim,
        };
        let mut q = shape.split_heads(&q)?;
        let mut k = shape.split_heads(&k)?;
        let mut v = shape.split_heads(&v)?;

        let has_state = incremental_state.is_some();
        let pending = match incremental_state.as_deref() {
            Some(state) => {
                let (merged_k, merged_v) =
                    state.extend(&shape.to_cache_layout(&k)?, &shape.to_cache_layout(&v)?)?;
                k = shape.from_cache_layout(&merged_k)?;
                v = shape.from_cache_layout(&merged_v)?;
                Some((merged_k, merged_v))
            }
            None => None,
        };
        let src_len = k.dim(1)?;

        if let (true, Some(position)) = (self.config.self_attention, self.position.as_ref()) {
            let offset = if has_state {
                src_len.saturating_sub(tgt_len)
            } else {
                0
            };
            k = position.encode(&k, 0, true)?;
            q = position.encode(&q, offset, false)?;
        }

        let dropout_p = if training {
            self.config.active_dropout()
        } else {
            None
        };
        let (attn, weights) = match self.config.backend {
            BackendSelection::Reference => {
                let scored = ExactAttention.attend(
                    &q,
                    &k,
                    &v,
                    &MaskSet {
                        attn_mask,
                        key_padding_mask,
                        causal: self.config.causal,
                    },
                    &ScoreParams {
                        batch,
                        num_heads: self.config.num_heads,
                        rel_pos,
                        dropout_p,
                        precision: self.config.precision,
                    },
                )?;
                (shape.merge_heads(&scored.attn)?, Some(scored.weights))
            }
            BackendSelection::Fused => {
                log::debug!("mha dispatching to fused kernel batch={batch} seq={tgt_len}");
                let packed = pack_qkv(&q, &k, &v, batch, self.config.num_heads)?;
                let fused = self.fused.compute(
                    &packed,
                    key_padding_mask,
                    &FusedParams {
                        causal: self.config.causal,
                        dropout_p: dropout_p.unwrap_or(0.0),
                        softmax_scale: 1.0,
                    },
                )?;
                let attn = fused
                    .attn
                    .reshape((batch, tgt_len, self.config.embed_dim))?
                    .to_dtype(q.dtype())?;
                (attn, fused.weights)
            }
        };

        let attn = match &self.inner_norm {
            Some(norm) => norm.forward(&attn, &self.projections.out.policy())?,
            None => attn,
        };
        let output = self.projections.out.transform(&attn)?;
        if let (Some(state), Some((merged_k, merged_v))) = (incremental_state, pending) {
            state.store(merged_k, merged_v);
        }
        Ok(AttentionOutput { output, weights })
    }

    fn log_first_call(&self) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "mha init backend={:?} precision={:?} embed_dim={} heads={} self_attention={} causal={} xpos={} subln={} sparsity={:?}",
                self.config.backend,
                self.config.precision,
                self.config.embed_dim,
                self.config.num_heads,
                self.config.self_attention,
                self.config.causal,
                self.position.is_some(),
                self.inner_norm.is_some(),
                self.config.sparsity,
            );
        }
    }

    /// Validates q/k/v and returns `(batch, tgt_len, src_len)`.
    fn preflight(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        precomputed_kv: bool,
    ) -> Result<(usize, usize, usize)> {
        let embed_dim = self.config.embed_dim;
        let (batch, tgt_len, width) = query.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "query must be [batch, tgt_len, {embed_dim}], got {:?}",
                query.dims()
            ))
        })?;
        if width != embed_dim {
            return Err(AttentionError::shape(format!(
                "query embed dim {width} does not match configured {embed_dim}"
            )));
        }
        let (key_batch, src_len, key_width) = key.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "key must be [batch, src_len, dim], got {:?}",
                key.dims()
            ))
        })?;
        let (value_batch, value_len, value_width) = value.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "value must be [batch, src_len, dim], got {:?}",
                value.dims()
            ))
        })?;
        if key_batch != batch || value_batch != batch {
            return Err(AttentionError::shape(format!(
                "key/value batch ({key_batch}/{value_batch}) must equal query batch {batch}"
            )));
        }
        if value_len != src_len {
            return Err(AttentionError::shape(format!(
                "key and value lengths differ: {src_len} vs {value_len}"
            )));
        }
        let (expected_key, expected_value) = if precomputed_kv {
            (embed_dim, embed_dim)
        } else {
            (
                self.projections.k.input_dim(),
                self.projections.v.input_dim(),
            )
        };
        if key_width != expected_key || value_width != expected_value {
            return Err(AttentionError::shape(format!(
                "key/value widths {key_width}/{value_width} do not match expected {expected_key}/{expected_value}"
            )));
        }

        let dtype = query.dtype();
        if !dtype.is_float() {
            return Err(AttentionError::dtype(format!("{dtype:?}")));
        }
        if key.dtype() != dtype || value.dtype() != dtype {
            return Err(AttentionError::shape(format!(
                "query/key/value dtypes differ: {dtype:?}/{:?}/{:?}",
                key.dtype(),
                value.dtype()
            )));
        }
        let device = query.device();
        if !device.same_device(key.device()) || !device.same_device(value.device()) {
            return Err(AttentionError::shape(
                "query, key and value must reside on the same device",
            ));
        }
        Ok((batch, tgt_len, src_len))
    }

    #[allow(clippy::too_many_arguments)]
    fn check_optional_inputs(
        &self,
        batch: usize,
        tgt_len: usize,
        src_len: usize,
        key_padding_mask: Option<&Tensor>,
        rel_pos: Option<&Tensor>,
        has_state: bool,
        has_attn_mask: bool,
    ) -> Result<()> {
        if let Some(mask) = key_padding_mask {
            if mask.dims() != [batch, src_len] {
                return Err(AttentionError::shape(format!(
                    "key_padding_mask must be [{batch}, {src_len}], got {:?}",
                    mask.dims()
                )));
            }
        }
        if let Some(bias) = rel_pos {
            let expected = batch * self.config.num_heads * tgt_len * src_len;
            if bias.elem_count() != expected {
                return Err(AttentionError::shape(format!(
                    "rel_pos has {} elements, expected {expected}",
                    bias.elem_count()
                )));
            }
        }
        if self.config.backend == BackendSelection::Fused {
            if has_attn_mask {
                return Err(AttentionError::unsupported(
                    "fused backend does not accept an additive attn_mask",
                ));
            }
            if rel_pos.is_some() {
                return Err(AttentionError::unsupported(
                    "fused backend does not accept a relative position bias",
                ));
            }
            if has_state {
                return Err(AttentionError::unsupported(
                    "fused backend does not support incremental decoding",
                ));
            }
            if tgt_len != src_len {
                return Err(AttentionError::unsupported(format!(
                    "fused backend requires equal query and key lengths, got {tgt_len} and {src_len}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(MultiheadAttention: Send, Sync);

    fn layer(config: Config) -> Result<MultiheadAttention> {
        let device = Device::Cpu;
        let projections = Projections::identity(config.embed_dim, DType::F32, &device)?;
        MultiheadAttention::new(config, projections, &device)
    }

    #[test]
    fn construction_validates_config() -> Result<()> {
        let mut config = Config::self_attention(8, 2);
        config.encoder_decoder_attention = true;
        let err = layer(config).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));

        let device = Device::Cpu;
        let projections = Projections::identity(6, DType::F32, &device)?;
        let err = MultiheadAttention::new(Config::self_attention(8, 2), projections, &device)
            .unwrap_err();
        assert!(err.is_precondition());
        Ok(())
    }

    #[test]
    fn scaling_follows_head_dim() -> Result<()> {
        let mha = layer(Config::self_attention(32, 2))?;
        assert_eq!(mha.head_dim(), 16);
        assert!((mha.scaling() - 0.25).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn xpos_and_subln_only_for_self_attention() -> Result<()> {
        let mut config = Config::encoder_decoder(8, 2);
        config.xpos_rel_pos = true;
        config.subln = true;
        let mha = layer(config.clone())?;
        assert!(mha.position.is_none());
        assert!(mha.inner_norm.is_none());

        config.self_attention = true;
        config.encoder_decoder_attention = false;
        let mha = layer(config)?;
        assert!(mha.position.is_some());
        assert!(mha.inner_norm.is_some());
        Ok(())
    }

    #[test]
    fn rejects_mismatched_query_width() -> Result<()> {
        let mha = layer(Config::self_attention(8, 2))?;
        let device = Device::Cpu;
        let query = Tensor::zeros((1, 3, 6), DType::F32, &device)?;
        let key = Tensor::zeros((1, 3, 8), DType::F32, &device)?;
        let err = mha
            .forward(&query, &key, &key, AttentionInputs::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }
}
