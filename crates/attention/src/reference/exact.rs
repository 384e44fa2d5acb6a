//! Reference attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait: scores, masks,
//! an `f32` softmax, the post-softmax relative bias, dropout and the value
//! matmul, in that order.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::dropout;
use mha_layers::PrecisionPolicy as LayerPrecision;

use crate::core::{
    Attention, AttentionError, MaskSet, PrecisionPolicy, Result, ScoreOutput, ScoreParams,
};
use crate::masks::{build_causal_mask, normalize_attn_mask, normalize_key_padding};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactAttention;

impl ExactAttention {
    pub fn new() -> Self {
        Self
    }
}

/// Softmax along the last axis in `f32`. Rows whose entries are all `-inf`
/// produce zeros instead of NaN.
pub(crate) fn masked_softmax_last_dim(scores: &Tensor) -> Result<Tensor> {
    let scores = scores.to_dtype(DType::F32)?;
    let max = scores.max_keepdim(D::Minus1)?.clamp(f32::MIN, f32::MAX)?;
    let exp = scores.broadcast_sub(&max)?.exp()?;
    let denom = exp.sum_keepdim(D::Minus1)?.maximum(f32::MIN_POSITIVE)?;
    Ok(exp.broadcast_div(&denom)?)
}

pub(crate) fn validate_views(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    batch: usize,
    heads: usize,
) -> Result<(usize, usize, usize)> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape(
            "q, k, v must reside on the same device",
        ));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape(format!(
            "q, k, v must share the same dtype, got {dtype:?}/{:?}/{:?}",
            k.dtype(),
            v.dtype()
        )));
    }
    if !dtype.is_float() {
        return Err(AttentionError::dtype(format!("{dtype:?}")));
    }

    let (bh, q_len, head_dim) = q.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "q must have shape [batch * heads, q_len, head_dim], got {:?}",
            q.dims()
        ))
    })?;
    let (kbh, k_len, kd) = k.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "k must have shape [batch * heads, k_len, head_dim], got {:?}",
            k.dims()
        ))
    })?;
    if bh != batch * heads {
        return Err(AttentionError::shape(format!(
            "q has {bh} head rows but batch {batch} x heads {heads} were declared"
        )));
    }
    if kbh != bh || kd != head_dim {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{bh}, ?, {head_dim}] got [{kbh}, {k_len}, {kd}]"
        )));
    }
    if v.dims() != [bh, k_len, head_dim] {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{bh}, {k_len}, {head_dim}] got {:?}",
            v.dims()
        )));
    }
    Ok((q_len, k_len, head_dim))
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: &MaskSet<'_>,
        params: &ScoreParams<'_>,
    ) -> Result<ScoreOutput> {
        let (batch, heads) = (params.batch, params.num_heads);
        let (q_len, k_len, _) = validate_views(q, k, v, batch, heads)?;
        let dtype = q.dtype();
        let device = q.device();
        let weight_shape = (batch, heads, q_len, k_len);

        let rel_pos = match params.rel_pos {
            Some(bias) if bias.elem_count() != batch * heads * q_len * k_len => {
                return Err(AttentionError::shape(format!(
                    "rel_pos has {} elements, expected {batch}x{heads}x{q_len}x{k_len}",
                    bias.elem_count()
                )))
            }
            Some(bias) => Some(bias.reshape(weight_shape)?),
            None => None,
        };
        let attn_mask = masks
            .attn_mask
            .map(|mask| normalize_attn_mask(mask, batch, heads, q_len, k_len))
            .transpose()?;
        let padding = masks
            .key_padding_mask
            .map(|mask| normalize_key_padding(mask, batch, k_len))
            .transpose()?;

        let compute = match params.precision {
            PrecisionPolicy::ForceF32 => DType::F32,
            PrecisionPolicy::Inherit => LayerPrecision::from_parameter_dtype(dtype).compute(),
        };
        let (q_work, k_work, v_work) = (
            q.to_dtype(compute)?,
            k.to_dtype(compute)?,
            v.to_dtype(compute)?,
        );

        let mut scores = q_work
            .matmul(&k_work.transpose(1, 2)?)?
            .to_dtype(DType::F32)?
            .reshape(weight_shape)?;

        if let Some(mask) = &attn_mask {
            scores = scores.broadcast_add(&mask.to_device(device)?)?;
        }
        if masks.causal {
            scores = scores.broadcast_add(&build_causal_mask(device, q_len, k_len)?)?;
        }
        if let Some(flags) = &padding {
            let flags = flags.to_device(device)?.broadcast_as(weight_shape)?;
            let neg_inf = Tensor::new(f32::NEG_INFINITY, device)?.broadcast_as(weight_shape)?;
            scores = flags.where_cond(&neg_inf, &scores)?;
        }

        let mut weights = masked_softmax_last_dim(&scores)?.to_dtype(v_work.dtype())?;
        if let Some(bias) = &rel_pos {
            weights = weights.add(&bias.to_dtype(weights.dtype())?)?;
        }

        let probs = match params.dropout_p {
            Some(p) if p > 0.0 => dropout(&weights, p)?,
            _ => weights.clone(),
        };

        let attn = probs
            .reshape((batch * heads, q_len, k_len))?
            .matmul(&v_work)?
            .to_dtype(dtype)?;

        Ok(ScoreOutput {
            attn,
            weights: weights.to_dtype(dtype)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::key_padding_mask_from_lengths;
    use candle_core::{Device, Result as CandleResult};

    fn params(batch: usize, heads: usize) -> ScoreParams<'static> {
        ScoreParams {
            batch,
            num_heads: heads,
            rel_pos: None,
            dropout_p: None,
            precision: PrecisionPolicy::Inherit,
        }
    }

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| ((i * 37 % 64) as f32) * 0.02 - 0.6).collect();
        let q = Tensor::from_vec(data.clone(), (2, 4, 8), device)?;
        let k = Tensor::from_vec(data.iter().rev().copied().collect(), (2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        causal: bool,
    ) -> CandleResult<(Tensor, Tensor)> {
        let (bh, q_len, head_dim) = q.dims3()?;
        let (_, k_len, _) = k.dims3()?;
        let mut output = vec![0f32; bh * q_len * head_dim];
        let mut weights = vec![0f32; bh * q_len * k_len];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let offset = k_len - q_len;

        for h in 0..bh {
            for q_idx in 0..q_len {
                let mut row = vec![f32::NEG_INFINITY; k_len];
                let mut max_val = f32::NEG_INFINITY;
                for k_idx in 0..k_len {
                    if causal && k_idx > q_idx + offset {
                        continue;
                    }
                    let mut dot = 0f32;
                    for d in 0..head_dim {
                        dot += q_vec[(h * q_len + q_idx) * head_dim + d]
                            * k_vec[(h * k_len + k_idx) * head_dim + d];
                    }
                    row[k_idx] = dot;
                    max_val = max_val.max(dot);
                }
                let exp: Vec<f32> = row.iter().map(|s| (s - max_val).exp()).collect();
                let denom: f32 = exp.iter().sum();
                for k_idx in 0..k_len {
                    let w = exp[k_idx] / denom;
                    weights[(h * q_len + q_idx) * k_len + k_idx] = w;
                    for d in 0..head_dim {
                        output[(h * q_len + q_idx) * head_dim + d] +=
                            w * v_vec[(h * k_len + k_idx) * head_dim + d];
                    }
                }
            }
        }

        Ok((
            Tensor::from_vec(output, (bh, q_len, head_dim), q.device())?,
            Tensor::from_vec(weights, (bh, q_len, k_len), q.device())?,
        ))
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        for causal in [false, true] {
            let masks = MaskSet {
                causal,
                ..MaskSet::default()
            };
            let out = ExactAttention.attend(&q, &k, &v, &masks, &params(1, 2))?;
            let (expected, expected_weights) = naive_attention(&q, &k, &v, causal)?;
            assert!(max_diff(&out.attn, &expected)? < 1e-4);
            assert_eq!(out.weights.dims(), &[1, 2, 4, 4]);
            let weights = out.weights.reshape((2, 4, 4))?;
            assert!(max_diff(&weights, &expected_weights)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn causal_alignment_with_longer_keys() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let q = q.narrow(1, 2, 2)?.contiguous()?;
        let masks = MaskSet {
            causal: true,
            ..MaskSet::default()
        };
        let out = ExactAttention.attend(&q, &k, &v, &masks, &params(2, 1))?;
        let (expected, _) = naive_attention(&q, &k, &v, true)?;
        assert!(max_diff(&out.attn, &expected)? < 1e-4);
        assert_eq!(out.weights.dims(), &[2, 1, 2, 4]);
        let first = out.weights.get(0)?.get(0)?.to_vec2::<f32>()?;
        assert_eq!(first[0][3], 0.0);
        assert!(first[1][3] > 0.0);
        Ok(())
    }

    #[test]
    fn rows_sum_to_one_and_padding_gets_zero_weight() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let padding = key_padding_mask_from_lengths(&device, &[3, 2], 4)?;
        let masks = MaskSet {
            key_padding_mask: Some(&padding),
            ..MaskSet::default()
        };
        let out = ExactAttention.attend(&q, &k, &v, &masks, &params(2, 1))?;
        let weights = out.weights.to_dtype(DType::F32)?;
        for (b, valid) in [(0usize, 3usize), (1, 2)] {
            for row in weights.get(b)?.get(0)?.to_vec2::<f32>()? {
                let total: f32 = row.iter().sum();
                assert!((total - 1.0).abs() < 1e-5);
                assert!(row[valid..].iter().all(|w| *w == 0.0));
            }
        }
        Ok(())
    }

    #[test]
    fn fully_masked_rows_produce_zeros() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let padding = key_padding_mask_from_lengths(&device, &[0, 4], 4)?;
        let masks = MaskSet {
            key_padding_mask: Some(&padding),
            ..MaskSet::default()
        };
        let out = ExactAttention.attend(&q, &k, &v, &masks, &params(2, 1))?;
        let dead = out.weights.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(dead.iter().all(|w| *w == 0.0));
        let attn = out.attn.flatten_all()?.to_vec1::<f32>()?;
        assert!(attn.iter().all(|x| x.is_finite()));
        assert!(attn[..4 * 8].iter().all(|x| *x == 0.0));
        Ok(())
    }

    #[test]
    fn additive_mask_ranks_are_equivalent() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let causal = build_causal_mask(&device, 4, 4)?;
        let two = causal.reshape((4, 4))?;
        let four = causal.repeat((2, 1, 1, 1))?;
        let flagged = ExactAttention.attend(
            &q,
            &k,
            &v,
            &MaskSet {
                causal: true,
                ..MaskSet::default()
            },
            &params(2, 1),
        )?;
        for mask in [&two, &four] {
            let masks = MaskSet {
                attn_mask: Some(mask),
                ..MaskSet::default()
            };
            let out = ExactAttention.attend(&q, &k, &v, &masks, &params(2, 1))?;
            assert!(max_diff(&out.attn, &flagged.attn)? < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn relative_bias_is_added_after_softmax() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let plain = ExactAttention.attend(&q, &k, &v, &MaskSet::default(), &params(1, 2))?;
        let bias = Tensor::full(0.5f32, (2, 4, 4), &device)?;
        let biased = ExactAttention.attend(
            &q,
            &k,
            &v,
            &MaskSet::default(),
            &ScoreParams {
                rel_pos: Some(&bias),
                ..params(1, 2)
            },
        )?;
        let shifted = plain.weights.affine(1.0, 0.5)?;
        assert!(max_diff(&biased.weights, &shifted)? < 1e-6);

        let wrong = Tensor::zeros((2, 4, 3), DType::F32, &device)?;
        let err = ExactAttention
            .attend(
                &q,
                &k,
                &v,
                &MaskSet::default(),
                &ScoreParams {
                    rel_pos: Some(&wrong),
                    ..params(1, 2)
                },
            )
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((2, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((2, 5, 8), DType::F32, &device)?;
        let v = Tensor::zeros((2, 4, 8), DType::F32, &device)?;
        let err = ExactAttention
            .attend(&q, &k, &v, &MaskSet::default(), &params(1, 2))
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let err = ExactAttention
            .attend(&q, &q, &q, &MaskSet::default(), &params(1, 3))
            .unwrap_err();
        assert!(err.is_precondition());
        Ok(())
    }

    #[test]
    fn integer_inputs_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 2), DType::U32, &device)?;
        let err = ExactAttention
            .attend(&q, &q, &q, &MaskSet::default(), &params(1, 1))
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
        Ok(())
    }

    #[test]
    fn dtype_matrix() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let masks = MaskSet {
            causal: true,
            ..MaskSet::default()
        };
        let reference = ExactAttention.attend(&q, &k, &v, &masks, &params(1, 2))?.attn;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            for precision in [PrecisionPolicy::Inherit, PrecisionPolicy::ForceF32] {
                let out = ExactAttention.attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    &masks,
                    &ScoreParams {
                        precision,
                        ..params(1, 2)
                    },
                )?;
                assert_eq!(out.attn.dtype(), dtype);
                let max = max_diff(&out.attn, &reference)?;
                assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
            }
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 4, 4), &device)?;
        let v = Tensor::ones((1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention.attend(&q, &k, &v, &MaskSet::default(), &params(1, 1))?;
        let values = out.attn.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn dropout_zero_probability_is_noop() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let with_zero = ExactAttention.attend(
            &q,
            &k,
            &v,
            &MaskSet::default(),
            &ScoreParams {
                dropout_p: Some(0.0),
                ..params(1, 2)
            },
        )?;
        let without = ExactAttention.attend(&q, &k, &v, &MaskSet::default(), &params(1, 2))?;
        assert!(max_diff(&with_zero.attn, &without.attn)? < 1e-6);
        Ok(())
    }

    #[test]
    fn dropout_keeps_weights_pre_dropout() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let dropped = ExactAttention.attend(
            &q,
            &k,
            &v,
            &MaskSet::default(),
            &ScoreParams {
                dropout_p: Some(0.5),
                ..params(1, 2)
            },
        )?;
        let clean = ExactAttention.attend(&q, &k, &v, &MaskSet::default(), &params(1, 2))?;
        assert!(max_diff(&dropped.weights, &clean.weights)? < 1e-6);
        Ok(())
    }

    #[test]
    fn inherit_promotes_half_precision_matmuls() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention.attend(&q, &k, &v, &MaskSet::default(), &params(1, 2))?;
        let (q, k, v) = (
            q.to_dtype(DType::BF16)?,
            k.to_dtype(DType::BF16)?,
            v.to_dtype(DType::BF16)?,
        );
        let out = ExactAttention.attend(&q, &k, &v, &MaskSet::default(), &params(1, 2))?;
        assert_eq!(out.attn.dtype(), DType::BF16);
        assert_eq!(out.weights.dtype(), DType::BF16);
        assert!(max_diff(&out.attn, &reference.attn)? < 5e-2);
        Ok(())
    }
}
