//! Block-tiled online-softmax kernel for the CPU.
//!
//! Each `(batch, head)` pair is processed independently on the rayon pool.
//! Keys are visited in tiles of `block_size`; every query row keeps a running
//! maximum, normaliser and output accumulator, so memory stays proportional to
//! `head_dim` per row instead of `seq_len`.

use candle_core::{DType, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use super::{FusedKernel, FusedOutput, FusedParams};
use crate::core::{AttentionError, Result};
use crate::masks::normalize_key_padding;

const DEFAULT_BLOCK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFlashKernel {
    block_size: usize,
    seed: Option<u64>,
}

impl Default for CpuFlashKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuFlashKernel {
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            seed: None,
        }
    }

    /// Key tile length; clamped to at least one.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Fixes the dropout stream; unseeded kernels draw a fresh seed per call.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

struct Geometry {
    seq: usize,
    heads: usize,
    head_dim: usize,
}

impl Geometry {
    fn index(&self, b: usize, t: usize, role: usize, h: usize) -> usize {
        (((b * self.seq + t) * 3 + role) * self.heads + h) * self.head_dim
    }
}

struct RowState {
    max: f32,
    norm: f32,
    acc: Vec<f32>,
}

impl CpuFlashKernel {
    #[allow(clippy::too_many_arguments)]
    fn attend_head(
        &self,
        data: &[f32],
        geometry: &Geometry,
        padding: Option<&[u8]>,
        params: &FusedParams,
        b: usize,
        h: usize,
        rng: &mut Option<StdRng>,
        out: &mut [f32],
    ) {
        let Geometry { seq, head_dim, .. } = *geometry;
        let keep = 1.0 - params.dropout_p;
        let mut scores = Vec::with_capacity(self.block_size);

        for t in 0..seq {
            let q_at = geometry.index(b, t, 0, h);
            let query = &data[q_at..q_at + head_dim];
            let limit = if params.causal { t + 1 } else { seq };
            let mut row = RowState {
                max: f32::NEG_INFINITY,
                norm: 0.0,
                acc: vec![0.0; head_dim],
            };

            for tile_start in (0..limit).step_by(self.block_size) {
                let tile_end = (tile_start + self.block_size).min(limit);
                scores.clear();
                let mut tile_max = f32::NEG_INFINITY;
                for s in tile_start..tile_end {
                    if padding.is_some_and(|flags| flags[b * seq + s] != 0) {
                        continue;
                    }
                    let k_at = geometry.index(b, s, 1, h);
                    let dot: f32 = query
                        .iter()
                        .zip(&data[k_at..k_at + head_dim])
                        .map(|(x, y)| x * y)
                        .sum();
                    let score = dot * params.softmax_scale;
                    tile_max = tile_max.max(score);
                    scores.push((s, score));
                }
                if scores.is_empty() {
                    continue;
                }

                let new_max = row.max.max(tile_max);
                let correction = (row.max - new_max).exp();
                row.norm *= correction;
                row.acc.iter_mut().for_each(|a| *a *= correction);
                for &(s, score) in &scores {
                    let p = (score - new_max).exp();
                    row.norm += p;
                    let weight = match rng.as_mut() {
                        Some(rng) => {
                            if rng.gen::<f32>() < params.dropout_p {
                                0.0
                            } else {
                                p / keep
                            }
                        }
                        None => p,
                    };
                    if weight != 0.0 {
                        let v_at = geometry.index(b, s, 2, h);
                        for (a, v) in row.acc.iter_mut().zip(&data[v_at..v_at + head_dim]) {
                            *a += weight * v;
                        }
                    }
                }
                row.max = new_max;
            }

            let dst = &mut out[t * head_dim..(t + 1) * head_dim];
            if row.norm > 0.0 {
                for (o, a) in dst.iter_mut().zip(&row.acc) {
                    *o = a / row.norm;
                }
            } else {
                dst.fill(0.0);
            }
        }
    }
}

impl FusedKernel for CpuFlashKernel {
    fn compute(
        &self,
        packed_qkv: &Tensor,
        key_padding_mask: Option<&Tensor>,
        params: &FusedParams,
    ) -> Result<FusedOutput> {
        let (batch, seq, roles, heads, head_dim) = packed_qkv.dims5().map_err(|_| {
            AttentionError::shape(format!(
                "packed qkv must be [batch, seq, 3, heads, head_dim], got {:?}",
                packed_qkv.dims()
            ))
        })?;
        if roles != 3 {
            return Err(AttentionError::shape(format!(
                "packed qkv axis 2 must hold q, k, v; got {roles}"
            )));
        }
        let dtype = packed_qkv.dtype();
        if !dtype.is_float() {
            return Err(AttentionError::dtype(format!("{dtype:?}")));
        }
        if !(0.0..1.0).contains(&params.dropout_p) {
            return Err(AttentionError::config(format!(
                "dropout probability must be in [0, 1), got {}",
                params.dropout_p
            )));
        }

        let padding = key_padding_mask
            .map(|mask| -> Result<Vec<u8>> {
                Ok(normalize_key_padding(mask, batch, seq)?
                    .flatten_all()?
                    .to_vec1::<u8>()?)
            })
            .transpose()?;
        let data = packed_qkv
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let geometry = Geometry {
            seq,
            heads,
            head_dim,
        };
        let seed = (params.dropout_p > 0.0).then(|| self.seed.unwrap_or_else(rand::random));

        log::debug!(
            "fused cpu kernel batch={batch} seq={seq} heads={heads} head_dim={head_dim} block={} causal={}",
            self.block_size,
            params.causal
        );

        let mut out = vec![0f32; batch * heads * seq * head_dim];
        if seq > 0 && head_dim > 0 {
            out.par_chunks_mut(seq * head_dim)
                .enumerate()
                .for_each(|(slot, chunk)| {
                    let (b, h) = (slot / heads, slot % heads);
                    let mut rng = seed.map(|s| StdRng::seed_from_u64(s ^ slot as u64));
                    self.attend_head(
                        &data,
                        &geometry,
                        padding.as_deref(),
                        params,
                        b,
                        h,
                        &mut rng,
                        chunk,
                    );
                });
        }

        let attn = Tensor::from_vec(out, (batch, heads, seq, head_dim), packed_qkv.device())?
            .transpose(1, 2)?
            .contiguous()?
            .to_dtype(dtype)?;
        Ok(FusedOutput {
            attn,
            weights: None,
        })
    }
}
