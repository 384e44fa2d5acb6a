//! Extrapolatable rotary position encoding.
//!
//! Each feature pair `(2j, 2j + 1)` is rotated by `r * θ_j` for absolute row
//! `r` and multiplied by `ζ_j^(p / scale_base)`, where `p` is the row position
//! relative to the centre of the encoded window. Queries use the decay and
//! keys its reciprocal (`downscale = true`), so the product of a query at `i`
//! and a key at `j` carries `ζ_j^((i - j) / scale_base)`: a relative decay that
//! does not depend on where the window starts.
//!
//! Tensors are laid out `(batch * heads, seq_len, head_dim)`. The `offset`
//! argument extends the window to the left, which lets a short query slice
//! share the window of a longer key sequence during incremental decoding.

use candle_core::{bail, DType, Result, Tensor};

const ROTARY_BASE: f64 = 10_000.0;

/// Sine, cosine and decay tables for one call, each `seq_len * head_dim / 2`.
#[derive(Debug, Clone, PartialEq)]
pub struct XPosTables {
    pub sin: Vec<f32>,
    pub cos: Vec<f32>,
    pub scale: Vec<f32>,
}

/// Rotary encoder with per-frequency exponential decay.
#[derive(Debug, Clone, PartialEq)]
pub struct XPos {
    head_dim: usize,
    scale_base: f32,
    decay: Vec<f64>,
    inv_freq: Vec<f64>,
}

impl XPos {
    /// `head_dim` must be even and `scale_base` positive.
    pub fn new(head_dim: usize, scale_base: f32) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            bail!("xpos head_dim must be a positive even number, got {head_dim}");
        }
        if !(scale_base > 0.0) {
            bail!("xpos scale_base must be positive, got {scale_base}");
        }
        let half = head_dim / 2;
        let width = head_dim as f64;
        let decay = (0..half)
            .map(|j| (2.0 * j as f64 + 0.4 * width) / (1.4 * width))
            .collect();
        let inv_freq = (0..half)
            .map(|j| ROTARY_BASE.powf(-(j as f64) / half as f64))
            .collect();
        Ok(Self {
            head_dim,
            scale_base,
            decay,
            inv_freq,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn scale_base(&self) -> f32 {
        self.scale_base
    }

    /// Tables for the last `seq_len` rows of a window of `seq_len + offset` rows.
    pub fn tables(&self, seq_len: usize, offset: usize, downscale: bool) -> XPosTables {
        let half = self.head_dim / 2;
        let window = seq_len + offset;
        let min_pos = -(((window + 1) / 2) as i64);
        let base = self.scale_base as f64;

        let mut tables = XPosTables {
            sin: Vec::with_capacity(seq_len * half),
            cos: Vec::with_capacity(seq_len * half),
            scale: Vec::with_capacity(seq_len * half),
        };
        for row in offset..window {
            let centred = (min_pos + row as i64) as f64;
            for j in 0..half {
                let angle = row as f64 * self.inv_freq[j];
                let mut scale = self.decay[j].powf(centred / base);
                if downscale {
                    scale = scale.recip();
                }
                tables.sin.push(angle.sin() as f32);
                tables.cos.push(angle.cos() as f32);
                tables.scale.push(scale as f32);
            }
        }
        tables
    }

    /// Encodes `x` shaped `(batch * heads, seq_len, head_dim)`.
    ///
    /// The rotation is evaluated in `f32`; the result keeps the dtype of `x`.
    pub fn apply(&self, x: &Tensor, offset: usize, downscale: bool) -> Result<Tensor> {
        let (rows, seq_len, head_dim) = x.dims3()?;
        if head_dim != self.head_dim {
            bail!(
                "xpos configured for head_dim {} but received {head_dim}",
                self.head_dim
            );
        }
        if seq_len == 0 {
            bail!("xpos requires a non-empty sequence");
        }
        let half = head_dim / 2;
        let device = x.device();
        let dtype = x.dtype();

        let XPosTables { sin, cos, scale } = self.tables(seq_len, offset, downscale);
        let scale = Tensor::from_vec(scale, (1, seq_len, half), device)?;
        let cos = Tensor::from_vec(cos, (1, seq_len, half), device)?.mul(&scale)?;
        let sin = Tensor::from_vec(sin, (1, seq_len, half), device)?.mul(&scale)?;

        let pairs = x
            .to_dtype(DType::F32)?
            .reshape((rows, seq_len, half, 2))?;
        let even = pairs.narrow(3, 0, 1)?.squeeze(3)?;
        let odd = pairs.narrow(3, 1, 1)?.squeeze(3)?;

        let rotated_even = even.broadcast_mul(&cos)?.sub(&odd.broadcast_mul(&sin)?)?;
        let rotated_odd = odd.broadcast_mul(&cos)?.add(&even.broadcast_mul(&sin)?)?;

        log::trace!(
            "xpos apply rows={rows} seq_len={seq_len} offset={offset} downscale={downscale}"
        );

        Tensor::stack(&[&rotated_even, &rotated_odd], 3)?
            .reshape((rows, seq_len, head_dim))?
            .to_dtype(dtype)
    }
}
