#![allow(dead_code)]

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use mha::{Config, MultiheadAttention, Projections};
use mha_layers::{Linear, LinearConfig, LinearLayer, PrecisionPolicy};

pub fn random_linear(dim: usize, device: &Device) -> anyhow::Result<Arc<dyn LinearLayer>> {
    let weight = Tensor::randn(0f32, 0.3, (dim, dim), device)?;
    let bias = Tensor::randn(0f32, 0.05, dim, device)?;
    Ok(Arc::new(Linear::new(
        LinearConfig::new(dim, dim),
        weight,
        Some(bias),
    )?))
}

pub fn random_projections(dim: usize, device: &Device) -> anyhow::Result<Projections> {
    Ok(Projections::from_layers(
        random_linear(dim, device)?,
        random_linear(dim, device)?,
        random_linear(dim, device)?,
        random_linear(dim, device)?,
        PrecisionPolicy::from_parameter_dtype(DType::F32),
    ))
}

pub fn build(config: Config, projections: Projections) -> anyhow::Result<MultiheadAttention> {
    Ok(MultiheadAttention::new(config, projections, &Device::Cpu)?)
}

pub fn max_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok(a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}
