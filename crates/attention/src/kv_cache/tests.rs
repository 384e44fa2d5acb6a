use super::IncrementalState;
use candle_core::{DType, Device, Tensor};
use static_assertions::{assert_impl_all, assert_not_impl_any};

fn allclose(a: &Tensor, b: &Tensor, tol: f32) {
    let diff = a
        .to_dtype(DType::F32)
        .unwrap()
        .sub(&b.to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let max = diff.into_iter().fold(0.0_f32, |acc, v| acc.max(v));
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
}

fn step(device: &Device, len: usize) -> (Tensor, Tensor) {
    let keys = Tensor::rand(0.0f32, 1.0, (2, 3, len, 4), device).unwrap();
    let values = Tensor::rand(0.0f32, 1.0, (2, 3, len, 4), device).unwrap();
    (keys, values)
}

#[test]
fn empty_then_populated_then_extended() {
    let device = Device::Cpu;
    let mut state = IncrementalState::new();
    assert!(state.is_empty());
    assert_eq!(state.len(), 0);

    let (k0, v0) = step(&device, 3);
    let (merged_k, merged_v) = state.merge(&k0, &v0).unwrap();
    assert_eq!(state.len(), 3);
    allclose(&merged_k, &k0, 0.0);
    allclose(&merged_v, &v0, 0.0);

    let (k1, v1) = step(&device, 1);
    let (merged_k, merged_v) = state.merge(&k1, &v1).unwrap();
    assert_eq!(state.len(), 4);
    allclose(&merged_k, &Tensor::cat(&[&k0, &k1], 2).unwrap(), 0.0);
    allclose(&merged_v, &Tensor::cat(&[&v0, &v1], 2).unwrap(), 0.0);
    allclose(state.prev_key().unwrap(), &merged_k, 0.0);
    allclose(state.prev_value().unwrap(), &merged_v, 0.0);
}

#[test]
fn mismatched_step_is_rejected_and_state_kept() {
    let device = Device::Cpu;
    let mut state = IncrementalState::new();
    let (k0, v0) = step(&device, 2);
    state.merge(&k0, &v0).unwrap();

    let wrong = Tensor::zeros((2, 3, 1, 5), DType::F32, &device).unwrap();
    let err = state.merge(&wrong, &wrong).unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(state.len(), 2);
}

#[test]
fn extend_leaves_state_untouched_until_stored() {
    let device = Device::Cpu;
    let mut state = IncrementalState::new();
    let (k0, v0) = step(&device, 2);
    state.merge(&k0, &v0).unwrap();

    let (k1, v1) = step(&device, 1);
    let (merged_k, merged_v) = state.extend(&k1, &v1).unwrap();
    assert_eq!(merged_k.dims(), &[2, 3, 3, 4]);
    assert_eq!(state.len(), 2);
    allclose(state.prev_key().unwrap(), &k0, 0.0);

    state.store(merged_k, merged_v);
    assert_eq!(state.len(), 3);
}

#[test]
fn reorder_selects_batch_rows() {
    let device = Device::Cpu;
    let mut state = IncrementalState::new();
    let (k0, v0) = step(&device, 2);
    state.merge(&k0, &v0).unwrap();

    state.reorder(&[1, 1, 0]).unwrap();
    let key = state.prev_key().unwrap();
    assert_eq!(key.dims(), &[3, 3, 2, 4]);
    allclose(&key.narrow(0, 0, 1).unwrap(), &k0.narrow(0, 1, 1).unwrap(), 0.0);
    allclose(&key.narrow(0, 2, 1).unwrap(), &k0.narrow(0, 0, 1).unwrap(), 0.0);
    assert!(state.reorder(&[5]).is_err());

    state.reset();
    assert!(state.is_empty());
    assert!(state.reorder(&[0]).is_ok());
}

#[test]
fn concurrency_traits_documented() {
    assert_impl_all!(IncrementalState: Send);
    assert_not_impl_any!(IncrementalState: Sync);
}
