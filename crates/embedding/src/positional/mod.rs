//! Position encoders operating on head-batched tensors `(batch * heads, seq, head_dim)`.

pub mod xpos;
