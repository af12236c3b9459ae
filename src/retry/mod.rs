//! Reconnection backoff
//!
//! `RetryPolicy` maps an attempt number to a jittered wait. It holds no
//! mutable state, so one policy is shared by every channel of a manager.

mod policy;

pub use policy::{
    compute_delay, exponential_bounds, RetryDelay, RetryDelayPreview, RetryPolicy,
};
