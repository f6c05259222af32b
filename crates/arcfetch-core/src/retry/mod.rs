//! Restart and backoff policy for chunks that end with a hard error.
//!
//! Classification of transport failures lives in `classify`; the policy only
//! looks at the error's kind tag and the chunk's restart count.

mod classify;
mod policy;

pub(crate) use classify::{classify_curl_error, is_interruption};
pub use policy::{RetryDecision, RetryPolicy};
