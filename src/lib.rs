//! In-process resilience primitives for async Rust: decorrelated-jitter
//! retry, timeout, circuit breaker, bulkhead, token-bucket rate limiting,
//! and fallback, composed into a single ordered [`pipeline::Pipeline`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use bulwark::prelude::*;
//!
//! # async fn call_downstream() -> Result<String, std::io::Error> {
//! #     Ok("ok".to_string())
//! # }
//! # async fn run() -> Result<String, ResilienceError<std::io::Error>> {
//! let retry = RetryConfig::builder()
//!     .max_retries(3).expect("valid max_retries")
//!     .base_delay(Duration::from_millis(50)).expect("valid base_delay")
//!     .build();
//!
//! let pipeline = Pipeline::builder()
//!     .retry(retry)
//!     .timeout(Duration::from_secs(2))
//!     .build();
//!
//! let result = pipeline.execute(|_token| call_downstream()).await?;
//! # Ok(result)
//! # }
//! ```
//!
//! Every primitive here is a concurrency primitive, not an I/O client: the
//! crate never performs network calls, spawns background tasks, or
//! persists state across process restarts. See each module's docs for the
//! invariants it upholds under concurrent use.

#![forbid(unsafe_code)]

pub mod breaker;
pub mod bucket;
pub mod bulkhead;
pub mod cancel;
pub mod clock;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod ring;
pub mod sleeper;
pub mod store;

pub mod prelude;
