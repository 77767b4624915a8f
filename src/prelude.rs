//! Convenient re-exports of the types most callers need.

pub use crate::breaker::{BreakerConfig, BreakerState, Phase};
pub use crate::bucket::{BucketState, RateLimitConfig};
pub use crate::bulkhead::{BulkheadConfig, BulkheadPermit, SemaphoreCell};
pub use crate::cancel::CancelToken;
pub use crate::clock::{Clock, JitterClock, MonotonicClock};
pub use crate::error::{ConfigError, ResilienceError};
pub use crate::pipeline::{Pipeline, PipelineBuilder};
pub use crate::registry::Registry;
pub use crate::retry::{RetryConfig, RetryConfigBuilder, RetryDriver};
pub use crate::ring::RingBuffer;
pub use crate::sleeper::{InstantSleeper, SleepOutcome, Sleeper, TokioSleeper, TrackingSleeper};
pub use crate::store::{KeyedState, KeyedStore};
