//! Client-side verification submitter.
//!
//! Approximates the caller's public address, applies a sliding-window rate
//! limit keyed by user and address, then forwards the verification payload
//! to a configured HTTP endpoint.

pub mod address;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod stun;
pub mod submitter;

pub use address::{
    AddressResolver, CandidateGatherer, FixedAddress, IpApproximator, UNKNOWN_ADDRESS,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SubmitterConfig;
pub use error::SubmitError;
pub use models::{VerificationData, VerificationResult};
pub use rate_limit::{
    MemoryStore, RateLimitEntry, RateLimitPolicy, RateLimitStatus, RateLimitStore, RateLimiter,
};
pub use stun::StunGatherer;
pub use submitter::VerificationSubmitter;
