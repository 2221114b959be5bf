//! The submission flow: address lookup, rate limit, POST, interpret.

use crate::address::{AddressResolver, IpApproximator};
use crate::clock::{Clock, SystemClock};
use crate::config::SubmitterConfig;
use crate::error::SubmitError;
use crate::metrics::{
    RATE_LIMITED_TOTAL, SUBMISSION_FAILURES, SUBMISSIONS_TOTAL, SUBMIT_LATENCY, TRACKED_KEYS,
};
use crate::models::{ErrorBody, VerificationData, VerificationResult};
use crate::rate_limit::{MemoryStore, RateLimitStatus, RateLimitStore, RateLimiter};
use crate::stun::StunGatherer;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct VerificationSubmitter {
    client: reqwest::Client,
    endpoint: String,
    limiter: RateLimiter,
    resolver: Arc<dyn AddressResolver>,
    clock: Arc<dyn Clock>,
}

/// Assembles a [`VerificationSubmitter`]. Anything not overridden gets the
/// production default: in-memory store, wall clock, STUN-based resolver.
pub struct SubmitterBuilder {
    config: SubmitterConfig,
    client: Option<reqwest::Client>,
    store: Option<Arc<dyn RateLimitStore>>,
    clock: Option<Arc<dyn Clock>>,
    resolver: Option<Arc<dyn AddressResolver>>,
}

impl SubmitterBuilder {
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<VerificationSubmitter, SubmitError> {
        self.config.validate()?;

        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(self.config.request_timeout)
                .build()?,
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store: Arc<dyn RateLimitStore> =
            self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let resolver: Arc<dyn AddressResolver> = self.resolver.unwrap_or_else(|| {
            Arc::new(IpApproximator::with_timeout(
                StunGatherer::new(self.config.stun_server.clone()),
                self.config.address_timeout,
            ))
        });

        Ok(VerificationSubmitter {
            client,
            endpoint: self.config.endpoint,
            limiter: RateLimiter::new(self.config.policy, store, clock.clone()),
            resolver,
            clock,
        })
    }
}

impl VerificationSubmitter {
    pub fn builder(config: SubmitterConfig) -> SubmitterBuilder {
        SubmitterBuilder {
            config,
            client: None,
            store: None,
            clock: None,
            resolver: None,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Submits one verification request.
    ///
    /// A blocked key is rejected before anything is recorded or sent. An
    /// allowed key has its attempt recorded before the request goes out, so
    /// failed submissions still count toward the limit.
    pub async fn submit(&self, data: &VerificationData) -> Result<VerificationResult, SubmitError> {
        SUBMISSIONS_TOTAL.inc();
        let start_time = Instant::now();

        let result = self.submit_inner(data).await;

        SUBMIT_LATENCY.observe(start_time.elapsed().as_secs_f64());
        TRACKED_KEYS.set(self.limiter.store().len() as f64);

        if let Err(e) = &result {
            error!(user_id = %data.discord_user_id, error = %e, "Verification error");
        }
        result
    }

    async fn submit_inner(
        &self,
        data: &VerificationData,
    ) -> Result<VerificationResult, SubmitError> {
        let ip = self.resolver.resolve_approximate_address().await;
        debug!(user_id = %data.discord_user_id, ip = %ip, "Resolved approximate address");

        let status = self.limiter.check(&data.discord_user_id, &ip);
        if let RateLimitStatus::Blocked { blocked_until } = status {
            RATE_LIMITED_TOTAL.inc();
            warn!(
                user_id = %data.discord_user_id,
                ip = %ip,
                %blocked_until,
                "Submission rate limited"
            );
            return Err(SubmitError::RateLimited { blocked_until });
        }

        let entry = self.limiter.record_attempt(&data.discord_user_id, &ip);

        let payload = data.to_payload(&ip, self.clock.now());

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(
                USER_AGENT,
                format!("verification-submitter/{}", env!("CARGO_PKG_VERSION")),
            )
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            SUBMISSION_FAILURES.inc();
            // unreadable bodies count as empty error payloads
            let body = response.bytes().await.unwrap_or_default();
            let message = ErrorBody::parse(&body)
                .message()
                .unwrap_or_else(|| format!("HTTP {}: Verification failed", status.as_u16()));
            return Err(SubmitError::SubmissionFailed {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        let result: VerificationResult = serde_json::from_slice(&body)?;

        info!(
            user_id = %data.discord_user_id,
            status = status.as_u16(),
            attempts = entry.attempts,
            "Verification submitted"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::FixedAddress;

    #[test]
    fn build_rejects_invalid_endpoint() {
        let result = VerificationSubmitter::builder(SubmitterConfig::new("nope")).build();
        assert!(matches!(result, Err(SubmitError::Config(_))));
    }

    #[test]
    fn build_uses_injected_store() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::new());
        let config = SubmitterConfig::new("http://127.0.0.1:9/verify");
        let submitter = VerificationSubmitter::builder(config)
            .store(store.clone())
            .resolver(Arc::new(FixedAddress("unknown".to_string())))
            .build()
            .unwrap();

        submitter.limiter().record_attempt("42", "unknown");
        assert_eq!(store.len(), 1);
        assert_eq!(submitter.endpoint(), "http://127.0.0.1:9/verify");
    }
}
