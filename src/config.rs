use crate::address::DEFAULT_ADDRESS_TIMEOUT;
use crate::error::SubmitError;
use crate::rate_limit::RateLimitPolicy;
use crate::stun::DEFAULT_STUN_SERVER;
use chrono::TimeDelta;
use clap::Parser;
use std::time::Duration;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "verification-submitter")]
#[command(about = "Submit a verification request with client-side rate limiting")]
pub struct Args {
    // Verification endpoint, differs per deployment
    #[arg(short, long, env = "VERIFY_API_URL")]
    pub endpoint: String,

    // Discord user the verification is for
    #[arg(short, long)]
    pub user_id: String,

    // Extra request fields as a JSON object
    // Example: '{"code":"ABC123"}'
    #[arg(short, long)]
    pub data: Option<String>,

    // Extra request fields as key=value, repeatable
    #[arg(short, long = "field", value_parser = parse_field)]
    pub fields: Vec<(String, String)>,

    // Attempts allowed per window before blocking
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    // Rate limit window in seconds
    #[arg(long, default_value_t = 900)]
    pub window_secs: u64,

    // Block duration in seconds once the limit is hit
    #[arg(long, default_value_t = 3600)]
    pub block_secs: u64,

    // Give up on address discovery after this many milliseconds
    #[arg(long, default_value_t = 3000)]
    pub ip_timeout_ms: u64,

    // STUN server used for address discovery
    #[arg(long, default_value = DEFAULT_STUN_SERVER)]
    pub stun_server: String,

    // HTTP request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,

    // Dump prometheus metrics to stderr before exiting
    #[arg(long)]
    pub print_metrics: bool,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub endpoint: String,
    pub policy: RateLimitPolicy,
    pub address_timeout: Duration,
    pub request_timeout: Duration,
    pub stun_server: String,
}

impl SubmitterConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy: RateLimitPolicy::default(),
            address_timeout: DEFAULT_ADDRESS_TIMEOUT,
            request_timeout: Duration::from_secs(30),
            stun_server: DEFAULT_STUN_SERVER.to_string(),
        }
    }

    // Endpoint must be an absolute http(s) URL
    pub fn validate(&self) -> Result<(), SubmitError> {
        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| SubmitError::Config(format!("endpoint {:?}: {}", self.endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SubmitError::Config(format!(
                "endpoint {:?} must use http or https",
                self.endpoint
            )));
        }
        if self.policy.max_attempts == 0 {
            return Err(SubmitError::Config("max attempts must be at least 1".to_string()));
        }
        if self.policy.window <= TimeDelta::zero()
            || self.policy.block_duration < TimeDelta::zero()
        {
            return Err(SubmitError::Config(
                "window must be positive and block duration non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

impl Args {
    pub fn submitter_config(&self) -> Result<SubmitterConfig, SubmitError> {
        Ok(SubmitterConfig {
            endpoint: self.endpoint.clone(),
            policy: RateLimitPolicy {
                window: seconds("window-secs", self.window_secs)?,
                max_attempts: self.max_attempts,
                block_duration: seconds("block-secs", self.block_secs)?,
            },
            address_timeout: Duration::from_millis(self.ip_timeout_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            stun_server: self.stun_server.clone(),
        })
    }
}

// Seconds as a chrono delta, rejecting values chrono cannot represent
fn seconds(name: &str, value: u64) -> Result<TimeDelta, SubmitError> {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| SubmitError::Config(format!("--{} {} is out of range", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_map_onto_config() {
        let args = Args::parse_from([
            "verification-submitter",
            "--endpoint",
            "https://bot.example.com/api/verify",
            "--user-id",
            "42",
            "--field",
            "code=ABC",
            "--window-secs",
            "60",
        ]);

        let config = args.submitter_config().unwrap();
        assert_eq!(config.endpoint, "https://bot.example.com/api/verify");
        assert_eq!(config.policy.window, chrono::Duration::seconds(60));
        assert_eq!(config.policy.max_attempts, 3);
        assert_eq!(config.policy.block_duration, chrono::Duration::minutes(60));
        assert_eq!(config.address_timeout, Duration::from_secs(3));
        assert_eq!(args.fields, vec![("code".to_string(), "ABC".to_string())]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(SubmitterConfig::new("not a url").validate().is_err());
        assert!(SubmitterConfig::new("ftp://example.com/verify").validate().is_err());
        assert!(SubmitterConfig::new("http://localhost:8080/api/verify").validate().is_ok());
    }

    #[test]
    fn out_of_range_durations_are_config_errors() {
        let args = Args::parse_from([
            "verification-submitter",
            "--endpoint",
            "https://bot.example.com/api/verify",
            "--user-id",
            "42",
            "--window-secs",
            "100000000000000000",
        ]);
        assert!(matches!(args.submitter_config(), Err(SubmitError::Config(_))));

        let args = Args::parse_from([
            "verification-submitter",
            "--endpoint",
            "https://bot.example.com/api/verify",
            "--user-id",
            "42",
            "--block-secs",
            "18446744073709551615",
        ]);
        assert!(matches!(args.submitter_config(), Err(SubmitError::Config(_))));
    }

    #[test]
    fn rejects_non_positive_window() {
        let mut config = SubmitterConfig::new("https://bot.example.com/api/verify");
        config.policy.window = TimeDelta::zero();
        assert!(config.validate().is_err());

        config.policy.window = TimeDelta::minutes(15);
        config.policy.block_duration = TimeDelta::seconds(-1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn field_needs_a_key() {
        assert!(parse_field("=value").is_err());
        assert!(parse_field("novalue").is_err());
        assert_eq!(parse_field("a=b=c").unwrap(), ("a".to_string(), "b=c".to_string()));
    }
}
