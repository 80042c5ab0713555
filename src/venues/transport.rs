// =============================================================================
// Shared venue transport — retries, deadlines, auth renewal
// =============================================================================
//
// One retry policy for every adapter:
//   - transport faults, 429, and 5xx retry with base · 2^n backoff up to a
//     fixed attempt count;
//   - other 4xx surface immediately as permanent rejections;
//   - a 401 under a renewable scheme triggers exactly one forced renewal
//     before the retry counter is consulted;
//   - the whole call is bounded by a per-call deadline and fails with a
//     distinguished timeout error.
//
// Request builders are closures because signed requests embed fresh
// timestamps — every attempt must re-sign.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

/// Default per-call deadline.
pub const DEFAULT_DEADLINE_SECS: u64 = 30;
/// Default attempt ceiling (first try + retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Base backoff delay.
pub const DEFAULT_BASE_DELAY_MS: u64 = 250;

/// Hook implemented by adapters whose scheme can be renewed (session tokens,
/// OAuth access tokens). Called at most once per transport call, on a 401.
#[async_trait]
pub trait AuthRenewer: Send + Sync {
    async fn renew(&self) -> GatewayResult<()>;
}

/// Retry/backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

/// Exponential backoff: `base · 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt)
}

/// The response an adapter receives back: HTTP status plus parsed JSON body
/// (`Null` when the body is empty). The Location header is captured for
/// venues that return created-order ids there.
#[derive(Debug, Clone)]
pub struct VenueResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
    pub location: Option<String>,
}

/// Shared HTTP machinery for one adapter instance.
pub struct Transport {
    venue: &'static str,
    client: reqwest::Client,
    policy: RetryPolicy,
    deadline: Duration,
}

impl Transport {
    pub fn new(venue: &'static str) -> Self {
        Self::with_policy(venue, RetryPolicy::default(), DEFAULT_DEADLINE_SECS)
    }

    pub fn with_policy(venue: &'static str, policy: RetryPolicy, deadline_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(deadline_secs))
            .build()
            .expect("reqwest client builds with static configuration");
        Self {
            venue,
            client,
            policy,
            deadline: Duration::from_secs(deadline_secs),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute `operation`, rebuilding the request via `build` on every
    /// attempt. `renewer` enables the single forced 401 renewal.
    pub async fn execute<F>(
        &self,
        operation: &str,
        build: F,
        renewer: Option<&dyn AuthRenewer>,
    ) -> GatewayResult<VenueResponse>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut renewed = false;
        let mut attempt: u32 = 0;
        let mut last_transient = String::new();

        loop {
            let outcome = tokio::time::timeout(self.deadline, async {
                let resp = build(&self.client).send().await?;
                let status = resp.status();
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let text = resp.text().await.unwrap_or_default();
                Ok::<(StatusCode, String, Option<String>), reqwest::Error>((status, text, location))
            })
            .await;

            let (status, text, location) = match outcome {
                Err(_) => {
                    return Err(GatewayError::Timeout {
                        venue: self.venue.to_string(),
                        operation: operation.to_string(),
                        deadline_secs: self.deadline.as_secs(),
                    });
                }
                Ok(Err(e)) => {
                    last_transient = format!("transport: {e}");
                    warn!(
                        venue = self.venue,
                        operation,
                        attempt,
                        error = %e,
                        "venue request transport fault"
                    );
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(self.transient(operation, attempt, &last_transient));
                    }
                    tokio::time::sleep(backoff_delay(self.policy.base_delay, attempt - 1)).await;
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            // 401 under a renewable scheme: one forced renewal, outside the
            // retry counter.
            if status == StatusCode::UNAUTHORIZED {
                if let (Some(renewer), false) = (renewer, renewed) {
                    debug!(venue = self.venue, operation, "401 — forcing auth renewal");
                    renewer.renew().await.map_err(|e| {
                        warn!(venue = self.venue, error = %e, "forced renewal failed");
                        GatewayError::VenueAuthExpired {
                            venue: self.venue.to_string(),
                        }
                    })?;
                    renewed = true;
                    continue;
                }
                return Err(GatewayError::VenueAuthExpired {
                    venue: self.venue.to_string(),
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_transient = format!("status {status}: {}", truncate(&text));
                warn!(
                    venue = self.venue,
                    operation,
                    attempt,
                    status = %status,
                    "venue returned retryable status"
                );
                attempt += 1;
                if attempt >= self.policy.max_attempts {
                    return Err(self.transient(operation, attempt, &last_transient));
                }
                tokio::time::sleep(backoff_delay(self.policy.base_delay, attempt - 1)).await;
                continue;
            }

            if status.is_client_error() {
                return Err(GatewayError::VenuePermanent {
                    venue: self.venue.to_string(),
                    operation: operation.to_string(),
                    message: format!("status {status}: {}", truncate(&text)),
                });
            }

            let body = if text.trim().is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
            };

            debug!(venue = self.venue, operation, status = %status, "venue call succeeded");
            return Ok(VenueResponse {
                status,
                body,
                location,
            });
        }
    }

    fn transient(&self, operation: &str, attempts: u32, message: &str) -> GatewayError {
        GatewayError::VenueTransient {
            venue: self.venue.to_string(),
            operation: operation.to_string(),
            attempts,
            message: message.to_string(),
        }
    }
}

/// Keep rejection bodies short enough for error messages.
fn truncate(text: &str) -> String {
    const MAX: usize = 240;
    if text.len() <= MAX {
        text.to_string()
    } else {
        format!("{}…", &text[..MAX])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
    }

    #[test]
    fn truncate_caps_long_bodies() {
        let long = "x".repeat(1000);
        assert!(truncate(&long).len() < 260);
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn unreachable_host_exhausts_retries_as_transient() {
        // TEST-NET-1 address; connection fails fast without routing anywhere.
        let transport = Transport::with_policy(
            "aster",
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
            2,
        );
        let err = transport
            .execute("probe", |c| c.get("http://192.0.2.1:1/nope"), None)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                GatewayError::VenueTransient { .. } | GatewayError::Timeout { .. }
            ),
            "got: {err}"
        );
    }
}
