// =============================================================================
// Gateway error taxonomy
// =============================================================================
//
// Every layer wraps lower-level failures with its own context (venue, symbol,
// operation) without losing the root cause. The webhook layer maps these
// variants onto HTTP status codes; the executor maps them onto its fail-open /
// fail-closed policy table. User-visible messages never carry credential or
// internal-path material.
// =============================================================================

use rust_decimal::Decimal;

/// Result alias used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All failure kinds the gateway distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Unknown user or secret mismatch at the webhook boundary.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No credential record exists for `(user, venue)`.
    #[error("no credentials on file for venue '{venue}'")]
    NoCredentials { venue: String },

    /// Malformed body, missing required field, or unsupported field value.
    #[error("invalid input: {field}: {message}")]
    Input { field: String, message: String },

    /// A weekly risk limit fired. Carries which limit, the observed value,
    /// and the configured cap so the response body can name all three.
    #[error("{limit} reached: {current} of {cap}")]
    OverLimit {
        limit: String,
        current: Decimal,
        cap: Decimal,
    },

    /// Entry action arrived outside the configured trading window.
    #[error("outside trading window: {0}")]
    OutsideWindow(String),

    /// The ML validator returned a confidence below the strategy threshold.
    /// A deliberate policy decision, distinct from a limit denial.
    #[error("blocked by ML validation: confidence {confidence} below threshold {threshold}")]
    MlBlocked { confidence: u8, threshold: u8 },

    /// Symbol is blacklisted (or absent from a configured whitelist).
    #[error("symbol '{0}' is not tradeable for this strategy")]
    SymbolDenied(String),

    /// The adapter does not support the requested operation. Never silently
    /// simulated.
    #[error("venue '{venue}' does not support {operation}")]
    Unsupported { venue: String, operation: String },

    /// Transient venue failure (network, 5xx, 429) that exhausted retries.
    #[error("venue '{venue}' {operation} failed after {attempts} attempts: {message}")]
    VenueTransient {
        venue: String,
        operation: String,
        attempts: u32,
        message: String,
    },

    /// Permanent venue rejection (4xx other than auth).
    #[error("venue '{venue}' rejected {operation}: {message}")]
    VenuePermanent {
        venue: String,
        operation: String,
        message: String,
    },

    /// Venue authentication expired and the single forced renewal failed.
    #[error("venue '{venue}' authentication expired and renewal failed")]
    VenueAuthExpired { venue: String },

    /// A per-call deadline elapsed.
    #[error("deadline of {deadline_secs}s exceeded calling {operation} on '{venue}'")]
    Timeout {
        venue: String,
        operation: String,
        deadline_secs: u64,
    },

    /// Benign: a close arrived for a key with no position anywhere.
    #[error("no open position for {symbol}")]
    NothingToClose { symbol: String },

    /// Store, cache, or other internal dependency failure. Callers decide
    /// fail-open vs fail-closed per call site.
    #[error("internal failure in {component}: {message}")]
    Internal { component: String, message: String },
}

impl GatewayError {
    /// Construct an `Input` error for a named field.
    pub fn input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Input {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Construct an `Internal` error for a named component.
    pub fn internal(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the executor may retry through its transport policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VenueTransient { .. } | Self::Timeout { .. } | Self::Internal { .. }
        )
    }

    /// Whether this error is a policy rejection (429-class at the webhook
    /// boundary) rather than an execution fault.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            Self::OverLimit { .. }
                | Self::OutsideWindow(_)
                | Self::MlBlocked { .. }
                | Self::SymbolDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn over_limit_names_limit_and_values() {
        let err = GatewayError::OverLimit {
            limit: "max_trades_per_week".to_string(),
            current: dec!(5),
            cap: dec!(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("max_trades_per_week"));
        assert!(msg.contains('5'));
        assert!(err.is_policy());
    }

    #[test]
    fn unsupported_is_not_transient() {
        let err = GatewayError::Unsupported {
            venue: "kalshi".to_string(),
            operation: "place_trailing_stop".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!err.is_policy());
    }

    #[test]
    fn timeout_is_transient() {
        let err = GatewayError::Timeout {
            venue: "aster".to_string(),
            operation: "get_ticker".to_string(),
            deadline_secs: 30,
        };
        assert!(err.is_transient());
    }
}
