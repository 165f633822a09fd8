//! Retry policy (spec.md §4.6 step 5, §9).

use crate::frame::ResponseError;

/// Opaque consistency level identifier; the concrete encoding belongs to
/// the row/type codec collaborator (spec.md §1), so the core only carries
/// it around as an index into the server's enumeration.
pub type ConsistencyLevel = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameHost { new_consistency: Option<ConsistencyLevel> },
    RetryNextHost { new_consistency: Option<ConsistencyLevel> },
    Rethrow,
    Ignore,
}

/// `RetryPolicy { onReadTimeout, onWriteTimeout, onUnavailable,
/// onRequestError }` (spec.md §9).
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn on_read_timeout(
        &self,
        consistency: ConsistencyLevel,
        retry_count: u32,
        is_idempotent: bool,
    ) -> RetryDecision;

    fn on_write_timeout(
        &self,
        consistency: ConsistencyLevel,
        retry_count: u32,
        is_idempotent: bool,
    ) -> RetryDecision;

    fn on_unavailable(&self, consistency: ConsistencyLevel, retry_count: u32) -> RetryDecision;

    /// Covers `overloaded|isBootstrapping|truncateError|serverError|requestError`
    /// (spec.md §4.6 step 5's last bullet): idempotent requests try the
    /// next host, everything else rethrows.
    fn on_request_error(&self, error: &ResponseError, is_idempotent: bool) -> RetryDecision;
}

/// The default policy: retry once on the same host for timeouts, move to
/// the next host on unavailable, never retry beyond that.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_read_timeout(
        &self,
        _consistency: ConsistencyLevel,
        retry_count: u32,
        is_idempotent: bool,
    ) -> RetryDecision {
        if retry_count == 0 && is_idempotent {
            RetryDecision::RetrySameHost { new_consistency: None }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        _consistency: ConsistencyLevel,
        retry_count: u32,
        is_idempotent: bool,
    ) -> RetryDecision {
        if retry_count == 0 && is_idempotent {
            RetryDecision::RetrySameHost { new_consistency: None }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_unavailable(&self, _consistency: ConsistencyLevel, retry_count: u32) -> RetryDecision {
        if retry_count == 0 {
            RetryDecision::RetryNextHost { new_consistency: None }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_request_error(&self, error: &ResponseError, is_idempotent: bool) -> RetryDecision {
        use crate::frame::ResponseErrorKind as K;
        match error.kind {
            K::Overloaded | K::IsBootstrapping | K::TruncateError | K::ServerError | K::RequestError
                if is_idempotent =>
            {
                RetryDecision::RetryNextHost { new_consistency: None }
            }
            _ => RetryDecision::Rethrow,
        }
    }
}

/// Never retries; every error is surfaced to the caller. Useful as an
/// explicit opt-out, matching the teacher's pattern of exposing a
/// "fall back to the default, minimal behavior" policy alongside the
/// smarter default.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(&self, _: ConsistencyLevel, _: u32, _: bool) -> RetryDecision {
        RetryDecision::Rethrow
    }
    fn on_write_timeout(&self, _: ConsistencyLevel, _: u32, _: bool) -> RetryDecision {
        RetryDecision::Rethrow
    }
    fn on_unavailable(&self, _: ConsistencyLevel, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }
    fn on_request_error(&self, _: &ResponseError, _: bool) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_read_timeout_once_when_idempotent() {
        let policy = DefaultRetryPolicy;
        assert_eq!(
            policy.on_read_timeout(1, 0, true),
            RetryDecision::RetrySameHost { new_consistency: None }
        );
        assert_eq!(policy.on_read_timeout(1, 1, true), RetryDecision::Rethrow);
        assert_eq!(policy.on_read_timeout(1, 0, false), RetryDecision::Rethrow);
    }
}
