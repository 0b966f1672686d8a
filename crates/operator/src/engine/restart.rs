use crate::crd::common::RestartPolicy;

/// What to do about one failed replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Delete the pod so the next pass recreates it
    Restart,
    /// Leave the failure in place; the job fails
    Exhausted,
}

/// Whether the `failure_count`-th failure may still be retried.
///
/// `Never` never retries. Past `backoff_limit` nothing retries. No limit
/// means unlimited retries.
pub fn should_restart(policy: RestartPolicy, backoff_limit: Option<i32>, failure_count: i32) -> bool {
    if policy == RestartPolicy::Never {
        return false;
    }
    match backoff_limit {
        Some(limit) => failure_count <= limit,
        None => true,
    }
}

/// Exit codes from signals (128 + n) are worth retrying; application errors are not.
pub fn is_retryable_exit_code(code: i32) -> bool {
    code >= 128
}

/// Decide for a failed replica. An unknown exit code counts as retryable.
pub fn evaluate(
    policy: RestartPolicy,
    backoff_limit: Option<i32>,
    failure_count: i32,
    exit_code: Option<i32>,
) -> RestartDecision {
    if !should_restart(policy, backoff_limit, failure_count) {
        return RestartDecision::Exhausted;
    }
    if policy == RestartPolicy::ExitCode && !exit_code.map(is_retryable_exit_code).unwrap_or(true) {
        return RestartDecision::Exhausted;
    }
    RestartDecision::Restart
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_policy_never_restarts() {
        assert!(!should_restart(RestartPolicy::Never, None, 1));
        assert!(!should_restart(RestartPolicy::Never, Some(10), 0));
    }

    #[test]
    fn backoff_limit_bounds_restarts() {
        assert!(should_restart(RestartPolicy::OnFailure, Some(2), 1));
        assert!(should_restart(RestartPolicy::OnFailure, Some(2), 2));
        assert!(!should_restart(RestartPolicy::OnFailure, Some(2), 3));
        assert!(should_restart(RestartPolicy::OnFailure, None, 100));
    }

    #[test]
    fn exit_code_policy_checks_the_code() {
        assert_eq!(
            evaluate(RestartPolicy::ExitCode, Some(3), 1, Some(137)),
            RestartDecision::Restart
        );
        assert_eq!(
            evaluate(RestartPolicy::ExitCode, Some(3), 1, Some(1)),
            RestartDecision::Exhausted
        );
        assert_eq!(
            evaluate(RestartPolicy::ExitCode, Some(3), 1, None),
            RestartDecision::Restart
        );
        assert_eq!(
            evaluate(RestartPolicy::ExitCode, Some(0), 1, Some(143)),
            RestartDecision::Exhausted
        );
    }

    #[test]
    fn on_failure_ignores_exit_code() {
        assert_eq!(
            evaluate(RestartPolicy::OnFailure, Some(1), 1, Some(1)),
            RestartDecision::Restart
        );
    }

    #[test]
    fn signal_codes_are_retryable() {
        for code in [128, 130, 137, 143, 255] {
            assert!(is_retryable_exit_code(code));
        }
        for code in [1, 2, 127] {
            assert!(!is_retryable_exit_code(code));
        }
    }
}
