//! Pure window-admission arithmetic.
//!
//! The Postgres store locks the tracking row and delegates the decision to
//! `decide`, so the same logic is exercised by unit tests without a
//! database. Concurrency control (row locking, upsert races) stays in the
//! store; everything time- and count-related lives here.

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::WindowAlgorithm;

/// The start/end of the window a request falls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The per-rule parameters the decision needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowPolicy {
    /// `max_requests + burst_allowance`.
    pub limit: i64,
    pub max_requests: i64,
    pub window_seconds: i64,
    pub algorithm: WindowAlgorithm,
}

/// The current tracking row, as read under lock.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowState {
    pub current_count: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    /// Time of the last admitted request; drives token-bucket drain.
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowDecision {
    /// No live window: create (or reset to) a fresh one with count 1.
    FreshWindow { bounds: WindowBounds },
    /// The window admits this request at the given count.
    Admit { new_count: i64 },
    /// The quota (including burst) is exhausted for this window.
    Deny,
    /// A previous violation left the identifier blocked.
    DenyBlocked { blocked_until: DateTime<Utc> },
}

impl WindowDecision {
    pub fn admitted(&self) -> bool {
        matches!(
            self,
            WindowDecision::FreshWindow { .. } | WindowDecision::Admit { .. }
        )
    }
}

/// Computes the bounds of the window containing `now`.
///
/// Fixed windows are aligned to epoch boundaries of `window_seconds`, so
/// every identifier sees the same window edges. Sliding and token-bucket
/// windows are anchored at the request that opens them and re-anchored
/// once they expire.
pub fn window_bounds(
    algorithm: WindowAlgorithm,
    window_seconds: i64,
    now: DateTime<Utc>,
) -> WindowBounds {
    let window = Duration::seconds(window_seconds);
    match algorithm {
        WindowAlgorithm::Fixed => {
            let secs = now.timestamp();
            let aligned = secs - secs.rem_euclid(window_seconds);
            let start = Utc
                .timestamp_opt(aligned, 0)
                .single()
                .unwrap_or(now);
            WindowBounds {
                start,
                end: start + window,
            }
        }
        WindowAlgorithm::Sliding | WindowAlgorithm::TokenBucket => WindowBounds {
            start: now,
            end: now + window,
        },
    }
}

/// Decides whether the request that arrived at `now` is admitted.
///
/// Must be called with the tracking row locked (or absent); the caller
/// applies the resulting mutation in the same transaction.
pub fn decide(
    policy: &WindowPolicy,
    state: Option<&WindowState>,
    now: DateTime<Utc>,
) -> WindowDecision {
    let Some(state) = state else {
        return WindowDecision::FreshWindow {
            bounds: window_bounds(policy.algorithm, policy.window_seconds, now),
        };
    };

    if state.window_end <= now {
        return WindowDecision::FreshWindow {
            bounds: window_bounds(policy.algorithm, policy.window_seconds, now),
        };
    }

    if state.is_blocked {
        if let Some(blocked_until) = state.blocked_until {
            if blocked_until > now {
                return WindowDecision::DenyBlocked { blocked_until };
            }
        }
    }

    let effective = effective_count(policy, state, now);
    if effective + 1 <= policy.limit {
        WindowDecision::Admit {
            new_count: effective + 1,
        }
    } else {
        WindowDecision::Deny
    }
}

/// The count after applying token-bucket drain. Fixed and sliding windows
/// count monotonically until the window resets.
fn effective_count(policy: &WindowPolicy, state: &WindowState, now: DateTime<Utc>) -> i64 {
    match policy.algorithm {
        WindowAlgorithm::Fixed | WindowAlgorithm::Sliding => state.current_count,
        WindowAlgorithm::TokenBucket => {
            let elapsed_ms = (now - state.updated_at).num_milliseconds().max(0);
            let drained =
                (elapsed_ms as f64 / 1000.0 * policy.max_requests as f64
                    / policy.window_seconds as f64) as i64;
            (state.current_count - drained).max(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_requests: i64, window_seconds: i64, burst: i64) -> WindowPolicy {
        WindowPolicy {
            limit: max_requests + burst,
            max_requests,
            window_seconds,
            algorithm: WindowAlgorithm::Fixed,
        }
    }

    fn state(count: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> WindowState {
        WindowState {
            current_count: count,
            window_start: start,
            window_end: end,
            is_blocked: false,
            blocked_until: None,
            updated_at: start,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_missing_state_opens_fresh_window() {
        let decision = decide(&policy(5, 60, 0), None, at(1_000_000));
        match decision {
            WindowDecision::FreshWindow { bounds } => {
                assert_eq!(bounds.end - bounds.start, Duration::seconds(60));
                assert!(bounds.start <= at(1_000_000));
            }
            other => panic!("expected fresh window, got {other:?}"),
        }
    }

    #[test]
    fn test_fixed_window_alignment() {
        // 1_000_030 falls 10s into the 60s epoch-aligned window [1_000_020, 1_000_080)
        let bounds = window_bounds(WindowAlgorithm::Fixed, 60, at(1_000_030));
        assert_eq!(bounds.start, at(1_000_020));
        assert_eq!(bounds.end, at(1_000_080));
    }

    #[test]
    fn test_nth_plus_one_request_denied() {
        let p = policy(5, 60, 0);
        let now = at(1_000_030);
        let bounds = window_bounds(WindowAlgorithm::Fixed, 60, now);

        // Counts 1..5 admitted
        for count in 0..5 {
            let s = state(count, bounds.start, bounds.end);
            assert_eq!(
                decide(&p, Some(&s), now),
                WindowDecision::Admit {
                    new_count: count + 1
                },
                "request {} should be admitted",
                count + 1
            );
        }

        // The 6th is denied
        let s = state(5, bounds.start, bounds.end);
        assert_eq!(decide(&p, Some(&s), now), WindowDecision::Deny);
    }

    #[test]
    fn test_burst_allowance_extends_quota() {
        let p = policy(5, 60, 2);
        let now = at(1_000_030);
        let bounds = window_bounds(WindowAlgorithm::Fixed, 60, now);

        let s = state(6, bounds.start, bounds.end);
        assert_eq!(decide(&p, Some(&s), now), WindowDecision::Admit { new_count: 7 });

        let s = state(7, bounds.start, bounds.end);
        assert_eq!(decide(&p, Some(&s), now), WindowDecision::Deny);
    }

    #[test]
    fn test_expired_window_resets() {
        let p = policy(5, 60, 0);
        let bounds = window_bounds(WindowAlgorithm::Fixed, 60, at(1_000_030));
        let s = state(5, bounds.start, bounds.end);

        // Same window: denied. Next window: fresh.
        assert_eq!(decide(&p, Some(&s), at(1_000_079)), WindowDecision::Deny);
        match decide(&p, Some(&s), at(1_000_081)) {
            WindowDecision::FreshWindow { bounds } => {
                assert_eq!(bounds.start, at(1_000_080));
            }
            other => panic!("expected fresh window, got {other:?}"),
        }
    }

    #[test]
    fn test_active_block_denies_even_with_quota() {
        let p = policy(5, 60, 0);
        let bounds = window_bounds(WindowAlgorithm::Fixed, 60, at(1_000_030));
        let mut s = state(1, bounds.start, bounds.end);
        s.is_blocked = true;
        s.blocked_until = Some(at(1_000_050));

        assert_eq!(
            decide(&p, Some(&s), at(1_000_040)),
            WindowDecision::DenyBlocked {
                blocked_until: at(1_000_050)
            }
        );
        // The block has lapsed but the window is still live: counting resumes.
        assert_eq!(
            decide(&p, Some(&s), at(1_000_055)),
            WindowDecision::Admit { new_count: 2 }
        );
    }

    #[test]
    fn test_token_bucket_drains_over_time() {
        let p = WindowPolicy {
            limit: 10,
            max_requests: 10,
            window_seconds: 60,
            algorithm: WindowAlgorithm::TokenBucket,
        };
        let start = at(1_000_000);
        let mut s = state(10, start, start + Duration::seconds(60));
        s.updated_at = start;

        // Full bucket: denied immediately.
        assert_eq!(decide(&p, Some(&s), at(1_000_001)), WindowDecision::Deny);

        // 12 seconds at 10 req / 60 s drains 2 slots.
        assert_eq!(
            decide(&p, Some(&s), at(1_000_012)),
            WindowDecision::Admit { new_count: 9 }
        );
    }

    #[test]
    fn test_sliding_window_anchored_at_first_request() {
        let bounds = window_bounds(WindowAlgorithm::Sliding, 60, at(1_000_030));
        assert_eq!(bounds.start, at(1_000_030));
        assert_eq!(bounds.end, at(1_000_090));
    }
}
