//! Periodic fault injection.
//!
//! Whether a request is faulted depends only on the effective configuration
//! and the global request counter, so "every Nth request fails" is exactly
//! reproducible. The counter is shared by all paths: interleaved traffic to
//! different paths shares one failure cadence.

use crate::store::EffectiveConfig;

/// Outcome for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    /// Configured status stands
    Normal { status: u16 },
    /// Configured error status substituted
    Faulted { status: u16 },
}

impl FaultState {
    pub fn status(&self) -> u16 {
        match self {
            FaultState::Normal { status } | FaultState::Faulted { status } => *status,
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, FaultState::Faulted { .. })
    }
}

/// Decide the status for the request numbered `request_counter`.
///
/// A missing period means every request; a period of zero means never.
pub fn decide(config: &EffectiveConfig, request_counter: u64) -> FaultState {
    let normal = FaultState::Normal {
        status: config.status_code,
    };

    let error_code = match config.error_code {
        Some(code) if code != 0 && code != config.status_code => code,
        _ => return normal,
    };

    match config.error_period.unwrap_or(1) {
        0 => normal,
        period if request_counter % period == 0 => FaultState::Faulted { status: error_code },
        _ => normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseDefaults;

    fn config(error_code: Option<u16>, error_period: Option<u64>) -> EffectiveConfig {
        let mut config = EffectiveConfig::merge(&ResponseDefaults::default(), None);
        config.error_code = error_code;
        config.error_period = error_period;
        config
    }

    #[test]
    fn test_no_error_code_is_normal() {
        let cfg = config(None, Some(1));
        for counter in 1..10 {
            assert_eq!(decide(&cfg, counter), FaultState::Normal { status: 200 });
        }
    }

    #[test]
    fn test_zero_error_code_is_normal() {
        let cfg = config(Some(0), Some(1));
        assert!(!decide(&cfg, 1).is_faulted());
    }

    #[test]
    fn test_error_code_equal_to_status_is_normal() {
        let cfg = config(Some(200), None);
        assert_eq!(decide(&cfg, 1), FaultState::Normal { status: 200 });
    }

    #[test]
    fn test_missing_period_faults_every_request() {
        let cfg = config(Some(503), None);
        for counter in 1..5 {
            assert_eq!(decide(&cfg, counter), FaultState::Faulted { status: 503 });
        }
    }

    #[test]
    fn test_zero_period_never_faults() {
        let cfg = config(Some(503), Some(0));
        for counter in 0..20 {
            assert!(!decide(&cfg, counter).is_faulted());
        }
    }

    #[test]
    fn test_one_in_every_period_faults() {
        for period in 2..8u64 {
            let cfg = config(Some(500), Some(period));
            for start in 1..=period {
                let faulted = (start..start + period)
                    .filter(|counter| decide(&cfg, *counter).is_faulted())
                    .count();
                assert_eq!(faulted, 1, "period {} starting at {}", period, start);
            }
        }
    }

    #[test]
    fn test_faulted_status_is_error_code() {
        let cfg = config(Some(502), Some(4));
        assert_eq!(decide(&cfg, 8).status(), 502);
        assert_eq!(decide(&cfg, 9).status(), 200);
    }
}
