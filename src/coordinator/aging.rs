//! Age-based authority adjustment
//!
//! Mandates that keep losing arbitration gain authority the longer they wait,
//! bounding starvation within a kind. Applied to copies before arbitration;
//! the registry keeps the emitted values and the kind ranking is untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Mandate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingPolicy {
    /// Age interval per bump (0 disables aging)
    pub step_ms: u64,
    /// Authority added per full interval
    pub bump_per_step: u32,
    /// Ceiling on the total bump
    pub max_bump: u32,
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            step_ms: 1_000,
            bump_per_step: 1,
            max_bump: 10,
        }
    }
}

impl AgingPolicy {
    pub fn disabled() -> Self {
        Self {
            step_ms: 0,
            bump_per_step: 0,
            max_bump: 0,
        }
    }

    pub fn bump_for(&self, age_ms: u64) -> u32 {
        if self.step_ms == 0 {
            return 0;
        }
        let steps = age_ms / self.step_ms;
        let bump = steps.saturating_mul(self.bump_per_step as u64);
        bump.min(self.max_bump as u64) as u32
    }

    /// Copies of `mandates` with authority raised by age at `now`
    pub fn apply(&self, mandates: Vec<Mandate>, now: DateTime<Utc>) -> Vec<Mandate> {
        mandates
            .into_iter()
            .map(|mut m| {
                m.authority = m.authority.saturating_add(self.bump_for(m.age_ms(now)));
                m
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, Mandate};
    use crate::platform::arbitrate;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bump_is_capped() {
        let policy = AgingPolicy {
            step_ms: 100,
            bump_per_step: 2,
            max_bump: 5,
        };
        assert_eq!(policy.bump_for(99), 0);
        assert_eq!(policy.bump_for(250), 4);
        assert_eq!(policy.bump_for(10_000), 5);
        assert_eq!(AgingPolicy::disabled().bump_for(10_000), 0);
    }

    #[test]
    fn test_old_mandate_overtakes_senior_newcomer() {
        let now = Utc::now();
        let waiting = Mandate::entry("BTC", "slow", Direction::Long, dec!(1))
            .with_authority(1)
            .at(now - Duration::seconds(5));
        let fresh = Mandate::entry("BTC", "fast", Direction::Long, dec!(1))
            .with_authority(3)
            .at(now);

        let raw = vec![waiting.clone(), fresh.clone()];
        let symbol = waiting.symbol.clone();
        let state = crate::domain::PositionState::Flat;
        assert_eq!(
            arbitrate(&symbol, state, &raw).originating_mandate_id,
            Some(fresh.id)
        );

        let aged = AgingPolicy::default().apply(raw, now);
        assert_eq!(
            arbitrate(&symbol, state, &aged).originating_mandate_id,
            Some(waiting.id)
        );
    }
}
