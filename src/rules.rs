/// Gamification rule engines invoked by the collector after every event.
///
/// Each engine is a trait so the orchestrator can plug in its own policy;
/// the structs in this module are the built-in defaults.
use crate::model::{AgentProfile, Event, RollingSample};
use std::collections::BTreeSet;

/// XP thresholds: reaching `LEVEL_THRESHOLDS[i]` puts an agent at level `i + 1`.
pub const LEVEL_THRESHOLDS: [u64; 10] = [0, 100, 250, 500, 1000, 2000, 4000, 8000, 16000, 32000];

/// Level reached with `xp` experience points (1-based).
pub fn level_for_xp(xp: u64) -> u32 {
    LEVEL_THRESHOLDS.iter().filter(|&&t| xp >= t).count() as u32
}

/// Result of awarding XP for one successful event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpAward {
    pub xp_delta: u64,
    pub new_level: u32,
}

/// Decides how much XP a successful event is worth.
pub trait XpEngine: Send + Sync {
    /// `streak` is the agent's streak including the event being rewarded.
    fn award_xp(&self, base: u64, streak: u32, current_xp: u64) -> XpAward;
}

/// Decides which achievements a profile has earned.
pub trait AchievementEngine: Send + Sync {
    /// Every achievement id the profile qualifies for after `event`.
    fn check_achievements(&self, profile: &AgentProfile, event: &Event) -> BTreeSet<String>;
}

/// Classifies an agent's strengths and weaknesses from recent behaviour.
pub trait StrengthsEngine: Send + Sync {
    /// Record `event` in the profile's rolling window, refresh its trait
    /// lists and return the traits detected.
    fn update_rolling_stats(&self, profile: &mut AgentProfile, event: &Event) -> Traits;
}

/// Detected strength and weakness tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traits {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
}

/// The three engines the collector drives.
pub struct RuleEngines {
    pub xp: Box<dyn XpEngine>,
    pub achievements: Box<dyn AchievementEngine>,
    pub strengths: Box<dyn StrengthsEngine>,
}

impl Default for RuleEngines {
    fn default() -> Self {
        Self {
            xp: Box::new(StreakXp),
            achievements: Box::new(DefaultAchievements),
            strengths: Box::new(RollingPercentiles::default()),
        }
    }
}

impl std::fmt::Debug for RuleEngines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngines").finish_non_exhaustive()
    }
}

/// Base XP plus 10% per consecutive success, capped at double.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreakXp;

impl XpEngine for StreakXp {
    fn award_xp(&self, base: u64, streak: u32, current_xp: u64) -> XpAward {
        let bonus_steps = u64::from(streak.min(10));
        let xp_delta = base + base * bonus_steps / 10;
        XpAward {
            xp_delta,
            new_level: level_for_xp(current_xp + xp_delta),
        }
    }
}

pub const FIRST_SUCCESS: &str = "first_success";
pub const ON_A_ROLL: &str = "on_a_roll";
pub const UNSTOPPABLE: &str = "unstoppable";
pub const VETERAN: &str = "veteran";
pub const TOKEN_TITAN: &str = "token_titan";
pub const MARATHON: &str = "marathon";

/// Built-in achievement set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAchievements;

impl AchievementEngine for DefaultAchievements {
    fn check_achievements(&self, profile: &AgentProfile, event: &Event) -> BTreeSet<String> {
        let mut earned = BTreeSet::new();
        let mut grant = |id: &str, cond: bool| {
            if cond {
                earned.insert(id.to_string());
            }
        };
        grant(FIRST_SUCCESS, profile.successful_invocations >= 1);
        grant(ON_A_ROLL, profile.current_streak >= 5);
        grant(UNSTOPPABLE, profile.current_streak >= 10);
        grant(VETERAN, profile.total_invocations >= 100);
        grant(TOKEN_TITAN, profile.total_tokens >= 1_000_000);
        grant(
            MARATHON,
            event.status.is_success() && event.duration_secs >= 30.0 * 60.0,
        );
        earned
    }
}

/// Rolling-window classifier using percentiles over the last `window` events.
#[derive(Debug, Clone, Copy)]
pub struct RollingPercentiles {
    pub window: usize,
    pub min_samples: usize,
}

impl Default for RollingPercentiles {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
        }
    }
}

impl RollingPercentiles {
    fn classify<'a>(&self, samples: impl Iterator<Item = &'a RollingSample>) -> Traits {
        let samples: Vec<&RollingSample> = samples.collect();
        let mut traits = Traits::default();
        if samples.len() < self.min_samples {
            return traits;
        }

        let successes = samples.iter().filter(|s| s.success).count();
        let success_rate = successes as f64 / samples.len() as f64;
        if success_rate >= 0.9 {
            traits.strengths.push("reliable".to_string());
        } else if success_rate <= 0.6 {
            traits.weaknesses.push("error_prone".to_string());
        }

        let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_secs).collect();
        durations.sort_by(f64::total_cmp);
        if percentile(&durations, 50.0) <= 60.0 {
            traits.strengths.push("fast".to_string());
        }
        if percentile(&durations, 90.0) >= 600.0 {
            traits.weaknesses.push("slow".to_string());
        }

        // Zero-token samples mean the caller never reported usage.
        let mut tokens: Vec<f64> = samples
            .iter()
            .filter(|s| s.tokens > 0)
            .map(|s| s.tokens as f64)
            .collect();
        if !tokens.is_empty() {
            tokens.sort_by(f64::total_cmp);
            let median = percentile(&tokens, 50.0);
            if median <= 5_000.0 {
                traits.strengths.push("efficient".to_string());
            } else if median >= 50_000.0 {
                traits.weaknesses.push("token_heavy".to_string());
            }
        }

        traits
    }
}

impl StrengthsEngine for RollingPercentiles {
    fn update_rolling_stats(&self, profile: &mut AgentProfile, event: &Event) -> Traits {
        profile.recent.push_back(RollingSample::from(event));
        while profile.recent.len() > self.window {
            profile.recent.pop_front();
        }
        let traits = self.classify(profile.recent.iter());
        profile.strengths = traits.strengths.clone();
        profile.weaknesses = traits.weaknesses.clone();
        traits
    }
}

/// Nearest-rank percentile over an ascending slice. Empty input yields 0.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    sorted[rank.round() as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventStatus, UNKNOWN_TICKET};
    use chrono::Utc;

    fn event(status: EventStatus, duration_secs: f64, tokens: u64) -> Event {
        let now = Utc::now();
        Event {
            id: "e".to_string(),
            agent: "coding".to_string(),
            session_id: "s".to_string(),
            ticket: UNKNOWN_TICKET.to_string(),
            started_at: now,
            ended_at: now,
            duration_secs,
            status,
            input_tokens: tokens,
            output_tokens: 0,
            total_tokens: tokens,
            cost_usd: 0.0,
            artifacts: Vec::new(),
            error_message: None,
            model: "sonnet".to_string(),
        }
    }

    #[test]
    fn test_level_for_xp() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(999), 4);
        assert_eq!(level_for_xp(1_000_000), 10);
    }

    #[test]
    fn test_streak_xp_bonus_is_capped() {
        let engine = StreakXp;
        assert_eq!(engine.award_xp(10, 0, 0).xp_delta, 10);
        assert_eq!(engine.award_xp(10, 1, 0).xp_delta, 11);
        assert_eq!(engine.award_xp(10, 10, 0).xp_delta, 20);
        assert_eq!(engine.award_xp(10, 25, 0).xp_delta, 20);
    }

    #[test]
    fn test_streak_xp_reports_new_level() {
        let award = StreakXp.award_xp(10, 0, 95);
        assert_eq!(award.new_level, 2);
        let award = StreakXp.award_xp(10, 0, 10);
        assert_eq!(award.new_level, 1);
    }

    #[test]
    fn test_default_achievements() {
        let mut profile = AgentProfile::new("coding");
        let ev = event(EventStatus::Success, 5.0, 10);
        assert!(DefaultAchievements
            .check_achievements(&profile, &ev)
            .is_empty());

        profile.successful_invocations = 1;
        profile.total_invocations = 100;
        profile.current_streak = 5;
        let earned = DefaultAchievements.check_achievements(&profile, &ev);
        assert!(earned.contains(FIRST_SUCCESS));
        assert!(earned.contains(ON_A_ROLL));
        assert!(earned.contains(VETERAN));
        assert!(!earned.contains(UNSTOPPABLE));
        assert!(!earned.contains(TOKEN_TITAN));
    }

    #[test]
    fn test_marathon_requires_success() {
        let profile = AgentProfile::new("coding");
        let long_fail = event(EventStatus::Error, 3600.0, 0);
        assert!(!DefaultAchievements
            .check_achievements(&profile, &long_fail)
            .contains(MARATHON));
        let long_ok = event(EventStatus::Success, 3600.0, 0);
        assert!(DefaultAchievements
            .check_achievements(&profile, &long_ok)
            .contains(MARATHON));
    }

    #[test]
    fn test_rolling_window_is_bounded() {
        let engine = RollingPercentiles {
            window: 3,
            min_samples: 1,
        };
        let mut profile = AgentProfile::new("coding");
        for i in 0..5 {
            engine.update_rolling_stats(&mut profile, &event(EventStatus::Success, i as f64, 1));
        }
        assert_eq!(profile.recent.len(), 3);
        assert_eq!(profile.recent.front().unwrap().duration_secs, 2.0);
    }

    #[test]
    fn test_no_traits_below_min_samples() {
        let engine = RollingPercentiles::default();
        let mut profile = AgentProfile::new("coding");
        let traits =
            engine.update_rolling_stats(&mut profile, &event(EventStatus::Success, 1.0, 10));
        assert_eq!(traits, Traits::default());
    }

    #[test]
    fn test_reliable_fast_efficient_agent() {
        let engine = RollingPercentiles::default();
        let mut profile = AgentProfile::new("coding");
        let mut traits = Traits::default();
        for _ in 0..10 {
            let ok = event(EventStatus::Success, 30.0, 2_000);
            traits = engine.update_rolling_stats(&mut profile, &ok);
        }
        assert_eq!(traits.strengths, vec!["reliable", "fast", "efficient"]);
        assert!(traits.weaknesses.is_empty());
        assert_eq!(profile.strengths, traits.strengths);
    }

    #[test]
    fn test_error_prone_slow_heavy_agent() {
        let engine = RollingPercentiles::default();
        let mut profile = AgentProfile::new("coding");
        let mut traits = Traits::default();
        for i in 0..10 {
            let status = if i % 2 == 0 {
                EventStatus::Success
            } else {
                EventStatus::Error
            };
            traits = engine.update_rolling_stats(&mut profile, &event(status, 900.0, 80_000));
        }
        assert!(traits.strengths.is_empty());
        assert_eq!(traits.weaknesses, vec!["error_prone", "slow", "token_heavy"]);
        assert_eq!(profile.weaknesses, traits.weaknesses);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 50.0), 3.0);
        assert_eq!(percentile(&values, 90.0), 5.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
