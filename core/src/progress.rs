use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::feedback::clamp_score;

pub const DEFAULT_PASS_THRESHOLD: f64 = 80.0;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Per-level progression state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LevelState {
    /// Not reachable yet; the previous level is incomplete
    Locked,
    /// Entered (first feedback request made) but not yet passed
    InProgress,
    /// Passed the threshold
    Completed,
    /// Attempt budget exhausted under the advance-on-exhaustion policy
    CompletedWithWarning,
}

impl LevelState {
    pub fn is_completed(&self) -> bool {
        matches!(self, LevelState::Completed | LevelState::CompletedWithWarning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LevelState::Locked => "locked",
            LevelState::InProgress => "in_progress",
            LevelState::Completed => "completed",
            LevelState::CompletedWithWarning => "completed_with_warning",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "locked" => Some(LevelState::Locked),
            "in_progress" => Some(LevelState::InProgress),
            "completed" => Some(LevelState::Completed),
            "completed_with_warning" => Some(LevelState::CompletedWithWarning),
            _ => None,
        }
    }
}

/// What happens when a student burns through max_attempts without reaching
/// the threshold. Configurable per quiz, captured on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Advance anyway, marked completed_with_warning
    AdvanceWithWarning,
    /// Stay in_progress; the student keeps revising (attempts keep counting)
    HardBlock,
}

/// Leveling policy for one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelPolicy {
    pub levels_total: i32,
    pub pass_threshold: f64,
    pub max_attempts: i32,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for LevelPolicy {
    fn default() -> Self {
        Self {
            levels_total: crate::feedback::DEFAULT_LEVELS_TOTAL,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            exhaustion: ExhaustionPolicy::HardBlock,
        }
    }
}

/// Mutable per-level progress. Attempts are charged only for successfully
/// scored responses; pipeline failures leave this untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelProgress {
    pub level: i32,
    pub attempts_used: i32,
    pub best_score: f64,
    pub state: LevelState,
}

impl LevelProgress {
    /// Fresh progress for a level the student has just entered.
    pub fn entered(level: i32) -> Self {
        Self {
            level,
            attempts_used: 0,
            best_score: 0.0,
            state: LevelState::InProgress,
        }
    }
}

/// Overall session state derived from per-level progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    InProgress,
    SubmissionAllowed,
}

/// Apply one successfully scored feedback response to a level's progress.
///
/// Charges an attempt, raises best_score, and resolves completion against
/// the policy. Scores are clamped defensively; callers normally pass
/// already-clamped values.
pub fn apply_score(progress: &mut LevelProgress, score: f64, policy: &LevelPolicy) {
    let score = clamp_score(score);

    progress.attempts_used += 1;
    if score > progress.best_score {
        progress.best_score = score;
    }

    if progress.state.is_completed() {
        // A refresh after completion never demotes the level.
        return;
    }

    if progress.best_score >= policy.pass_threshold {
        progress.state = LevelState::Completed;
    } else if progress.attempts_used >= policy.max_attempts {
        match policy.exhaustion {
            ExhaustionPolicy::AdvanceWithWarning => {
                progress.state = LevelState::CompletedWithWarning;
            }
            ExhaustionPolicy::HardBlock => {
                progress.state = LevelState::InProgress;
            }
        }
    }
}

/// Which level a feedback request may currently target: level 1 always,
/// level L+1 once level L is completed.
pub fn level_unlocked(level: i32, completed: &[LevelProgress], policy: &LevelPolicy) -> bool {
    if level < 1 || level > policy.levels_total {
        return false;
    }
    if level == 1 {
        return true;
    }
    completed
        .iter()
        .any(|progress| progress.level == level - 1 && progress.state.is_completed())
}

/// Derive the session state from per-level progress.
pub fn session_state(levels: &[LevelProgress], policy: &LevelPolicy) -> SessionState {
    if levels.is_empty() {
        return SessionState::NotStarted;
    }
    let final_done = levels
        .iter()
        .any(|progress| progress.level == policy.levels_total && progress.state.is_completed());
    if final_done {
        SessionState::SubmissionAllowed
    } else {
        SessionState::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ExhaustionPolicy, LevelPolicy, LevelProgress, LevelState, SessionState, apply_score,
        level_unlocked, session_state,
    };

    fn policy(exhaustion: ExhaustionPolicy) -> LevelPolicy {
        LevelPolicy {
            levels_total: 3,
            pass_threshold: 80.0,
            max_attempts: 3,
            exhaustion,
        }
    }

    #[test]
    fn passing_score_completes_the_level() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        let mut progress = LevelProgress::entered(1);

        apply_score(&mut progress, 85.0, &policy);
        assert_eq!(progress.state, LevelState::Completed);
        assert_eq!(progress.attempts_used, 1);
        assert_eq!(progress.best_score, 85.0);
    }

    #[test]
    fn failing_scores_accumulate_best_without_completing() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        let mut progress = LevelProgress::entered(1);

        apply_score(&mut progress, 40.0, &policy);
        apply_score(&mut progress, 60.0, &policy);
        assert_eq!(progress.state, LevelState::InProgress);
        assert_eq!(progress.best_score, 60.0);
        assert_eq!(progress.attempts_used, 2);
    }

    #[test]
    fn exhaustion_advances_with_warning_when_policy_allows() {
        let policy = policy(ExhaustionPolicy::AdvanceWithWarning);
        let mut progress = LevelProgress::entered(1);

        for _ in 0..3 {
            apply_score(&mut progress, 50.0, &policy);
        }
        assert_eq!(progress.state, LevelState::CompletedWithWarning);
        assert!(progress.state.is_completed());
    }

    #[test]
    fn exhaustion_hard_blocks_when_policy_demands() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        let mut progress = LevelProgress::entered(1);

        for _ in 0..5 {
            apply_score(&mut progress, 50.0, &policy);
        }
        assert_eq!(progress.state, LevelState::InProgress);
        assert_eq!(progress.attempts_used, 5);
    }

    #[test]
    fn completion_is_never_demoted_by_a_later_refresh() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        let mut progress = LevelProgress::entered(1);

        apply_score(&mut progress, 90.0, &policy);
        apply_score(&mut progress, 10.0, &policy);
        assert_eq!(progress.state, LevelState::Completed);
        assert_eq!(progress.best_score, 90.0);
    }

    #[test]
    fn scores_are_clamped_before_applying() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        let mut progress = LevelProgress::entered(1);

        apply_score(&mut progress, 150.0, &policy);
        assert_eq!(progress.best_score, 100.0);
    }

    #[test]
    fn level_one_is_always_unlocked() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        assert!(level_unlocked(1, &[], &policy));
        assert!(!level_unlocked(2, &[], &policy));
        assert!(!level_unlocked(0, &[], &policy));
        assert!(!level_unlocked(4, &[], &policy));
    }

    #[test]
    fn completing_a_level_unlocks_the_next() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        let mut first = LevelProgress::entered(1);
        apply_score(&mut first, 95.0, &policy);

        assert!(level_unlocked(2, &[first], &policy));
        assert!(!level_unlocked(3, &[first], &policy));
    }

    #[test]
    fn warned_completion_also_unlocks_the_next_level() {
        let policy = policy(ExhaustionPolicy::AdvanceWithWarning);
        let mut first = LevelProgress::entered(1);
        for _ in 0..3 {
            apply_score(&mut first, 30.0, &policy);
        }

        assert!(level_unlocked(2, &[first], &policy));
    }

    #[test]
    fn session_state_follows_final_level() {
        let policy = policy(ExhaustionPolicy::HardBlock);
        assert_eq!(session_state(&[], &policy), SessionState::NotStarted);

        let first = LevelProgress::entered(1);
        assert_eq!(session_state(&[first], &policy), SessionState::InProgress);

        let mut last = LevelProgress::entered(3);
        apply_score(&mut last, 85.0, &policy);
        assert_eq!(
            session_state(&[first, last], &policy),
            SessionState::SubmissionAllowed
        );
    }
}
