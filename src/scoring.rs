//! Pure point computation, free of store access and side effects.
//!
//! Two policies coexist by design: the mode-aware flat awards used by the
//! dedicated correct/wrong/super resolutions, and the speed/streak formula
//! used by the generic award path. Both are variants of one [`ScorePolicy`]
//! so call sites select a strategy instead of duplicating arithmetic.

use serde::Deserialize;

use crate::model::GameMode;

/// Fixed bonus for an outstanding answer, identical in every mode.
pub const SUPER_ANSWER_POINTS: i32 = 20;
/// Correct-answer award when no mode (or a mode without the setting) is active.
pub const DEFAULT_POINTS_CORRECT: i32 = 10;
/// Wrong-answer deduction when no mode (or a mode without the setting) is active.
pub const DEFAULT_POINTS_WRONG: i32 = 5;

/// Streak multiplier stops compounding past this many consecutive answers.
const MAX_STREAK_EXPONENT: u32 = 5;

/// Tunables of the speed/streak formula.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoreSettings {
    /// Points for any correct answer before bonuses.
    pub base_points: i32,
    /// Upper bound applied to the speed bonus.
    pub speed_bonus_cap: i32,
    /// Starting value of the speed bonus, eroded by 10 points per second.
    pub max_speed_bonus: i32,
    /// Multiplier compounded per streak step.
    pub streak_multiplier: f64,
    /// Points deducted for a wrong answer.
    pub penalty_points: i32,
}

impl Default for ScoreSettings {
    fn default() -> Self {
        Self {
            base_points: 100,
            speed_bonus_cap: 50,
            max_speed_bonus: 200,
            streak_multiplier: 1.5,
            penalty_points: 25,
        }
    }
}

/// How the host resolved the open round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// The answer was right.
    Correct,
    /// The answer was wrong.
    Wrong,
    /// The answer was right and exceptional; awards the fixed super bonus.
    Super,
}

impl AnswerOutcome {
    /// Whether this outcome counts as a correct resolution for streak purposes.
    pub fn is_correct(self) -> bool {
        !matches!(self, AnswerOutcome::Wrong)
    }
}

/// Point delta for one resolution under the speed/streak formula.
///
/// `streak` is the streak value in effect for this answer, i.e. already
/// incremented for a correct resolution. Ignored when the answer is wrong.
pub fn speed_score(
    settings: &ScoreSettings,
    response_time: f64,
    is_correct: bool,
    streak: u32,
) -> i32 {
    if !is_correct {
        return -settings.penalty_points;
    }

    let mut score = f64::from(settings.base_points);
    let speed_bonus = (f64::from(settings.max_speed_bonus) - response_time * 10.0).max(0.0);
    score += speed_bonus.min(f64::from(settings.speed_bonus_cap));

    if streak > 0 {
        let exponent = streak.min(MAX_STREAK_EXPONENT);
        score *= settings.streak_multiplier.powi(exponent as i32);
    }

    score.round() as i32
}

/// Pluggable scoring strategy, selected per call site.
#[derive(Debug, Clone, PartialEq)]
pub enum ScorePolicy {
    /// Flat awards taken from the active game mode settings.
    ModeAware {
        /// Points for a correct resolution.
        points_correct: i32,
        /// Points deducted for a wrong resolution.
        points_wrong: i32,
    },
    /// Response-time and streak weighted formula.
    SpeedStreak(ScoreSettings),
}

impl ScorePolicy {
    /// Mode-aware policy from the active mode, falling back to the defaults.
    pub fn mode_aware(mode: Option<&GameMode>) -> Self {
        let settings = mode.map(|mode| &mode.settings);
        ScorePolicy::ModeAware {
            points_correct: settings
                .and_then(|s| s.points_correct)
                .unwrap_or(DEFAULT_POINTS_CORRECT),
            points_wrong: settings
                .and_then(|s| s.points_wrong)
                .unwrap_or(DEFAULT_POINTS_WRONG),
        }
    }

    /// Point delta for one resolution. Positive awards, negative deductions.
    pub fn delta(&self, outcome: AnswerOutcome, response_time: f64, streak: u32) -> i32 {
        if matches!(outcome, AnswerOutcome::Super) {
            return SUPER_ANSWER_POINTS;
        }

        match self {
            ScorePolicy::ModeAware {
                points_correct,
                points_wrong,
            } => match outcome {
                AnswerOutcome::Correct => *points_correct,
                AnswerOutcome::Wrong => -points_wrong,
                AnswerOutcome::Super => SUPER_ANSWER_POINTS,
            },
            ScorePolicy::SpeedStreak(settings) => {
                speed_score(settings, response_time, outcome.is_correct(), streak)
            }
        }
    }
}
