//! Hit-count scoring over byte candidates and the convergence rule deciding
//! when enough trials have accumulated to call a byte.

use log::debug;
use serde::Serialize;

/// One score slot per byte value.
pub const CANDIDATES: usize = 256;

#[derive(Debug, Clone)]
pub struct CandidateScores {
    counts: [u32; CANDIDATES],
}

impl CandidateScores {
    pub fn new() -> CandidateScores {
        CandidateScores {
            counts: [0; CANDIDATES],
        }
    }

    pub fn record(&mut self, candidate: usize) {
        self.counts[candidate] += 1;
    }

    pub fn count(&self, candidate: usize) -> u32 {
        self.counts[candidate]
    }

    /// Best and runner-up candidates in one ascending scan. On equal counts
    /// the later candidate replaces the slot, so ties break toward the
    /// higher byte value, deterministically on every call.
    pub fn top_two(&self) -> (Candidate, Candidate) {
        let mut best = 0usize;
        let mut second: Option<usize> = None;
        for i in 1..CANDIDATES {
            if self.counts[i] >= self.counts[best] {
                second = Some(best);
                best = i;
            } else if second.map_or(true, |s| self.counts[i] >= self.counts[s]) {
                second = Some(i);
            }
        }
        let second = second.unwrap_or(best);
        (self.candidate(best), self.candidate(second))
    }

    fn candidate(&self, index: usize) -> Candidate {
        Candidate {
            value: index as u8,
            score: self.counts[index],
        }
    }
}

impl Default for CandidateScores {
    fn default() -> Self {
        CandidateScores::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub value: u8,
    pub score: u32,
}

/// When to stop trialing a byte.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConvergencePolicy {
    /// Required lead of the best score over twice the runner-up.
    pub margin: u32,
    /// Trial budget per byte; exhausting it is an outcome, not an error.
    pub max_trials: u32,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        ConvergencePolicy {
            margin: 5,
            max_trials: 999,
        }
    }
}

impl ConvergencePolicy {
    /// The margin rule, plus an early exit on two uncontested hits. The
    /// extraction loop stops at the first state satisfying this, so the
    /// early exit never has to hold for later states.
    pub fn converged(&self, top1: u32, top2: u32) -> bool {
        top1 >= 2 * top2 + self.margin || (top1 == 2 && top2 == 0)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExtractionOutcome {
    pub best: Candidate,
    pub runner_up: Candidate,
    pub trials: u32,
    pub converged: bool,
}

impl ExtractionOutcome {
    /// Confidence heuristic for reporting: the best candidate leads the
    /// runner-up two to one.
    pub fn is_clear(&self) -> bool {
        self.best.score >= 2 * self.runner_up.score
    }
}

/// Run `trial` (which appends hits to the scores) until the convergence
/// rule holds or the budget runs out.
pub fn extract_byte(
    policy: &ConvergencePolicy,
    mut trial: impl FnMut(u32, &mut CandidateScores),
) -> ExtractionOutcome {
    let mut scores = CandidateScores::new();
    let mut trials = 0;
    let mut converged = false;
    for t in 0..policy.max_trials {
        trial(t, &mut scores);
        trials = t + 1;
        let (best, second) = scores.top_two();
        if policy.converged(best.score, second.score) {
            converged = true;
            break;
        }
    }
    let (best, runner_up) = scores.top_two();
    debug!(
        "{} after {} trials: {:#04x} score {} vs {:#04x} score {}",
        if converged { "converged" } else { "budget exhausted" },
        trials,
        best.value,
        best.score,
        runner_up.value,
        runner_up.score
    );
    ExtractionOutcome {
        best,
        runner_up,
        trials,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_break_toward_the_higher_value() {
        let mut scores = CandidateScores::new();
        scores.record(10);
        scores.record(200);
        let (best, runner_up) = scores.top_two();
        assert_eq!(best.value, 200);
        assert_eq!(runner_up.value, 10);
        assert_eq!(best.score, 1);
        assert_eq!(runner_up.score, 1);
    }

    #[test]
    fn top_two_of_empty_scores_is_the_last_candidate() {
        let (best, runner_up) = CandidateScores::new().top_two();
        assert_eq!(best.value, 255);
        assert_eq!(runner_up.value, 254);
        assert_eq!(best.score, 0);
        assert_eq!(runner_up.score, 0);
    }

    #[test]
    fn convergence_needs_a_double_lead_plus_margin() {
        let policy = ConvergencePolicy::default();
        assert!(policy.converged(9, 2));
        assert!(!policy.converged(8, 2));
        assert!(policy.converged(5, 0));
        assert!(!policy.converged(4, 0));
    }

    #[test]
    fn early_exit_on_two_uncontested_hits() {
        let policy = ConvergencePolicy::default();
        assert!(policy.converged(2, 0));
        assert!(!policy.converged(1, 0));
        assert!(!policy.converged(2, 1));
    }

    #[test]
    fn margin_rule_is_monotone_for_contested_runners_up() {
        let policy = ConvergencePolicy::default();
        for top2 in 1..50 {
            let mut held = false;
            for top1 in 0..200 {
                let now = policy.converged(top1, top2);
                assert!(!held || now);
                held = now;
            }
        }
    }

    #[test]
    fn clean_oracle_converges_in_two_trials() {
        let outcome = extract_byte(&ConvergencePolicy::default(), |_, scores| {
            scores.record(0x42);
        });
        assert!(outcome.converged);
        assert_eq!(outcome.trials, 2);
        assert_eq!(outcome.best.value, 0x42);
        assert_eq!(outcome.best.score, 2);
        assert_eq!(outcome.runner_up.score, 0);
        assert!(outcome.is_clear());
    }

    #[test]
    fn contested_candidates_exhaust_the_budget() {
        let policy = ConvergencePolicy {
            margin: 5,
            max_trials: 10,
        };
        let outcome = extract_byte(&policy, |_, scores| {
            scores.record(1);
            scores.record(2);
        });
        assert!(!outcome.converged);
        assert_eq!(outcome.trials, 10);
        assert!(!outcome.is_clear());
    }

    #[test]
    fn dominant_candidate_reported_with_double_lead() {
        let policy = ConvergencePolicy::default();
        let outcome = extract_byte(&policy, |t, scores| {
            scores.record(0x7a);
            if t % 3 == 0 {
                scores.record(0x05);
            }
        });
        assert!(outcome.converged);
        assert_eq!(outcome.best.value, 0x7a);
        assert!(outcome.best.score >= 2 * outcome.runner_up.score);
        assert!(outcome.trials <= policy.max_trials);
        assert!(outcome.is_clear());
    }
}
