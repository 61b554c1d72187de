//! Rank correlation between process rewards and final rewards.
//!
//! Each trajectory with at least one step contributes one pair: the mean of
//! its per-step rewards and its final reward. Agreement between the two is
//! measured with Kendall's tau-b and turned into a search-strategy hint.

use serde::Serialize;

use super::round_to;
use crate::trajectory::Trajectory;

/// Largest sample for which the p-value is computed exactly (no ties).
const EXACT_P_MAX_N: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KendallTau {
    pub tau: f64,
    /// Two-sided.
    pub p_value: f64,
}

impl KendallTau {
    /// Stand-in for undefined correlations.
    pub const NEUTRAL: KendallTau = KendallTau {
        tau: 0.0,
        p_value: 1.0,
    };
}

/// Kendall's tau-b of two equally long samples.
///
/// Returns `None` when tau is undefined: fewer than two pairs, mismatched
/// lengths, a non-finite value, or a sample that is constant.
pub fn kendall_tau(x: &[f64], y: &[f64]) -> Option<KendallTau> {
    let n = x.len();
    if n < 2 || n != y.len() || x.iter().chain(y).any(|v| !v.is_finite()) {
        return None;
    }

    let mut s: i64 = 0;
    let mut discordant: u64 = 0;
    for i in 0..n {
        for j in (i + 1)..n {
            let sign = sign(x[i] - x[j]) * sign(y[i] - y[j]);
            s += sign;
            if sign < 0 {
                discordant += 1;
            }
        }
    }

    let pairs = (n * (n - 1) / 2) as f64;
    let x_ties = TieCounts::of(x);
    let y_ties = TieCounts::of(y);
    let denom = ((pairs - x_ties.pairs) * (pairs - y_ties.pairs)).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    let tau = (s as f64 / denom).clamp(-1.0, 1.0);

    let p_value = if x_ties.pairs == 0.0 && y_ties.pairs == 0.0 && n <= EXACT_P_MAX_N {
        exact_p_value(n, discordant)
    } else {
        asymptotic_p_value(n, s, &x_ties, &y_ties)
    };

    Some(KendallTau {
        tau,
        p_value: p_value.clamp(0.0, 1.0),
    })
}

fn sign(v: f64) -> i64 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// Tie-group sums used by the tau-b variance.
struct TieCounts {
    /// Σ t(t-1)/2
    pairs: f64,
    /// Σ t(t-1)(t-2)
    v1: f64,
    /// Σ t(t-1)(2t+5)
    v2: f64,
}

impl TieCounts {
    fn of(values: &[f64]) -> Self {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let mut counts = Self {
            pairs: 0.0,
            v1: 0.0,
            v2: 0.0,
        };
        for group in sorted.chunk_by(|a, b| a == b) {
            let t = group.len() as f64;
            if t > 1.0 {
                counts.pairs += t * (t - 1.0) / 2.0;
                counts.v1 += t * (t - 1.0) * (t - 2.0);
                counts.v2 += t * (t - 1.0) * (2.0 * t + 5.0);
            }
        }
        counts
    }
}

/// Exact two-sided p-value for a tie-free sample of size `n` with `discordant`
/// discordant pairs, by counting permutations with at most that many inversions.
fn exact_p_value(n: usize, discordant: u64) -> f64 {
    let total = (n * (n - 1) / 2) as u64;
    let c = discordant.min(total - discordant) as usize;

    if n <= 2 || 2 * c as u64 == total {
        return 1.0;
    }

    // dist[k] = permutations of j elements with exactly k inversions, for k <= c.
    // Counts are kept as fractions of j! to stay within f64 range.
    let mut dist = vec![0.0f64; c + 1];
    dist[0] = 1.0;
    for j in 2..=n {
        let mut prefix = 0.0;
        let mut next = vec![0.0f64; c + 1];
        for k in 0..=c {
            prefix += dist[k];
            if k >= j {
                prefix -= dist[k - j];
            }
            next[k] = prefix / j as f64;
        }
        dist = next;
    }

    (2.0 * dist.iter().sum::<f64>()).min(1.0)
}

/// Normal approximation with the tie-corrected variance of S.
fn asymptotic_p_value(n: usize, s: i64, x: &TieCounts, y: &TieCounts) -> f64 {
    let nf = n as f64;
    let mut var = (nf * (nf - 1.0) * (2.0 * nf + 5.0) - x.v2 - y.v2) / 18.0
        + 2.0 * x.pairs * y.pairs / (nf * (nf - 1.0));
    if n > 2 {
        var += x.v1 * y.v1 / (9.0 * nf * (nf - 1.0) * (nf - 2.0));
    }
    if var <= 0.0 || !var.is_finite() {
        return 1.0;
    }

    let z = s as f64 / var.sqrt();
    erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// Complementary error function for `x >= 0` (Abramowitz-Stegun 7.1.26).
fn erfc(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = ((((1.061405429 * t - 1.453152027) * t + 1.421413741) * t - 0.284496736) * t
        + 0.254829592)
        * t;
    poly * (-x * x).exp()
}

/// Qualitative reading of tau.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpretation {
    NoData,
    InsufficientData,
    StrongPositiveCorrelation,
    StrongNegativeCorrelation,
    ModeratePositiveCorrelation,
    ModerateNegativeCorrelation,
    WeakPositiveCorrelation,
    WeakNegativeCorrelation,
    NoCorrelation,
}

/// Suggested search strategy given the correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Step rewards track the outcome; use them to guide a beam search.
    BeamSearch,
    /// Step rewards are not a reliable signal; train on the outcome reward.
    OutcomeReward,
    InsufficientData,
    NeedMoreSamples,
}

/// Bands |tau| at 0.7 / 0.3 / 0.1 and picks a strategy.
pub fn interpret(tau: f64) -> (Interpretation, Strategy) {
    let positive = tau > 0.0;
    match tau.abs() {
        a if a >= 0.7 && positive => (Interpretation::StrongPositiveCorrelation, Strategy::BeamSearch),
        a if a >= 0.7 => (Interpretation::StrongNegativeCorrelation, Strategy::OutcomeReward),
        a if a >= 0.3 && positive => {
            (Interpretation::ModeratePositiveCorrelation, Strategy::BeamSearch)
        }
        a if a >= 0.3 => (Interpretation::ModerateNegativeCorrelation, Strategy::OutcomeReward),
        a if a >= 0.1 && positive => {
            (Interpretation::WeakPositiveCorrelation, Strategy::OutcomeReward)
        }
        a if a >= 0.1 => (Interpretation::WeakNegativeCorrelation, Strategy::OutcomeReward),
        _ => (Interpretation::NoCorrelation, Strategy::OutcomeReward),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScatterData {
    /// Mean step reward per trajectory.
    pub x: Vec<f64>,
    /// Final reward per trajectory.
    pub y: Vec<f64>,
    pub trajectory_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationReport {
    pub kendall_tau: f64,
    pub p_value: f64,
    pub sample_size: usize,
    pub interpretation: Interpretation,
    pub suggested_strategy: Strategy,
    pub scatter_data: ScatterData,
}

impl CorrelationReport {
    fn sentinel(
        sample_size: usize,
        interpretation: Interpretation,
        suggested_strategy: Strategy,
    ) -> Self {
        Self {
            kendall_tau: KendallTau::NEUTRAL.tau,
            p_value: KendallTau::NEUTRAL.p_value,
            sample_size,
            interpretation,
            suggested_strategy,
            scatter_data: ScatterData::default(),
        }
    }
}

/// Correlates mean step reward with final reward over trajectories that have steps.
pub fn process_reward_correlation(trajectories: &[Trajectory]) -> CorrelationReport {
    if trajectories.is_empty() {
        return CorrelationReport::sentinel(0, Interpretation::NoData, Strategy::InsufficientData);
    }

    let mut scatter = ScatterData::default();
    for t in trajectories {
        if let Some(process) = t.mean_step_reward() {
            scatter.x.push(process);
            scatter.y.push(t.reward);
            scatter.trajectory_ids.push(t.trajectory_id.clone());
        }
    }

    let sample_size = scatter.x.len();
    if sample_size < 2 {
        return CorrelationReport::sentinel(
            sample_size,
            Interpretation::InsufficientData,
            Strategy::NeedMoreSamples,
        );
    }

    let result = kendall_tau(&scatter.x, &scatter.y).unwrap_or(KendallTau::NEUTRAL);
    let (interpretation, suggested_strategy) = interpret(result.tau);
    tracing::debug!(
        sample_size,
        tau = result.tau,
        p_value = result.p_value,
        "Process reward correlation computed"
    );

    scatter.x.iter_mut().for_each(|v| *v = round_to(*v, 3));
    scatter.y.iter_mut().for_each(|v| *v = round_to(*v, 3));

    CorrelationReport {
        kendall_tau: round_to(result.tau, 3),
        p_value: round_to(result.p_value, 4),
        sample_size,
        interpretation,
        suggested_strategy,
        scatter_data: scatter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::Step;

    fn with_process(id: &str, step_reward: f64, reward: f64) -> Trajectory {
        Trajectory::new(id, "q")
            .with_reward(reward)
            .with_steps(vec![Step {
                reward: step_reward,
                ..Default::default()
            }])
    }

    #[test]
    fn test_perfect_agreement() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let r = kendall_tau(&x, &x).expect("defined");
        assert!((r.tau - 1.0).abs() < 1e-12);
        // 2 / 5! = 0.01667
        assert!((r.p_value - 2.0 / 120.0).abs() < 1e-9);

        let rev = [5.0, 4.0, 3.0, 2.0, 1.0];
        let r = kendall_tau(&x, &rev).expect("defined");
        assert!((r.tau + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_exact_p_value_small_sample() {
        // One discordant pair out of 6 for n = 4: P(inv <= 1) = 4/24.
        let r = kendall_tau(&[1.0, 2.0, 3.0, 4.0], &[1.0, 3.0, 2.0, 4.0]).expect("defined");
        assert!((r.tau - 4.0 / 6.0).abs() < 1e-12);
        assert!((r.p_value - 2.0 * 4.0 / 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_tau_b_with_ties() {
        let r = kendall_tau(&[0.1, 0.2, 0.8, 0.9], &[0.0, 0.0, 1.0, 1.0]).expect("defined");
        assert!((r.tau - 4.0 / 24f64.sqrt()).abs() < 1e-12);
        assert!(r.p_value > 0.0 && r.p_value < 1.0);
    }

    #[test]
    fn test_large_sample_uses_normal_approximation() {
        let x: Vec<f64> = (0..50).map(f64::from).collect();
        let r = kendall_tau(&x, &x).expect("defined");
        assert!((r.tau - 1.0).abs() < 1e-12);
        assert!(r.p_value < 1e-6);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(kendall_tau(&[1.0], &[1.0]).is_none());
        assert!(kendall_tau(&[1.0, 2.0], &[1.0]).is_none());
        assert!(kendall_tau(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
        assert!(kendall_tau(&[f64::NAN, 1.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_interpret_bands() {
        assert_eq!(
            interpret(0.8),
            (Interpretation::StrongPositiveCorrelation, Strategy::BeamSearch)
        );
        assert_eq!(
            interpret(-0.8),
            (Interpretation::StrongNegativeCorrelation, Strategy::OutcomeReward)
        );
        assert_eq!(interpret(0.3).1, Strategy::BeamSearch);
        assert_eq!(interpret(0.15).0, Interpretation::WeakPositiveCorrelation);
        assert_eq!(interpret(-0.1).0, Interpretation::WeakNegativeCorrelation);
        assert_eq!(interpret(0.05).0, Interpretation::NoCorrelation);
    }

    #[test]
    fn test_report_sentinels() {
        let report = process_reward_correlation(&[]);
        assert_eq!(report.interpretation, Interpretation::NoData);
        assert_eq!(report.suggested_strategy, Strategy::InsufficientData);

        let no_steps = vec![Trajectory::new("a", "q"), with_process("b", 0.5, 1.0)];
        let report = process_reward_correlation(&no_steps);
        assert_eq!(report.sample_size, 1);
        assert_eq!(report.interpretation, Interpretation::InsufficientData);
        assert_eq!(report.suggested_strategy, Strategy::NeedMoreSamples);
        assert_eq!(report.p_value, 1.0);
    }

    #[test]
    fn test_constant_rewards_are_neutral() {
        let report = process_reward_correlation(&[
            with_process("a", 0.1, 1.0),
            with_process("b", 0.5, 1.0),
            with_process("c", 0.9, 1.0),
        ]);
        assert_eq!(report.kendall_tau, 0.0);
        assert_eq!(report.p_value, 1.0);
        assert_eq!(report.interpretation, Interpretation::NoCorrelation);
        assert_eq!(report.scatter_data.trajectory_ids.len(), 3);
    }

    #[test]
    fn test_serialized_labels() {
        let json = serde_json::to_value(interpret(0.9)).expect("serializes");
        assert_eq!(json[0], "strong_positive_correlation");
        assert_eq!(json[1], "beam_search");
        let json = serde_json::to_value(Strategy::OutcomeReward).expect("serializes");
        assert_eq!(json, "outcome_reward");
    }
}
