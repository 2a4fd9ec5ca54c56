//! Convergence diagnostics computed from the completed traces of an ensemble.

use std::fmt::Display;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{chain::Trace, sampler::Ensemble};

/// R-hat values above this indicate that the chains have not mixed.
pub const R_HAT_THRESHOLD: f64 = 1.01;
/// BFMI values below this indicate inefficient momentum resampling.
pub const BFMI_THRESHOLD: f64 = 0.3;

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance.
fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (values.len() - 1) as f64
}

/// Potential scale reduction of equally long chains.
///
/// Identical chains give `sqrt((n - 1) / n)` for `n` draws per chain,
/// slightly below one, as the within-chain variance is unbiased but the
/// pooled estimate weights it by `(n - 1) / n`.
///
/// Returns NaN for fewer than two draws per chain or a constant estimand.
pub fn r_hat(chains: &[&[f64]]) -> f64 {
    let Some(n) = chains.first().map(|chain| chain.len()) else {
        return f64::NAN;
    };
    if n < 2 || chains.iter().any(|chain| chain.len() != n) {
        return f64::NAN;
    }
    let means: Vec<f64> = chains.iter().map(|chain| mean(chain)).collect();
    let within = chains.iter().map(|chain| variance(chain)).sum::<f64>() / chains.len() as f64;
    let between = if chains.len() > 1 {
        n as f64 * variance(&means)
    } else {
        0.
    };
    if within == 0. {
        return f64::NAN;
    }
    let n = n as f64;
    let var_plus = (n - 1.) / n * within + between / n;
    (var_plus / within).sqrt()
}

/// R-hat over the first and second half of every chain.
///
/// The middle draw of odd length chains is dropped.
pub fn split_r_hat(chains: &[&[f64]]) -> f64 {
    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|chain| {
            let half = chain.len() / 2;
            [&chain[..half], &chain[chain.len() - half..]]
        })
        .collect();
    r_hat(&halves)
}

/// Autocovariance at `lag`, normalized by the chain length.
fn autocovariance(chain: &[f64], chain_mean: f64, lag: usize) -> f64 {
    let n = chain.len();
    chain[..n - lag]
        .iter()
        .zip(chain[lag..].iter())
        .map(|(a, b)| (a - chain_mean) * (b - chain_mean))
        .sum::<f64>()
        / n as f64
}

/// Effective sample size of equally long chains.
///
/// Autocorrelations are estimated with the variogram estimator of all
/// chains combined and truncated with Geyer's initial monotone sequence.
/// The result is never larger than the total number of draws.
pub fn effective_sample_size(chains: &[&[f64]]) -> f64 {
    let Some(n) = chains.first().map(|chain| chain.len()) else {
        return f64::NAN;
    };
    if n < 4 || chains.iter().any(|chain| chain.len() != n) {
        return f64::NAN;
    }
    let m = chains.len();
    let means: Vec<f64> = chains.iter().map(|chain| mean(chain)).collect();
    let within = chains.iter().map(|chain| variance(chain)).sum::<f64>() / m as f64;
    let between_over_n = if m > 1 { variance(&means) } else { 0. };
    let var_plus = (n as f64 - 1.) / n as f64 * within + between_over_n;
    if !(var_plus > 0.) {
        return f64::NAN;
    }

    let rho = |lag: usize| {
        let acov = chains
            .iter()
            .zip(means.iter())
            .map(|(chain, &chain_mean)| autocovariance(chain, chain_mean, lag))
            .sum::<f64>()
            / m as f64;
        1. - (within - acov) / var_plus
    };

    // Pairs of consecutive autocorrelations, starting at lag 0 with rho = 1.
    let mut sum = 0.;
    let mut previous = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let first = if lag == 0 { 1. } else { rho(lag) };
        let pair = first + rho(lag + 1);
        if pair <= 0. {
            break;
        }
        let pair = pair.min(previous);
        sum += pair;
        previous = pair;
        lag += 2;
    }

    let total = (m * n) as f64;
    let tau = (-1. + 2. * sum).max(1. / total.log10());
    (total / tau).min(total)
}

/// Bayesian fraction of missing information of one energy trace.
pub fn bfmi(energies: &[f64]) -> f64 {
    if energies.len() < 2 {
        return f64::NAN;
    }
    let energy_mean = mean(energies);
    let var = energies
        .iter()
        .map(|e| (e - energy_mean) * (e - energy_mean))
        .sum::<f64>()
        / energies.len() as f64;
    let diff = energies
        .iter()
        .tuple_windows()
        .map(|(a, b)| (b - a) * (b - a))
        .sum::<f64>()
        / (energies.len() - 1) as f64;
    diff / var
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceSummary {
    pub chain: u64,
    pub count: usize,
    /// Indices of the divergent draws among the sampling draws.
    pub indices: Vec<usize>,
    pub maxdepth_hits: usize,
}

/// Summary of one coordinate over all completed chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub r_hat: f64,
    pub ess: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiagnosticWarning {
    HighRHat { name: String, r_hat: f64 },
    LowBfmi { chain: u64, bfmi: f64 },
    Divergences { chain: u64, count: usize },
    MaxTreeDepth { chain: u64, count: usize },
    IncompleteChains { count: usize },
}

impl Display for DiagnosticWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticWarning::HighRHat { name, r_hat } => write!(
                f,
                "R-hat of {} is {:.3}, the chains have not converged",
                name, r_hat
            ),
            DiagnosticWarning::LowBfmi { chain, bfmi } => write!(
                f,
                "chain {} has a BFMI of {:.3}, momentum resampling is inefficient",
                chain, bfmi
            ),
            DiagnosticWarning::Divergences { chain, count } => {
                write!(f, "chain {} had {} divergent transitions", chain, count)
            }
            DiagnosticWarning::MaxTreeDepth { chain, count } => write!(
                f,
                "chain {} reached the maximum tree depth in {} draws",
                chain, count
            ),
            DiagnosticWarning::IncompleteChains { count } => write!(
                f,
                "{} chains did not complete and are excluded from the diagnostics",
                count
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub summary: Vec<SummaryRow>,
    /// BFMI per completed chain that recorded energies.
    pub bfmi: Vec<(u64, f64)>,
    pub divergences: Vec<DivergenceSummary>,
    pub warnings: Vec<DiagnosticWarning>,
}

impl DiagnosticsReport {
    pub fn max_r_hat(&self) -> f64 {
        self.summary
            .iter()
            .map(|row| row.r_hat)
            .fold(f64::NAN, f64::max)
    }

    pub fn total_divergences(&self) -> usize {
        self.divergences.iter().map(|div| div.count).sum()
    }

    pub fn row(&self, name: &str) -> Option<&SummaryRow> {
        self.summary.iter().find(|row| row.name == name)
    }
}

fn summarize(name: String, values: &[Vec<f64>]) -> SummaryRow {
    let chains: Vec<&[f64]> = values.iter().map(|v| v.as_slice()).collect();
    let all: Vec<f64> = values.iter().flatten().copied().collect();
    let (mean, sd) = if all.len() > 1 {
        (mean(&all), variance(&all).sqrt())
    } else {
        (all.first().copied().unwrap_or(f64::NAN), f64::NAN)
    };
    SummaryRow {
        name,
        mean,
        sd,
        r_hat: split_r_hat(&chains),
        ess: effective_sample_size(&chains),
    }
}

/// Compute all diagnostics of an ensemble.
///
/// Only completed chains contribute.
pub fn diagnose(ensemble: &Ensemble) -> DiagnosticsReport {
    let completed: Vec<&Trace> = ensemble.completed_traces().collect();
    let mut warnings = vec![];

    let incomplete = ensemble.traces.len() - completed.len();
    if incomplete > 0 {
        warnings.push(DiagnosticWarning::IncompleteChains { count: incomplete });
    }

    let summary: Vec<SummaryRow> = ensemble
        .coordinate_names()
        .into_iter()
        .enumerate()
        .map(|(coord, name)| {
            let values: Vec<Vec<f64>> = completed.iter().map(|trace| trace.values(coord)).collect();
            summarize(name, &values)
        })
        .collect();
    for row in summary.iter() {
        if row.r_hat > R_HAT_THRESHOLD {
            warnings.push(DiagnosticWarning::HighRHat {
                name: row.name.clone(),
                r_hat: row.r_hat,
            });
        }
    }

    let mut bfmis = vec![];
    let mut divergences = vec![];
    for trace in completed.iter() {
        let energies = trace.energies();
        if energies.len() >= 2 {
            let value = bfmi(&energies);
            if value < BFMI_THRESHOLD {
                warnings.push(DiagnosticWarning::LowBfmi {
                    chain: trace.chain,
                    bfmi: value,
                });
            }
            bfmis.push((trace.chain, value));
        }

        let indices = trace.divergent_draws();
        let maxdepth_hits = trace.maxdepth_hits();
        if !indices.is_empty() {
            warnings.push(DiagnosticWarning::Divergences {
                chain: trace.chain,
                count: indices.len(),
            });
        }
        if maxdepth_hits > 0 {
            warnings.push(DiagnosticWarning::MaxTreeDepth {
                chain: trace.chain,
                count: maxdepth_hits,
            });
        }
        divergences.push(DivergenceSummary {
            chain: trace.chain,
            count: indices.len(),
            indices,
            maxdepth_hits,
        });
    }

    DiagnosticsReport {
        summary,
        bfmi: bfmis,
        divergences,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn normal_draws(seed: u64, n: usize, shift: f64) -> Vec<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..n)
            .map(|_| shift + rng.sample::<f64, _>(StandardNormal))
            .collect()
    }

    #[test]
    fn duplicated_chains_r_hat_is_just_below_one() {
        let n = 1000;
        let chain = normal_draws(0, n, 0.);
        let value = r_hat(&[&chain, &chain]);
        assert!(value < 1.);
        assert_relative_eq!(value, ((n as f64 - 1.) / n as f64).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(value, 1., epsilon = 1e-3);
    }

    #[test]
    fn r_hat_detects_separated_chains() {
        let a = normal_draws(1, 500, 0.);
        let b = normal_draws(2, 500, 5.);
        assert!(split_r_hat(&[&a, &b]) > 2.);
        let c = normal_draws(3, 500, 0.);
        assert!(split_r_hat(&[&a, &c]) < 1.02);
    }

    #[test]
    fn split_r_hat_detects_trends() {
        let trend: Vec<f64> = (0..1000).map(|i| i as f64 / 100.).collect();
        assert!(r_hat(&[&trend]) < 1.);
        assert!(split_r_hat(&[&trend]) > 1.5);
    }

    #[test]
    fn degenerate_input_is_nan() {
        assert!(r_hat(&[]).is_nan());
        assert!(r_hat(&[&[1.]]).is_nan());
        assert!(r_hat(&[&[1., 1., 1.]]).is_nan());
        assert!(effective_sample_size(&[&[1., 2.]]).is_nan());
        assert!(bfmi(&[1.]).is_nan());
    }

    #[test]
    fn ess_of_independent_draws() {
        let a = normal_draws(4, 2000, 0.);
        let b = normal_draws(5, 2000, 0.);
        let ess = effective_sample_size(&[&a, &b]);
        assert!(ess > 3000., "ess was {}", ess);
        assert!(ess <= 4000.);
    }

    #[test]
    fn ess_of_correlated_draws() {
        let mut rng = SmallRng::seed_from_u64(6);
        let mut x = 0.;
        let draws: Vec<f64> = (0..4000)
            .map(|_| {
                x = 0.9 * x + rng.sample::<f64, _>(StandardNormal);
                x
            })
            .collect();
        // AR(1) with phi 0.9 has tau = 19.
        let ess = effective_sample_size(&[&draws]);
        assert!(ess > 100. && ess < 400., "ess was {}", ess);
    }

    #[test]
    fn bfmi_of_random_walk_is_small() {
        let independent = normal_draws(7, 2000, 0.);
        assert!(bfmi(&independent) > 1.5);

        let mut walk = vec![0.];
        let steps = normal_draws(8, 2000, 0.);
        for step in steps {
            let last = walk[walk.len() - 1];
            walk.push(last + 0.01 * step);
        }
        assert!(bfmi(&walk) < BFMI_THRESHOLD);
    }

    proptest! {
        #[test]
        fn ess_is_capped(values in proptest::collection::vec(-10f64..10f64, 8..64)) {
            let ess = effective_sample_size(&[&values]);
            prop_assert!(ess.is_nan() || ess <= values.len() as f64);
        }
    }
}
