//! Fit of a timing distribution: outlier rejection, histogram, then a Gaussian least squares fit
use serde::{Deserialize, Serialize};

use super::error::FitError;

const MAX_ITERATIONS: usize = 200;
const MAX_DAMPING: f64 = 1.0e16;
const PARAM_TOLERANCE: f64 = 1.0e-10;
const COST_TOLERANCE: f64 = 1.0e-12;

/// Location and width of a timing distribution. (0, 0) when no fit could be made
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingFit {
    pub center: f64,
    pub width: f64,
}

/// Median of values; the mean of the middle pair for an even count
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    } else {
        Some(sorted[mid])
    }
}

/// Keep values whose distance from the median is under threshold median absolute deviations.
/// With a zero deviation (more than half the values identical) nothing is rejected.
pub fn reject_outliers(values: &[f64], threshold: f64) -> Vec<f64> {
    let Some(center) = median(values) else {
        return Vec::new();
    };
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    let mad = median(&deviations).unwrap_or(0.0);
    if mad == 0.0 {
        return values.to_vec();
    }
    values
        .iter()
        .zip(deviations)
        .filter(|(_, dev)| dev / mad < threshold)
        .map(|(v, _)| *v)
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
fn std_dev(values: &[f64]) -> f64 {
    let mu = mean(values);
    (values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub centers: Vec<f64>,
    pub counts: Vec<f64>,
}

/// Equal width histogram spanning [min, max] with the last bin closed. A zero-width range is
/// widened by 0.5 either side.
pub fn histogram(values: &[f64], n_bins: usize) -> Histogram {
    let n_bins = n_bins.max(1);
    let (mut lo, mut hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    if values.is_empty() {
        lo = 0.0;
        hi = 1.0;
    } else if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let span = hi - lo;
    let edge = |i: usize| lo + span * i as f64 / n_bins as f64;
    let centers = (0..n_bins).map(|i| 0.5 * (edge(i) + edge(i + 1))).collect();

    let mut counts = vec![0.0; n_bins];
    for value in values {
        let bin = (((value - lo) / span) * n_bins as f64).floor() as usize;
        counts[bin.min(n_bins - 1)] += 1.0;
    }
    Histogram { centers, counts }
}

fn gaussian(x: f64, params: &[f64; 3]) -> f64 {
    let [amplitude, center, sigma] = *params;
    amplitude * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp()
}

fn cost(x: &[f64], y: &[f64], params: &[f64; 3]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(xi, yi)| (yi - gaussian(*xi, params)).powi(2))
        .sum()
}

/// Solve a 3x3 linear system by Gaussian elimination with partial pivoting
fn solve3(mut a: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|i, j| a[*i][col].abs().total_cmp(&a[*j][col].abs()))?;
        if a[pivot][col].abs() < f64::MIN_POSITIVE {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..3 {
            let factor = a[row][col] / a[col][col];
            for k in col..3 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut solution = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = ((row + 1)..3).map(|k| a[row][k] * solution[k]).sum();
        solution[row] = (b[row] - tail) / a[row][row];
    }
    solution.iter().all(|v| v.is_finite()).then_some(solution)
}

/// Levenberg-Marquardt fit of amplitude * exp(-(x - center)^2 / (2 sigma^2)) to (x, y)
fn levenberg_marquardt(x: &[f64], y: &[f64], initial: [f64; 3]) -> Result<[f64; 3], FitError> {
    let mut params = initial;
    let mut current_cost = cost(x, y, &params);
    let mut damping = 1.0e-3;

    for _ in 0..MAX_ITERATIONS {
        let mut jtj = [[0.0; 3]; 3];
        let mut jtr = [0.0; 3];
        let [amplitude, center, sigma] = params;
        for (xi, yi) in x.iter().zip(y) {
            let dx = xi - center;
            let e = (-dx * dx / (2.0 * sigma * sigma)).exp();
            let jac = [
                e,
                amplitude * e * dx / (sigma * sigma),
                amplitude * e * dx * dx / (sigma * sigma * sigma),
            ];
            let residual = yi - amplitude * e;
            for r in 0..3 {
                jtr[r] += jac[r] * residual;
                for c in 0..3 {
                    jtj[r][c] += jac[r] * jac[c];
                }
            }
        }

        loop {
            let mut lhs = jtj;
            for (d, row) in lhs.iter_mut().enumerate() {
                row[d] += damping * jtj[d][d].max(f64::EPSILON);
            }
            let step = solve3(lhs, jtr);
            let trial = step.map(|delta| {
                [
                    params[0] + delta[0],
                    params[1] + delta[1],
                    params[2] + delta[2],
                ]
            });
            let trial_cost = trial.map(|p| cost(x, y, &p));
            match (step, trial, trial_cost) {
                (Some(delta), Some(next), Some(next_cost))
                    if next_cost.is_finite() && next_cost <= current_cost =>
                {
                    let small_step = delta
                        .iter()
                        .zip(next.iter())
                        .all(|(d, p)| d.abs() <= PARAM_TOLERANCE * (p.abs() + PARAM_TOLERANCE));
                    let small_gain = current_cost - next_cost <= COST_TOLERANCE * current_cost;
                    params = next;
                    current_cost = next_cost;
                    damping = (damping / 10.0).max(1.0e-12);
                    if small_step || small_gain {
                        return Ok(params);
                    }
                    break;
                }
                _ => {
                    damping *= 10.0;
                    // No step in any direction improves the fit: this is the minimum
                    if damping > MAX_DAMPING {
                        return Ok(params);
                    }
                }
            }
        }
    }
    Err(FitError::NotConverged(MAX_ITERATIONS))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingFitter {
    n_bins: usize,
    outlier_threshold: f64,
}

impl TimingFitter {
    pub fn new(n_bins: usize, outlier_threshold: f64) -> Self {
        Self {
            n_bins,
            outlier_threshold,
        }
    }

    /// Fit the distribution of values. Non-finite values (missing crossings) are ignored
    pub fn fit(&self, values: &[f64]) -> Result<TimingFit, FitError> {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let retained = reject_outliers(&finite, self.outlier_threshold);
        if retained.len() < 3 {
            return Err(FitError::TooFewValues(retained.len()));
        }

        let hist = histogram(&retained, self.n_bins);
        let amplitude = hist.counts.iter().copied().fold(0.0, f64::max);
        let center = median(&retained).unwrap_or(0.0);
        let width = std_dev(&retained);
        if width == 0.0 || !width.is_finite() {
            return Err(FitError::DegenerateInput(format!(
                "initial width is {width}"
            )));
        }

        let [_, center, sigma] =
            levenberg_marquardt(&hist.centers, &hist.counts, [amplitude, center, width])?;
        if !center.is_finite() || !sigma.is_finite() || sigma == 0.0 {
            return Err(FitError::DegenerateInput(format!(
                "fit ended at center {center}, width {sigma}"
            )));
        }
        Ok(TimingFit {
            center,
            width: sigma.abs(),
        })
    }
}
