//! Fitting of waning parameters to published effectiveness data.
//!
//! Literature reports effectiveness as averages over day ranges after the
//! immunizing event. The model explains them with two latent parameters: the
//! probability `base` that the event immunizes at all, and the parameter
//! `mean` of the waning distribution. The fraction of immune individuals `t`
//! days after the event is then `base * P(X > t)`, which is estimated by
//! sampling and compared to the reference averages.

use crate::waning::WaningSampler;
use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

/// Number of durations sampled per survival estimate.
pub const ITERS: usize = 2000;

/// Seed of every survival estimate, so the objective is deterministic.
const FIT_SEED: u64 = 12345;

const BOUNDS_BASE: (f64, f64) = (0.0, 1.0);
const BOUNDS_MEAN: (f64, f64) = (10.0, 1000.0);
const INIT_MEAN: f64 = 100.0;

/// Observed average effectiveness on the day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub start: i64,
    pub end: i64,
    pub value: f64,
}

impl Reference {
    pub fn new(start: i64, end: i64, value: f64) -> Self {
        Self { start, end, value }
    }

    /// Move the interval by `days`.
    pub fn shifted(&self, days: i64) -> Self {
        Self::new(self.start + days, self.end + days, self.value)
    }
}

/// Estimate the fraction of immune individuals for the days `0..=max_day`.
///
/// This is the discrete survival function of `ITERS` sampled durations,
/// scaled by `base`.
pub fn estimate_survival(
    sampler: &WaningSampler,
    max_day: usize,
    base: f64,
    mean: f64,
) -> Vec<f64> {
    let mut rng = ChaCha12Rng::seed_from_u64(FIT_SEED);

    // Histogram of durations, anything beyond `max_day` lands in the last bin.
    let mut counts = vec![0usize; max_day + 2];
    for _ in 0..ITERS {
        let days = sampler.sample_with_mean(mean, &mut rng) as usize;
        counts[days.min(max_day + 1)] += 1;
    }

    // Number of durations strictly greater than each day.
    let mut survival = vec![0.0; max_day + 1];
    let mut n_alive = ITERS;
    for (day, val) in survival.iter_mut().enumerate() {
        n_alive -= counts[day];
        *val = base * n_alive as f64 / ITERS as f64;
    }
    survival
}

/// Average the survival curve over every reference interval.
///
/// Days before 0 contribute nothing, the event has not immunized yet.
pub fn average_effectiveness(refs: &[Reference], survival: &[f64]) -> Vec<f64> {
    refs.iter()
        .map(|r| {
            let start = r.start.max(0) as usize;
            let end = (r.end.max(0) as usize).min(survival.len());
            let sum: f64 = survival.get(start..end).map_or(0.0, |s| s.iter().sum());
            sum / (r.end - r.start) as f64
        })
        .collect()
}

/// Sum of absolute relative errors between reference and model values.
pub fn error_fun(refs: &[Reference], model: &[f64]) -> f64 {
    refs.iter()
        .zip(model)
        .map(|(r, m)| (r.value - m).abs() / r.value.abs())
        .sum()
}

/// Fit `(base, mean)` such that the modeled effectiveness reproduces `refs`.
///
/// # Errors
/// Returns an error if the references are empty, contain an empty interval
/// or a zero effectiveness, or if the minimization produces a non-finite value.
pub fn fit_distribution_mean(refs: &[Reference], sampler: &WaningSampler) -> Result<(f64, f64)> {
    check_refs(refs).context("invalid reference values")?;

    let max_day = refs.iter().map(|r| r.end).max().unwrap_or(1).max(1) as usize;
    let objective = |x: &[f64; 2]| {
        let survival = estimate_survival(sampler, max_day, x[0], x[1]);
        error_fun(refs, &average_effectiveness(refs, &survival))
    };

    let simplex = NelderMead::new([BOUNDS_BASE.0, BOUNDS_MEAN.0], [BOUNDS_BASE.1, BOUNDS_MEAN.1]);
    let x0 = [refs[0].value.clamp(BOUNDS_BASE.0, BOUNDS_BASE.1), INIT_MEAN];
    let (mut x, mut err) = simplex.minimize(objective, x0);

    // Restart from the optimum until it stops improving.
    for _ in 0..MAX_RESTARTS {
        let (x_new, err_new) = simplex.minimize(objective, x);
        if err_new >= err {
            break;
        }
        (x, err) = (x_new, err_new);
    }

    if !err.is_finite() || x.iter().any(|v| !v.is_finite()) {
        bail!("minimization did not converge (error {err}, parameters {x:?})");
    }
    log::debug!("fitted base {:.4} and mean {:.2} with error {err:.4}", x[0], x[1]);

    Ok((x[0], x[1]))
}

fn check_refs(refs: &[Reference]) -> Result<()> {
    if refs.is_empty() {
        bail!("at least one reference interval is required");
    }
    for r in refs {
        if r.end <= r.start {
            bail!("interval [{}, {}) is empty", r.start, r.end);
        }
        if !r.value.is_finite() || r.value == 0.0 {
            bail!(
                "effectiveness on [{}, {}) must be finite and non-zero, but is {}",
                r.start,
                r.end,
                r.value
            );
        }
    }
    if refs.iter().all(|r| r.end <= 0) {
        bail!("every interval ends before the immunizing event takes effect");
    }
    Ok(())
}

/// Turn cumulative effectiveness after each dose into marginal base probabilities.
///
/// `cumul[k]` is the probability of being immune after dose `k + 1`, and
/// `samplers[k]` the waning of that dose. Dose `k + 1` only adds immunity for
/// recipients whose previous immunity did not hold until it, which happens
/// with probability `1 - cumul[k - 1] * f`, with `f` the fraction of
/// durations exceeding `intervals[k - 1]`. Solving
/// `cumul[k] = cumul[k - 1] * f + (1 - cumul[k - 1] * f) * p`
/// for `p` gives the marginal base of dose `k + 1`.
pub fn adjust_vacc_values(
    samplers: &[WaningSampler],
    cumul: &[f64],
    intervals: &[u32],
) -> Result<Vec<f64>> {
    if samplers.len() != cumul.len() {
        bail!(
            "got {} samplers for {} cumulative values",
            samplers.len(),
            cumul.len()
        );
    }
    let Some(&first) = cumul.first() else {
        return Ok(Vec::new());
    };

    let mut rng = ChaCha12Rng::seed_from_u64(FIT_SEED);
    let mut marginal = vec![first];
    for k in 1..cumul.len() {
        let interval = *intervals
            .get(k - 1)
            .with_context(|| format!("missing interval between doses {k} and {}", k + 1))?;

        let n_imm = (0..ITERS)
            .filter(|_| samplers[k - 1].sample(&mut rng) > interval)
            .count();
        let frac_imm = n_imm as f64 / ITERS as f64;

        let kept = cumul[k - 1] * frac_imm;
        let denom = 1.0 - kept;
        if denom.abs() < 1e-12 {
            bail!("dose {} cannot add immunity, every recipient is still immune", k + 1);
        }
        let prob = (cumul[k] - kept) / denom;
        if !(0.0..=1.0).contains(&prob) {
            log::warn!("marginal base of dose {} is {prob:.4}, clamping to [0, 1]", k + 1);
        }
        marginal.push(prob.clamp(0.0, 1.0));
    }

    Ok(marginal)
}

const MAX_RESTARTS: usize = 3;

/// Downhill simplex minimizer on a box.
///
/// Vertices leaving the box are clipped onto it.
struct NelderMead<const N: usize> {
    lower: [f64; N],
    upper: [f64; N],
    xatol: f64,
    fatol: f64,
    max_iter: usize,
}

impl<const N: usize> NelderMead<N> {
    fn new(lower: [f64; N], upper: [f64; N]) -> Self {
        Self {
            lower,
            upper,
            xatol: 1e-4,
            fatol: 1e-4,
            max_iter: 200 * N,
        }
    }

    fn clip(&self, mut x: [f64; N]) -> [f64; N] {
        for i in 0..N {
            x[i] = x[i].clamp(self.lower[i], self.upper[i]);
        }
        x
    }

    fn initial_simplex(&self, x0: [f64; N]) -> Vec<[f64; N]> {
        let x0 = self.clip(x0);
        let mut sim = vec![x0];
        for i in 0..N {
            let mut x = x0;
            x[i] = if x[i] != 0.0 { 1.05 * x[i] } else { 0.00025 };
            // Reflect into the box.
            if x[i] > self.upper[i] {
                x[i] = 2.0 * self.upper[i] - x[i];
            }
            sim.push(self.clip(x));
        }
        sim
    }

    fn minimize<F>(&self, mut f: F, x0: [f64; N]) -> ([f64; N], f64)
    where
        F: FnMut(&[f64; N]) -> f64,
    {
        const ALPHA: f64 = 1.0;
        const GAMMA: f64 = 2.0;
        const RHO: f64 = 0.5;
        const SIGMA: f64 = 0.5;

        let mut sim: Vec<([f64; N], f64)> = self
            .initial_simplex(x0)
            .into_iter()
            .map(|x| {
                let fx = f(&x);
                (x, fx)
            })
            .collect();

        let affine = |a: &[f64; N], b: &[f64; N], t: f64| {
            let mut x = [0.0; N];
            for i in 0..N {
                x[i] = a[i] + t * (b[i] - a[i]);
            }
            self.clip(x)
        };

        for _ in 0..self.max_iter {
            sim.sort_by(|a, b| a.1.total_cmp(&b.1));

            let (best, f_best) = sim[0];
            let x_spread = sim[1..]
                .iter()
                .flat_map(|(x, _)| x.iter().zip(&best).map(|(a, b)| (a - b).abs()))
                .fold(0.0, f64::max);
            let f_spread = sim[1..]
                .iter()
                .map(|(_, fx)| (fx - f_best).abs())
                .fold(0.0, f64::max);
            if x_spread <= self.xatol && f_spread <= self.fatol {
                break;
            }

            let mut centroid = [0.0; N];
            for (x, _) in &sim[..N] {
                for i in 0..N {
                    centroid[i] += x[i] / N as f64;
                }
            }

            let (worst, f_worst) = sim[N];
            let f_second = sim[N - 1].1;

            let x_r = affine(&centroid, &worst, -ALPHA);
            let f_r = f(&x_r);

            if f_r < f_best {
                let x_e = affine(&centroid, &worst, -GAMMA);
                let f_e = f(&x_e);
                sim[N] = if f_e < f_r { (x_e, f_e) } else { (x_r, f_r) };
                continue;
            }
            if f_r < f_second {
                sim[N] = (x_r, f_r);
                continue;
            }

            let (x_c, f_c) = if f_r < f_worst {
                let x_c = affine(&centroid, &worst, -ALPHA * RHO);
                let f_c = f(&x_c);
                (x_c, f_c)
            } else {
                let x_c = affine(&centroid, &worst, RHO);
                let f_c = f(&x_c);
                (x_c, f_c)
            };
            if f_c < f_r.min(f_worst) {
                sim[N] = (x_c, f_c);
                continue;
            }

            for vertex in sim.iter_mut().skip(1) {
                let x = affine(&best, &vertex.0, SIGMA);
                *vertex = (x, f(&x));
            }
        }

        sim.sort_by(|a, b| a.1.total_cmp(&b.1));
        sim[0]
    }
}
