//! Immunity granted by infections and vaccinations.
//!
//! [`Observables`] resolves the configured waning specifications into fitted
//! parameters. [`BaseImmunityModel`] and [`LossModel`] turn them into dense
//! tables indexed by cause and target for use in the simulation loop.

use crate::config::{Config, DEFAULT_CAUSE, N_DOSES, vacc_cause};
use crate::fit::{adjust_vacc_values, fit_distribution_mean};
use crate::waning::{WaningKind, WaningSampler};
use anyhow::{Context, Result};
use rand::Rng;
use std::collections::BTreeMap;

/// Waning parameters of one cause against one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaningParams {
    pub kind: WaningKind,
    /// Probability that the event immunizes at all.
    pub base: f64,
    /// Parameter of the waning distribution.
    pub mean: f64,
}

impl WaningParams {
    pub fn sampler(&self) -> Result<WaningSampler> {
        WaningSampler::new(self.kind, self.mean)
    }
}

/// Fitted waning parameters per target and cause.
#[derive(Debug, Clone, PartialEq)]
pub struct Observables {
    entries: BTreeMap<String, BTreeMap<String, WaningParams>>,
}

impl Observables {
    /// Resolve the observables of a configuration.
    ///
    /// Entries without `mean` are fitted to their reference values, shifted
    /// by the vaccination delay for vaccine causes. The bases of consecutive
    /// doses are then turned from cumulative into marginal probabilities.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (target, causes) in &cfg.observables {
            let mut params = BTreeMap::new();
            for (cause, spec) in causes {
                let (base, mean) = match (spec.base, spec.mean) {
                    (Some(base), Some(mean)) => (base, mean),
                    _ => {
                        log::info!("fitting {cause} against {target}");
                        let shift = if is_vacc_cause(cause) {
                            -i64::from(cfg.vacc_delay)
                        } else {
                            0
                        };
                        let refs: Vec<_> =
                            spec.references().iter().map(|r| r.shifted(shift)).collect();
                        let sampler = WaningSampler::new(spec.distribution, 1.0)?;
                        let (base, mean) = fit_distribution_mean(&refs, &sampler)
                            .with_context(|| format!("failed to fit {cause} against {target}"))?;
                        log::info!("fitted base {base:.4} and mean {mean:.2}");
                        (base, mean)
                    }
                };
                let kind = spec.distribution;
                params.insert(cause.clone(), WaningParams { kind, base, mean });
            }
            entries.insert(target.clone(), params);
        }

        for (target, params) in entries.iter_mut() {
            adjust_dose_bases(params, &cfg.vacc_intervals)
                .with_context(|| format!("failed to adjust dose bases against {target}"))?;
        }

        Ok(Self { entries })
    }

    /// Names of all targets, in table order.
    pub fn targets(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Parameters of `cause` against `target`, falling back to the default cause.
    pub fn lookup(&self, target: &str, cause: &str) -> Option<&WaningParams> {
        let params = self.entries.get(target)?;
        params.get(cause).or_else(|| params.get(DEFAULT_CAUSE))
    }

    /// Iterate over `(target, cause, params)` of every explicit entry.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &WaningParams)> {
        self.entries.iter().flat_map(|(target, params)| {
            params
                .iter()
                .map(move |(cause, p)| (target.as_str(), cause.as_str(), p))
        })
    }

    /// Resolve `[cause][target]` parameters for the given causes.
    fn table(&self, causes: &[String]) -> Result<Vec<Vec<WaningParams>>> {
        causes
            .iter()
            .map(|cause| {
                self.entries
                    .keys()
                    .map(|target| {
                        self.lookup(target, cause).copied().with_context(|| {
                            format!("no waning of {cause} (or {DEFAULT_CAUSE}) against {target}")
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }
}

fn is_vacc_cause(cause: &str) -> bool {
    cause.starts_with("VACC")
}

fn adjust_dose_bases(params: &mut BTreeMap<String, WaningParams>, intervals: &[u32]) -> Result<()> {
    let doses: Vec<_> = (1..=N_DOSES)
        .map(vacc_cause)
        .take_while(|cause| params.contains_key(cause))
        .collect();
    if doses.len() < 2 {
        return Ok(());
    }

    let samplers = doses
        .iter()
        .map(|cause| params[cause].sampler())
        .collect::<Result<Vec<_>>>()?;
    let cumul: Vec<_> = doses.iter().map(|cause| params[cause].base).collect();
    let marginal = adjust_vacc_values(&samplers, &cumul, intervals)?;

    for (cause, base) in doses.iter().zip(marginal) {
        if let Some(p) = params.get_mut(cause) {
            p.base = base;
        }
    }
    Ok(())
}

/// Probability that an immunizing event succeeds, per cause and target.
#[derive(Debug, Clone)]
pub struct BaseImmunityModel {
    bases: Vec<Vec<f64>>,
}

impl BaseImmunityModel {
    pub fn new(obs: &Observables, causes: &[String]) -> Result<Self> {
        let bases = obs
            .table(causes)?
            .into_iter()
            .map(|row| row.iter().map(|p| p.base).collect())
            .collect::<Vec<_>>();
        Ok(Self { bases })
    }

    /// Sample whether `cause` immunizes against `target`.
    pub fn sample<R: Rng + ?Sized>(&self, cause: usize, target: usize, rng: &mut R) -> bool {
        rng.random::<f64>() < self.bases[cause][target]
    }

    /// Sample whether `cause` immunizes against every target.
    ///
    /// A single uniform draw is compared against all targets, so a success
    /// against a target implies success against every target with a larger base.
    pub fn sample_all<R: Rng + ?Sized>(&self, cause: usize, rng: &mut R, out: &mut [bool]) {
        let u = rng.random::<f64>();
        for (val, &base) in out.iter_mut().zip(&self.bases[cause]) {
            *val = u < base;
        }
    }
}

/// Waning durations per cause and target.
#[derive(Debug, Clone)]
pub struct LossModel {
    samplers: Vec<Vec<WaningSampler>>,
}

impl LossModel {
    pub fn new(obs: &Observables, causes: &[String]) -> Result<Self> {
        let samplers = obs
            .table(causes)?
            .into_iter()
            .map(|row| row.iter().map(WaningParams::sampler).collect::<Result<Vec<_>>>())
            .collect::<Result<_>>()?;
        Ok(Self { samplers })
    }

    /// Sample the days until immunity granted by `cause` is lost, per target.
    ///
    /// One duration is drawn for the first target and rescaled to every
    /// other target by the ratio of the means.
    pub fn sample_all<R: Rng + ?Sized>(&self, cause: usize, rng: &mut R, out: &mut [u32]) {
        let row = &self.samplers[cause];
        let Some(first) = row.first() else {
            return;
        };
        let days = first.sample(rng);
        for (val, sampler) in out.iter_mut().zip(row) {
            *val = if sampler.mean() == first.mean() {
                days
            } else {
                (days as f64 * (sampler.mean() / first.mean())) as u32
            };
        }
    }
}
