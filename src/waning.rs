//! Immunity-loss duration sampling.

use anyhow::{Result, bail};
use rand::{Rng, distr::Open01};
use rand_distr::{Distribution, Exp1, Gamma, StandardNormal, Triangular, Weibull};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of the gamma distribution.
const GAMMA_SHAPE: f64 = 4.0;
/// Scale of the logistic distribution.
const LOGISTIC_SCALE: f64 = 15.0;

/// Parametric family of an immunity-loss duration.
///
/// Every family is parametrized by a single number, called `mean` throughout
/// the configuration. For `weibull`, `weibull2` and `lognormal` it is a scale
/// parameter and not the expectation, see [`WaningKind::expectation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaningKind {
    /// Exponential with scale `mean`.
    Exponential,
    /// Gamma with shape 4 and scale `mean / 4`.
    Gamma,
    /// Triangular on `[0, 2 * mean]` with mode `mean`.
    Triangular,
    /// Weibull with shape 1.5 and scale `mean`.
    Weibull,
    /// Weibull with shape 2 and scale `mean`.
    Weibull2,
    /// Uniform on `[0, 2 * mean]`.
    Uniform,
    /// Standard lognormal multiplied by `mean`.
    Lognormal,
    /// Logistic with location `mean` and scale 15.
    Logistic,
}

impl WaningKind {
    /// Theoretical expectation of the untruncated duration.
    pub fn expectation(self, mean: f64) -> f64 {
        match self {
            Self::Exponential | Self::Gamma | Self::Triangular | Self::Uniform | Self::Logistic => {
                mean
            }
            // Gamma(1 + 1/1.5) and Gamma(1 + 1/2).
            Self::Weibull => mean * 0.902_745_292_950_933_6,
            Self::Weibull2 => mean * 0.886_226_925_452_758,
            Self::Lognormal => mean * 0.5_f64.exp(),
        }
    }
}

impl fmt::Display for WaningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Exponential => "exponential",
            Self::Gamma => "gamma",
            Self::Triangular => "triangular",
            Self::Weibull => "weibull",
            Self::Weibull2 => "weibull2",
            Self::Uniform => "uniform",
            Self::Lognormal => "lognormal",
            Self::Logistic => "logistic",
        };
        f.write_str(name)
    }
}

/// Unit-parameter member of a family, rescaled by the mean on every draw.
#[derive(Debug, Clone)]
enum Unit {
    Exponential,
    Gamma(Gamma<f64>),
    Triangular(Triangular<f64>),
    Weibull(Weibull<f64>),
    Uniform,
    Lognormal,
    Logistic,
}

/// Draws whole days until immunity is lost.
#[derive(Debug, Clone)]
pub struct WaningSampler {
    kind: WaningKind,
    mean: f64,
    unit: Unit,
}

impl WaningSampler {
    pub fn new(kind: WaningKind, mean: f64) -> Result<Self> {
        if !mean.is_finite() || mean < 0.0 {
            bail!("{kind} parameter must be finite and non-negative, but is {mean}");
        }

        let unit = match kind {
            WaningKind::Exponential => Unit::Exponential,
            WaningKind::Gamma => Unit::Gamma(Gamma::new(GAMMA_SHAPE, 1.0 / GAMMA_SHAPE)?),
            WaningKind::Triangular => Unit::Triangular(Triangular::new(0.0, 2.0, 1.0)?),
            WaningKind::Weibull => Unit::Weibull(Weibull::new(1.0, 1.5)?),
            WaningKind::Weibull2 => Unit::Weibull(Weibull::new(1.0, 2.0)?),
            WaningKind::Uniform => Unit::Uniform,
            WaningKind::Lognormal => Unit::Lognormal,
            WaningKind::Logistic => Unit::Logistic,
        };

        Ok(Self { kind, mean, unit })
    }

    pub fn kind(&self) -> WaningKind {
        self.kind
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample a duration using the stored mean.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        self.sample_with_mean(self.mean, rng)
    }

    /// Sample a duration ignoring the stored mean.
    pub fn sample_with_mean<R: Rng + ?Sized>(&self, mean: f64, rng: &mut R) -> u32 {
        let val = match &self.unit {
            Unit::Exponential => mean * rng.sample::<f64, _>(Exp1),
            Unit::Gamma(dist) => mean * dist.sample(rng),
            Unit::Triangular(dist) => mean * dist.sample(rng),
            Unit::Weibull(dist) => mean * dist.sample(rng),
            Unit::Uniform => 2.0 * mean * rng.random::<f64>(),
            Unit::Lognormal => mean * rng.sample::<f64, _>(StandardNormal).exp(),
            Unit::Logistic => {
                let u: f64 = rng.sample(Open01);
                mean + LOGISTIC_SCALE * (u / (1.0 - u)).ln()
            }
        };
        // Truncate toward zero; casts saturate and map NaN to 0.
        val.max(0.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    const N_SAMPLES: usize = 100_000;

    fn empirical_mean(kind: WaningKind, mean: f64) -> f64 {
        let sampler = WaningSampler::new(kind, mean).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let sum: u64 = (0..N_SAMPLES).map(|_| sampler.sample(&mut rng) as u64).sum();
        sum as f64 / N_SAMPLES as f64
    }

    #[test]
    fn sample_means_follow_distribution_laws() {
        let kinds = [
            WaningKind::Exponential,
            WaningKind::Gamma,
            WaningKind::Triangular,
            WaningKind::Weibull,
            WaningKind::Weibull2,
            WaningKind::Uniform,
            WaningKind::Lognormal,
            WaningKind::Logistic,
        ];
        for kind in kinds {
            let expected = kind.expectation(200.0);
            let observed = empirical_mean(kind, 200.0);
            let rel_err = (observed - expected).abs() / expected;
            assert!(
                rel_err < 0.05,
                "{kind}: expected {expected}, observed {observed}"
            );
        }
    }

    #[test]
    fn lognormal_parameter_is_not_the_mean() {
        let observed = empirical_mean(WaningKind::Lognormal, 100.0);
        assert!(observed > 150.0 && observed < 180.0);
    }

    #[test]
    fn bounded_families_stay_in_support() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        for kind in [WaningKind::Uniform, WaningKind::Triangular] {
            let sampler = WaningSampler::new(kind, 50.0).unwrap();
            assert!((0..10_000).all(|_| sampler.sample(&mut rng) <= 100));
        }
    }

    #[test]
    fn sample_with_mean_overrides_stored_mean() {
        let sampler = WaningSampler::new(WaningKind::Uniform, 1.0).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let max = (0..10_000)
            .map(|_| sampler.sample_with_mean(500.0, &mut rng))
            .max()
            .unwrap();
        assert!(max > 900);
    }

    #[test]
    fn rejects_invalid_parameter() {
        assert!(WaningSampler::new(WaningKind::Exponential, -1.0).is_err());
        assert!(WaningSampler::new(WaningKind::Gamma, f64::NAN).is_err());
    }

    #[test]
    fn unknown_names_fail_to_deserialize() {
        #[derive(Deserialize)]
        struct Spec {
            #[allow(dead_code)]
            distribution: WaningKind,
        }
        assert!(toml::from_str::<Spec>("distribution = \"weibull2\"").is_ok());
        assert!(toml::from_str::<Spec>("distribution = \"cauchy\"").is_err());
    }
}
