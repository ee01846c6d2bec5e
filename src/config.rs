use crate::fit::Reference;
use crate::waning::WaningKind;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::Debug,
    fs,
    ops::RangeBounds,
    path::{Path, PathBuf},
};
use xxhash_rust::xxh3::xxh3_128;

/// Number of vaccine doses tracked by the model.
pub const N_DOSES: usize = 4;

/// Cause used for a target when no cause-specific entry exists.
pub const DEFAULT_CAUSE: &str = "DEFAULT";

/// Cause label of the `dose`-th vaccination (1-based).
pub fn vacc_cause(dose: usize) -> String {
    format!("VACC{dose}")
}

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seed of the random number generator.
    pub seed: u64,
    /// First simulated day.
    pub t0: NaiveDate,
    /// Last simulated day (inclusive).
    pub tend: NaiveDate,
    /// Fraction of the population simulated as agents.
    pub scale: f64,

    /// Name of the scenario, used for output files.
    #[serde(default)]
    pub scenario: Option<String>,
    /// Region to restrict the input data to.
    #[serde(default)]
    pub federal_state: Option<String>,

    /// Days between a vaccination and the immunity it grants.
    pub vacc_delay: u32,
    /// Minimum days between consecutive doses (1->2, 2->3, 3->4).
    pub vacc_intervals: Vec<u32>,
    /// Possible days between infection and confirmation.
    pub det_delay: Vec<u32>,
    /// Possible days between infection and recovery of detected cases.
    pub recovery_delay: Vec<u32>,
    /// Possible days between infection and recovery of undetected cases.
    pub recovery_delay_undet: Vec<u32>,

    /// Probability that a case is detected, interpolated between dates.
    pub detection_probability: BTreeMap<NaiveDate, f64>,

    /// Input data files.
    pub files: DataFiles,

    /// Waning specification per target and cause.
    pub observables: BTreeMap<String, BTreeMap<String, WaningSpec>>,
}

/// Paths of the input data, relative to the simulation directory.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataFiles {
    pub epidata: PathBuf,
    pub vaccdata: PathBuf,
    pub variantdata: PathBuf,
    pub populationdata: PathBuf,
}

/// Waning of the immunity against one target granted by one cause.
///
/// Either `base` and `mean` are given, or they are fitted to `values`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaningSpec {
    pub distribution: WaningKind,
    #[serde(default)]
    pub base: Option<f64>,
    #[serde(default)]
    pub mean: Option<f64>,
    /// Reference effectiveness as `[day_start, day_end, value]`.
    #[serde(default)]
    pub values: Vec<(i64, i64, f64)>,
    /// Publication the values were taken from.
    #[serde(default)]
    pub source: Option<String>,
}

impl WaningSpec {
    pub fn references(&self) -> Vec<Reference> {
        self.values
            .iter()
            .map(|&(start, end, value)| Reference::new(start, end, value))
            .collect()
    }
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents = fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tend < self.t0 {
            bail!("end date {} precedes start date {}", self.tend, self.t0);
        }
        check_num(self.scale, f64::MIN_POSITIVE..=1.0).context("invalid scale")?;

        check_num(self.vacc_delay, 0..1000).context("invalid vaccination delay")?;
        check_len(&self.vacc_intervals, N_DOSES - 1).context("invalid vaccination intervals")?;
        check_delays(&self.det_delay).context("invalid detection delays")?;
        check_delays(&self.recovery_delay).context("invalid recovery delays")?;
        check_delays(&self.recovery_delay_undet)
            .context("invalid recovery delays of undetected cases")?;
        let max_det = self.det_delay.iter().max().copied().unwrap_or(0);
        let min_rec = self.recovery_delay.iter().min().copied().unwrap_or(0);
        if max_det > min_rec {
            bail!("detection delay {max_det} exceeds recovery delay {min_rec}");
        }

        if self.detection_probability.is_empty() {
            bail!("at least one detection probability is required");
        }
        for (date, &prob) in &self.detection_probability {
            check_num(prob, f64::MIN_POSITIVE..=1.0)
                .with_context(|| format!("invalid detection probability on {date}"))?;
        }

        if self.observables.is_empty() {
            bail!("at least one observable is required");
        }
        for (target, causes) in &self.observables {
            for (cause, spec) in causes {
                check_spec(spec)
                    .with_context(|| format!("invalid waning of {cause} against {target}"))?;
            }
        }

        Ok(())
    }

    /// Number of simulated days.
    pub fn n_days(&self) -> usize {
        (self.tend - self.t0).num_days() as usize + 1
    }

    /// Calendar date of every simulated day.
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.t0.iter_days().take(self.n_days()).collect()
    }

    pub fn scenario_name(&self) -> String {
        match &self.scenario {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("immunization_level_{}", self.tend.format("%Y%m%d")),
        }
    }

    /// Deterministic hash of the configuration, used as cache key.
    pub fn hash(&self) -> Result<String> {
        let bytes = rmp_serde::to_vec(self).context("failed to serialize config")?;
        Ok(format!("{:032x}", xxh3_128(&bytes)))
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_len<T>(vec: &[T], exp_len: usize) -> Result<()> {
    let len = vec.len();
    if len != exp_len {
        bail!("vector length must be {exp_len}, but is {len}");
    }
    Ok(())
}

fn check_delays(delays: &[u32]) -> Result<()> {
    if delays.is_empty() {
        bail!("at least one delay is required");
    }
    for &delay in delays {
        check_num(delay, 0..1000)?;
    }
    Ok(())
}

fn check_spec(spec: &WaningSpec) -> Result<()> {
    match (spec.base, spec.mean) {
        (Some(base), Some(mean)) => {
            check_num(base, 0.0..=1.0).context("invalid base")?;
            check_num(mean, f64::MIN_POSITIVE..1e12).context("invalid mean")?;
        }
        (None, None) => {
            if spec.values.is_empty() {
                bail!("either base and mean or reference values are required");
            }
        }
        _ => bail!("base and mean must be given together"),
    }
    for &(start, end, value) in &spec.values {
        if end <= start {
            bail!("reference interval [{start}, {end}) is empty");
        }
        check_num(value, 0.0..=1.0).context("invalid reference effectiveness")?;
    }
    Ok(())
}
