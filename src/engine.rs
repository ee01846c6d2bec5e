use crate::config::{Config, N_DOSES, vacc_cause};
use crate::data::EventSource;
use crate::immunity::{BaseImmunityModel, LossModel, Observables};
use crate::model::{Agent, Bucket, Population};
use crate::variant::VariantAssigner;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;

/// Events available for assignment on one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quotas {
    pub detected: u64,
    pub undetected: u64,
    pub doses: [u64; N_DOSES],
}

impl Quotas {
    /// Quotas for `date`, scaled to the simulated population.
    pub fn for_date<S: EventSource>(source: &S, date: NaiveDate, scale: f64) -> Self {
        let scaled = |val: f64| (val * scale).round().max(0.0) as u64;
        Self {
            detected: scaled(source.cases(date, true)),
            undetected: scaled(source.cases(date, false)),
            doses: std::array::from_fn(|i_dose| scaled(source.doses(date, i_dose + 1))),
        }
    }

    fn total(&self) -> u64 {
        self.detected + self.undetected + self.doses.iter().sum::<u64>()
    }
}

/// Daily counts of agents, not yet normalized by the scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregates {
    n_targets: usize,
    n_variants: usize,
    /// Agents per bucket, per day.
    pub buckets: Vec<[u64; Bucket::COUNT]>,
    /// Agents in no bucket, per day.
    pub susceptible: Vec<u64>,
    /// Immune agents, indexed `[day][bucket][target]`.
    immune: Vec<u64>,
    /// Detected infections, indexed `[day][previous variant or none][variant]`.
    reinfections: Vec<u64>,
    /// Quotas offered per day.
    pub quotas: Vec<Quotas>,
    /// Events assigned per day.
    pub assigned: Vec<Quotas>,
}

impl Aggregates {
    pub fn new(n_days: usize, n_targets: usize, n_variants: usize) -> Self {
        Self {
            n_targets,
            n_variants,
            buckets: vec![[0; Bucket::COUNT]; n_days],
            susceptible: vec![0; n_days],
            immune: vec![0; n_days * Bucket::COUNT * n_targets],
            reinfections: vec![0; n_days * (n_variants + 1) * n_variants],
            quotas: vec![Quotas::default(); n_days],
            assigned: vec![Quotas::default(); n_days],
        }
    }

    pub fn n_days(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, day: usize, bucket: Bucket) -> u64 {
        self.buckets[day][bucket.index()]
    }

    pub fn immune(&self, day: usize, bucket: Bucket, target: usize) -> u64 {
        self.immune[self.immune_idx(day, bucket, target)]
    }

    /// Detected infections on `day` with `variant` of agents last detected with `prev`.
    pub fn reinfections(&self, day: usize, prev: Option<usize>, variant: usize) -> u64 {
        self.reinfections[self.reinfection_idx(day, prev, variant)]
    }

    fn immune_idx(&self, day: usize, bucket: Bucket, target: usize) -> usize {
        (day * Bucket::COUNT + bucket.index()) * self.n_targets + target
    }

    fn reinfection_idx(&self, day: usize, prev: Option<usize>, variant: usize) -> usize {
        let i_prev = prev.map_or(0, |v| v + 1);
        (day * (self.n_variants + 1) + i_prev) * self.n_variants + variant
    }

    fn add_reinfection(&mut self, day: usize, prev: Option<usize>, variant: usize) {
        let idx = self.reinfection_idx(day, prev, variant);
        self.reinfections[idx] += 1;
    }

    fn record(&mut self, day: usize, agt: &Agent) {
        let Some(bucket) = agt.bucket() else {
            self.susceptible[day] += 1;
            return;
        };
        self.buckets[day][bucket.index()] += 1;
        for (target, state) in agt.targets.iter().enumerate() {
            if state.immune {
                let idx = self.immune_idx(day, bucket, target);
                self.immune[idx] += 1;
            }
        }
    }
}

/// Simulation engine.
///
/// Holds the resolved model parameters and the random number generator,
/// and runs the daily assignment of infections and vaccinations.
pub struct Engine {
    dates: Vec<NaiveDate>,
    scale: f64,

    vacc_delay: usize,
    vacc_intervals: Vec<usize>,
    det_delay: Vec<usize>,
    recovery_delay: Vec<usize>,
    recovery_delay_undet: Vec<usize>,

    targets: Vec<String>,
    variants: VariantAssigner,
    /// Target index of every variant.
    variant_targets: Vec<usize>,
    base: BaseImmunityModel,
    loss: LossModel,

    rng: ChaCha12Rng,
}

impl Engine {
    /// Create an engine, seeding the random number generator from the configuration.
    ///
    /// Every variant must also be a target, so that immunity against the
    /// infecting variant can be checked.
    pub fn new(cfg: &Config, obs: &Observables, variants: VariantAssigner) -> Result<Self> {
        let targets = obs.targets();
        let variant_targets = variants
            .variants()
            .iter()
            .map(|variant| {
                targets
                    .iter()
                    .position(|target| target == variant)
                    .with_context(|| format!("variant {variant} is not an observable"))
            })
            .collect::<Result<Vec<_>>>()?;

        let causes: Vec<_> = variants
            .variants()
            .iter()
            .cloned()
            .chain((1..=N_DOSES).map(vacc_cause))
            .collect();
        let base = BaseImmunityModel::new(obs, &causes).context("failed to build base model")?;
        let loss = LossModel::new(obs, &causes).context("failed to build loss model")?;

        let to_days = |delays: &[u32]| -> Result<Vec<usize>> {
            if delays.is_empty() {
                bail!("delay set must not be empty");
            }
            Ok(delays.iter().map(|&d| d as usize).collect())
        };

        Ok(Self {
            dates: cfg.dates(),
            scale: cfg.scale,
            vacc_delay: cfg.vacc_delay as usize,
            vacc_intervals: cfg.vacc_intervals.iter().map(|&d| d as usize).collect(),
            det_delay: to_days(&cfg.det_delay)?,
            recovery_delay: to_days(&cfg.recovery_delay)?,
            recovery_delay_undet: to_days(&cfg.recovery_delay_undet)?,
            targets,
            variants,
            variant_targets,
            base,
            loss,
            rng: ChaCha12Rng::seed_from_u64(cfg.seed),
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn variants(&self) -> &VariantAssigner {
        &self.variants
    }

    /// Run the simulation for a population of `population` inhabitants.
    pub fn run<S: EventSource>(&mut self, source: &S, population: f64) -> Result<Aggregates> {
        let n_agents = (population * self.scale) as usize;
        let n_days = self.dates.len();
        let n_targets = self.targets.len();
        log::info!("simulating {n_agents} agents over {n_days} days");

        let mut pop = Population::new(n_agents, n_targets);
        let mut agg = Aggregates::new(n_days, n_targets, self.variants.variants().len());
        let mut scratch = Scratch::new(n_targets);

        let progress_step = (n_days / 10).max(1);
        for day in 0..n_days {
            let date = self.dates[day];
            let quotas = Quotas::for_date(source, date, self.scale);
            let mut left = quotas;
            self.step(day, &mut left, &mut pop, &mut agg, &mut scratch)
                .with_context(|| format!("failed to simulate {date}"))?;

            agg.quotas[day] = quotas;
            agg.assigned[day] = Quotas {
                detected: quotas.detected - left.detected,
                undetected: quotas.undetected - left.undetected,
                doses: std::array::from_fn(|i| quotas.doses[i] - left.doses[i]),
            };
            if left.total() > 0 {
                log::debug!("discarding unassigned events on {date}: {left:?}");
            }

            if (day + 1) % progress_step == 0 || day + 1 == n_days {
                let progress = 100.0 * (day + 1) as f64 / n_days as f64;
                log::info!("completed {progress:06.2}%");
            }
        }

        Ok(agg)
    }

    fn step(
        &mut self,
        day: usize,
        left: &mut Quotas,
        pop: &mut Population,
        agg: &mut Aggregates,
        scratch: &mut Scratch,
    ) -> Result<()> {
        let Self {
            dates,
            vacc_delay,
            vacc_intervals,
            det_delay,
            recovery_delay,
            recovery_delay_undet,
            variants,
            variant_targets,
            base,
            loss,
            rng,
            ..
        } = self;
        let variant_dist = variants.distribution(dates[day])?;
        let n_variants = variant_targets.len();

        let mut immunize = |agt: &mut Agent, cause: usize, imm_day: usize, rng: &mut ChaCha12Rng| {
            base.sample_all(cause, rng, &mut scratch.base);
            loss.sample_all(cause, rng, &mut scratch.loss);
            for (target, (&success, &days)) in scratch.base.iter().zip(&scratch.loss).enumerate() {
                if success {
                    agt.schedule_immunity(target, imm_day, imm_day + days as usize);
                }
            }
        };

        pop.visit_shuffled(rng, |agt, rng| {
            if left.detected > 0 && !agt.active {
                let variant = variant_dist.sample(rng);
                if !agt.is_immune(variant_targets[variant]) {
                    agt.conf_day = Some(day + pick(det_delay, rng));
                    let rec_day = day + pick(recovery_delay, rng);
                    agt.rec_day = Some(rec_day);
                    immunize(agt, variant, rec_day, rng);
                    agt.confirmed = false;
                    agt.active = true;
                    agg.add_reinfection(day, agt.variant, variant);
                    agt.variant = Some(variant);
                    left.detected -= 1;
                }
            } else if left.undetected > 0 && !agt.active {
                let variant = variant_dist.sample(rng);
                if !agt.is_immune(variant_targets[variant]) {
                    let rec_day = day + pick(recovery_delay_undet, rng);
                    agt.rec_day = Some(rec_day);
                    immunize(agt, variant, rec_day, rng);
                    agt.confirmed = false;
                    agt.active = true;
                    left.undetected -= 1;
                }
            } else if !agt.active && agt.doses < N_DOSES && left.doses[agt.doses] > 0 {
                let i_dose = agt.doses;
                let due = match (i_dose, agt.vacc_day) {
                    (0, _) => true,
                    (_, Some(vacc_day)) => day - vacc_day > vacc_intervals[i_dose - 1],
                    (_, None) => false,
                };
                if due {
                    agt.vacc_day = Some(day);
                    immunize(agt, n_variants + i_dose, day + *vacc_delay, rng);
                    agt.doses += 1;
                    left.doses[i_dose] -= 1;
                }
            }

            agt.realize(day);
            agg.record(day, agt);
        });

        Ok(())
    }
}

/// Per-target buffers reused for every immunizing event.
struct Scratch {
    base: Vec<bool>,
    loss: Vec<u32>,
}

impl Scratch {
    fn new(n_targets: usize) -> Self {
        Self {
            base: vec![false; n_targets],
            loss: vec![0; n_targets],
        }
    }
}

/// Pick one of the (non-empty) delays uniformly.
fn pick<R: Rng + ?Sized>(delays: &[usize], rng: &mut R) -> usize {
    delays[rng.random_range(0..delays.len())]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Constant daily event counts.
    pub(crate) struct ConstSource {
        pub(crate) detected: f64,
        pub(crate) undetected: f64,
        pub(crate) doses: [f64; N_DOSES],
    }

    impl EventSource for ConstSource {
        fn cases(&self, _date: NaiveDate, detected: bool) -> f64 {
            if detected { self.detected } else { self.undetected }
        }

        fn doses(&self, _date: NaiveDate, dose: usize) -> f64 {
            self.doses[dose - 1]
        }
    }

    const HEADER: &str = r#"
seed = 1
t0 = "2022-01-01"
tend = "2022-01-30"
scale = 1.0
vacc_delay = 14
vacc_intervals = [21, 90, 120]
det_delay = [0]
recovery_delay = [10]
recovery_delay_undet = [10]

[detection_probability]
"2022-01-01" = 0.5

[files]
epidata = "cases.csv"
vaccdata = "vaccinations.csv"
variantdata = "variants.csv"
populationdata = "population.csv"
"#;

    fn engine(observables: &str, tweak: impl Fn(&mut Config)) -> Engine {
        let mut cfg = Config::from_toml_str(&(HEADER.to_string() + observables)).unwrap();
        tweak(&mut cfg);
        let obs = Observables::from_config(&cfg).unwrap();
        let date = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
        let variants = VariantAssigner::new(
            vec!["DELTA".to_string()],
            BTreeMap::from([(date, vec![1.0])]),
        )
        .unwrap();
        Engine::new(&cfg, &obs, variants).unwrap()
    }

    const PERMANENT: &str = r#"
[observables.DELTA.DEFAULT]
distribution = "exponential"
base = 1.0
mean = 1e9
"#;

    const MIXED: &str = r#"
[observables.DELTA.DEFAULT]
distribution = "exponential"
base = 0.8
mean = 20.0

[observables.DELTA.VACC1]
distribution = "gamma"
base = 0.6
mean = 30.0

[observables.HOSPITALISATION.DEFAULT]
distribution = "weibull"
base = 0.9
mean = 60.0
"#;

    fn mixed_source() -> ConstSource {
        ConstSource {
            detected: 40.0,
            undetected: 60.0,
            doses: [80.0, 50.0, 20.0, 5.0],
        }
    }

    #[test]
    fn constant_detected_cases_reach_steady_state() {
        let mut eng = engine(PERMANENT, |_| {});
        let source = ConstSource {
            detected: 50.0,
            undetected: 0.0,
            doses: [0.0; N_DOSES],
        };
        let agg = eng.run(&source, 10_000.0).unwrap();

        for day in 10..30 {
            assert_eq!(agg.bucket(day, Bucket::ActiveDetected), 500);
            assert_eq!(agg.bucket(day, Bucket::RecoveredDetected), 50 * (day as u64 - 9));
            assert_eq!(
                agg.immune(day, Bucket::RecoveredDetected, 0),
                agg.bucket(day, Bucket::RecoveredDetected)
            );
        }
        for day in 0..10 {
            assert_eq!(agg.bucket(day, Bucket::ActiveDetected), 50 * (day as u64 + 1));
        }
        assert_eq!(agg.reinfections(0, None, 0), 50);
        assert_eq!(agg.reinfections(29, Some(0), 0), 0);
    }

    #[test]
    fn vaccination_immunizes_only_where_base_allows() {
        let observables = r#"
[observables.A.DEFAULT]
distribution = "exponential"
base = 0.0
mean = 100.0

[observables.A.VACC1]
distribution = "exponential"
base = 1.0
mean = 1e9

[observables.B.DEFAULT]
distribution = "exponential"
base = 1.0
mean = 100.0

[observables.B.VACC1]
distribution = "exponential"
base = 0.0
mean = 100.0

[observables.DELTA.DEFAULT]
distribution = "exponential"
base = 1.0
mean = 100.0
"#;
        let mut eng = engine(observables, |_| {});
        let source = ConstSource {
            detected: 0.0,
            undetected: 0.0,
            doses: [10.0, 0.0, 0.0, 0.0],
        };
        let agg = eng.run(&source, 1000.0).unwrap();
        let (a, b) = (0, 1);
        assert_eq!(eng.targets()[a], "A");

        for day in 0..30 {
            let n_vacc = agg.bucket(day, Bucket::Vaccinated);
            assert_eq!(n_vacc, 10 * (day as u64 + 1));
            // Immunity starts 14 days after the dose.
            let n_imm = 10 * (day as u64).saturating_sub(13);
            assert_eq!(agg.immune(day, Bucket::Vaccinated, a), n_imm);
            assert_eq!(agg.immune(day, Bucket::Vaccinated, b), 0);
        }
    }

    #[test]
    fn runs_are_deterministic() {
        let source = mixed_source();
        let agg_a = engine(MIXED, |_| {}).run(&source, 5000.0).unwrap();
        let agg_b = engine(MIXED, |_| {}).run(&source, 5000.0).unwrap();
        assert_eq!(agg_a, agg_b);

        let agg_c = engine(MIXED, |cfg| cfg.seed = 2).run(&source, 5000.0).unwrap();
        assert_ne!(agg_a, agg_c);
    }

    #[test]
    fn buckets_partition_the_population() {
        let agg = engine(MIXED, |_| {}).run(&mixed_source(), 5000.0).unwrap();
        for day in 0..agg.n_days() {
            let counted: u64 = agg.buckets[day].iter().sum();
            assert_eq!(counted + agg.susceptible[day], 5000);
            for bucket in Bucket::ALL {
                for target in 0..2 {
                    assert!(agg.immune(day, bucket, target) <= agg.bucket(day, bucket));
                }
            }
        }
    }

    #[test]
    fn assigned_events_never_exceed_quotas() {
        let agg = engine(MIXED, |_| {}).run(&mixed_source(), 5000.0).unwrap();
        let expected = Quotas {
            detected: 40,
            undetected: 60,
            doses: [80, 50, 20, 5],
        };
        for (quotas, assigned) in agg.quotas.iter().zip(&agg.assigned) {
            assert_eq!(*quotas, expected);
            assert!(assigned.detected <= quotas.detected);
            assert!(assigned.undetected <= quotas.undetected);
            for i_dose in 0..N_DOSES {
                assert!(assigned.doses[i_dose] <= quotas.doses[i_dose]);
            }
        }
        // Nobody is due for a second dose within the first 21 days.
        assert!(agg.assigned[..22].iter().all(|a| a.doses[1] == 0));
        assert_eq!(agg.assigned[0].doses[0], 80);
    }

    #[test]
    fn scale_reduces_agents_and_quotas() {
        let mut eng = engine(PERMANENT, |cfg| cfg.scale = 0.1);
        let source = ConstSource {
            detected: 50.0,
            undetected: 0.0,
            doses: [0.0; N_DOSES],
        };
        let agg = eng.run(&source, 10_000.0).unwrap();
        assert_eq!(agg.quotas[0].detected, 5);
        assert_eq!(agg.buckets[0].iter().sum::<u64>() + agg.susceptible[0], 1000);
        assert_eq!(agg.bucket(29, Bucket::ActiveDetected), 50);
    }

    #[test]
    fn variants_must_be_observables() {
        let cfg = Config::from_toml_str(&(HEADER.to_string() + PERMANENT)).unwrap();
        let obs = Observables::from_config(&cfg).unwrap();
        let date = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
        let variants = VariantAssigner::new(
            vec!["OMICRON".to_string()],
            BTreeMap::from([(date, vec![1.0])]),
        )
        .unwrap();
        assert!(Engine::new(&cfg, &obs, variants).is_err());
    }

    #[test]
    fn detected_cases_take_priority() {
        let mut eng = engine(PERMANENT, |_| {});
        let source = ConstSource {
            detected: 100.0,
            undetected: 100.0,
            doses: [100.0; N_DOSES],
        };
        let agg = eng.run(&source, 100.0).unwrap();
        let expected = Quotas {
            detected: 100,
            undetected: 0,
            doses: [0; N_DOSES],
        };
        assert_eq!(agg.assigned[0], expected);
        assert_eq!(agg.bucket(0, Bucket::ActiveDetected), 100);
    }

    #[test]
    fn immune_agents_skip_their_turn() {
        for (detected, undetected, bucket) in [
            (1.0, 0.0, Bucket::RecoveredDetected),
            (0.0, 1.0, Bucket::RecoveredUndetected),
        ] {
            let mut eng = engine(PERMANENT, |_| {});
            let source = ConstSource {
                detected,
                undetected,
                doses: [1.0, 0.0, 0.0, 0.0],
            };
            let agg = eng.run(&source, 1.0).unwrap();

            let total = |a: &Quotas| a.detected + a.undetected;
            assert_eq!(total(&agg.assigned[0]), 1);
            // Active until day 10, immune from then on.
            assert!(agg.assigned[1..].iter().all(|a| total(a) == 0));
            assert!(agg.assigned.iter().all(|a| a.doses == [0; N_DOSES]));
            assert_eq!(agg.bucket(29, bucket), 1);
            assert_eq!(agg.immune(29, bucket, 0), 1);
        }
    }

    #[test]
    fn waned_agents_are_reinfected() {
        let observables = r#"
[observables.DELTA.DEFAULT]
distribution = "exponential"
base = 1.0
mean = 1.0
"#;
        let mut eng = engine(observables, |_| {});
        let source = ConstSource {
            detected: 20.0,
            undetected: 0.0,
            doses: [0.0; N_DOSES],
        };
        let agg = eng.run(&source, 300.0).unwrap();

        let first: u64 = (0..agg.n_days()).map(|day| agg.reinfections(day, None, 0)).sum();
        let repeat: u64 = (0..agg.n_days())
            .map(|day| agg.reinfections(day, Some(0), 0))
            .sum();
        assert!(first <= 300);
        assert!(repeat > 0);
        assert_eq!(agg.reinfections(0, Some(0), 0), 0);
        let assigned: u64 = agg.assigned.iter().map(|a| a.detected).sum();
        assert_eq!(first + repeat, assigned);
    }
}
