//! Input data: cases, vaccinations, population and detection probabilities.
//!
//! All files are semicolon-separated with a header line.

use crate::config::{Config, N_DOSES};
use crate::series::TimeSeries;
use anyhow::{Context, Result, bail};
use chrono::{Days, NaiveDate};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, path::Path};

/// Days averaged to extrapolate the case series past its last date.
const EXTRAPOLATION_DAYS: usize = 7;

/// Daily event counts driving the simulation.
pub trait EventSource {
    /// New detected or undetected cases on `date`.
    fn cases(&self, date: NaiveDate, detected: bool) -> f64;

    /// Doses number `dose` (1-based) administered on `date`.
    fn doses(&self, date: NaiveDate, dose: usize) -> f64;

    /// Detected cases as reported on `date`, without smoothing.
    fn reported_cases(&self, date: NaiveDate) -> f64 {
        self.cases(date, true)
    }
}

/// Parse a date given as `YYYY-MM-DD` or `DD.MM.YYYY`, ignoring any time part.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%d.%m.%Y"))
        .with_context(|| format!("failed to parse date {s:?}"))
}

fn read_rows<T: DeserializeOwned, P: AsRef<Path>>(file: P) -> Result<Vec<T>> {
    let file = file.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .trim(csv::Trim::All)
        .from_path(file)
        .with_context(|| format!("failed to open {file:?}"))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i_row, row)| row.with_context(|| format!("failed to read row {i_row} of {file:?}")))
        .collect()
}

/// Probability that a case is detected.
///
/// Linearly interpolated between the given dates and constant outside them.
#[derive(Debug, Clone)]
pub struct DetectionModel {
    points: BTreeMap<NaiveDate, f64>,
}

impl DetectionModel {
    pub fn new(points: BTreeMap<NaiveDate, f64>) -> Result<Self> {
        if points.is_empty() {
            bail!("at least one detection probability is required");
        }
        Ok(Self { points })
    }

    pub fn probability(&self, date: NaiveDate) -> f64 {
        let before = self.points.range(..=date).next_back();
        let after = self.points.range(date..).next();
        match (before, after) {
            (Some((&t1, &p1)), Some((&t2, &p2))) if t1 != t2 => {
                let fac = (t2 - date).num_days() as f64 / (t2 - t1).num_days() as f64;
                fac * p1 + (1.0 - fac) * p2
            }
            (Some((_, &p)), _) | (None, Some((_, &p))) => p,
            (None, None) => 1.0,
        }
    }

    /// Estimated undetected cases accompanying `detected` cases on `date`.
    pub fn undetected(&self, date: NaiveDate, detected: f64) -> f64 {
        let prob = self.probability(date);
        detected / prob * (1.0 - prob)
    }
}

/// Country-wide series plus one series per region.
#[derive(Debug, Clone)]
struct Regional {
    total: TimeSeries<NaiveDate>,
    regions: BTreeMap<String, TimeSeries<NaiveDate>>,
}

impl Regional {
    fn new() -> Self {
        Self {
            total: TimeSeries::new(0.0),
            regions: BTreeMap::new(),
        }
    }

    fn add(&mut self, date: NaiveDate, region: &str, value: f64) {
        self.total.add_value(date, value);
        self.regions
            .entry(region.to_string())
            .or_insert_with(|| TimeSeries::new(0.0))
            .add_value(date, value);
    }

    fn series(&self, region: Option<&str>) -> Option<&TimeSeries<NaiveDate>> {
        match region {
            None => Some(&self.total),
            Some(region) => self.regions.get(region),
        }
    }

    fn value(&self, date: NaiveDate, region: Option<&str>) -> f64 {
        self.series(region).map_or(0.0, |series| series.value(date))
    }

    fn all_mut(&mut self) -> impl Iterator<Item = &mut TimeSeries<NaiveDate>> {
        std::iter::once(&mut self.total).chain(self.regions.values_mut())
    }
}

/// Detected cases and estimated undetected cases per confirmation date.
#[derive(Debug, Clone)]
pub struct CaseParameters {
    detected: Regional,
    undetected: Regional,
    det_delay: Vec<u32>,
}

impl CaseParameters {
    /// Load `date;region;count` rows of detected cases.
    ///
    /// Every series is extended past its last date by the average of the
    /// seven calendar days ending there, so that infections do not stop
    /// abruptly at the data end.
    pub fn from_file<P: AsRef<Path>>(
        file: P,
        detection: &DetectionModel,
        det_delay: &[u32],
    ) -> Result<Self> {
        let rows: Vec<(String, String, f64)> = read_rows(file)?;
        let mut detected = Regional::new();
        for (date, region, count) in rows {
            detected.add(parse_date(&date)?, &region, count);
        }

        for series in detected.all_mut() {
            let Some(last) = series.last_time() else {
                continue;
            };
            // Days without reports in the last week count as zero cases.
            for k in 1..EXTRAPOLATION_DAYS as u64 {
                if let Some(date) = last.checked_sub_days(Days::new(k)) {
                    series.add_value(date, 0.0);
                }
            }
            let count = series.ma_value(last, EXTRAPOLATION_DAYS);
            for k in 1..=EXTRAPOLATION_DAYS as u64 {
                if let Some(date) = last.checked_add_days(Days::new(k)) {
                    series.append_value(date, count);
                }
            }
        }

        let mut undetected = Regional::new();
        for (region, series) in &detected.regions {
            for (date, count) in series.times().zip(series.values()) {
                undetected.add(date, region, detection.undetected(date, count));
            }
        }

        Ok(Self {
            detected,
            undetected,
            det_delay: det_delay.to_vec(),
        })
    }

    /// New cases for `date`, smoothed over the detection delays.
    ///
    /// Cases confirmed on `date + k` for every delay `k` are averaged, which
    /// also removes the weekly reporting pattern for a seven-day delay set.
    pub fn get(&self, date: NaiveDate, detected: bool, region: Option<&str>) -> f64 {
        let series = if detected {
            &self.detected
        } else {
            &self.undetected
        };
        let sum: f64 = self
            .det_delay
            .iter()
            .filter_map(|&k| date.checked_add_days(Days::new(u64::from(k))))
            .map(|date| series.value(date, region))
            .sum();
        sum / self.det_delay.len().max(1) as f64
    }

    /// Detected cases confirmed on `date`, without smoothing.
    pub fn raw(&self, date: NaiveDate, region: Option<&str>) -> f64 {
        self.detected.value(date, region)
    }
}

/// Administered doses per date and dose number.
#[derive(Debug, Clone)]
pub struct VaccinationParameters {
    doses: Vec<Regional>,
}

impl VaccinationParameters {
    /// Load `date;region;dose;count` rows. Doses beyond the fourth are ignored.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let rows: Vec<(String, String, usize, f64)> = read_rows(file)?;
        let mut doses: Vec<_> = (0..N_DOSES).map(|_| Regional::new()).collect();
        for (date, region, dose, count) in rows {
            let date = parse_date(&date)?;
            match dose {
                1..=N_DOSES => doses[dose - 1].add(date, &region, count),
                0 => bail!("dose numbers start at 1, found 0 on {date}"),
                _ => log::debug!("ignoring {count} doses number {dose} on {date}"),
            }
        }
        Ok(Self { doses })
    }

    pub fn get(&self, date: NaiveDate, dose: usize, region: Option<&str>) -> f64 {
        match dose {
            1..=N_DOSES => self.doses[dose - 1].value(date, region),
            _ => 0.0,
        }
    }
}

/// Inhabitants per region.
#[derive(Debug, Clone)]
pub struct PopulationParameters {
    population: BTreeMap<String, f64>,
}

impl PopulationParameters {
    /// Load `region;count` rows.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let rows: Vec<(String, f64)> = read_rows(file)?;
        if rows.is_empty() {
            bail!("population data is empty");
        }
        Ok(Self {
            population: rows.into_iter().collect(),
        })
    }

    /// Inhabitants of `region`, or of the whole country.
    pub fn get_population(&self, region: Option<&str>) -> Result<f64> {
        match region {
            None => Ok(self.population.values().sum()),
            Some(region) => self
                .population
                .get(region)
                .copied()
                .with_context(|| format!("unknown region {region}")),
        }
    }
}

/// Case and vaccination data of one simulation, restricted to its region.
#[derive(Debug, Clone)]
pub struct EpiData {
    cases: CaseParameters,
    vaccinations: VaccinationParameters,
    region: Option<String>,
}

impl EpiData {
    /// Load the case and vaccination files of `cfg`, relative to `dir`.
    pub fn load<P: AsRef<Path>>(cfg: &Config, dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let detection = DetectionModel::new(cfg.detection_probability.clone())?;
        let cases = CaseParameters::from_file(dir.join(&cfg.files.epidata), &detection, &cfg.det_delay)
            .context("failed to load case data")?;
        let vaccinations = VaccinationParameters::from_file(dir.join(&cfg.files.vaccdata))
            .context("failed to load vaccination data")?;
        Ok(Self {
            cases,
            vaccinations,
            region: cfg.federal_state.clone(),
        })
    }
}

impl EventSource for EpiData {
    fn cases(&self, date: NaiveDate, detected: bool) -> f64 {
        self.cases.get(date, detected, self.region.as_deref())
    }

    fn doses(&self, date: NaiveDate, dose: usize) -> f64 {
        self.vaccinations.get(date, dose, self.region.as_deref())
    }

    fn reported_cases(&self, date: NaiveDate) -> f64 {
        self.cases.raw(date, self.region.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::{env, fs, path::PathBuf};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 1, d).unwrap()
    }

    fn write_tmp(name: &str, contents: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("immunity-waning-data-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("failed to create test directory");
        let file = dir.join(name);
        fs::write(&file, contents).expect("failed to write test file");
        file
    }

    #[test]
    fn parses_both_date_formats() {
        assert_eq!(parse_date("2022-01-05").unwrap(), day(5));
        assert_eq!(parse_date("05.01.2022").unwrap(), day(5));
        assert_eq!(parse_date("2022-01-05T00:00:00").unwrap(), day(5));
        assert!(parse_date("January").is_err());
    }

    #[test]
    fn detection_probability_is_interpolated_and_clamped() {
        let model = DetectionModel::new(BTreeMap::from([(day(1), 0.2), (day(11), 0.6)])).unwrap();
        assert_relative_eq!(model.probability(day(1)), 0.2);
        assert_relative_eq!(model.probability(day(6)), 0.4);
        assert_relative_eq!(model.probability(day(11)), 0.6);
        assert_relative_eq!(model.probability(day(30)), 0.6);
        assert_relative_eq!(model.undetected(day(11), 6.0), 4.0);
    }

    #[test]
    fn cases_are_split_smoothed_and_extrapolated() {
        let file = write_tmp(
            "cases.csv",
            "date;region;count\n2022-01-01;A;10\n2022-01-01;B;30\n2022-01-02;A;20\n",
        );
        let detection = DetectionModel::new(BTreeMap::from([(day(1), 0.5)])).unwrap();
        let cases = CaseParameters::from_file(&file, &detection, &[0]).unwrap();

        assert_relative_eq!(cases.get(day(1), true, None), 40.0);
        assert_relative_eq!(cases.get(day(1), false, None), 40.0);
        assert_relative_eq!(cases.get(day(1), true, Some("B")), 30.0);
        assert_relative_eq!(cases.get(day(1), true, Some("C")), 0.0);
        // Extrapolated with the mean of the last seven calendar days.
        assert_relative_eq!(cases.get(day(5), true, Some("A")), 30.0 / 7.0);
        assert_relative_eq!(cases.get(day(9), true, None), 60.0 / 7.0);
        let undetected = cases.get(day(8), false, Some("B"));
        assert_relative_eq!(undetected, 30.0 / 7.0, max_relative = 1e-12);
        assert_relative_eq!(cases.get(day(9), true, Some("B")), 0.0);
        assert_relative_eq!(cases.get(day(20), true, Some("A")), 0.0);

        let smoothed = CaseParameters::from_file(&file, &detection, &[0, 1]).unwrap();
        assert_relative_eq!(smoothed.get(day(1), true, Some("A")), 15.0);
        assert_relative_eq!(smoothed.raw(day(1), Some("A")), 10.0);
    }

    #[test]
    fn vaccinations_and_population_are_read_per_region() {
        let file = write_tmp(
            "vaccinations.csv",
            "date;region;dose;count\n2022-01-01;A;1;5\n2022-01-01;B;1;7\n2022-01-01;A;2;3\n2022-01-01;A;5;9\n",
        );
        let vacc = VaccinationParameters::from_file(&file).unwrap();
        assert_relative_eq!(vacc.get(day(1), 1, None), 12.0);
        assert_relative_eq!(vacc.get(day(1), 2, Some("A")), 3.0);
        assert_relative_eq!(vacc.get(day(1), 5, None), 0.0);
        assert_relative_eq!(vacc.get(day(2), 1, None), 0.0);

        let file = write_tmp("population.csv", "region;count\nA;1000\nB;500\n");
        let pop = PopulationParameters::from_file(&file).unwrap();
        assert_relative_eq!(pop.get_population(None).unwrap(), 1500.0);
        assert_relative_eq!(pop.get_population(Some("B")).unwrap(), 500.0);
        assert!(pop.get_population(Some("C")).is_err());
    }
}
