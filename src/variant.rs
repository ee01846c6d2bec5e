use crate::data::parse_date;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use rand::Rng;
use rand_distr::{Distribution, weighted::WeightedIndex};
use std::{collections::BTreeMap, path::Path};

/// Daily shares of the variants among new cases.
///
/// Dates before the first or after the last known day use the nearest known
/// day. A missing day inside the known window is an error.
#[derive(Debug, Clone)]
pub struct VariantAssigner {
    variants: Vec<String>,
    ratios: BTreeMap<NaiveDate, Vec<f64>>,
    dists: BTreeMap<NaiveDate, WeightedIndex<f64>>,
}

impl VariantAssigner {
    /// Create an assigner, normalizing every day to sum to one.
    pub fn new(variants: Vec<String>, ratios: BTreeMap<NaiveDate, Vec<f64>>) -> Result<Self> {
        if variants.is_empty() {
            bail!("at least one variant is required");
        }
        if ratios.is_empty() {
            bail!("at least one day of variant ratios is required");
        }

        let mut normalized = BTreeMap::new();
        let mut dists = BTreeMap::new();
        for (date, vals) in ratios {
            if vals.len() != variants.len() {
                bail!(
                    "{} ratios on {date} for {} variants",
                    vals.len(),
                    variants.len()
                );
            }
            if vals.iter().any(|&val| !val.is_finite() || val < 0.0) {
                bail!("ratios on {date} must be finite and non-negative");
            }
            let sum: f64 = vals.iter().sum();
            if sum <= 0.0 {
                bail!("ratios on {date} sum to {sum}");
            }
            let vals: Vec<_> = vals.iter().map(|val| val / sum).collect();
            let dist = WeightedIndex::new(&vals)
                .with_context(|| format!("invalid ratios on {date}"))?;
            dists.insert(date, dist);
            normalized.insert(date, vals);
        }

        Ok(Self {
            variants,
            ratios: normalized,
            dists,
        })
    }

    /// Load the ratios from a semicolon-separated file.
    ///
    /// The header holds the variant names after the date column, every row
    /// a date and one (not necessarily normalized) share per variant.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .from_path(file)
            .with_context(|| format!("failed to open {file:?}"))?;

        let header = reader.headers().context("failed to read header")?;
        let variants: Vec<_> = header.iter().skip(1).map(str::to_string).collect();

        let mut ratios = BTreeMap::new();
        for (i_row, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("failed to read row {i_row}"))?;
            let date = parse_date(&record[0]).with_context(|| format!("invalid date in row {i_row}"))?;
            let vals = record
                .iter()
                .skip(1)
                .map(|val| val.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid ratio in row {i_row}"))?;
            ratios.insert(date, vals);
        }

        Self::new(variants, ratios).with_context(|| format!("invalid variant data in {file:?}"))
    }

    pub fn variants(&self) -> &[String] {
        &self.variants
    }

    /// Shares of the variants on `date`, summing to one.
    pub fn ratio(&self, date: NaiveDate) -> Result<&[f64]> {
        let date = self.resolve(date)?;
        Ok(&self.ratios[&date])
    }

    /// Draw the index of a variant for a case on `date`.
    pub fn sample<R: Rng + ?Sized>(&self, date: NaiveDate, rng: &mut R) -> Result<usize> {
        Ok(self.distribution(date)?.sample(rng))
    }

    /// Weighted distribution of the variants on `date`.
    pub fn distribution(&self, date: NaiveDate) -> Result<&WeightedIndex<f64>> {
        let date = self.resolve(date)?;
        Ok(&self.dists[&date])
    }

    fn resolve(&self, date: NaiveDate) -> Result<NaiveDate> {
        if self.ratios.contains_key(&date) {
            return Ok(date);
        }
        let first = self.ratios.keys().next().copied();
        let last = self.ratios.keys().next_back().copied();
        match (first, last) {
            (Some(first), _) if date < first => Ok(first),
            (_, Some(last)) if date > last => Ok(last),
            _ => bail!("no variant ratios for {date}"),
        }
    }
}
