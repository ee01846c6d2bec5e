use crate::data::EventSource;
use crate::engine::{Aggregates, Engine};
use crate::model::Bucket;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Named daily series of one simulation, in population units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimResult {
    pub time: Vec<NaiveDate>,
    pub series: BTreeMap<String, Vec<f64>>,
}

impl SimResult {
    /// Assemble the result table from the aggregates of a run.
    ///
    /// Agent counts are divided by the scale. Case counts taken from
    /// `source` are already in population units and are truncated.
    pub fn assemble<S: EventSource>(
        engine: &Engine,
        agg: &Aggregates,
        source: &S,
        population: f64,
    ) -> Result<Self> {
        let time = engine.dates().to_vec();
        let n_days = time.len();
        if agg.n_days() != n_days {
            bail!("{} days of aggregates for {n_days} dates", agg.n_days());
        }
        let scale = engine.scale();
        let variants = engine.variants().variants();
        let ratios = time
            .iter()
            .map(|&date| engine.variants().ratio(date))
            .collect::<Result<Vec<_>>>()?;

        let mut series = BTreeMap::new();
        let per_day = |f: &dyn Fn(usize) -> f64| (0..n_days).map(f).collect::<Vec<_>>();

        for bucket in Bucket::ALL {
            let counts = per_day(&|day| agg.bucket(day, bucket) as f64 / scale);
            if matches!(bucket, Bucket::ActiveDetected | Bucket::ActiveUndetected) {
                for (i_var, variant) in variants.iter().enumerate() {
                    let split = per_day(&|day| counts[day] * ratios[day][i_var]);
                    series.insert(format!("{} {variant}", bucket.label()), split);
                }
            }
            series.insert(bucket.label().to_string(), counts);
        }

        for (target, name) in engine.targets().iter().enumerate() {
            let mut total = vec![0.0; n_days];
            for bucket in Bucket::ALL {
                let immune = per_day(&|day| agg.immune(day, bucket, target) as f64 / scale);
                let susceptible = per_day(&|day| {
                    (agg.bucket(day, bucket) - agg.immune(day, bucket, target)) as f64 / scale
                });
                for (sum, val) in total.iter_mut().zip(&immune) {
                    *sum += val;
                }
                series.insert(format!("{} immune {name}", bucket.label()), immune);
                series.insert(format!("{} susceptible {name}", bucket.label()), susceptible);
            }
            series.insert(format!("immune {name}"), total);
        }

        for (i_new, new) in variants.iter().enumerate() {
            let first = per_day(&|day| agg.reinfections(day, None, i_new) as f64 / scale);
            series.insert(format!("detected reinfection (None,{new})"), first);
            for (i_prev, prev) in variants.iter().enumerate() {
                let counts =
                    per_day(&|day| agg.reinfections(day, Some(i_prev), i_new) as f64 / scale);
                series.insert(format!("detected reinfection ({prev},{new})"), counts);
            }
        }

        let confirmed = per_day(&|day| source.reported_cases(time[day]).trunc());
        let infected = per_day(&|day| {
            (source.cases(time[day], true) + source.cases(time[day], false)).trunc()
        });
        for (i_var, variant) in variants.iter().enumerate() {
            let split = |vals: &[f64]| per_day(&|day| (vals[day] * ratios[day][i_var]).trunc());
            series.insert(format!("new confirmed {variant}"), split(&confirmed));
            series.insert(format!("new infected {variant}"), split(&infected));
        }
        series.insert("new confirmed".to_string(), confirmed);
        series.insert("new infected".to_string(), infected);

        series.insert("population".to_string(), vec![population; n_days]);

        Ok(Self { time, series })
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series.get(name).map(Vec::as_slice)
    }

    /// Write the table as semicolon-separated values, rounded to whole people.
    pub fn write_csv<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_path(file)
            .with_context(|| format!("failed to create {file:?}"))?;

        let header = std::iter::once("time").chain(self.series.keys().map(String::as_str));
        writer.write_record(header).context("failed to write header")?;

        for (day, date) in self.time.iter().enumerate() {
            let record = std::iter::once(date.to_string()).chain(
                self.series
                    .values()
                    .map(|vals| format!("{}", vals[day].round() as i64)),
            );
            writer
                .write_record(record)
                .with_context(|| format!("failed to write {date}"))?;
        }

        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, self).context("failed to serialize result")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let result = decode::from_read(&mut reader).context("failed to deserialize result")?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, tests::BASIC};
    use crate::engine::tests::ConstSource;
    use crate::immunity::Observables;
    use crate::variant::VariantAssigner;
    use approx::assert_relative_eq;
    use std::{env, fs};

    fn run() -> (SimResult, Aggregates) {
        let cfg = Config::from_toml_str(BASIC).unwrap();
        let obs = Observables::from_config(&cfg).unwrap();
        let variants = VariantAssigner::new(
            vec!["DELTA".to_string()],
            BTreeMap::from([(cfg.t0, vec![1.0])]),
        )
        .unwrap();
        let mut engine = Engine::new(&cfg, &obs, variants).unwrap();
        let source = ConstSource {
            detected: 500.0,
            undetected: 700.5,
            doses: [1000.0, 0.0, 0.0, 0.0],
        };
        let agg = engine.run(&source, 100_000.0).unwrap();
        let result = SimResult::assemble(&engine, &agg, &source, 100_000.0).unwrap();
        (result, agg)
    }

    #[test]
    fn normalizes_counts_by_scale() {
        let (result, agg) = run();
        assert_eq!(result.time.len(), 31);
        for day in [0, 15, 30] {
            let active = agg.bucket(day, Bucket::ActiveDetected) as f64 * 100.0;
            let total = result.get("active detected").unwrap()[day];
            assert_relative_eq!(total, active, max_relative = 1e-9);
            let delta = result.get("active detected DELTA").unwrap()[day];
            assert_relative_eq!(delta, active, max_relative = 1e-9);
            let immune = result.get("vaccinated immune DELTA").unwrap()[day];
            let susceptible = result.get("vaccinated susceptible DELTA").unwrap()[day];
            let vaccinated = result.get("vaccinated").unwrap()[day];
            assert_relative_eq!(immune + susceptible, vaccinated, max_relative = 1e-9);
        }
        assert!(result.get("population").unwrap().iter().all(|&n| n == 100_000.0));
    }

    #[test]
    fn takes_case_counts_from_source() {
        let (result, _) = run();
        assert!(result.get("new confirmed").unwrap().iter().all(|&n| n == 500.0));
        assert!(result.get("new infected").unwrap().iter().all(|&n| n == 1200.0));
        assert_eq!(result.get("new infected DELTA"), result.get("new infected"));
        let first = result.get("detected reinfection (None,DELTA)").unwrap();
        assert_relative_eq!(first[0], 500.0, max_relative = 1e-9);
        assert!(result.get("detected reinfection (DELTA,DELTA)").is_some());
    }

    #[test]
    fn total_immunity_sums_buckets() {
        let (result, _) = run();
        for day in 0..31 {
            let sum: f64 = Bucket::ALL
                .iter()
                .map(|b| result.get(&format!("{} immune DELTA", b.label())).unwrap()[day])
                .sum();
            let total = result.get("immune DELTA").unwrap()[day];
            assert_relative_eq!(total, sum, max_relative = 1e-9);
        }
    }

    #[test]
    fn writes_and_reloads() {
        let (result, _) = run();
        let dir = env::temp_dir().join(format!("immunity-waning-results-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let cache = dir.join("result.msgpack");
        result.save(&cache).unwrap();
        assert_eq!(SimResult::load(&cache).unwrap(), result);

        let table = dir.join("result.csv");
        result.write_csv(&table).unwrap();
        let contents = fs::read_to_string(&table).unwrap();
        let mut lines = contents.lines();
        let header: Vec<_> = lines.next().unwrap().split(';').collect();
        assert_eq!(header[0], "time");
        assert_eq!(header.len(), result.series.len() + 1);
        assert!(header[1..].windows(2).all(|w| w[0] < w[1]));
        assert!(lines.next().unwrap().starts_with("2022-01-01;"));
        assert_eq!(contents.lines().count(), 32);

        assert!(SimResult::load(dir.join("missing.msgpack")).is_err());
    }
}
