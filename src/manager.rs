use crate::config::Config;
use crate::data::{EpiData, PopulationParameters};
use crate::engine::Engine;
use crate::immunity::Observables;
use crate::results::SimResult;
use crate::variant::VariantAssigner;
use anyhow::{Context, Result};
use glob::glob;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Simulate the configured scenario and export its result table.
    ///
    /// A cached result of an identical configuration is reused.
    pub fn run_simulation(&self) -> Result<()> {
        let hash = self.cfg.hash()?;
        let cache_file = self.cache_file(&hash);

        let result = match self.load_cached(&cache_file) {
            Some(result) => {
                log::info!("loaded {cache_file:?}");
                result
            }
            None => {
                let result = self.simulate().context("failed to simulate")?;
                self.store_cached(&cache_file, &result);
                result
            }
        };

        let results_dir = self.sim_dir.join("results");
        fs::create_dir_all(&results_dir)
            .with_context(|| format!("failed to create {results_dir:?}"))?;
        let results_file = results_dir.join(format!("{}.csv", self.cfg.scenario_name()));
        result
            .write_csv(&results_file)
            .context("failed to write results")?;
        log::info!("saved {results_file:?}");

        Ok(())
    }

    /// Resolve the waning parameters and log them without simulating.
    pub fn fit_parameters(&self) -> Result<()> {
        let obs = Observables::from_config(&self.cfg).context("failed to resolve observables")?;
        for (target, cause, params) in obs.iter() {
            log::info!(
                "{target} {cause}: {} base {:.4} mean {:.2}",
                params.kind,
                params.base,
                params.mean
            );
        }
        Ok(())
    }

    /// Remove every cached result.
    pub fn clean_cache(&self) -> Result<()> {
        let pattern = self.sim_dir.join("cache").join("*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        for file in glob(pattern)
            .context("failed to glob cache files")?
            .filter_map(Result::ok)
        {
            fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
            log::info!("removed {file:?}");
        }
        Ok(())
    }

    fn simulate(&self) -> Result<SimResult> {
        let files = &self.cfg.files;

        let obs = Observables::from_config(&self.cfg).context("failed to resolve observables")?;
        let variants = VariantAssigner::from_file(self.sim_dir.join(&files.variantdata))
            .context("failed to load variant data")?;
        let epidata = EpiData::load(&self.cfg, &self.sim_dir).context("failed to load epidata")?;
        let population = PopulationParameters::from_file(self.sim_dir.join(&files.populationdata))
            .context("failed to load population data")?
            .get_population(self.cfg.federal_state.as_deref())?;

        let mut engine =
            Engine::new(&self.cfg, &obs, variants).context("failed to construct engine")?;
        let agg = engine
            .run(&epidata, population)
            .context("failed to run engine")?;

        SimResult::assemble(&engine, &agg, &epidata, population)
    }

    fn load_cached(&self, cache_file: &Path) -> Option<SimResult> {
        if !cache_file.exists() {
            log::info!("no cached result at {cache_file:?}");
            return None;
        }
        match SimResult::load(cache_file) {
            Ok(result) if result.time == self.cfg.dates() => Some(result),
            Ok(_) => {
                log::warn!("ignoring {cache_file:?}: dates differ from the config");
                None
            }
            Err(error) => {
                log::warn!("ignoring {cache_file:?}: {error:#}");
                None
            }
        }
    }

    fn store_cached(&self, cache_file: &Path, result: &SimResult) {
        let stored = cache_file
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .context("failed to create cache dir")
            .and_then(|()| result.save(cache_file));
        match stored {
            Ok(()) => log::info!("saved {cache_file:?}"),
            Err(error) => log::warn!("failed to cache result: {error:#}"),
        }
    }

    fn cache_file(&self, hash: &str) -> PathBuf {
        self.sim_dir.join("cache").join(format!("{hash}.msgpack"))
    }
}
