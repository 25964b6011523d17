use crate::aggregate::StatFlags;
use crate::analysis::Analyzer;
use crate::calibrate::{CalibrationResult, CalibrationSettings, Calibrator, Estimate};
use crate::config::Config;
use crate::engine::{Convergence, Economy};
use crate::scenario::{Scenario, ScenarioDelta, run_sweep};
use anyhow::{Context, Result, bail};
use glob::glob;
use rmp_serde::{decode, encode};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
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

    /// Simulate the economy at the given center and spread, or at the
    /// stored estimate, with every statistic enabled.
    pub fn simulate(&self, point: Option<(f64, f64)>) -> Result<()> {
        let estimate = match point {
            Some((center, spread)) => Estimate {
                center,
                spread,
                lorenz_distance: f64::NAN,
            },
            None => self
                .load_estimate()
                .context("no center and spread given and no stored estimate")?
                .estimate(),
        };

        let mut economy = Scenario::new(&self.cfg, estimate, ScenarioDelta::default())
            .build()
            .context("failed to build economy")?;
        let outcome = economy.solve().context("failed to solve economy")?;
        if let Convergence::NonConverged {
            iterations,
            distance,
            ..
        } = outcome
        {
            log::warn!(
                "aggregate saving rule did not converge after {iterations} loops \
                 (last distance {distance:.3e})"
            );
        }

        self.save_results(&economy)
    }

    /// Calibrate the heterogeneous parameter and store the estimate, the
    /// calibrated economy and its statistics.
    pub fn calibrate(&self) -> Result<()> {
        let economy = Economy::new(self.cfg.clone()).context("failed to construct economy")?;
        let mut calibrator = Calibrator::new(economy, CalibrationSettings::from_config(&self.cfg));
        let estimate = calibrator.calibrate().context("calibration failed")?;
        let trials = calibrator.trials().to_vec();
        let mut economy = calibrator.into_target();

        let result = CalibrationResult::new(estimate, trials, &self.cfg)?;
        save_msgpack(self.estimate_file(), &result).context("failed to save estimate")?;
        save_json(self.estimate_json_file(), &result).context("failed to save estimate")?;
        economy
            .save_checkpoint(self.economy_file())
            .context("failed to save checkpoint")?;

        // Rules are solved at the estimate; only the statistics are added.
        economy.set_flags(StatFlags {
            lorenz: true,
            many_stats: true,
        });
        economy
            .make_history()
            .context("failed to simulate calibrated economy")?;
        self.save_results(&economy)
    }

    /// Run the configured growth and maximum-age scenarios from the
    /// stored estimate.
    pub fn sweep(&self) -> Result<()> {
        let Some(sweep) = &self.cfg.sweep else {
            bail!("config has no [sweep] section");
        };
        let result = self.load_estimate().context("failed to load estimate")?;

        // The calibrated economy, when present, supplies the no-update rules.
        let checkpoint_file = self.economy_file();
        let baseline = if checkpoint_file.exists() {
            let economy = Economy::load_checkpoint(&checkpoint_file)
                .with_context(|| format!("failed to load {checkpoint_file:?}"))?;
            if economy.config() != &self.cfg {
                bail!("checkpoint config differs from the current config");
            }
            Some(economy)
        } else {
            None
        };

        let points = run_sweep(&self.cfg, result.estimate(), sweep, baseline)
            .context("failed to run sweep")?;
        save_json(self.sweep_file(), &points).context("failed to save sweep")?;
        Ok(())
    }

    pub fn clean(&self) -> Result<()> {
        for ext in ["msgpack", "json"] {
            let pattern = self.sim_dir.join(format!("*.{ext}"));
            let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
            for file in glob(pattern)
                .context("failed to glob output files")?
                .filter_map(Result::ok)
            {
                fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
                log::info!("removed {file:?}");
            }
        }
        Ok(())
    }

    fn save_results(&self, economy: &Economy) -> Result<()> {
        economy
            .save_history(self.history_file())
            .context("failed to save history")?;

        let mut analyzer = Analyzer::new(economy.flags());
        analyzer
            .add_records(
                &economy.history().records,
                self.cfg.economy.ignore_periods,
            )
            .context("failed to analyze history")?;
        analyzer
            .save_results(self.summary_file())
            .context("failed to save summary")?;
        Ok(())
    }

    fn load_estimate(&self) -> Result<CalibrationResult> {
        load_msgpack(self.estimate_file())
    }

    fn estimate_file(&self) -> PathBuf {
        self.sim_dir.join("estimate.msgpack")
    }

    fn estimate_json_file(&self) -> PathBuf {
        self.sim_dir.join("estimate.json")
    }

    fn economy_file(&self) -> PathBuf {
        self.sim_dir.join("economy.msgpack")
    }

    fn history_file(&self) -> PathBuf {
        self.sim_dir.join("history.msgpack")
    }

    fn summary_file(&self) -> PathBuf {
        self.sim_dir.join("summary.json")
    }

    fn sweep_file(&self) -> PathBuf {
        self.sim_dir.join("sweep.json")
    }
}

fn save_msgpack<P: AsRef<Path>, T: Serialize>(file: P, value: &T) -> Result<()> {
    let file = file.as_ref();
    let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
    let mut writer = BufWriter::new(file);
    encode::write(&mut writer, value).context("failed to serialize value")?;
    writer.flush().context("failed to flush writer stream")?;
    Ok(())
}

fn load_msgpack<P: AsRef<Path>, T: DeserializeOwned>(file: P) -> Result<T> {
    let file = file.as_ref();
    let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
    let mut reader = BufReader::new(file);
    let value = decode::from_read(&mut reader).context("failed to deserialize value")?;
    Ok(value)
}

fn save_json<P: AsRef<Path>, T: Serialize>(file: P, value: &T) -> Result<()> {
    let file = file.as_ref();
    let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value).context("failed to write JSON")?;
    Ok(())
}
