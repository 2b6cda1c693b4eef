use crate::Error;
use crate::Result;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;

/// the single record governing kernel parameters, read from JSON.
/// every field has a default so partial configs stay valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub seed: u64,
    pub kernels: Kernels,
    pub schedule: Schedule,
    pub generate: Generate,
    pub posterior_enum: PosteriorEnum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Kernels {
    pub cat: Cat,
    pub kind: Kind,
    pub hyper: Hyper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cat {
    pub empty_group_count: u32,
    /// 0 disables the pipeline and runs the sequential loop
    pub row_queue_capacity: u32,
    pub parser_threads: u32,
}

impl Default for Cat {
    fn default() -> Self {
        Self {
            empty_group_count: 1,
            row_queue_capacity: 255,
            parser_threads: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Kind {
    /// 0 disables kind inference entirely
    pub iterations: u32,
    pub empty_kind_count: u32,
    pub score_parallel: bool,
    pub row_queue_capacity: u32,
    pub parser_threads: u32,
}

impl Default for Kind {
    fn default() -> Self {
        Self {
            iterations: 32,
            empty_kind_count: 32,
            score_parallel: true,
            row_queue_capacity: 255,
            parser_threads: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyper {
    pub run: bool,
    pub parallel: bool,
}

impl Default for Hyper {
    fn default() -> Self {
        Self {
            run: true,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub extra_passes: f64,
    /// datasets smaller than this get proportionally more sweeps
    pub small_data_size: f64,
    /// 0 disables checkpointing
    pub checkpoint_period_sec: f64,
    /// consecutive kind sweeps without a move before the latch trips
    pub max_reject_iters: u32,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            extra_passes: 500.0,
            small_data_size: 4096.0,
            checkpoint_period_sec: 0.0,
            max_reject_iters: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Generate {
    pub row_count: u32,
    pub density: f64,
}

impl Default for Generate {
    fn default() -> Self {
        Self {
            row_count: 100,
            density: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosteriorEnum {
    pub sample_count: u32,
    pub sample_skip: u32,
}

impl Default for PosteriorEnum {
    fn default() -> Self {
        Self {
            sample_count: 100,
            sample_skip: 10,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(Error::io(path.display().to_string()))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kernels.cat.empty_group_count == 0 {
            return Err(Error::Config("kernels.cat.empty_group_count must be > 0".into()));
        }
        if self.kernels.cat.parser_threads == 0 {
            return Err(Error::Config("kernels.cat.parser_threads must be > 0".into()));
        }
        if self.kernels.kind.iterations > 0 && self.kernels.kind.empty_kind_count == 0 {
            return Err(Error::Config("kernels.kind.empty_kind_count must be > 0".into()));
        }
        if self.kernels.kind.parser_threads == 0 {
            return Err(Error::Config("kernels.kind.parser_threads must be > 0".into()));
        }
        if !(0.0..=crate::MAX_EXTRA_PASSES).contains(&self.schedule.extra_passes) {
            return Err(Error::Config(format!(
                "schedule.extra_passes must lie in [0, {}]",
                crate::MAX_EXTRA_PASSES
            )));
        }
        if !(0.0..=1.0).contains(&self.generate.density) {
            return Err(Error::Config("generate.density must lie in [0, 1]".into()));
        }
        if self.posterior_enum.sample_count == 0 {
            return Err(Error::Config("posterior_enum.sample_count must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"seed": 7, "kernels": {"cat": {"empty_group_count": 2}}}"#)
                .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.kernels.cat.empty_group_count, 2);
        assert_eq!(config.kernels.cat.parser_threads, 1);
        assert_eq!(config.kernels.kind.iterations, 32);
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let mut config = Config::default();
        config.kernels.cat.empty_group_count = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.generate.density = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.schedule.extra_passes = -1.0;
        assert!(config.validate().is_err());
    }
}
