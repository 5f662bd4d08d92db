use anyhow::{Context, Result};
use clap::Args;
use salesops_pipeline::PipelineConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Flags that win over the config file and `SALESOPS_*` variables.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// SQLite database holding the stream, registry and run history
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
    /// Advisory lock file shared by every process using the same database
    #[arg(long, global = true)]
    pub lock_path: Option<PathBuf>,
    /// Minimum MAE improvement (percent) required to promote a candidate
    #[arg(long, global = true)]
    pub promotion_threshold: Option<f64>,
    /// External trainer run through `bash -lc`
    #[arg(long, global = true)]
    pub trainer_command: Option<String>,
    #[arg(long, global = true)]
    pub trainer_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    pub poll_interval_secs: Option<u64>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if let Some(lock_path) = &self.lock_path {
            config.lock_path = Some(lock_path.clone());
        }
        if let Some(threshold) = self.promotion_threshold {
            config.promotion_threshold_pct = threshold;
        }
        if let Some(command) = &self.trainer_command {
            if !command.trim().is_empty() {
                config.trainer_command = Some(command.clone());
            }
        }
        if let Some(secs) = self.trainer_timeout_secs {
            config.trainer_timeout_secs = secs;
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval_secs = secs;
        }
    }
}

/// Defaults, then the YAML file, then the environment, then flags.
pub fn load_config<F>(
    file: Option<&Path>,
    overrides: &ConfigOverrides,
    env_lookup: F,
) -> Result<PipelineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match file {
        Some(path) => read_config_file(path)?,
        None => PipelineConfig::default(),
    };
    config
        .apply_env(env_lookup)
        .context("Invalid SALESOPS_* environment")?;
    overrides.apply(&mut config);
    config.validate().context("Invalid pipeline configuration")?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<PipelineConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(PipelineConfig::default());
    }
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Logs go to stderr; stdout carries the JSON results.
pub fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SALESOPS_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
