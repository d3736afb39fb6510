//! Loading the engine configuration (RON) and the step pipeline (JSON).

use std::fs;
use std::path::Path;

use amplify_core::{parse_pipeline, Step};
use amplify_engine::EngineConfig;
use anyhow::{Context, Result};
use engine_logging::engine_info;

/// Pipeline used when no `--steps` file is given.
pub const DEFAULT_PIPELINE: &str = include_str!("../pipelines/default-steps.json");

/// Reads a RON engine configuration. Fields left out keep their defaults;
/// no path means all defaults.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: EngineConfig = ron::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    engine_info!("Loaded configuration from {}", path.display());
    Ok(config)
}

pub fn load_pipeline(path: Option<&Path>) -> Result<Vec<Step>> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading pipeline {}", path.display()))?;
            parse_pipeline(&text).with_context(|| format!("parsing pipeline {}", path.display()))
        }
        None => parse_pipeline(DEFAULT_PIPELINE).context("parsing built-in pipeline"),
    }
}
