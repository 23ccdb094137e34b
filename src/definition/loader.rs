use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::definition::PipelineDefinition;

/// Load one pipeline definition from a YAML file and sanity-check it.
/// Structural validation of the process graph happens later, at instance
/// creation; this only rejects files the engine could never register.
pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline file {}", path.display()))?;
    let definition: PipelineDefinition = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing pipeline file {}", path.display()))?;
    if definition.id.trim().is_empty() {
        bail!("pipeline file {} has an empty id", path.display());
    }
    if definition.processes.is_empty() {
        bail!("pipeline {} declares no processes", definition.id);
    }
    Ok(definition)
}

/// Load every `.yaml`/`.yml` file in a directory. A file that fails to
/// load is logged and skipped so one bad pipeline does not keep the
/// dispatcher from starting.
pub fn load_pipeline_dir(dir: &Path) -> Result<Vec<PipelineDefinition>> {
    let mut definitions = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("reading pipeline directory {}", dir.display()))?
    {
        let path = entry?.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else { continue };
        if ext != "yaml" && ext != "yml" {
            continue;
        }
        match load_pipeline(&path) {
            Ok(definition) => definitions.push(definition),
            Err(e) => warn!("Skipping pipeline file {}: {:#}", path.display(), e),
        }
    }
    Ok(definitions)
}
