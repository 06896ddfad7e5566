use crate::error::Result;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

pub const DEFAULT_BLAS_BUDGET: u64 = 256_000_000;
pub const DEFAULT_SCRATCH_ALIGNMENT: u64 = 128;

/// How triangle geometry interacts with any-hit shaders.
#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnyHitMode {
    /// Any-hit shaders are skipped entirely.
    Opaque,
    /// Any-hit shaders run, at most once per primitive along a ray.
    NoDuplicateAnyHit,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RaytracingConfig {
    pub blas_budget_bytes: u64,
    pub compact_blas: bool,
    pub any_hit_mode: AnyHitMode,
    pub tlas_allow_update: bool,
    pub default_scratch_alignment: u64,
}

impl Default for RaytracingConfig {
    fn default() -> Self {
        RaytracingConfig {
            blas_budget_bytes: DEFAULT_BLAS_BUDGET,
            compact_blas: true,
            any_hit_mode: AnyHitMode::Opaque,
            tlas_allow_update: true,
            default_scratch_alignment: DEFAULT_SCRATCH_ALIGNMENT,
        }
    }
}

impl RaytracingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        log::debug!("loading raytracing config from {}", path.as_ref().display());
        let file = File::open(path)?;
        let config: RaytracingConfig = serde_json::from_reader(file)?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
