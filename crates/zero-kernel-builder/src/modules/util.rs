use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::build_config::{BuildConfig, KernelVersion};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

fn default_true() -> bool {
    true
}

/// Module-level `enabled` switch read from a table that carries other settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ModuleToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Per-stage `[<module>.steps.<step>]` table shared by stages without settings of their own.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StepToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for StepToggle {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

/// Kernel source tree of the requested device.
pub fn kernel_tree(ctx: &ExecCtx, build: &BuildConfig) -> Result<PathBuf> {
    Ok(ctx.resources()?.path_of(&build.codename)?.to_path_buf())
}

/// Version found in the sources by `kernel.verify`.
pub fn source_version(ctx: &ExecCtx) -> Result<KernelVersion> {
    ctx.pipeline
        .kernel_version
        .ok_or_else(|| Error::msg("kernel version in sources is unknown (kernel.verify did not run)"))
}

pub fn is_git_checkout(p: &Path) -> bool {
    p.join(".git").exists()
}

/// Generated files in the workspace root: `localversion` and finished zips.
pub fn root_outputs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && (name == "localversion" || name.ends_with(".zip")) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
