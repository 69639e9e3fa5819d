use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "kernel".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    /// Where finished kernel zips land.
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    /// Absolute paths are used as-is, relative ones are rooted at the workspace root.
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.root.join(pb)
        })
    }

    /// Resource paths from manifests: relative, no '..', never outside the root.
    pub fn resolve_under_root(&self, rel: &str) -> Result<PathBuf> {
        resolve_under(&self.root, rel)
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;
    for dir in [&paths.root, &paths.build_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    if has_parent_component(Path::new(p)) {
        return Err(Error::config(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn has_parent_component(p: &Path) -> bool {
    p.components().any(|c| matches!(c, Component::ParentDir))
}

fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(Error::config("empty relative path"));
    }
    let rel_pb = Path::new(rel);
    if has_parent_component(rel_pb) {
        return Err(Error::config(format!(
            "invalid relative path '{}' (contains '..')",
            rel
        )));
    }
    if rel_pb.is_absolute() {
        return Err(Error::config(format!(
            "resource path '{}' must be relative to the workspace root",
            rel
        )));
    }
    Ok(root.join(rel_pb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> WorkspacePaths {
        let root = PathBuf::from("/tmp/zkb-root");
        WorkspacePaths {
            build_dir: root.join("build"),
            out_dir: root.join("kernel"),
            root,
        }
    }

    #[test]
    fn resource_paths_stay_under_root() {
        let ws = ws();
        assert_eq!(
            ws.resolve_under_root("clang-r450784e").unwrap(),
            ws.root.join("clang-r450784e")
        );
        assert!(ws.resolve_under_root("../elsewhere").is_err());
        assert!(ws.resolve_under_root("/opt/clang").is_err());
    }

    #[test]
    fn config_paths_accept_absolute() {
        let ws = ws();
        assert_eq!(
            ws.resolve_config_path("/etc/custom_defconfig").unwrap(),
            PathBuf::from("/etc/custom_defconfig")
        );
        assert_eq!(
            ws.resolve_config_path("manifests/tools.json").unwrap(),
            ws.root.join("manifests/tools.json")
        );
    }
}
