use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::manifest::ResolvedResourceTable;

/// Explicit process environment for every subprocess the pipeline spawns.
///
/// The builder never mutates its own `PATH`; resolved toolchains are tracked
/// here and applied per command.
#[derive(Debug, Clone)]
pub struct Environment {
    pub root: PathBuf,
    /// Highest priority first.
    bin_paths: Vec<PathBuf>,
    vars: BTreeMap<String, String>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(".")
    }
}

impl Environment {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bin_paths: Vec::new(),
            vars: BTreeMap::new(),
        }
    }

    pub fn prepend_bin(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.bin_paths.retain(|p| p != &dir);
        self.bin_paths.insert(0, dir);
    }

    pub fn bin_paths(&self) -> &[PathBuf] {
        &self.bin_paths
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Tracked bin dirs followed by the inherited `PATH`.
    pub fn search_path(&self) -> Result<OsString> {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .bin_paths
            .iter()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).map_err(|e| Error::msg(format!("invalid search path: {e}")))
    }

    /// A command with this environment applied, running in `cwd` (the root when `None`).
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>, cwd: Option<&Path>) -> Result<Command> {
        let mut cmd = Command::new(program);
        cmd.current_dir(cwd.unwrap_or(&self.root));
        cmd.env("PATH", self.search_path()?);
        cmd.envs(&self.vars);
        Ok(cmd)
    }
}

/// Prepends `<path>/bin` of every resolved entry in table order, so later entries win.
pub fn export_path(table: &ResolvedResourceTable, env: &mut Environment) {
    for entry in table.entries() {
        env.prepend_bin(entry.path.join("bin"));
    }
}
