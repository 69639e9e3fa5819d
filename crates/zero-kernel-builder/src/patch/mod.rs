//! In-place source transformations and the per-tree ledger that guards them.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::environment::Environment;
use crate::error::{Error, ErrorKind, Result};
use crate::launcher::Launcher;

pub mod catalog;

/// Ledger file kept at the top of every transformed tree. `git clean -fdx` removes it.
pub const LEDGER_FILE: &str = ".zkb-transforms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransformId {
    pub name: &'static str,
    pub version: u32,
}

impl TransformId {
    pub const fn new(name: &'static str, version: u32) -> Self {
        Self { name, version }
    }
}

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug)]
pub struct TransformLedger {
    path: PathBuf,
    applied: BTreeSet<String>,
}

impl TransformLedger {
    pub fn open(tree: &Path) -> Result<Self> {
        let path = tree.join(LEDGER_FILE);
        let applied = match fs::read_to_string(&path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(Error::patch(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self { path, applied })
    }

    pub fn contains(&self, id: TransformId) -> bool {
        self.applied.contains(&id.to_string())
    }

    fn record(&mut self, id: TransformId) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{id}")?;
        self.applied.insert(id.to_string());
        Ok(())
    }
}

/// One edit inside a transformation. Paths are relative to the tree being modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Replace every occurrence of each `from` with its `to`.
    Substitute {
        file: PathBuf,
        pairs: Vec<(String, String)>,
    },
    AppendText {
        file: PathBuf,
        text: String,
    },
    /// Insert `line` before the first line starting with `anchor`.
    InsertBefore {
        file: PathBuf,
        anchor: String,
        line: String,
    },
    /// Create `link` pointing at the absolute `target`.
    Symlink {
        target: PathBuf,
        link: PathBuf,
    },
}

impl Edit {
    fn file(&self) -> &Path {
        match self {
            Edit::Substitute { file, .. }
            | Edit::AppendText { file, .. }
            | Edit::InsertBefore { file, .. } => file,
            Edit::Symlink { target, .. } => target,
        }
    }
}

/// A named, versioned group of edits applied at most once per tree.
#[derive(Debug, Clone)]
pub struct Transform {
    pub id: TransformId,
    pub edits: Vec<Edit>,
}

impl Transform {
    pub fn new(id: TransformId) -> Self {
        Self {
            id,
            edits: Vec::new(),
        }
    }

    pub fn edit(mut self, edit: Edit) -> Self {
        self.edits.push(edit);
        self
    }

    /// Applies every edit after checking all targets exist; the ledger entry is
    /// written once the last edit succeeds.
    pub fn apply(&self, tree: &Path) -> Result<()> {
        let mut ledger = TransformLedger::open(tree)?;
        if ledger.contains(self.id) {
            return Err(Error::patch(format!(
                "transformation {} was already applied to {}",
                self.id,
                tree.display()
            )));
        }

        for edit in &self.edits {
            let target = tree.join(edit.file());
            if !target.exists() {
                return Err(Error::patch(format!(
                    "{}: target {} does not exist",
                    self.id,
                    target.display()
                )));
            }
        }

        for edit in &self.edits {
            apply_edit(tree, edit)
                .map_err(|e| e.recast(ErrorKind::PatchApplication).context(self.id))?;
        }
        ledger.record(self.id)
    }
}

fn apply_edit(tree: &Path, edit: &Edit) -> Result<()> {
    match edit {
        Edit::Substitute { file, pairs } => {
            let path = tree.join(file);
            let mut text = fs::read_to_string(&path)?;
            for (from, to) in pairs {
                if text.contains(from.as_str()) {
                    tracing::debug!(file = %path.display(), %from, "substitute");
                    text = text.replace(from.as_str(), to);
                }
            }
            fs::write(&path, text)?;
        }
        Edit::AppendText { file, text } => {
            let mut f = OpenOptions::new().append(true).open(tree.join(file))?;
            f.write_all(text.as_bytes())?;
        }
        Edit::InsertBefore { file, anchor, line } => {
            let path = tree.join(file);
            let text = insert_before_line(&fs::read_to_string(&path)?, anchor, line)
                .ok_or_else(|| {
                    Error::patch(format!(
                        "{}: no line starting with '{anchor}'",
                        path.display()
                    ))
                })?;
            fs::write(&path, text)?;
        }
        Edit::Symlink { target, link } => {
            let link = tree.join(link);
            if link.symlink_metadata().is_ok() {
                return Err(Error::patch(format!("{} already exists", link.display())));
            }
            symlink_dir(target, &link)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink_dir(target: &Path, link: &Path) -> Result<()> {
    let _ = (target, link);
    Err(Error::patch("symlinks are only supported on unix hosts"))
}

/// Returns `text` with `new_line` inserted before the first line starting with
/// `anchor`, or `None` when no line matches.
pub fn insert_before_line(text: &str, anchor: &str, new_line: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len() + new_line.len() + 1);
    let mut inserted = false;
    for line in text.lines() {
        if !inserted && line.trim_end().starts_with(anchor) {
            out.push_str(new_line);
            out.push('\n');
            inserted = true;
        }
        out.push_str(line);
        out.push('\n');
    }
    inserted.then_some(out)
}

/// `name()` becomes `name(void)` for every catalog signature.
pub fn strict_prototype_pairs(signatures: &[&str]) -> Vec<(String, String)> {
    signatures
        .iter()
        .map(|s| (s.to_string(), s.replace("()", "(void)")))
        .collect()
}

pub fn substitution_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

/// Runs `patch -p1` for `patch_file` inside `dir`.
pub fn apply_patch_file<L: Launcher + ?Sized>(
    launcher: &mut L,
    env: &Environment,
    dir: &Path,
    patch_file: &Path,
) -> Result<()> {
    if !patch_file.is_file() {
        return Err(Error::patch(format!(
            "patch file {} does not exist",
            patch_file.display()
        )));
    }
    launcher.log(&format!("applying patch: {}", patch_file.display()));
    let mut cmd = env.command("patch", Some(dir))?;
    cmd.args(["-p1", "-s", "--forward", "--no-backup-if-mismatch", "-i"])
        .arg(patch_file);
    launcher.launch(cmd).map_err(|e| {
        e.recast(ErrorKind::PatchApplication)
            .context(format!("patch {} rejected", patch_file.display()))
    })
}

/// `*.patch` files in `dir`, sorted by name, minus `excluded`.
pub fn list_patch_files(dir: &Path, excluded: &[&str]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)
        .map_err(|e| Error::patch(format!("failed to read {}: {e}", dir.display())))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && name.ends_with(".patch") && !excluded.contains(&name) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Recursive copy; entries whose path relative to `src` matches `skip` are left out.
pub fn copy_dir_filtered(src: &Path, dst: &Path, skip: impl Fn(&Path) -> bool) -> Result<()> {
    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        e.path()
            .strip_prefix(src)
            .map(|rel| !skip(rel))
            .unwrap_or(true)
    });
    fs::create_dir_all(dst)?;
    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let to = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&to)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(entry.path())?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to)?;
            }
            symlink_dir(&target, &to)?;
        } else {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

/// VCS metadata: `.git`, `.gitignore`, `.gitmodules` and friends.
pub fn is_git_metadata(rel: &Path) -> bool {
    rel.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with(".git"))
            .unwrap_or(false)
    })
}

pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(md) if md.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// KernelSU's documented version formula.
pub fn ksu_git_version(commit_count: u64) -> u64 {
    10000 + commit_count + 200
}

/// Major version from `clang --version` output.
pub fn parse_clang_major(version_output: &str) -> Result<u32> {
    let after = version_output
        .split("clang version ")
        .nth(1)
        .ok_or_else(|| Error::config("unrecognized `clang --version` output"))?;
    let major = after.split('.').next().unwrap_or_default().trim();
    major
        .parse()
        .map_err(|_| Error::config(format!("invalid clang major version '{major}'")))
}
