//! Materializes resolved resources on disk. Anything whose target path exists is left alone.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

use crate::environment::Environment;
use crate::error::{Error, ErrorKind, Result};
use crate::launcher::{Fetcher, Launcher};
use crate::manifest::{KERNELSU, ResolvedResourceTable, ResourceEntry, ResourceKind};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveReport {
    pub cloned: Vec<String>,
    pub downloaded: Vec<String>,
    pub extracted: Vec<String>,
    /// Extracted directories found in the root and moved into place.
    pub relocated: Vec<String>,
    pub skipped: Vec<String>,
}

impl ResolveReport {
    /// True when nothing touched the network or ran git.
    pub fn is_noop(&self) -> bool {
        self.cloned.is_empty() && self.downloaded.is_empty()
    }
}

pub fn resolve<L, F>(
    table: &ResolvedResourceTable,
    env: &Environment,
    launcher: &mut L,
    fetcher: &mut F,
) -> Result<ResolveReport>
where
    L: Launcher + ?Sized,
    F: Fetcher + ?Sized,
{
    let mut report = ResolveReport::default();
    for entry in table.entries() {
        if entry.path.exists() {
            launcher.log(&format!("found an existing path: {}", entry.path.display()));
            report.skipped.push(entry.name.clone());
            continue;
        }
        match entry.kind {
            ResourceKind::Generic => resolve_generic(entry, env, launcher, fetcher, &mut report)?,
            ResourceKind::Git => resolve_git(entry, env, launcher, &mut report)?,
        }
    }
    Ok(report)
}

/// File name of the archive behind `url`. For `.../name.tar.gz/download` style
/// mirror links the segment before `download` is used.
pub fn archive_name(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let mut segments = trimmed.rsplit('/');
    let last = segments.next().unwrap_or_default();
    let name = if last == "download" {
        segments.next().unwrap_or_default()
    } else {
        last
    };
    let name = name.split(['?', '#']).next().unwrap_or_default();
    if name.is_empty() || name.contains(':') {
        return Err(Error::config(format!("cannot derive archive name from url '{url}'")));
    }
    Ok(name.to_string())
}

/// Directory name an archive unpacks to by convention: everything before the first '.'.
pub fn archive_stem(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn resolve_generic<L, F>(
    entry: &ResourceEntry,
    env: &Environment,
    launcher: &mut L,
    fetcher: &mut F,
    report: &mut ResolveReport,
) -> Result<()>
where
    L: Launcher + ?Sized,
    F: Fetcher + ?Sized,
{
    let name = archive_name(&entry.url)?;
    let archive = env.root.join(&name);
    let stem_dir = env.root.join(archive_stem(&name));

    if !archive.exists() && stem_dir.is_dir() && stem_dir != entry.path {
        launcher.log(&format!(
            "moving {} into place at {}",
            stem_dir.display(),
            entry.path.display()
        ));
        if let Some(parent) = entry.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&stem_dir, &entry.path).map_err(|e| {
            Error::resource(format!(
                "failed to move {} to {}: {e}",
                stem_dir.display(),
                entry.path.display()
            ))
        })?;
        report.relocated.push(entry.name.clone());
        return Ok(());
    }

    if !archive.exists() {
        launcher.log(&format!("downloading {}", entry.url));
        fetcher
            .fetch(&entry.url, &archive)
            .map_err(|e| e.recast(ErrorKind::ResourceAcquisition).context(&entry.name))?;
        report.downloaded.push(entry.name.clone());
    }

    launcher.log(&format!("unpacking {name}.."));
    if let Err(e) = extract_tar(&archive, &entry.path) {
        remove_partial(&entry.path);
        return Err(e
            .recast(ErrorKind::ResourceAcquisition)
            .context(format!("{}: extracting {}", entry.name, archive.display())));
    }
    fs::remove_file(&archive)?;
    report.extracted.push(entry.name.clone());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

impl TarCompression {
    /// Sniffs the compression from the leading bytes of an archive.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if magic.starts_with(b"BZh") {
            Self::Bzip2
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else {
            Self::None
        }
    }
}

/// Unpacks a plain, gzip, bzip2 or xz tar into `dest`.
pub fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
    let mut magic = [0u8; 6];
    let compression = {
        let mut f = File::open(archive)?;
        let n = f.read(&mut magic)?;
        TarCompression::detect(&magic[..n])
    };
    let file = BufReader::new(File::open(archive)?);
    fs::create_dir_all(dest)?;
    match compression {
        TarCompression::Gzip => tar::Archive::new(GzDecoder::new(file)).unpack(dest)?,
        TarCompression::Bzip2 => tar::Archive::new(BzDecoder::new(file)).unpack(dest)?,
        TarCompression::Xz => tar::Archive::new(XzDecoder::new(file)).unpack(dest)?,
        TarCompression::None => tar::Archive::new(file).unpack(dest)?,
    }
    Ok(())
}

/// Full history is kept for KernelSU (its version is a commit count) and for pinned commits.
pub fn needs_full_history(entry: &ResourceEntry) -> bool {
    entry.name.eq_ignore_ascii_case(KERNELSU) || entry.commit.is_some()
}

pub fn git_clone_args(entry: &ResourceEntry) -> Result<Vec<String>> {
    let branch = entry.branch.as_deref().ok_or_else(|| {
        Error::config(format!("resource '{}': git entries require a branch", entry.name))
    })?;
    let mut args: Vec<String> = vec!["clone".into(), "-b".into(), branch.into()];
    if !needs_full_history(entry) {
        args.extend(["--depth".into(), "1".into()]);
    }
    args.extend([
        "--remote-submodules".into(),
        "--recurse-submodules".into(),
        "--shallow-submodules".into(),
        entry.url.clone(),
        entry.path.to_string_lossy().into_owned(),
    ]);
    Ok(args)
}

fn resolve_git<L>(
    entry: &ResourceEntry,
    env: &Environment,
    launcher: &mut L,
    report: &mut ResolveReport,
) -> Result<()>
where
    L: Launcher + ?Sized,
{
    let args = git_clone_args(entry)?;
    let mut clone = env.command("git", None)?;
    clone.args(&args);
    launcher.log(&format!("cloning {} ({})", entry.name, entry.url));

    let res = launcher.launch(clone).and_then(|()| match &entry.commit {
        Some(commit) => {
            let mut checkout = env.command("git", Some(&entry.path))?;
            checkout.args(["checkout", commit.as_str()]);
            launcher.launch(checkout)
        }
        None => Ok(()),
    });
    if let Err(e) = res {
        remove_partial(&entry.path);
        return Err(e
            .recast(ErrorKind::ResourceAcquisition)
            .context(format!("cloning '{}'", entry.name)));
    }
    report.cloned.push(entry.name.clone());
    Ok(())
}

fn remove_partial(path: &Path) {
    let res = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return;
    };
    if let Err(e) = res {
        tracing::warn!(path = %path.display(), "failed to remove partial target: {e}");
    }
}
