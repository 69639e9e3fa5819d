use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use zero_kernel_builder_macros::{Module, Stage};

use crate::build_config::{Base, BuildConfig, KernelVersion};
use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::manifest::ANYKERNEL3;
use crate::modules::util::{StepToggle, ensure_dir, kernel_tree, source_version};
use crate::{Error, ErrorKind, Result};

pub const KERNEL_IMAGE: &str = "out/arch/arm64/boot/Image.gz-dtb";

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i64 {
    9
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Deflate level for the flashable zip.
    pub compression_level: i64,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compression_level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ProjectTable {
    name: Option<String>,
    version: Option<String>,
}

/// Product name and internal version stamped into artifact names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMeta {
    pub name: String,
    pub version: String,
}

impl ProjectMeta {
    /// `KNAME`/`KVERSION` win over `[project]`, which wins over the defaults.
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let table: ProjectTable = doc.deserialize_path("project")?.unwrap_or_default();
        Ok(Self::resolve(
            table,
            std::env::var("KNAME").ok(),
            std::env::var("KVERSION").ok(),
        ))
    }

    fn resolve(table: ProjectTable, env_name: Option<String>, env_version: Option<String>) -> Self {
        let pick = |env: Option<String>, cfg: Option<String>| {
            env.filter(|v| !v.trim().is_empty())
                .or(cfg.filter(|v| !v.trim().is_empty()))
        };
        Self {
            name: pick(env_name, table.name).unwrap_or_else(|| "zero".into()),
            version: pick(env_version, table.version)
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").into()),
        }
    }
}

/// `{name}-{version}-{ucodename}-{base}-{kv}[-ksu].zip`
pub fn artifact_name(
    meta: &ProjectMeta,
    unified_codename: &str,
    base: Base,
    kernel_version: KernelVersion,
    ksu: bool,
) -> String {
    let suffix = if ksu { "-ksu" } else { "" };
    format!(
        "{}-{}-{unified_codename}-{base}-{kernel_version}{suffix}.zip",
        meta.name, meta.version
    )
}

/// Mirrors `zip -x *.git* *README* *LICENSE* *placeholder` on a path relative
/// to the archive root.
pub fn excluded_from_zip(rel: &str) -> bool {
    rel.contains(".git")
        || rel.contains("README")
        || rel.contains("LICENSE")
        || rel.ends_with("placeholder")
}

/// Zips every non-excluded file under `src` into `dest`; returns the file count.
pub fn write_flashable_zip(src: &Path, dest: &Path, level: i64) -> Result<usize> {
    let mut zip = ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level));

    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(src)
                .map(|rel| !excluded_from_zip(&rel.to_string_lossy()))
                .unwrap_or(true)
        });

    let mut count = 0;
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?
            .to_string_lossy()
            .replace('\\', "/");

        zip.start_file(rel.as_str(), with_mode(options, &entry.metadata()?))?;
        zip.write_all(&fs::read(entry.path())?)?;
        count += 1;
    }
    zip.finish()?;
    Ok(count)
}

#[cfg(unix)]
fn with_mode(options: SimpleFileOptions, md: &fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(md.permissions().mode())
}

#[cfg(not(unix))]
fn with_mode(options: SimpleFileOptions, _md: &fs::Metadata) -> SimpleFileOptions {
    options
}

#[Stage(
    id = "package.zip",
    module = "package",
    phase = "package",
    config = StepToggle,
    provides = ["package:zip"],
    after = ["build:image"],
    when = ["!build.clean_only"],
    default_label = "Create flashable zip"
)]
pub struct ZipStage;

impl ZipStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::from_doc(doc)?;
        let pkg: PackageConfig = doc.deserialize_path("package")?.unwrap_or_default();
        let meta = ProjectMeta::from_doc(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel = kernel_tree(ctx, &build)?;
        let kv = source_version(ctx)?;
        let ak3 = ctx.resources()?.path_of(ANYKERNEL3)?.to_path_buf();

        let image = kernel.join(KERNEL_IMAGE);
        fs::copy(&image, ak3.join("Image.gz-dtb"))
            .map_err(|e| Error::packaging(format!("failed to copy {}: {e}", image.display())))?;

        let name = artifact_name(&meta, &build.unified_codename(), build.base, kv, build.ksu);
        let dest = ws.out_dir.join(&name);
        let files = ensure_dir(&ws.out_dir)
            .and_then(|()| write_flashable_zip(&ak3, &dest, pkg.compression_level))
            .map_err(|e| {
                e.recast(ErrorKind::Packaging)
                    .context(format!("writing {}", dest.display()))
            })?;
        tracing::info!(artifact = %dest.display(), files, "packaged");
        ctx.log(&format!("{} ({files} files)", dest.display()));
        Ok(())
    }
}

#[Module(
    id = "package",
    detect = "build",
    config = PackageConfig,
    config_path = "package",
    stages = [ZipStage]
)]
pub struct PackageModule;
