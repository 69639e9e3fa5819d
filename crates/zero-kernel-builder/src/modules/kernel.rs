//! Kernel tree preparation: cleanup, version check, source patches and the
//! final defconfig.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use zero_kernel_builder_macros::{Module, Stage};

use crate::build_config::{Base, BuildConfig, KernelVersion};
use crate::config::ConfigDoc;
use crate::defconfig::{ConfigFragment, resolve_defconfig};
use crate::executor::ExecCtx;
use crate::manifest::{ANYKERNEL3, CLANG, KERNELSU, RTL8812AU};
use crate::modules::util::{
    StepToggle, is_git_checkout, kernel_tree, root_outputs, source_version, write_text,
};
use crate::patch::catalog::{
    self, BASELINE_CONFIGS, EXCLUDED_PATCHES, KERNELSU_COMPAT_PATCH, KSU_CONFIGS, QCACLD_PA_PATCH,
    STRICT_PROTOTYPES_MIN_CLANG,
};
use crate::patch::{
    Edit, Transform, TransformId, apply_patch_file, copy_dir_filtered, is_git_metadata,
    ksu_git_version, list_patch_files, parse_clang_major, remove_path_if_exists,
    strict_prototype_pairs, substitution_pairs,
};
use crate::workspace::WorkspacePaths;
use crate::{Error, ErrorKind, Result};

pub const STRICT_PROTOTYPES: TransformId = TransformId::new("strict-prototypes", 1);
pub const MAC80211_BAND: TransformId = TransformId::new("mac80211-60ghz-band", 1);
pub const KERNELSU_INTEGRATION: TransformId = TransformId::new("kernelsu-integration", 1);
pub const RTL8812AU_DRIVER: TransformId = TransformId::new("rtl8812au-v5.6.4.2", 1);
pub const IPA_HEADER: TransformId = TransformId::new("ipa-header-512", 1);
pub const DEFCONFIG_FRAGMENT: TransformId = TransformId::new("defconfig-fragment", 1);

fn default_true() -> bool {
    true
}

fn default_modifications_dir() -> String {
    "modifications".into()
}

fn default_localversion() -> String {
    "~zero_kernel".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root of the modification catalog, one directory per unified codename.
    pub modifications_dir: String,
    /// Written to `<root>/localversion` before the build.
    pub localversion: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            modifications_dir: default_modifications_dir(),
            localversion: default_localversion(),
        }
    }
}

impl KernelConfig {
    fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("kernel")?.unwrap_or_default())
    }

    /// `modifications/<unified codename>`
    pub fn modifications_root(&self, ws: &WorkspacePaths, build: &BuildConfig) -> Result<PathBuf> {
        Ok(ws
            .resolve_config_path(&self.modifications_dir)?
            .join(build.unified_codename()))
    }
}

// Everything a patch stage needs, gathered once per stage.
struct TreeCtx {
    build: BuildConfig,
    kernel: PathBuf,
    mods: PathBuf,
    kv: KernelVersion,
}

impl TreeCtx {
    fn load(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<Self> {
        let build = BuildConfig::from_doc(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let mods = KernelConfig::from_doc(doc)?.modifications_root(&ws, &build)?;
        Ok(Self {
            kernel: kernel_tree(ctx, &build)?,
            kv: source_version(ctx)?,
            build,
            mods,
        })
    }

    fn patch_dir(&self) -> PathBuf {
        self.mods.join(self.kv.to_string())
    }
}

#[Stage(
    id = "kernel.clean",
    module = "kernel",
    phase = "clean",
    config = StepToggle,
    provides = ["kernel:clean"],
    after = ["resources:path"],
    default_label = "Clean build environment",
    core = true
)]
pub struct CleanStage;

impl CleanStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::from_doc(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let table = ctx.resources()?.clone();
        let env = ctx.pipeline.env.clone();

        for name in [build.codename.as_str(), ANYKERNEL3, KERNELSU] {
            let Some(entry) = table.get(name) else {
                continue;
            };
            if !is_git_checkout(&entry.path) {
                ctx.log(&format!("{name}: not a git checkout, skipping"));
                continue;
            }
            for args in [&["clean", "-fdx"][..], &["reset", "--hard", "HEAD"][..]] {
                let mut cmd = env.command("git", Some(&entry.path))?;
                cmd.args(args);
                if let Err(e) = ctx.run_cmd(cmd) {
                    tracing::warn!(resource = %name, error = %e, "cleanup step failed");
                    ctx.log(&format!("{name}: git {} failed: {e}", args.join(" ")));
                }
            }
        }

        match root_outputs(&ws.root) {
            Ok(files) => {
                for f in files {
                    if let Err(e) = fs::remove_file(&f) {
                        ctx.log(&format!("failed to remove {}: {e}", f.display()));
                    } else {
                        ctx.log(&format!("removed {}", f.display()));
                    }
                }
            }
            Err(e) => ctx.log(&format!("failed to list {}: {e}", ws.root.display())),
        }

        if build.clean_only {
            ctx.log("clean-only run: stopping after cleanup");
        }
        Ok(())
    }
}

#[Stage(
    id = "kernel.localversion",
    module = "kernel",
    phase = "localversion",
    config = StepToggle,
    provides = ["kernel:localversion"],
    after = ["kernel:clean"],
    when = ["!build.clean_only"],
    default_label = "Write localversion"
)]
pub struct LocalversionStage;

impl LocalversionStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kcfg = KernelConfig::from_doc(doc)?;
        let path = ws.root.join("localversion");
        write_text(&path, &kcfg.localversion)?;
        ctx.log(&format!("{} = {}", path.display(), kcfg.localversion));
        Ok(())
    }
}

#[Stage(
    id = "kernel.verify",
    module = "kernel",
    phase = "verify",
    config = StepToggle,
    provides = ["kernel:verified"],
    after = ["kernel:clean", "kernel:localversion?"],
    when = ["!build.clean_only"],
    default_label = "Verify kernel version",
    core = true
)]
pub struct VerifyStage;

impl VerifyStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::from_doc(doc)?;
        let kernel = kernel_tree(ctx, &build)?;
        let makefile = kernel.join("Makefile");
        let text = fs::read_to_string(&makefile).map_err(|e| {
            Error::version_mismatch(format!("failed to read {}: {e}", makefile.display()))
        })?;
        let found = KernelVersion::parse_makefile(&text)?;
        if found != build.kernel_version {
            return Err(Error::version_mismatch(format!(
                "requested kernel {} but {} contains {found}",
                build.kernel_version,
                kernel.display()
            )));
        }
        ctx.log(&format!("kernel version in sources: {found}"));
        ctx.pipeline.kernel_version = Some(found);
        Ok(())
    }
}

#[Stage(
    id = "kernel.prototypes",
    module = "kernel",
    phase = "patch",
    config = StepToggle,
    provides = ["patch:prototypes"],
    after = ["kernel:verified"],
    when = ["!build.clean_only"],
    default_label = "Strict prototypes"
)]
pub struct PrototypesStage;

impl PrototypesStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tree = TreeCtx::load(doc, ctx)?;
        let clang = ctx.resources()?.path_of(CLANG)?.join("bin").join("clang");
        let mut cmd = ctx.pipeline.env.command(&clang, None)?;
        cmd.arg("--version");
        let major = parse_clang_major(&ctx.capture_cmd(cmd)?)?;

        if major < STRICT_PROTOTYPES_MIN_CLANG {
            ctx.log(&format!("clang {major}: strict prototypes patch not needed"));
            return Ok(());
        }

        let fixes = catalog::strict_prototypes_catalog(tree.kv, tree.build.base);
        let transform = fixes.iter().fold(Transform::new(STRICT_PROTOTYPES), |t, fix| {
            t.edit(Edit::Substitute {
                file: fix.file.into(),
                pairs: strict_prototype_pairs(fix.signatures),
            })
        });
        transform.apply(&tree.kernel)?;
        ctx.log(&format!("clang {major}: patched {} files", fixes.len()));
        Ok(())
    }
}

#[Stage(
    id = "kernel.anykernel3",
    module = "kernel",
    phase = "patch",
    config = StepToggle,
    provides = ["patch:anykernel3"],
    after = ["kernel:verified", "kernel.prototypes?"],
    when = ["!build.clean_only"],
    default_label = "Patch AnyKernel3"
)]
pub struct AnyKernel3Stage;

impl AnyKernel3Stage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tree = TreeCtx::load(doc, ctx)?;
        let ak3 = ctx.resources()?.path_of(ANYKERNEL3)?.to_path_buf();
        let staged = tree.mods.join("anykernel3");

        let script = staged.join("anykernel.sh");
        if !script.is_file() {
            return Err(Error::patch(format!(
                "{} does not exist",
                script.display()
            )));
        }

        for dir in ["ramdisk", "models"] {
            remove_path_if_exists(&ak3.join(dir))
                .map_err(|e| e.recast(ErrorKind::PatchApplication))?;
        }
        fs::copy(&script, ak3.join("anykernel.sh")).map_err(|e| {
            Error::patch(format!("failed to install {}: {e}", script.display()))
        })?;

        let ramdisk = staged.join("ramdisk");
        if ramdisk.is_dir() {
            copy_dir_filtered(&ramdisk, &ak3.join("ramdisk"), |_| false)
                .map_err(|e| e.recast(ErrorKind::PatchApplication).context("ramdisk overlay"))?;
            ctx.log("copied ramdisk overlay");
        }
        ctx.log(&format!("installed {}", script.display()));
        Ok(())
    }
}

#[Stage(
    id = "kernel.patches",
    module = "kernel",
    phase = "patch",
    config = StepToggle,
    provides = ["patch:kernel"],
    after = ["patch:anykernel3"],
    when = ["!build.clean_only"],
    default_label = "Patch kernel"
)]
pub struct KernelPatchStage;

impl KernelPatchStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tree = TreeCtx::load(doc, ctx)?;
        let env = ctx.pipeline.env.clone();

        for patch in list_patch_files(&tree.patch_dir(), EXCLUDED_PATCHES)? {
            apply_patch_file(&mut *ctx, &env, &tree.kernel, &patch)?;
        }

        let mut band = Transform::new(MAC80211_BAND);
        for file in catalog::MAC80211_FILES {
            if tree.kernel.join(file).is_file() {
                band = band.edit(Edit::Substitute {
                    file: file.into(),
                    pairs: substitution_pairs(&[catalog::MAC80211_BAND_FIX]),
                });
            } else {
                ctx.log(&format!("{file} not found, skipping"));
            }
        }
        if !band.edits.is_empty() {
            band.apply(&tree.kernel)?;
        }
        Ok(())
    }
}

#[Stage(
    id = "kernel.ksu",
    module = "kernel",
    phase = "patch",
    config = StepToggle,
    provides = ["patch:ksu"],
    after = ["patch:kernel"],
    when = ["build.ksu", "!build.clean_only"],
    default_label = "Integrate KernelSU"
)]
pub struct KsuStage;

impl KsuStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tree = TreeCtx::load(doc, ctx)?;
        let ksu = ctx.resources()?.path_of(KERNELSU)?.to_path_buf();

        let mut cmd = ctx.pipeline.env.command("git", Some(&ksu))?;
        cmd.args(["rev-list", "--count", "HEAD"]);
        let raw = ctx.capture_cmd(cmd)?;
        let count: u64 = raw.trim().parse().map_err(|e| {
            Error::patch(format!("unexpected commit count '{}': {e}", raw.trim()))
        })?;
        let version = ksu_git_version(count);
        ctx.pipeline
            .env
            .set_var("KSU_GIT_VERSION", version.to_string());
        ctx.log(&format!("KSU_GIT_VERSION={version}"));

        Transform::new(KERNELSU_INTEGRATION)
            .edit(Edit::Symlink {
                target: ksu.join("kernel"),
                link: catalog::KSU_LINK.into(),
            })
            .edit(Edit::AppendText {
                file: catalog::KSU_MAKEFILE.into(),
                text: catalog::KSU_MAKEFILE_LINE.into(),
            })
            .edit(Edit::InsertBefore {
                file: catalog::KSU_KCONFIG.into(),
                anchor: "endmenu".into(),
                line: catalog::KSU_KCONFIG_SOURCE.into(),
            })
            .apply(&tree.kernel)?;

        // 4.14 trees take the compat patch on the KernelSU side.
        let target = if tree.kv.is_4_14() { &ksu } else { &tree.kernel };
        let env = ctx.pipeline.env.clone();
        let compat = tree.patch_dir().join(KERNELSU_COMPAT_PATCH);
        apply_patch_file(&mut *ctx, &env, target, &compat)?;

        ctx.pipeline.fragment.extend_from(KSU_CONFIGS);
        Ok(())
    }
}

/// The out-of-tree RTL8812AU driver is opt-in.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VendorDriverStep {
    pub enabled: bool,
    pub label: Option<String>,
}

#[Stage(
    id = "kernel.vendor_driver",
    module = "kernel",
    phase = "patch",
    config = VendorDriverStep,
    provides = ["patch:vendor-driver"],
    after = ["patch:kernel", "patch:ksu?"],
    when = ["!build.clean_only"],
    default_label = "Add RTL8812AU driver"
)]
pub struct VendorDriverStage;

impl VendorDriverStage {
    pub fn run(_cfg: &VendorDriverStep, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tree = TreeCtx::load(doc, ctx)?;
        let src = ctx.resources()?.path_of(RTL8812AU)?.to_path_buf();
        let dest = Path::new(catalog::RTL8812AU_DEST);

        if tree.kernel.join(dest).exists() {
            return Err(Error::patch(format!(
                "{} already exists in {}",
                dest.display(),
                tree.kernel.display()
            )));
        }
        copy_dir_filtered(&src, &tree.kernel.join(dest), is_git_metadata)?;

        let mut transform = Transform::new(RTL8812AU_DRIVER);
        for (file, pairs) in catalog::RTL8812AU_SUBSTITUTIONS {
            transform = transform.edit(Edit::Substitute {
                file: dest.join(file),
                pairs: substitution_pairs(pairs),
            });
        }
        transform
            .edit(Edit::AppendText {
                file: catalog::REALTEK_MAKEFILE.into(),
                text: catalog::REALTEK_MAKEFILE_LINE.into(),
            })
            .edit(Edit::InsertBefore {
                file: catalog::WIRELESS_KCONFIG.into(),
                anchor: "endif".into(),
                line: catalog::RTL8812AU_KCONFIG_SOURCE.into(),
            })
            .apply(&tree.kernel)?;
        ctx.log(&format!("installed driver into {}", dest.display()));
        Ok(())
    }
}

#[Stage(
    id = "kernel.base_extras",
    module = "kernel",
    phase = "patch",
    config = StepToggle,
    provides = ["patch:base-extras"],
    after = ["patch:kernel", "patch:ksu?", "patch:vendor-driver?"],
    when = ["!build.clean_only"],
    default_label = "Base-specific fixes"
)]
pub struct BaseExtrasStage;

impl BaseExtrasStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tree = TreeCtx::load(doc, ctx)?;
        if tree.build.base != Base::Pa {
            ctx.log(&format!("no extra fixes for base '{}'", tree.build.base));
            return Ok(());
        }

        if tree.kv == KernelVersion::new(4, 4) {
            let env = ctx.pipeline.env.clone();
            let qcacld = tree.patch_dir().join(QCACLD_PA_PATCH);
            apply_patch_file(&mut *ctx, &env, &tree.kernel, &qcacld)?;
        }

        Transform::new(IPA_HEADER)
            .edit(Edit::Substitute {
                file: catalog::IPA_FILE.into(),
                pairs: substitution_pairs(&[catalog::IPA_HEADER_FIX]),
            })
            .apply(&tree.kernel)?;
        ctx.log(&format!("patched {}", catalog::IPA_FILE));
        Ok(())
    }
}

#[Stage(
    id = "kernel.defconfig",
    module = "kernel",
    phase = "defconfig",
    config = StepToggle,
    provides = ["kernel:defconfig"],
    after = ["kernel:verified", "patch:done?"],
    when = ["!build.clean_only"],
    default_label = "Finalize defconfig",
    core = true
)]
pub struct DefconfigStage;

impl DefconfigStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tree = TreeCtx::load(doc, ctx)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let build = &tree.build;
        let defconfig = resolve_defconfig(
            &build.codename,
            build.base,
            tree.kv,
            build.defconfig.as_deref(),
        )?;
        let dest = defconfig.path_in(&tree.kernel);

        if let Some(src) = &defconfig.source {
            let src = ws.resolve_config_path(&src.to_string_lossy())?;
            if !src.is_file() {
                return Err(Error::config(format!(
                    "defconfig override {} does not exist",
                    src.display()
                )));
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest)?;
            ctx.log(&format!("copied {} to {}", src.display(), dest.display()));
            return Ok(());
        }

        let fragment = defconfig_fragment(&ctx.pipeline.fragment);
        let existing = fs::read_to_string(&dest).map_err(|e| {
            Error::patch(format!("failed to read {}: {e}", dest.display()))
        })?;
        let mut text = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&fragment.render());

        let rel = dest
            .strip_prefix(&tree.kernel)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        Transform::new(DEFCONFIG_FRAGMENT)
            .edit(Edit::AppendText {
                file: rel.to_path_buf(),
                text,
            })
            .apply(&tree.kernel)?;
        ctx.log(&format!(
            "appended {} options to {}",
            fragment.render().lines().count(),
            defconfig.target()
        ));
        Ok(())
    }
}

/// Baseline options followed by whatever the patch stages contributed.
pub fn defconfig_fragment(contributed: &ConfigFragment) -> ConfigFragment {
    let mut out = ConfigFragment::default();
    out.extend_from(BASELINE_CONFIGS);
    out.merge(contributed);
    out
}

#[Module(
    id = "kernel",
    detect = "build",
    config = KernelConfig,
    config_path = "kernel",
    stages = [
        CleanStage,
        LocalversionStage,
        VerifyStage,
        PrototypesStage,
        AnyKernel3Stage,
        KernelPatchStage,
        KsuStage,
        VendorDriverStage,
        BaseExtrasStage,
        DefconfigStage
    ]
)]
pub struct KernelModule;
