use serde::Deserialize;

use zero_kernel_builder_macros::{Module, Stage};

use crate::build_config::BuildConfig;
use crate::config::ConfigDoc;
use crate::defconfig::resolve_defconfig;
use crate::environment::export_path;
use crate::executor::ExecCtx;
use crate::launcher::HttpFetcher;
use crate::manifest::{self, DeviceManifest, ToolManifest};
use crate::resolver;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_tools_manifest() -> String {
    "manifests/tools.json".into()
}

fn default_devices_manifest() -> String {
    "manifests/devices.json".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Shared toolchain manifest, relative to the workspace root.
    pub tools: String,
    /// Kernel source manifest, only read when a build is requested.
    pub devices: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tools: default_tools_manifest(),
            devices: default_devices_manifest(),
        }
    }
}

#[Stage(
    id = "resources.manifest",
    module = "resources",
    phase = "manifest",
    provides = ["resources:table"],
    after = ["core.init"],
    default_label = "Load manifests",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestStage {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ManifestStage {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ManifestStage {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let res: ResourcesConfig = doc.deserialize_path("resources")?.unwrap_or_default();

        let tools_path = ws.resolve_config_path(&res.tools)?;
        ctx.log(&format!("tool manifest: {}", tools_path.display()));
        let tools = ToolManifest::load(&tools_path)?;

        let table = if doc.has_table_path("build") {
            let build = BuildConfig::from_doc(doc)?;
            // Unsupported device/base combinations fail here, before any tree is touched.
            resolve_defconfig(
                &build.codename,
                build.base,
                build.kernel_version,
                build.defconfig.as_deref(),
            )?;

            let devices_path = ws.resolve_config_path(&res.devices)?;
            ctx.log(&format!("device manifest: {}", devices_path.display()));
            let devices = DeviceManifest::load(&devices_path)?;
            let spec = devices.lookup(&build.codename, build.kernel_version, build.base)?;
            manifest::merge(&tools, Some((build.codename.as_str(), spec)), &ws)?
        } else {
            ctx.log("no build requested; only shared tools are installed");
            manifest::merge(&tools, None, &ws)?
        };

        for entry in table.entries() {
            ctx.log(&format!("{} -> {}", entry.name, entry.path.display()));
        }
        ctx.pipeline.resources = Some(table);
        Ok(())
    }
}

#[Stage(
    id = "resources.fetch",
    module = "resources",
    phase = "fetch",
    provides = ["resources:fetched"],
    after = ["resources:table"],
    default_label = "Fetch tools and sources",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchStage {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for FetchStage {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl FetchStage {
    pub fn run(_cfg: &Self, _doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let table = ctx.resources()?.clone();
        let env = ctx.pipeline.env.clone();
        let mut fetcher = HttpFetcher::new()?;

        let report = resolver::resolve(&table, &env, &mut *ctx, &mut fetcher)?;
        ctx.log(&format!(
            "resolved: cloned={} downloaded={} extracted={} relocated={} skipped={}",
            report.cloned.len(),
            report.downloaded.len(),
            report.extracted.len(),
            report.relocated.len(),
            report.skipped.len()
        ));
        Ok(())
    }
}

#[Stage(
    id = "resources.path",
    module = "resources",
    phase = "path",
    provides = ["resources:path"],
    after = ["resources:fetched"],
    default_label = "Export tool paths",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathStage {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for PathStage {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl PathStage {
    pub fn run(_cfg: &Self, _doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let pipeline = &mut ctx.pipeline;
        let table = pipeline
            .resources
            .as_ref()
            .ok_or_else(|| Error::msg("resource table not loaded"))?;
        export_path(table, &mut pipeline.env);
        let dirs: Vec<String> = pipeline
            .env
            .bin_paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        ctx.log(&format!("search path prefix: {}", dirs.join(":")));
        Ok(())
    }
}

#[Module(
    id = "resources",
    detect = "*",
    config = ResourcesConfig,
    config_path = "resources",
    stages = [ManifestStage, FetchStage, PathStage]
)]
pub struct ResourcesModule;
