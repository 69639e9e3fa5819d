//! Tool and device manifests and the resolved resource table built from them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::build_config::{Base, KernelVersion};
use crate::error::{Error, Result};
use crate::workspace::WorkspacePaths;

/// Well-known resource names used by pipeline stages.
pub const ANYKERNEL3: &str = "AnyKernel3";
pub const KERNELSU: &str = "KernelSU";
pub const CLANG: &str = "clang";
pub const RTL8812AU: &str = "rtl8812au";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Tar archive (plain, gzip, bzip2 or xz) extracted into the target path.
    Generic,
    Git,
}

/// One manifest entry as written in JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSpec {
    pub path: String,
    pub url: String,
    #[serde(alias = "type")]
    pub kind: ResourceKind,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
}

impl ResourceSpec {
    fn validate(&self, name: &str) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::config(format!("resource '{name}': empty path")));
        }
        if self.url.trim().is_empty() {
            return Err(Error::config(format!("resource '{name}': empty url")));
        }
        if self.kind == ResourceKind::Git && non_empty(&self.branch).is_none() {
            return Err(Error::config(format!(
                "resource '{name}': git entries require a branch"
            )));
        }
        Ok(())
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_spec(name: &str, value: serde_json::Value) -> Result<ResourceSpec> {
    let spec: ResourceSpec = serde_json::from_value(value)
        .map_err(|e| Error::config(format!("resource '{name}': {e}")))?;
    spec.validate(name)?;
    Ok(spec)
}

/// A manifest entry bound to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub name: String,
    /// Absolute, under the workspace root.
    pub path: PathBuf,
    pub url: String,
    pub kind: ResourceKind,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

impl ResourceEntry {
    pub fn bind(name: &str, spec: &ResourceSpec, ws: &WorkspacePaths) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            path: ws.resolve_under_root(&spec.path)?,
            url: spec.url.trim().to_string(),
            kind: spec.kind,
            branch: non_empty(&spec.branch).map(str::to_string),
            commit: non_empty(&spec.commit).map(str::to_string),
        })
    }
}

/// Shared tools in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ToolManifest {
    entries: Vec<(String, ResourceSpec)>,
}

impl ToolManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let entries = map
            .into_iter()
            .map(|(name, v)| -> Result<(String, ResourceSpec)> {
                let spec = parse_spec(&name, v)?;
                Ok((name, spec))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read tool manifest {}: {e}", path.display()))
        })?;
        Self::from_json(&text).map_err(|e| e.context(path.display()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceKey {
    pub codename: String,
    pub kernel_version: KernelVersion,
    pub base: Base,
}

/// Kernel sources per (codename, kernel version, base), validated at load.
#[derive(Debug, Clone, Default)]
pub struct DeviceManifest {
    entries: BTreeMap<DeviceKey, ResourceSpec>,
}

type RawDevices = BTreeMap<String, BTreeMap<String, BTreeMap<String, serde_json::Value>>>;

impl DeviceManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawDevices = serde_json::from_str(text)?;
        let mut entries = BTreeMap::new();
        for (codename, versions) in raw {
            for (kv, bases) in versions {
                let kernel_version: KernelVersion = kv
                    .parse()
                    .map_err(|e: Error| e.context(format!("device '{codename}'")))?;
                for (base, v) in bases {
                    let base: Base = base
                        .parse()
                        .map_err(|e: Error| e.context(format!("device '{codename}/{kv}'")))?;
                    let spec = parse_spec(&format!("{codename}/{kv}/{base}"), v)?;
                    entries.insert(
                        DeviceKey {
                            codename: codename.clone(),
                            kernel_version,
                            base,
                        },
                        spec,
                    );
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read device manifest {}: {e}", path.display()))
        })?;
        Self::from_json(&text).map_err(|e| e.context(path.display()))
    }

    pub fn lookup(&self, codename: &str, kernel_version: KernelVersion, base: Base) -> Result<&ResourceSpec> {
        let key = DeviceKey {
            codename: codename.to_string(),
            kernel_version,
            base,
        };
        self.entries.get(&key).ok_or_else(|| {
            Error::config(format!(
                "unsupported build: no kernel source for {codename} / {kernel_version} / {base}"
            ))
        })
    }
}

/// Ordered union of the tools and the selected kernel source.
#[derive(Debug, Clone, Default)]
pub struct ResolvedResourceTable {
    entries: Vec<ResourceEntry>,
}

impl ResolvedResourceTable {
    pub fn entries(&self) -> &[ResourceEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ResourceEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&ResourceEntry> {
        self.get(name)
            .ok_or_else(|| Error::config(format!("resource '{name}' is not declared in the manifests")))
    }

    pub fn path_of(&self, name: &str) -> Result<&Path> {
        Ok(self.require(name)?.path.as_path())
    }
}

/// The device entry is named after the codename. It replaces a tool of the same name,
/// otherwise it is appended last.
pub fn merge(
    tools: &ToolManifest,
    device: Option<(&str, &ResourceSpec)>,
    ws: &WorkspacePaths,
) -> Result<ResolvedResourceTable> {
    let mut entries = tools
        .entries
        .iter()
        .map(|(name, spec)| ResourceEntry::bind(name, spec, ws))
        .collect::<Result<Vec<_>>>()?;

    if let Some((codename, spec)) = device {
        let entry = ResourceEntry::bind(codename, spec, ws)?;
        match entries.iter_mut().find(|e| e.name == codename) {
            Some(slot) => *slot = entry,
            None => entries.push(entry),
        }
    }
    Ok(ResolvedResourceTable { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const TOOLS: &str = r#"{
        "clang": {"path": "clang-r450784e", "url": "https://example.invalid/clang.tar.gz", "type": "generic"},
        "AnyKernel3": {"path": "AnyKernel3", "url": "https://github.com/osm0sis/AnyKernel3", "type": "git", "branch": "master", "commit": ""},
        "KernelSU": {"path": "KernelSU", "url": "https://github.com/tiann/KernelSU", "kind": "git", "branch": "main"}
    }"#;

    fn ws() -> WorkspacePaths {
        let root = PathBuf::from("/w");
        WorkspacePaths {
            build_dir: root.join("build"),
            out_dir: root.join("kernel"),
            root,
        }
    }

    #[test]
    fn tool_order_is_preserved() {
        let tools = ToolManifest::from_json(TOOLS).unwrap();
        assert_eq!(tools.names().collect::<Vec<_>>(), vec!["clang", "AnyKernel3", "KernelSU"]);
    }

    #[test]
    fn empty_commit_reads_as_none() {
        let tools = ToolManifest::from_json(TOOLS).unwrap();
        let table = merge(&tools, None, &ws()).unwrap();
        assert_eq!(table.require("AnyKernel3").unwrap().commit, None);
        assert_eq!(table.path_of("clang").unwrap(), Path::new("/w/clang-r450784e"));
    }

    #[test]
    fn git_entry_without_branch_is_rejected() {
        let err = ToolManifest::from_json(
            r#"{"KernelSU": {"path": "KernelSU", "url": "https://x", "type": "git"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn device_entry_is_appended_under_codename() {
        let tools = ToolManifest::from_json(TOOLS).unwrap();
        let devices = DeviceManifest::from_json(
            r#"{"dumpling": {"4.4": {"los": {"path": "dumpling", "url": "https://x/kernel", "type": "git", "branch": "lineage-20"}}}}"#,
        )
        .unwrap();
        let spec = devices
            .lookup("dumpling", KernelVersion::new(4, 4), Base::Los)
            .unwrap();
        let table = merge(&tools, Some(("dumpling", spec)), &ws()).unwrap();
        let names: Vec<_> = table.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["clang", "AnyKernel3", "KernelSU", "dumpling"]);
    }

    #[test]
    fn missing_device_triple_is_a_config_error() {
        let devices = DeviceManifest::from_json(
            r#"{"dumpling": {"4.4": {"los": {"path": "dumpling", "url": "https://x", "type": "git", "branch": "b"}}}}"#,
        )
        .unwrap();
        let err = devices
            .lookup("dumpling", KernelVersion::new(4, 14), Base::Los)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn unknown_base_key_fails_at_load() {
        let err = DeviceManifest::from_json(
            r#"{"dumpling": {"4.4": {"aosp": {"path": "d", "url": "https://x", "type": "git", "branch": "b"}}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
