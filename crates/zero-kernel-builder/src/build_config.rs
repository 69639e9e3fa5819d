use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigDoc;
use crate::defconfig::DeviceSeries;
use crate::error::{Error, Result};

/// ROM base the kernel sources are taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Base {
    /// LineageOS
    Los,
    /// Paranoid Android
    Pa,
    X,
}

impl Base {
    pub fn as_str(self) -> &'static str {
        match self {
            Base::Los => "los",
            Base::Pa => "pa",
            Base::X => "x",
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Base {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "los" => Ok(Base::Los),
            "pa" => Ok(Base::Pa),
            "x" => Ok(Base::X),
            other => Err(Error::config(format!(
                "unknown base '{other}' (expected one of: los, pa, x)"
            ))),
        }
    }
}

/// Linux `major.minor`, as in "4.14".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_4_14(self) -> bool {
        self == Self::new(4, 14)
    }

    /// Reads `VERSION = x` and `PATCHLEVEL = y` from a kernel top-level Makefile.
    pub fn parse_makefile(text: &str) -> Result<Self> {
        let field = |name: &str| -> Result<u32> {
            let re = Regex::new(&format!(r"(?m)^{name}\s*=\s*(\d+)\s*$"))
                .map_err(|e| Error::msg(format!("bad regex: {e}")))?;
            let caps = re.captures(text).ok_or_else(|| {
                Error::version_mismatch(format!("kernel Makefile has no {name} line"))
            })?;
            caps[1]
                .parse()
                .map_err(|e| Error::version_mismatch(format!("invalid {name} in Makefile: {e}")))
        };
        Ok(Self::new(field("VERSION")?, field("PATCHLEVEL")?))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for KernelVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || Error::config(format!("invalid kernel version '{s}' (expected e.g. 4.14)"));
        let (major, minor) = s.split_once('.').ok_or_else(bad)?;
        Ok(Self::new(
            major.parse().map_err(|_| bad())?,
            minor.parse().map_err(|_| bad())?,
        ))
    }
}

impl TryFrom<String> for KernelVersion {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<KernelVersion> for String {
    fn from(v: KernelVersion) -> Self {
        v.to_string()
    }
}

/// Per-invocation build request, read from `[build]`.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    pub codename: String,
    pub base: Base,
    pub kernel_version: KernelVersion,
    #[serde(default)]
    pub ksu: bool,
    #[serde(default)]
    pub defconfig: Option<PathBuf>,
    #[serde(default)]
    pub clean_only: bool,
    /// Overrides the host CPU count for `make -j`.
    #[serde(default)]
    pub jobs: Option<usize>,
}

impl BuildConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: BuildConfig = doc
            .deserialize_path("build")?
            .ok_or_else(|| Error::config("missing [build] table"))?;
        if cfg.codename.trim().is_empty() {
            return Err(Error::config("build.codename must not be empty"));
        }
        Ok(cfg)
    }

    /// Devices of one series share kernel sources and modifications.
    pub fn unified_codename(&self) -> String {
        unified_codename(&self.codename)
    }
}

/// Paths given on the command line are relative to where `zkb` was started,
/// not to the workspace root.
pub fn invocation_relative(cwd: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

/// Series name for known devices, the codename itself otherwise.
pub fn unified_codename(codename: &str) -> String {
    DeviceSeries::classify(codename)
        .map(|s| s.unified_codename().to_string())
        .unwrap_or_else(|_| codename.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn makefile_version_is_parsed() {
        let mk = "# SPDX-License-Identifier: GPL-2.0\nVERSION = 4\nPATCHLEVEL = 14\nSUBLEVEL = 190\nEXTRAVERSION =\n";
        assert_eq!(KernelVersion::parse_makefile(mk).unwrap(), KernelVersion::new(4, 14));
    }

    #[test]
    fn command_line_paths_follow_the_invocation_dir() {
        let cwd = Path::new("/home/dev/configs");
        assert_eq!(
            invocation_relative(cwd, Path::new("custom_defconfig")),
            PathBuf::from("/home/dev/configs/custom_defconfig")
        );
        assert_eq!(
            invocation_relative(cwd, Path::new("/opt/zkb/custom_defconfig")),
            PathBuf::from("/opt/zkb/custom_defconfig")
        );
    }

    #[test]
    fn makefile_without_patchlevel_is_rejected() {
        assert!(KernelVersion::parse_makefile("VERSION = 4\n").is_err());
    }

    #[test]
    fn build_table_deserializes() {
        let doc = ConfigDoc {
            path: "<mem>".into(),
            value: toml::from_str(
                "[build]\ncodename = \"cheeseburger\"\nbase = \"pa\"\nkernel_version = \"4.14\"\nksu = true\n",
            )
            .unwrap(),
        };
        let cfg = BuildConfig::from_doc(&doc).unwrap();
        assert_eq!(cfg.base, Base::Pa);
        assert!(cfg.kernel_version.is_4_14());
        assert!(cfg.ksu);
        assert_eq!(cfg.unified_codename(), "dumplinger");
    }

    #[test]
    fn unknown_base_is_a_config_error() {
        let doc = ConfigDoc {
            path: "<mem>".into(),
            value: toml::from_str(
                "[build]\ncodename = \"dumpling\"\nbase = \"aosp\"\nkernel_version = \"4.4\"\n",
            )
            .unwrap(),
        };
        let err = BuildConfig::from_doc(&doc).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn unified_codename_is_total() {
        assert_eq!(unified_codename("dumpling"), "dumplinger");
        assert_eq!(unified_codename("cheeseburger"), "dumplinger");
        assert_eq!(unified_codename("guacamoleb"), "guacamoles");
        assert_eq!(unified_codename("enchilada"), "enchilada");
        assert_eq!(unified_codename(""), "");
    }
}
