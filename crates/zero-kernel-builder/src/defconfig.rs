use std::fmt;
use std::path::{Path, PathBuf};

use crate::build_config::{Base, KernelVersion};
use crate::error::{Error, Result};

/// Device families sharing one kernel tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSeries {
    /// dumpling, cheeseburger
    OnePlus5,
    /// guacamole, guacamoleb, ...
    OnePlus7,
}

impl DeviceSeries {
    pub fn classify(codename: &str) -> Result<Self> {
        if matches!(codename, "dumpling" | "cheeseburger") {
            Ok(Self::OnePlus5)
        } else if codename.contains("guacamole") {
            Ok(Self::OnePlus7)
        } else {
            Err(Error::config(format!("unsupported device codename '{codename}'")))
        }
    }

    pub fn unified_codename(self) -> &'static str {
        match self {
            Self::OnePlus5 => "dumplinger",
            Self::OnePlus7 => "guacamoles",
        }
    }

    fn defconfig_name(self, base: Base, kv: KernelVersion) -> Option<&'static str> {
        let is_4_14 = kv.is_4_14();
        match (self, base) {
            (Self::OnePlus7, Base::Los) => Some("lineage_sm8150_defconfig"),
            (Self::OnePlus7, _) => None,
            (Self::OnePlus5, Base::Los) => Some("lineage_oneplus5_defconfig"),
            (Self::OnePlus5, Base::Pa) if is_4_14 => Some("vendor/paranoid_defconfig"),
            (Self::OnePlus5, Base::Pa) => Some("paranoid_defconfig"),
            (Self::OnePlus5, Base::X) if is_4_14 => Some("msm8998_oneplus_android_defconfig"),
            (Self::OnePlus5, Base::X) => Some("oneplus5_defconfig"),
        }
    }
}

impl fmt::Display for DeviceSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OnePlus5 => "OnePlus 5/5T",
            Self::OnePlus7 => "OnePlus 7 series",
        })
    }
}

/// Defconfig to build with, relative to `arch/arm64/configs/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defconfig {
    pub name: PathBuf,
    /// User-supplied file copied verbatim over `name`.
    pub source: Option<PathBuf>,
}

impl Defconfig {
    /// Location inside a kernel tree.
    pub fn path_in(&self, kernel: &Path) -> PathBuf {
        kernel.join("arch/arm64/configs").join(&self.name)
    }

    /// The make target, e.g. `vendor/paranoid_defconfig`.
    pub fn target(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }
}

pub fn resolve_defconfig(
    codename: &str,
    base: Base,
    kernel_version: KernelVersion,
    override_path: Option<&Path>,
) -> Result<Defconfig> {
    if let Some(src) = override_path {
        let name = src.file_name().ok_or_else(|| {
            Error::config(format!("defconfig override '{}' has no file name", src.display()))
        })?;
        return Ok(Defconfig {
            name: PathBuf::from(name),
            source: Some(src.to_path_buf()),
        });
    }

    let series = DeviceSeries::classify(codename)?;
    let name = series.defconfig_name(base, kernel_version).ok_or_else(|| {
        Error::config(format!(
            "base '{base}' is not supported for {series} ({codename})"
        ))
    })?;
    Ok(Defconfig {
        name: PathBuf::from(name),
        source: None,
    })
}

/// Ordered `CONFIG_*` assignments; setting a key again replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFragment {
    lines: Vec<(String, String)>,
}

impl ConfigFragment {
    pub fn set(&mut self, key: &str, value: &str) {
        match self.lines.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.lines.push((key.to_string(), value.to_string())),
        }
    }

    pub fn extend_from(&mut self, pairs: &[(&str, &str)]) {
        for (k, v) in pairs {
            self.set(k, v);
        }
    }

    /// Later values win; new keys keep `other`'s order.
    pub fn merge(&mut self, other: &ConfigFragment) {
        for (k, v) in &other.lines {
            self.set(k, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_uses_its_file_name() {
        let d = resolve_defconfig(
            "enchilada",
            Base::X,
            KernelVersion::new(4, 9),
            Some(Path::new("/home/u/my_defconfig")),
        )
        .unwrap();
        assert_eq!(d.name, PathBuf::from("my_defconfig"));
        assert_eq!(d.source.as_deref(), Some(Path::new("/home/u/my_defconfig")));
    }

    #[test]
    fn op7_only_supports_los() {
        let err = resolve_defconfig("guacamole", Base::Pa, KernelVersion::new(4, 14), None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn fragment_keeps_first_position_on_reset() {
        let mut f = ConfigFragment::default();
        f.extend_from(&[("CONFIG_MODULES", "y"), ("CONFIG_KSU", "y")]);
        f.set("CONFIG_MODULES", "n");
        assert_eq!(f.render(), "CONFIG_MODULES=n\nCONFIG_KSU=y\n");
    }
}
