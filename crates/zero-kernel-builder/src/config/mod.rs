use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "zkb.toml";

/// Workspace configuration after `extends`/`imports` have been inlined.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    /// Layer caller-supplied values (CLI flags) over the loaded document.
    pub fn overlay(&mut self, overlay: Value) {
        merge_values(&mut self.value, overlay);
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = parse_imports(file_path, tbl)?;
    tbl.remove("imports");
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value_inner(&resolve_ref_path(file_path, &imp), stack)?;
            merge_values(&mut acc, loaded);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    inline_imports(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Load `path` if it exists; a missing default config yields an empty document.
pub fn load_or_empty(path: &Path) -> Result<ConfigDoc> {
    if path.is_file() {
        load(path)
    } else {
        Ok(ConfigDoc::empty(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_replaces_leaves_and_keeps_siblings() {
        let mut doc = ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str(
                r#"
[build]
codename = "dumpling"
ksu = false

[workspace]
out_dir = "kernel"
"#,
            )
            .unwrap(),
        };
        doc.overlay(toml::from_str("[build]\nksu = true\n").unwrap());

        assert_eq!(doc.value_path("build.ksu").and_then(Value::as_bool), Some(true));
        assert_eq!(
            doc.value_path("build.codename").and_then(Value::as_str),
            Some("dumpling")
        );
        assert!(doc.has_table_path("workspace"));
    }

    #[test]
    fn extends_and_imports_are_inlined() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.toml"),
            "[workspace]\nout_dir = \"kernel\"\n[project]\nname = \"zero\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("devices.toml"), "devices = \"m/devices.json\"\n").unwrap();
        fs::write(
            dir.path().join("zkb.toml"),
            "extends = \"base.toml\"\n[project]\nversion = \"1.2.0\"\n[resources]\nimports = [\"devices.toml\"]\n",
        )
        .unwrap();

        let doc = load(&dir.path().join("zkb.toml")).unwrap();
        assert_eq!(
            doc.value_path("project.name").and_then(Value::as_str),
            Some("zero")
        );
        assert_eq!(
            doc.value_path("project.version").and_then(Value::as_str),
            Some("1.2.0")
        );
        assert_eq!(
            doc.value_path("resources.devices").and_then(Value::as_str),
            Some("m/devices.json")
        );
        assert!(doc.value_path("extends").is_none());
    }

    #[test]
    fn missing_default_config_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let doc = load_or_empty(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert!(doc.table_path("").map(|t| t.is_empty()).unwrap_or(false));
    }
}
