use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::Compression;
use flate2::write::GzEncoder;

use zero_kernel_builder::build_config::{Base, KernelVersion};
use zero_kernel_builder::environment::Environment;
use zero_kernel_builder::launcher::{Fetcher, Launcher};
use zero_kernel_builder::manifest::{self, DeviceManifest, ResolvedResourceTable, ToolManifest};
use zero_kernel_builder::resolver;
use zero_kernel_builder::workspace::WorkspacePaths;
use zero_kernel_builder::{Error, ErrorKind, Result};

const TOOLS: &str = r#"{
    "clang": {"path": "clang-r450784e", "url": "https://example.invalid/clang-r450784e.tar.gz", "kind": "generic"},
    "AnyKernel3": {"path": "AnyKernel3", "url": "https://github.com/osm0sis/AnyKernel3", "kind": "git", "branch": "master"},
    "KernelSU": {"path": "KernelSU", "url": "https://github.com/tiann/KernelSU", "type": "git", "branch": "main"}
}"#;

const DEVICES: &str = r#"{
    "dumpling": {
        "4.4": {
            "los": {"path": "dumpling", "url": "https://github.com/LineageOS/android_kernel_oneplus_msm8998", "kind": "git", "branch": "lineage-20", "commit": "0123abc"}
        }
    }
}"#;

/// Records commands; a clone creates its target directory (the last argument).
#[derive(Default)]
struct FakeLauncher {
    commands: Vec<Vec<String>>,
    fail_clone: bool,
}

impl Launcher for FakeLauncher {
    fn launch(&mut self, cmd: Command) -> Result<()> {
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        self.commands.push(args.clone());
        if args.first().map(String::as_str) == Some("clone") {
            let dest = PathBuf::from(args.last().unwrap());
            fs::create_dir_all(dest.join(".git")).unwrap();
            if self.fail_clone {
                return Err(Error::msg("fatal: unable to access remote"));
            }
        }
        Ok(())
    }

    fn capture(&mut self, cmd: Command) -> Result<String> {
        self.launch(cmd).map(|()| String::new())
    }

    fn log(&self, _msg: &str) {}
}

/// Serves a small gzip tarball for every URL.
#[derive(Default)]
struct FakeFetcher {
    urls: Vec<String>,
}

impl Fetcher for FakeFetcher {
    fn fetch(&mut self, url: &str, dest: &Path) -> Result<()> {
        self.urls.push(url.to_string());
        let enc = GzEncoder::new(File::create(dest)?, Compression::default());
        let mut tar = tar::Builder::new(enc);
        let data = b"#!/bin/sh\necho clang version 17.0.2\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        tar.append_data(&mut header, "bin/clang", &data[..])?;
        tar.into_inner()?.finish()?;
        Ok(())
    }
}

fn workspace(root: &Path) -> WorkspacePaths {
    WorkspacePaths {
        root: root.to_path_buf(),
        build_dir: root.join("build"),
        out_dir: root.join("kernel"),
    }
}

fn scenario_a_table(ws: &WorkspacePaths) -> ResolvedResourceTable {
    let tools = ToolManifest::from_json(TOOLS).unwrap();
    let devices = DeviceManifest::from_json(DEVICES).unwrap();
    let spec = devices
        .lookup("dumpling", KernelVersion::new(4, 4), Base::Los)
        .unwrap();
    manifest::merge(&tools, Some(("dumpling", spec)), ws).unwrap()
}

fn clone_of<'a>(launcher: &'a FakeLauncher, url: &str) -> &'a Vec<String> {
    launcher
        .commands
        .iter()
        .find(|c| c.first().map(String::as_str) == Some("clone") && c.iter().any(|a| a == url))
        .unwrap_or_else(|| panic!("no clone of {url}: {:?}", launcher.commands))
}

#[test]
fn first_resolve_materializes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path());
    let table = scenario_a_table(&ws);
    let env = Environment::new(dir.path());
    let mut launcher = FakeLauncher::default();
    let mut fetcher = FakeFetcher::default();

    let report = resolver::resolve(&table, &env, &mut launcher, &mut fetcher).unwrap();

    assert_eq!(report.downloaded, vec!["clang"]);
    assert_eq!(report.extracted, vec!["clang"]);
    assert_eq!(report.cloned, vec!["AnyKernel3", "KernelSU", "dumpling"]);
    assert!(dir.path().join("clang-r450784e/bin/clang").is_file());
    assert!(!dir.path().join("clang-r450784e.tar.gz").exists());

    let ak3 = clone_of(&launcher, "https://github.com/osm0sis/AnyKernel3");
    assert!(ak3.windows(2).any(|w| w[0] == "--depth" && w[1] == "1"));
    assert!(ak3.iter().any(|a| a == "--shallow-submodules"));

    let ksu = clone_of(&launcher, "https://github.com/tiann/KernelSU");
    assert!(!ksu.iter().any(|a| a == "--depth"));

    let kernel = clone_of(
        &launcher,
        "https://github.com/LineageOS/android_kernel_oneplus_msm8998",
    );
    assert!(!kernel.iter().any(|a| a == "--depth"));
    assert!(
        launcher
            .commands
            .iter()
            .any(|c| c == &vec!["checkout".to_string(), "0123abc".to_string()])
    );
}

#[test]
fn second_resolve_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path());
    let table = scenario_a_table(&ws);
    let env = Environment::new(dir.path());
    let mut launcher = FakeLauncher::default();
    let mut fetcher = FakeFetcher::default();

    resolver::resolve(&table, &env, &mut launcher, &mut fetcher).unwrap();
    let commands = launcher.commands.len();
    let fetches = fetcher.urls.len();

    let report = resolver::resolve(&table, &env, &mut launcher, &mut fetcher).unwrap();
    assert!(report.is_noop());
    assert_eq!(report.skipped.len(), table.entries().len());
    assert_eq!(launcher.commands.len(), commands);
    assert_eq!(fetcher.urls.len(), fetches);
}

#[test]
fn extracted_directory_in_root_is_moved_into_place() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path());
    let tools = ToolManifest::from_json(
        r#"{"clang": {"path": "toolchains/clang", "url": "https://example.invalid/clang-r450784e.tar.gz/download", "kind": "generic"}}"#,
    )
    .unwrap();
    let table = manifest::merge(&tools, None, &ws).unwrap();
    fs::create_dir_all(dir.path().join("clang-r450784e/bin")).unwrap();

    let mut launcher = FakeLauncher::default();
    let mut fetcher = FakeFetcher::default();
    let report = resolver::resolve(
        &table,
        &Environment::new(dir.path()),
        &mut launcher,
        &mut fetcher,
    )
    .unwrap();

    assert_eq!(report.relocated, vec!["clang"]);
    assert!(fetcher.urls.is_empty());
    assert!(dir.path().join("toolchains/clang/bin").is_dir());
    assert!(!dir.path().join("clang-r450784e").exists());
}

#[test]
fn failed_clone_leaves_no_partial_tree() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path());
    let tools = ToolManifest::from_json(
        r#"{"AnyKernel3": {"path": "AnyKernel3", "url": "https://github.com/osm0sis/AnyKernel3", "kind": "git", "branch": "master"}}"#,
    )
    .unwrap();
    let table = manifest::merge(&tools, None, &ws).unwrap();

    let mut launcher = FakeLauncher {
        fail_clone: true,
        ..Default::default()
    };
    let err = resolver::resolve(
        &table,
        &Environment::new(dir.path()),
        &mut launcher,
        &mut FakeFetcher::default(),
    )
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceAcquisition);
    assert!(!dir.path().join("AnyKernel3").exists());
}

#[test]
fn unknown_resource_kind_is_rejected_at_load() {
    let err = ToolManifest::from_json(
        r#"{"gcc": {"path": "gcc", "url": "ftp://example.invalid/gcc.tar.gz", "kind": "ftp"}}"#,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn unsupported_device_triple_is_a_config_error() {
    let devices = DeviceManifest::from_json(DEVICES).unwrap();
    let err = devices
        .lookup("dumpling", KernelVersion::new(4, 14), Base::Los)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
