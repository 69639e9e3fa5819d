use std::fs;
use std::path::Path;

use zero_kernel_builder::ErrorKind;
use zero_kernel_builder::build_config::{Base, KernelVersion};
use zero_kernel_builder::modules::kernel::{KERNELSU_INTEGRATION, STRICT_PROTOTYPES};
use zero_kernel_builder::patch::catalog::{self, PrototypeFix, strict_prototypes_catalog};
use zero_kernel_builder::patch::{
    Edit, LEDGER_FILE, Transform, TransformLedger, ksu_git_version, list_patch_files,
    strict_prototype_pairs,
};

const VOICE_SVC: &str = "drivers/soc/qcom/qdsp6v2/voice_svc.c";
const TARGET_IF: &str = "drivers/staging/qca-wifi-host-cmn/target_if/core/src/target_if_main.c";

fn files(fixes: &[PrototypeFix]) -> Vec<&'static str> {
    fixes.iter().map(|f| f.file).collect()
}

fn prototypes_transform(fixes: &[PrototypeFix]) -> Transform {
    fixes.iter().fold(Transform::new(STRICT_PROTOTYPES), |t, fix| {
        t.edit(Edit::Substitute {
            file: fix.file.into(),
            pairs: strict_prototype_pairs(fix.signatures),
        })
    })
}

fn write(root: &Path, rel: &str, text: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, text).unwrap();
}

#[test]
fn catalog_selection_depends_on_version_and_base_only() {
    let pa_414 = files(&strict_prototypes_catalog(KernelVersion::new(4, 14), Base::Pa));
    assert!(pa_414.contains(&TARGET_IF));
    assert!(!pa_414.contains(&VOICE_SVC));

    let los_44 = files(&strict_prototypes_catalog(KernelVersion::new(4, 4), Base::Los));
    assert!(los_44.contains(&VOICE_SVC));
    assert!(!los_44.contains(&TARGET_IF));

    assert_eq!(
        strict_prototypes_catalog(KernelVersion::new(4, 4), Base::Los),
        strict_prototypes_catalog(KernelVersion::new(4, 4), Base::X)
    );
    assert_eq!(
        strict_prototypes_catalog(KernelVersion::new(4, 9), Base::Pa),
        strict_prototypes_catalog(KernelVersion::new(4, 9), Base::Pa)
    );
}

#[test]
fn ksu_version_formula() {
    for count in [0u64, 1, 1234, 11_000] {
        assert_eq!(ksu_git_version(count), 10_000 + count + 200);
    }
}

#[test]
fn strict_prototypes_rewrite_empty_parameter_lists() {
    let dir = tempfile::tempdir().unwrap();
    let fixes = strict_prototypes_catalog(KernelVersion::new(4, 14), Base::Pa);
    for fix in &fixes {
        let body: String = fix
            .signatures
            .iter()
            .map(|s| format!("{s}\n{{\n}}\n"))
            .collect();
        write(dir.path(), fix.file, &body);
    }

    prototypes_transform(&fixes).apply(dir.path()).unwrap();

    let mux = fs::read_to_string(dir.path().join("drivers/char/diag/diag_mux.c")).unwrap();
    assert!(mux.contains("int diag_mux_init(void)"));
    assert!(mux.contains("void diag_mux_exit(void)"));
    assert!(!mux.contains("()"));
    assert!(TransformLedger::open(dir.path()).unwrap().contains(STRICT_PROTOTYPES));
}

#[test]
fn missing_catalog_file_is_fatal_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fixes = strict_prototypes_catalog(KernelVersion::new(4, 4), Base::Los);
    // Everything but the last file.
    for fix in &fixes[..fixes.len() - 1] {
        write(dir.path(), fix.file, &fix.signatures.join("\n"));
    }

    let err = prototypes_transform(&fixes).apply(dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PatchApplication);

    let first = fs::read_to_string(dir.path().join(fixes[0].file)).unwrap();
    assert!(first.contains("()"));
    assert!(!dir.path().join(LEDGER_FILE).exists());
}

#[test]
fn reapplying_a_transformation_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "net/mac80211/tx.c", "case IEEE80211_BAND_60GHZ:\n");
    let t = Transform::new(zero_kernel_builder::patch::TransformId::new("band", 1)).edit(
        Edit::AppendText {
            file: "net/mac80211/tx.c".into(),
            text: "/* zkb */\n".into(),
        },
    );

    t.apply(dir.path()).unwrap();
    let err = t.apply(dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PatchApplication);

    let text = fs::read_to_string(dir.path().join("net/mac80211/tx.c")).unwrap();
    assert_eq!(text.matches("/* zkb */").count(), 1);
}

#[cfg(unix)]
#[test]
fn kernelsu_is_wired_into_the_driver_tree() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dir.path().join("dumpling");
    let ksu = dir.path().join("KernelSU");
    fs::create_dir_all(ksu.join("kernel")).unwrap();
    write(&kernel, catalog::KSU_MAKEFILE, "obj-y += base/\n");
    write(
        &kernel,
        catalog::KSU_KCONFIG,
        "menu \"Device Drivers\"\nsource \"drivers/base/Kconfig\"\nendmenu\n",
    );

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
        .apply(&kernel)
        .unwrap();

    assert_eq!(
        fs::read_link(kernel.join(catalog::KSU_LINK)).unwrap(),
        ksu.join("kernel")
    );
    let makefile = fs::read_to_string(kernel.join(catalog::KSU_MAKEFILE)).unwrap();
    assert!(makefile.ends_with("obj-$(CONFIG_KSU)\t\t+= kernelsu/\n"));
    let kconfig = fs::read_to_string(kernel.join(catalog::KSU_KCONFIG)).unwrap();
    assert!(kconfig.contains("source \"drivers/kernelsu/Kconfig\"\nendmenu\n"));
}

#[test]
fn bulk_patches_skip_dedicated_ones() {
    let dir = tempfile::tempdir().unwrap();
    for name in [
        "0002-wifi.patch",
        "0001-display.patch",
        catalog::KERNELSU_COMPAT_PATCH,
        catalog::QCACLD_PA_PATCH,
        "notes.txt",
    ] {
        write(dir.path(), name, "");
    }

    let names: Vec<String> = list_patch_files(dir.path(), catalog::EXCLUDED_PATCHES)
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["0001-display.patch", "0002-wifi.patch"]);
}
