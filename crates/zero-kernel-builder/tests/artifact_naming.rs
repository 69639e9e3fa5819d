use std::fs::{self, File};

use zero_kernel_builder::build_config::{Base, KernelVersion};
use zero_kernel_builder::modules::package::{
    ProjectMeta, artifact_name, excluded_from_zip, write_flashable_zip,
};

fn meta() -> ProjectMeta {
    ProjectMeta {
        name: "zero".into(),
        version: "1.2".into(),
    }
}

#[test]
fn ksu_suffix_follows_the_flag() {
    for base in [Base::Los, Base::Pa, Base::X] {
        for kv in [KernelVersion::new(4, 4), KernelVersion::new(4, 14)] {
            let plain = artifact_name(&meta(), "dumplinger", base, kv, false);
            let ksu = artifact_name(&meta(), "dumplinger", base, kv, true);
            assert!(!plain.contains("-ksu"), "{plain}");
            assert!(ksu.ends_with("-ksu.zip"), "{ksu}");
        }
    }
}

#[test]
fn name_layout() {
    assert_eq!(
        artifact_name(&meta(), "dumplinger", Base::Los, KernelVersion::new(4, 4), false),
        "zero-1.2-dumplinger-los-4.4.zip"
    );
    assert_eq!(
        artifact_name(&meta(), "dumplinger", Base::Pa, KernelVersion::new(4, 14), true),
        "zero-1.2-dumplinger-pa-4.14-ksu.zip"
    );
}

#[test]
fn exclusion_patterns() {
    assert!(excluded_from_zip(".git"));
    assert!(excluded_from_zip(".gitignore"));
    assert!(excluded_from_zip("README.md"));
    assert!(excluded_from_zip("LICENSE"));
    assert!(excluded_from_zip("ramdisk/placeholder"));
    assert!(!excluded_from_zip("anykernel.sh"));
    assert!(!excluded_from_zip("META-INF/com/google/android/update-binary"));
}

#[test]
fn zip_contains_only_flashable_files() {
    let dir = tempfile::tempdir().unwrap();
    let ak3 = dir.path().join("AnyKernel3");
    for rel in [
        "anykernel.sh",
        "Image.gz-dtb",
        "README.md",
        "modules/placeholder",
        ".git/HEAD",
        "META-INF/com/google/android/update-binary",
    ] {
        let p = ak3.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, rel).unwrap();
    }

    let dest = dir.path().join("out.zip");
    let count = write_flashable_zip(&ak3, &dest, 9).unwrap();
    assert_eq!(count, 3);

    let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "Image.gz-dtb",
            "META-INF/com/google/android/update-binary",
            "anykernel.sh"
        ]
    );
}
