use std::time::Instant;

use zero_kernel_builder_macros::{Module, Stage};

use crate::build_config::{Base, BuildConfig, KernelVersion};
use crate::config::ConfigDoc;
use crate::defconfig::resolve_defconfig;
use crate::executor::{ExecCtx, format_elapsed_hms};
use crate::modules::util::{ModuleToggle, StepToggle, kernel_tree, source_version};
use crate::{Error, ErrorKind, Result};

const COMMON_ARGS: &[&str] = &["O=out", "ARCH=arm64", "SUBARCH=arm64"];

const KERNEL_ARGS: &[&str] = &[
    "CROSS_COMPILE=llvm-",
    "CROSS_COMPILE_ARM32=arm-linux-androideabi-",
    "CLANG_TRIPLE=aarch64-linux-gnu-",
    "LLVM=1",
    "LLVM_IAS=1",
    "CXX=clang++",
    "AS=llvm-as",
];

/// The defconfig step followed by the kernel build, as `make` argument lists.
pub fn make_invocations(
    base: Base,
    kernel_version: KernelVersion,
    defconfig_target: &str,
    jobs: usize,
) -> [Vec<String>; 2] {
    let jobs = format!("-j{jobs}");

    let mut configure = vec![jobs.clone()];
    configure.extend(COMMON_ARGS.iter().map(|s| s.to_string()));
    configure.push(defconfig_target.to_string());
    configure.extend(["LLVM=1".to_string(), "LLVM_IAS=1".to_string()]);

    let mut build = vec![jobs];
    build.extend(COMMON_ARGS.iter().chain(KERNEL_ARGS).map(|s| s.to_string()));
    if base == Base::Pa && kernel_version.is_4_14() {
        build.extend(["LEX=flex".to_string(), "YACC=bison".to_string()]);
    }

    [configure, build]
}

#[Stage(
    id = "build.kernel",
    module = "build",
    phase = "compile",
    config = StepToggle,
    provides = ["build:image"],
    after = ["kernel:defconfig"],
    when = ["!build.clean_only"],
    default_label = "Build kernel",
    core = true
)]
pub struct CompileStage;

impl CompileStage {
    pub fn run(_cfg: &StepToggle, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::from_doc(doc)?;
        let kernel = kernel_tree(ctx, &build)?;
        let kv = source_version(ctx)?;
        let defconfig = resolve_defconfig(
            &build.codename,
            build.base,
            kv,
            build.defconfig.as_deref(),
        )?;
        let jobs = build.jobs.unwrap_or_else(num_cpus::get).max(1);
        ctx.log(&format!("launching the build with {jobs} jobs"));

        let start = Instant::now();
        for args in make_invocations(build.base, kv, &defconfig.target(), jobs) {
            let mut cmd = ctx.pipeline.env.command("make", Some(&kernel))?;
            cmd.args(&args);
            if let Err(e) = ctx.run_cmd(cmd) {
                let elapsed = format_elapsed_hms(start.elapsed().as_secs());
                return Err(e
                    .recast(ErrorKind::Build)
                    .context(format!("kernel build failed after {elapsed}")));
            }
        }

        let elapsed = format_elapsed_hms(start.elapsed().as_secs());
        tracing::info!(%elapsed, "kernel build finished");
        ctx.log(&format!("time spent for the build: {elapsed}"));

        let image = kernel.join("out/arch/arm64/boot/Image.gz-dtb");
        if !image.is_file() {
            return Err(Error::build(format!(
                "build finished but {} is missing",
                image.display()
            )));
        }
        Ok(())
    }
}

#[Module(
    id = "build",
    detect = "build",
    config = ModuleToggle,
    config_path = "build",
    stages = [CompileStage]
)]
pub struct BuildModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_step_names_the_defconfig() {
        let [configure, _] =
            make_invocations(Base::Los, KernelVersion::new(4, 4), "lineage_oneplus5_defconfig", 8);
        assert_eq!(
            configure,
            vec![
                "-j8",
                "O=out",
                "ARCH=arm64",
                "SUBARCH=arm64",
                "lineage_oneplus5_defconfig",
                "LLVM=1",
                "LLVM_IAS=1"
            ]
        );
    }

    #[test]
    fn pa_4_14_adds_lex_and_yacc() {
        let [_, build] =
            make_invocations(Base::Pa, KernelVersion::new(4, 14), "vendor/paranoid_defconfig", 4);
        assert!(build.ends_with(&["LEX=flex".to_string(), "YACC=bison".to_string()]));

        let [_, build] =
            make_invocations(Base::Pa, KernelVersion::new(4, 4), "paranoid_defconfig", 4);
        assert_eq!(build.last().map(String::as_str), Some("AS=llvm-as"));

        let [_, build] = make_invocations(
            Base::X,
            KernelVersion::new(4, 14),
            "msm8998_oneplus_android_defconfig",
            4,
        );
        assert!(!build.iter().any(|a| a == "LEX=flex"));
    }
}
