use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use zero_kernel_builder::Result;
use zero_kernel_builder::build_config::{BuildConfig, invocation_relative};
use zero_kernel_builder::config::{self, ConfigDoc, DEFAULT_CONFIG_FILE};
use zero_kernel_builder::defconfig::resolve_defconfig;
use zero_kernel_builder::executor::{self, ExecCtx, StdoutSink};
use zero_kernel_builder::modules;
use zero_kernel_builder::planner::Plan;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Workspace config TOML (optional when the file does not exist)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct BuildArgs {
    /// Device codename, e.g. dumpling or guacamole
    #[arg(short, long)]
    codename: String,
    /// ROM base: los, pa or x
    #[arg(short, long)]
    base: String,
    /// Linux kernel version expected in the sources, e.g. 4.14
    #[arg(long = "lkv", alias = "kernel-version")]
    kernel_version: String,
    /// Integrate KernelSU
    #[arg(long)]
    ksu: bool,
    /// Use this defconfig verbatim instead of patching the device one
    #[arg(long)]
    defconfig: Option<PathBuf>,
    /// Only clean the build environment
    #[arg(long)]
    clean: bool,
    /// Parallel make jobs (defaults to the CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,
}

impl BuildArgs {
    fn overlay(&self, cwd: &Path) -> toml::Value {
        let mut build = toml::value::Table::new();
        build.insert("codename".into(), self.codename.clone().into());
        build.insert("base".into(), self.base.clone().into());
        build.insert("kernel_version".into(), self.kernel_version.clone().into());
        build.insert("ksu".into(), self.ksu.into());
        build.insert("clean_only".into(), self.clean.into());
        if let Some(p) = &self.defconfig {
            let p = invocation_relative(cwd, p);
            build.insert("defconfig".into(), p.to_string_lossy().into_owned().into());
        }
        if let Some(j) = self.jobs {
            build.insert("jobs".into(), (j as i64).into());
        }
        let mut root = toml::value::Table::new();
        root.insert("build".into(), toml::Value::Table(build));
        toml::Value::Table(root)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch sources, patch, build and package a kernel
    Kernel {
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        config: ConfigArgs,
        /// Log the stages that would run without executing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the stage plan for a kernel build
    Plan {
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        config: ConfigArgs,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Only install and export the shared tools
    Tools {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the fully-resolved config (after imports/extends)
    Resolve {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenv::dotenv().ok();
    init_tracing(cli.log_json);

    let res = match cli.cmd {
        Command::Kernel {
            build,
            config,
            dry_run,
        } => cmd_kernel(&config.config, &build, dry_run),
        Command::Plan { build, config, dot } => cmd_plan(&config.config, &build, dot),
        Command::Tools { config, dry_run } => cmd_tools(&config.config, dry_run),
        Command::Resolve { config } => cmd_resolve(&config.config),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.kind().as_str());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("ZKB_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_build_doc(path: &Path, args: &BuildArgs) -> Result<ConfigDoc> {
    let mut doc = config::load_or_empty(path)?;
    let cwd = std::env::current_dir()
        .map_err(|e| zero_kernel_builder::Error::msg(format!("cwd error: {e}")))?;
    doc.overlay(args.overlay(&cwd));

    // Reject unsupported requests before anything on disk changes.
    let build = BuildConfig::from_doc(&doc)?;
    resolve_defconfig(
        &build.codename,
        build.base,
        build.kernel_version,
        build.defconfig.as_deref(),
    )?;
    Ok(doc)
}

fn plan_for(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in modules::builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}

fn execute(doc: &ConfigDoc, dry_run: bool) -> Result<()> {
    let plan = plan_for(doc)?;
    let reg = executor::builtin_registry()?;
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(dry_run, sink);
    executor::execute_plan(doc, &plan, &reg, &mut ctx)
}

fn cmd_kernel(path: &Path, args: &BuildArgs, dry_run: bool) -> Result<()> {
    let doc = load_build_doc(path, args)?;
    execute(&doc, dry_run)
}

fn cmd_tools(path: &Path, dry_run: bool) -> Result<()> {
    let mut doc = config::load_or_empty(path)?;
    if let Some(t) = doc.value.as_table_mut() {
        t.remove("build");
    }
    execute(&doc, dry_run)
}

fn cmd_plan(path: &Path, args: &BuildArgs, dot: bool) -> Result<()> {
    let doc = load_build_doc(path, args)?;
    let plan = plan_for(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<12}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load_or_empty(path)?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}
