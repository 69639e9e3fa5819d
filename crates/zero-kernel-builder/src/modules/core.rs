use crate::config::ConfigDoc;
use crate::environment::Environment;
use crate::error::Result;
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::Module;
use crate::planner::{Plan, Task};
use crate::workspace::WorkspaceConfig;

pub const INIT_TASK: &str = "core.init";

const KNOWN_TABLES: &[&str] = &["workspace", "resources", "kernel", "build", "package", "project"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        if let Some(tbl) = doc.value.as_table() {
            for (key, v) in tbl {
                if v.is_table() && !KNOWN_TABLES.contains(&key.as_str()) {
                    return Err(crate::Error::config(format!(
                        "unknown config table '{key}' (expected one of: {})",
                        KNOWN_TABLES.join(", ")
                    )));
                }
            }
        }

        plan.add(Task {
            id: INIT_TASK.into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

impl ModuleExec for CoreModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(INIT_TASK, core_init)
    }
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let paths = if ctx.dry_run {
        let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let paths = crate::workspace::load_paths(&ws)?;
        ctx.set_workspace_paths(paths.clone());
        paths
    } else {
        ctx.workspace_paths_or_init(doc)?
    };
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.build_dir = {}", paths.build_dir.display()));
    ctx.log(&format!("workspace.out_dir = {}", paths.out_dir.display()));
    ctx.pipeline.env = Environment::new(&paths.root);
    Ok(())
}
