use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::time::Instant;

use crate::build_config::KernelVersion;
use crate::config::ConfigDoc;
use crate::defconfig::ConfigFragment;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::manifest::ResolvedResourceTable;
use crate::planner::{PATCH_BARRIER_ID, Plan};
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

pub mod sanitize;

use sanitize::sanitize_line;

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started += 1;
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines += 1;
                    push_task_log_line(&mut s.task_logs, &id, &line);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let err_text = error.unwrap_or_default();
                if ok {
                    if let Ok(mut s) = self.state.lock() {
                        s.tasks_ok += 1;
                        s.task_logs.remove(&id);
                    }
                    println!("DONE: {id} ({})", format_elapsed_hms((elapsed_ms / 1000) as u64));
                    return;
                }

                println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_failed += 1;
                    s.failed_tasks.push(id.clone());
                    match write_task_error_log(&mut s, &id, &err_text, elapsed_ms) {
                        Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                        Err(e) => println!("WARN: failed to write task error log for {id}: {e}"),
                    }
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  stages: started={} ok={} failed={}\n",
                    s.tasks_started, s.tasks_ok, s.tasks_failed
                ));
                summary.push_str(&format!("  logs: {}\n", s.log_lines));
                summary.push_str(&format!(
                    "  elapsed: {}\n",
                    format_elapsed_hms(wall.as_secs())
                ));
                if !s.failed_tasks.is_empty() {
                    summary.push_str(&format!("  failed_stages: {}\n", s.failed_tasks.join(", ")));
                }
                for p in &s.error_log_paths {
                    summary.push_str(&format!("  error_log: {}\n", p.display()));
                }
                if let Some(e) = error.filter(|_| !ok) {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                *s = StdoutSinkState::default();
                print!("{summary}");
            }
        }
    }
}

/// State handed from one pipeline stage to the next.
#[derive(Debug, Default)]
pub struct PipelineState {
    pub resources: Option<ResolvedResourceTable>,
    pub env: Environment,
    /// Version read from the kernel Makefile by `kernel.verify`.
    pub kernel_version: Option<KernelVersion>,
    /// Config lines appended to the resolved defconfig at the end of patching.
    pub fragment: ConfigFragment,
}

pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    pub pipeline: PipelineState,
    workspace: Option<WorkspacePaths>,
    launcher: Option<Mutex<Box<dyn Launcher + Send>>>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            pipeline: PipelineState::default(),
            workspace: None,
            launcher: None,
        }
    }

    /// Route stage subprocesses through `launcher` instead of spawning them here.
    pub fn with_launcher(mut self, launcher: Box<dyn Launcher + Send>) -> Self {
        self.launcher = Some(Mutex::new(launcher));
        self
    }

    fn installed_launcher(&self) -> Option<Result<MutexGuard<'_, Box<dyn Launcher + Send>>>> {
        self.launcher
            .as_ref()
            .map(|l| l.lock().map_err(|_| Error::msg("launcher lock poisoned")))
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&mut self, paths: WorkspacePaths) {
        self.workspace = Some(paths);
    }

    pub fn workspace_paths(&self) -> Option<&WorkspacePaths> {
        self.workspace.as_ref()
    }

    pub fn workspace_paths_or_init(&mut self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = &self.workspace {
            return Ok(p.clone());
        }
        let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let paths = crate::workspace::init_dirs(&ws)?;
        self.workspace = Some(paths.clone());
        Ok(paths)
    }

    pub fn resources(&self) -> Result<&ResolvedResourceTable> {
        self.pipeline
            .resources
            .as_ref()
            .ok_or_else(|| Error::msg("resource table not loaded (resources.manifest did not run)"))
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        tracing::debug!(task = %id, "{msg}");
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Run a subprocess, streaming its sanitized output into the task log.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        if let Some(launcher) = self.installed_launcher() {
            return launcher?.launch(cmd);
        }
        tracing::info!(cmd = ?cmd, "spawn");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn {:?} failed: {e}", cmd.get_program())))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::msg(format!(
                "command {:?} failed: {status}",
                cmd.get_program()
            )));
        }
        Ok(())
    }

    /// Run a subprocess and return its stdout; stderr goes to the task log.
    pub fn capture_cmd(&self, mut cmd: Command) -> Result<String> {
        if let Some(launcher) = self.installed_launcher() {
            return launcher?.capture(cmd);
        }
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("spawn {:?} failed: {e}", cmd.get_program())))?;
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            let line = sanitize_line(line);
            if !line.is_empty() {
                self.log(&line);
            }
        }
        if !output.status.success() {
            return Err(Error::msg(format!(
                "command {:?} failed: {}",
                cmd.get_program(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Launcher for ExecCtx {
    fn launch(&mut self, cmd: Command) -> Result<()> {
        self.run_cmd(cmd)
    }

    fn capture(&mut self, cmd: Command) -> Result<String> {
        self.capture_cmd(cmd)
    }

    fn log(&self, msg: &str) {
        ExecCtx::log(self, msg)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Runs the plan in order, stopping at the first failing stage. The returned
/// error keeps the stage's kind and is prefixed with its id.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    for task in &ordered {
        if reg.get(&task.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            continue;
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        tracing::info!(task = %task.id, label = %task.label, "stage start");

        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                tracing::error!(task = %task.id, kind = e.kind().as_str(), "{e}");
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(format!("[{}] {e}", e.kind().as_str())),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add(PATCH_BARRIER_ID, patch_barrier)?;
    crate::modules::core::CoreModule::register_tasks(&mut reg)?;
    crate::modules::resources::ResourcesModule::register_tasks(&mut reg)?;
    crate::modules::kernel::KernelModule::register_tasks(&mut reg)?;
    crate::modules::build::BuildModule::register_tasks(&mut reg)?;
    crate::modules::package::PackageModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn patch_barrier(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.log("all source patches applied");
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn push_task_log_line(task_logs: &mut BTreeMap<String, VecDeque<String>>, task_id: &str, line: &str) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_line(line));
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match &state.error_logs_dir {
        Some(d) => d.clone(),
        None => {
            let dir = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("build")
                .join("error-logs")
                .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!(
                    "failed to create error logs dir {}: {e}",
                    dir.display()
                ))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in state.task_logs.get(task_id).into_iter().flatten() {
        body.push_str(line);
        body.push('\n');
    }
    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;

    if !state.error_log_paths.contains(&path) {
        state.error_log_paths.push(path.clone());
    }
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_zero_padded() {
        assert_eq!(format_elapsed_hms(0), "00:00:00");
        assert_eq!(format_elapsed_hms(3 * 3600 + 25 * 60 + 7), "03:25:07");
    }

    #[test]
    fn filename_component_replaces_separators() {
        assert_eq!(sanitize_filename_component("kernel.ksu"), "kernel.ksu");
        assert_eq!(sanitize_filename_component("a/b c"), "a_b_c");
    }
}
