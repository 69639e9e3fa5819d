use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

/// Stages that mutate a source tree provide a token with this prefix.
pub const PATCH_TOKEN_PREFIX: &str = "patch:";
pub const PATCH_BARRIER_ID: &str = "kernel.barrier.patch";
pub const PATCH_DONE_TOKEN: &str = "patch:done";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing '?' marks the dependency optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::config(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::config(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    // Resolve a dependency to a concrete task id. Optional deps that match nothing yield None.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        task: &str,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::config(format!(
            "task '{}' has invalid dependency '{}': unknown task or token",
            task, dep
        )))
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for task in self.tasks.values() {
            for dep in &task.after {
                if let Some(dep_id) = self.resolve_dep(&provides, &task.id, dep)? {
                    out.push((dep_id, task.id.as_str()));
                }
            }
        }
        Ok(out)
    }

    /// Topological order; ties break by task id so the order is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to) {
                *incoming.entry(to).or_default() += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::config(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_patch_barrier()
    }

    // Every task providing a `patch:` token feeds the barrier; defconfig finalization
    // waits on `patch:done` instead of naming each optional patch stage.
    fn add_patch_barrier(&mut self) -> Result<()> {
        if self.tasks.contains_key(PATCH_BARRIER_ID) {
            return Ok(());
        }
        let deps: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.provides.iter().any(|p| p.starts_with(PATCH_TOKEN_PREFIX)))
            .map(|t| t.id.clone())
            .collect();
        if deps.is_empty() {
            return Ok(());
        }

        self.add(Task {
            id: PATCH_BARRIER_ID.into(),
            label: "Patches applied".into(),
            module: "kernel".into(),
            phase: "barrier".into(),
            after: deps,
            provides: vec![PATCH_DONE_TOKEN.into()],
        })
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", from, to));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn optional_missing_dependency_is_ignored() {
        let mut plan = Plan::default();
        plan.add(task("a", &[], &["tok:a"])).unwrap();
        plan.add(task("b", &["tok:a", "tok:missing?"], &[])).unwrap();
        let ids: Vec<_> = plan.ordered().unwrap().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn required_missing_dependency_fails() {
        let mut plan = Plan::default();
        plan.add(task("b", &["tok:missing"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("tok:missing"), "unexpected err: {err}");
    }

    #[test]
    fn barrier_collects_patch_providers() {
        let mut plan = Plan::default();
        plan.add(task("p1", &[], &["patch:one"])).unwrap();
        plan.add(task("p2", &["p1"], &["patch:two"])).unwrap();
        plan.add(task("final", &[PATCH_DONE_TOKEN], &[])).unwrap();
        plan.finalize_default().unwrap();

        let ids: Vec<_> = plan.ordered().unwrap().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["p1", "p2", PATCH_BARRIER_ID, "final"]);
    }

    #[test]
    fn cycle_is_reported() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        assert!(plan.ordered().unwrap_err().to_string().contains("cycle"));
    }
}
