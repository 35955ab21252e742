use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub phase: String,
    /// Task ids this one runs after. A trailing `?` marks the dependency as
    /// optional: ignored when that task is not in the plan.
    pub after: Vec<TaskId>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn resolve_dep<'a>(&self, dep: &'a str) -> Result<Option<&'a str>> {
        let (dep, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if self.tasks.contains_key(dep) {
            Ok(Some(dep))
        } else if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{dep}'")))
        }
    }

    /// Tasks in dependency order; ties are broken by task id so the order is
    /// stable across runs.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, task) in &self.tasks {
            incoming.entry(id.as_str()).or_insert(0);
            outgoing.entry(id.as_str()).or_default();
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep(dep).map_err(|e| {
                    Error::msg(format!(
                        "task '{id}' has invalid dependency '{dep}': {e}"
                    ))
                })?
                else {
                    continue;
                };
                if outgoing.entry(dep_id).or_default().insert(id.as_str()) {
                    *incoming.entry(id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = ready.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        ready.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(plan: &Plan) -> Vec<String> {
        plan.ordered()
            .expect("ordered")
            .into_iter()
            .map(|t| t.id.clone())
            .collect()
    }

    #[test]
    fn dependencies_win_over_id_order() {
        let mut plan = Plan::default();
        plan.add(task("a.last", &["z.first"])).expect("add");
        plan.add(task("z.first", &[])).expect("add");
        assert_eq!(ids(&plan), vec!["z.first", "a.last"]);
    }

    #[test]
    fn optional_dependencies_are_skipped_when_absent() {
        let mut plan = Plan::default();
        plan.add(task("run", &["deploy?", "build?"])).expect("add");
        plan.add(task("build", &[])).expect("add");
        assert_eq!(ids(&plan), vec!["build", "run"]);
    }

    #[test]
    fn missing_required_dependency_is_an_error() {
        let mut plan = Plan::default();
        plan.add(task("run", &["deploy"])).expect("add");
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("unknown dependency 'deploy'"), "unexpected err: {err}");
    }

    #[test]
    fn cycles_are_reported() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"])).expect("add");
        plan.add(task("b", &["a"])).expect("add");
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut plan = Plan::default();
        plan.add(task("a", &[])).expect("add");
        assert!(plan.add(task("a", &[])).is_err());
    }
}
