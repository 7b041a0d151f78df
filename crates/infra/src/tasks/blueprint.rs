//! Task collections.
//!
//! A [`Blueprint`] gathers tasks (and their periodic schedules) before any
//! app exists. Apps own a blueprint of their own as their registry; other
//! blueprints are merged into it by copy, optionally under a namespace.

use std::collections::BTreeMap;

use procrastinate_core::Error as DomainError;

use super::task::Task;
use crate::periodic::{PeriodicRegistry, PeriodicTask};

/// Name-indexed tasks plus their periodic registrations.
#[derive(Debug, Clone, Default)]
pub struct Blueprint {
    tasks: BTreeMap<String, Task>,
    aliases: BTreeMap<String, String>,
    periodic: PeriodicRegistry,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task`. Its name and aliases must not be taken by any other
    /// name or alias.
    pub fn add_task(&mut self, task: Task) -> Result<(), DomainError> {
        self.check_names(&task)?;
        self.insert(task);
        Ok(())
    }

    /// A blueprint holding `task` alone.
    pub fn with_task(task: Task) -> Self {
        let mut blueprint = Self::new();
        blueprint.insert(task);
        blueprint
    }

    fn insert(&mut self, task: Task) {
        for alias in task.aliases() {
            self.aliases.insert(alias.clone(), task.name().to_string());
        }
        self.tasks.insert(task.name().to_string(), task);
    }

    /// Register `task` and schedule it.
    pub fn add_periodic_task(
        &mut self,
        task: Task,
        periodic_task: PeriodicTask,
    ) -> Result<(), DomainError> {
        if periodic_task.task_name() != task.name() {
            return Err(DomainError::validation(format!(
                "periodic schedule is for task {:?}, not {:?}",
                periodic_task.task_name(),
                task.name()
            )));
        }
        if !self.tasks.contains_key(task.name()) {
            self.add_task(task)?;
        }
        self.periodic.add(periodic_task)
    }

    /// Copy every task and schedule of `other` into this blueprint,
    /// prefixed by `<namespace>:`. Nothing is added if any name collides.
    pub fn add_tasks_from(&mut self, other: &Blueprint, namespace: &str) -> Result<(), DomainError> {
        let incoming = other.namespaced(namespace);
        let mut merged = self.clone();
        for task in incoming.tasks.into_values() {
            merged.add_task(task)?;
        }
        merged.periodic.check_conflicts(&incoming.periodic)?;
        for periodic_task in incoming.periodic.iter() {
            merged.periodic.add(periodic_task.clone())?;
        }
        *self = merged;
        Ok(())
    }

    /// Look a task up by name, then by alias.
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name).or_else(|| {
            self.aliases
                .get(name)
                .and_then(|canonical| self.tasks.get(canonical))
        })
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn periodic_registry(&self) -> &PeriodicRegistry {
        &self.periodic
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Apply `f` to every task, e.g. to bind them to an app.
    pub(crate) fn map_tasks(&mut self, f: impl Fn(Task) -> Task) {
        let tasks = std::mem::take(&mut self.tasks);
        self.tasks = tasks
            .into_iter()
            .map(|(name, task)| (name, f(task)))
            .collect();
    }

    fn namespaced(&self, namespace: &str) -> Blueprint {
        let mut namespaced = Blueprint::new();
        for task in self.tasks.values() {
            let task = task.namespaced(namespace);
            for alias in task.aliases() {
                namespaced
                    .aliases
                    .insert(alias.clone(), task.name().to_string());
            }
            namespaced.tasks.insert(task.name().to_string(), task);
        }
        for periodic_task in self.periodic.iter() {
            let _ = namespaced.periodic.add(periodic_task.namespaced(namespace));
        }
        namespaced
    }

    fn check_names(&self, task: &Task) -> Result<(), DomainError> {
        std::iter::once(task.name())
            .chain(task.aliases().iter().map(String::as_str))
            .find(|name| self.tasks.contains_key(*name) || self.aliases.contains_key(*name))
            .map_or(Ok(()), |name| Err(DomainError::task_already_registered(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procrastinate_core::{JobArgs, TaskError};

    fn task(name: &str) -> Task {
        Task::new(name, |_: JobArgs| async move { Ok::<_, TaskError>(()) })
    }

    #[test]
    fn single_task_blueprint_still_rejects_collisions() {
        let mut blueprint = Blueprint::with_task(task("builtin").with_alias("old_builtin"));
        assert!(blueprint.get("old_builtin").is_some());
        assert!(blueprint.add_task(task("old_builtin")).is_err());
        assert!(blueprint.add_task(task("other")).is_ok());
    }

    #[test]
    fn lookup_by_name_and_alias() {
        let mut blueprint = Blueprint::new();
        blueprint.add_task(task("send_email").with_alias("mail")).unwrap();

        assert_eq!(blueprint.get("send_email").unwrap().name(), "send_email");
        assert_eq!(blueprint.get("mail").unwrap().name(), "send_email");
        assert!(blueprint.get("other").is_none());
    }

    #[test]
    fn duplicate_names_and_aliases_are_rejected() {
        let mut blueprint = Blueprint::new();
        blueprint.add_task(task("a").with_alias("x")).unwrap();

        assert!(matches!(
            blueprint.add_task(task("a")),
            Err(DomainError::TaskAlreadyRegistered(name)) if name == "a"
        ));
        assert!(matches!(
            blueprint.add_task(task("x")),
            Err(DomainError::TaskAlreadyRegistered(name)) if name == "x"
        ));
        assert!(blueprint.add_task(task("b").with_alias("a")).is_err());
        assert_eq!(blueprint.len(), 1);
    }

    #[test]
    fn namespaced_merge_prefixes_everything() {
        let mut inner = Blueprint::new();
        inner.add_task(task("sum").with_alias("add")).unwrap();
        let beat = task("beat");
        inner
            .add_periodic_task(beat.clone(), PeriodicTask::new(&beat, "* * * * *").unwrap())
            .unwrap();

        let mut outer = Blueprint::new();
        outer.add_tasks_from(&inner, "math").unwrap();

        assert!(outer.get("math:sum").is_some());
        assert_eq!(outer.get("math:add").unwrap().name(), "math:sum");
        assert!(outer.get("sum").is_none());
        assert!(outer.periodic_registry().get("math:beat", "").is_some());
    }

    #[test]
    fn conflicting_merge_adds_nothing() {
        let mut inner = Blueprint::new();
        inner.add_task(task("one")).unwrap();
        inner.add_task(task("two")).unwrap();

        let mut outer = Blueprint::new();
        outer.add_task(task("ns:two")).unwrap();

        assert!(outer.add_tasks_from(&inner, "ns").is_err());
        assert!(outer.get("ns:one").is_none());
        assert_eq!(outer.len(), 1);
    }

    #[test]
    fn periodic_task_must_match_its_task() {
        let mut blueprint = Blueprint::new();
        let periodic = PeriodicTask::new(&task("a"), "* * * * *").unwrap();
        assert!(blueprint.add_periodic_task(task("b"), periodic).is_err());
    }
}
