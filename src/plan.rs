//! Plan resolution and execution.
//!
//! A plan is the ordered set of tasks from the application config. Tasks
//! name their dependencies; [`ExecutionPlan::resolve`] produces an order
//! that respects them (stable with respect to declaration order), and
//! [`PlanRunner`] executes the plan one task at a time, stopping at the
//! first failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::config::CoordinatorConfig;
use crate::error::PlanError;
use crate::extract::{TaskCoordinator, TaskReport};
use crate::store::DataStore;
use crate::task::ExtractionTask;

/// Tasks in a dependency-respecting execution order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    tasks: Vec<ExtractionTask>,
}

impl ExecutionPlan {
    /// Resolves an execution order for the given tasks.
    ///
    /// Among tasks whose dependencies are satisfied, declaration order is
    /// preserved.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` on duplicate task names, dependencies on unknown
    /// tasks, or dependency cycles.
    pub fn resolve(tasks: &[ExtractionTask]) -> Result<Self, PlanError> {
        let mut names = HashSet::new();
        for task in tasks {
            if !names.insert(task.name.as_str()) {
                return Err(PlanError::DuplicateTask(task.name.clone()));
            }
        }

        for task in tasks {
            for dep in &task.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut order = Vec::with_capacity(tasks.len());
        let mut placed: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&ExtractionTask> = tasks.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut blocked = Vec::new();

            for task in pending {
                if task
                    .dependencies
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
                {
                    placed.insert(task.name.as_str());
                    order.push(task.clone());
                } else {
                    blocked.push(task);
                }
            }

            // A full pass with no progress means the rest form a cycle.
            if blocked.len() == before {
                return Err(PlanError::DependencyCycle(blocked[0].name.clone()));
            }
            pending = blocked;
        }

        Ok(Self { tasks: order })
    }

    /// Resolves the plan restricted to one task and its transitive
    /// dependencies.
    pub fn resolve_target(tasks: &[ExtractionTask], target: &str) -> Result<Self, PlanError> {
        let full = Self::resolve(tasks)?;
        if !full.tasks.iter().any(|t| t.name == target) {
            return Err(PlanError::UnknownTask(target.to_string()));
        }

        let by_name: HashMap<&str, &ExtractionTask> = full
            .tasks
            .iter()
            .map(|task| (task.name.as_str(), task))
            .collect();

        let mut wanted: HashSet<&str> = HashSet::new();
        let mut stack = vec![target];
        while let Some(name) = stack.pop() {
            if wanted.insert(name) {
                if let Some(task) = by_name.get(name) {
                    stack.extend(task.dependencies.iter().map(|dep| dep.as_str()));
                }
            }
        }

        let tasks = full
            .tasks
            .iter()
            .filter(|task| wanted.contains(task.name.as_str()))
            .cloned()
            .collect();

        Ok(Self { tasks })
    }

    /// The tasks in execution order.
    pub fn tasks(&self) -> &[ExtractionTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Rolled-up counters for a completed plan run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Total records read across tasks.
    pub records_in: u64,
    /// Total records written across tasks.
    pub records_out: u64,
    /// Total bulk appends across tasks.
    pub appends: u64,
    /// Wall-clock duration of the whole run in milliseconds.
    pub duration_ms: u64,
    /// Per-task reports in execution order.
    pub reports: Vec<TaskReport>,
}

impl RunSummary {
    fn from_reports(reports: Vec<TaskReport>, duration_ms: u64) -> Self {
        Self {
            records_in: reports.iter().map(|r| r.records_in).sum(),
            records_out: reports.iter().map(|r| r.records_out).sum(),
            appends: reports.iter().map(|r| r.appends).sum(),
            duration_ms,
            reports,
        }
    }

    /// Number of tasks that completed.
    pub fn tasks(&self) -> usize {
        self.reports.len()
    }
}

/// Executes a resolved plan against one store.
pub struct PlanRunner {
    store: Arc<dyn DataStore>,
    config: CoordinatorConfig,
}

impl PlanRunner {
    pub fn new(store: Arc<dyn DataStore>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    /// Runs every task in plan order, stopping at the first failure.
    ///
    /// Tasks after the failed one are not started.
    pub async fn run(&self, plan: &ExecutionPlan) -> Result<RunSummary, PlanError> {
        let started = Instant::now();
        let mut reports = Vec::with_capacity(plan.len());

        info!(tasks = plan.len(), "Running extraction plan");

        for task in plan.tasks() {
            let coordinator = TaskCoordinator::new(Arc::clone(&self.store), self.config.clone());
            match coordinator.run(task).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(task = %task.name, error = %e, "Plan stopped at failed task");
                    return Err(PlanError::TaskFailed {
                        task: task.name.clone(),
                        source: e,
                    });
                }
            }
        }

        let summary = RunSummary::from_reports(reports, started.elapsed().as_millis() as u64);
        info!(
            tasks = summary.tasks(),
            records_in = summary.records_in,
            records_out = summary.records_out,
            duration_ms = summary.duration_ms,
            "Plan complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::ExtractionStyle;
    use serde_json::json;

    fn task(name: &str) -> ExtractionTask {
        ExtractionTask::new(name, "true").with_style(ExtractionStyle::ShellCommand)
    }

    fn names(plan: &ExecutionPlan) -> Vec<&str> {
        plan.tasks().iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_plan_preserves_declaration_order() {
        let tasks = vec![task("one"), task("two"), task("three")];
        let plan = ExecutionPlan::resolve(&tasks).unwrap();
        assert_eq!(names(&plan), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_plan_orders_dependencies() {
        let tasks = vec![
            task("c").with_dependencies(vec!["b".to_string()]),
            task("b").with_dependencies(vec!["a".to_string()]),
            task("a"),
        ];
        let plan = ExecutionPlan::resolve(&tasks).unwrap();
        assert_eq!(names(&plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_plan_diamond() {
        let tasks = vec![
            task("d").with_dependencies(vec!["b".to_string(), "c".to_string()]),
            task("c").with_dependencies(vec!["a".to_string()]),
            task("b").with_dependencies(vec!["a".to_string()]),
            task("a"),
        ];
        let plan = ExecutionPlan::resolve(&tasks).unwrap();
        assert_eq!(names(&plan), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_plan_detects_cycle() {
        let tasks = vec![
            task("a").with_dependencies(vec!["b".to_string()]),
            task("b").with_dependencies(vec!["a".to_string()]),
        ];
        let result = ExecutionPlan::resolve(&tasks);
        assert!(matches!(result, Err(PlanError::DependencyCycle(_))));
    }

    #[test]
    fn test_plan_rejects_duplicate_names() {
        let tasks = vec![task("same"), task("same")];
        let result = ExecutionPlan::resolve(&tasks);
        assert!(matches!(result, Err(PlanError::DuplicateTask(name)) if name == "same"));
    }

    #[test]
    fn test_plan_rejects_unknown_dependency() {
        let tasks = vec![task("a").with_dependencies(vec!["ghost".to_string()])];
        let result = ExecutionPlan::resolve(&tasks);
        assert!(matches!(
            result,
            Err(PlanError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_plan_target_subset() {
        let tasks = vec![
            task("a"),
            task("b").with_dependencies(vec!["a".to_string()]),
            task("c").with_dependencies(vec!["b".to_string()]),
            task("x"),
        ];
        let plan = ExecutionPlan::resolve_target(&tasks, "b").unwrap();
        assert_eq!(names(&plan), vec!["a", "b"]);
    }

    #[test]
    fn test_plan_target_unknown() {
        let tasks = vec![task("a")];
        let result = ExecutionPlan::resolve_target(&tasks, "nope");
        assert!(matches!(result, Err(PlanError::UnknownTask(name)) if name == "nope"));
    }

    #[tokio::test]
    async fn test_runner_executes_in_dependency_order() {
        let store = MemoryStore::new();
        let tasks = vec![
            ExtractionTask::new("second", "UPDATE stats SET done = true")
                .with_style(ExtractionStyle::DirectQuery)
                .with_dependencies(vec!["first".to_string()]),
            ExtractionTask::new("first", "DELETE FROM stats")
                .with_style(ExtractionStyle::DirectQuery),
        ];
        let plan = ExecutionPlan::resolve(&tasks).unwrap();

        let runner = PlanRunner::new(Arc::new(store.clone()), CoordinatorConfig::default());
        let summary = runner.run(&plan).await.unwrap();

        assert_eq!(summary.tasks(), 2);
        assert_eq!(
            store.executed(),
            vec!["DELETE FROM stats", "UPDATE stats SET done = true"]
        );
        assert_eq!(summary.reports[0].task, "first");
        assert_eq!(summary.reports[1].task, "second");
    }

    #[tokio::test]
    async fn test_runner_stops_at_first_failure() {
        let store = MemoryStore::new();
        let tasks = vec![
            ExtractionTask::new("boom", "exit 3").with_style(ExtractionStyle::ShellCommand),
            ExtractionTask::new("after", "SELECT 1").with_style(ExtractionStyle::DirectQuery),
        ];
        let plan = ExecutionPlan::resolve(&tasks).unwrap();

        let runner = PlanRunner::new(Arc::new(store.clone()), CoordinatorConfig::default());
        let err = runner.run(&plan).await.unwrap_err();

        assert!(matches!(err, PlanError::TaskFailed { task, .. } if task == "boom"));
        // The second task never started.
        assert!(store.executed().is_empty());
    }

    #[tokio::test]
    async fn test_summary_rolls_up_reports() {
        let store = MemoryStore::new();
        store.seed("left", (0..3).map(|i| json!({ "id": i })).collect());
        store.seed("right", (0..4).map(|i| json!({ "id": i })).collect());

        let tasks = vec![
            ExtractionTask::new("copy_left", "cat")
                .with_input_query("left")
                .with_output_relation("out_left"),
            ExtractionTask::new("copy_right", "cat")
                .with_input_query("right")
                .with_output_relation("out_right"),
        ];
        let plan = ExecutionPlan::resolve(&tasks).unwrap();

        let runner = PlanRunner::new(Arc::new(store.clone()), CoordinatorConfig::default());
        let summary = runner.run(&plan).await.unwrap();

        assert_eq!(summary.records_in, 7);
        assert_eq!(summary.records_out, 7);
        assert_eq!(store.records("out_left").len(), 3);
        assert_eq!(store.records("out_right").len(), 4);
    }
}
