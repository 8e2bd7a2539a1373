//! Per-stage execution plans.
//!
//! Each stage is sorted on its own: dependencies inside the stage become
//! graph edges, dependencies on earlier stages are only validated. Ties are
//! broken by declaration order so the same registry always yields the same
//! plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};
use crate::stage::SetupStage;
use crate::task::SetupTask;

/// Ordered tasks per stage. Stages outside the stage filter are absent;
/// stages without tasks map to an empty list.
pub type ExecutionPlan = BTreeMap<SetupStage, Vec<SetupTask>>;

/// Build the plan for `tasks` (the full registry, in declaration order).
///
/// Empty filters select everything.
///
/// # Errors
///
/// Returns a plan error for unknown, future-stage, filtered or skipped-stage
/// dependencies and for same-stage cycles.
pub fn build_execution_plan(
    tasks: &[SetupTask],
    stage_filter: &HashSet<SetupStage>,
    task_filter: &HashSet<String>,
) -> Result<ExecutionPlan> {
    let registry: HashMap<&str, &SetupTask> = tasks.iter().map(|t| (t.name.as_str(), t)).collect();
    let mut plan = ExecutionPlan::new();

    for stage in SetupStage::ORDER {
        if !stage_filter.is_empty() && !stage_filter.contains(&stage) {
            continue;
        }
        let stage_tasks: Vec<&SetupTask> = tasks
            .iter()
            .filter(|t| t.stage == stage)
            .filter(|t| task_filter.is_empty() || task_filter.contains(&t.name))
            .collect();
        let ordered = order_stage(stage, &stage_tasks, &registry, stage_filter, task_filter)?;
        plan.insert(stage, ordered);
    }
    Ok(plan)
}

fn order_stage(
    stage: SetupStage,
    stage_tasks: &[&SetupTask],
    registry: &HashMap<&str, &SetupTask>,
    stage_filter: &HashSet<SetupStage>,
    task_filter: &HashSet<String>,
) -> Result<Vec<SetupTask>> {
    // Nodes are added in declaration order, so a node's index is its rank.
    let mut graph: DiGraph<(), ()> = DiGraph::new();
    let nodes: HashMap<&str, NodeIndex> = stage_tasks
        .iter()
        .map(|task| (task.name.as_str(), graph.add_node(())))
        .collect();

    for task in stage_tasks {
        for dependency in &task.dependencies {
            let dep = registry
                .get(dependency.as_str())
                .ok_or_else(|| Error::unknown_dependency(&task.name, dependency))?;
            if dep.stage > stage {
                return Err(Error::future_stage_dependency(&task.name, dependency));
            }
            if dep.stage == stage {
                let (Some(&from), Some(&to)) =
                    (nodes.get(dependency.as_str()), nodes.get(task.name.as_str()))
                else {
                    return Err(Error::filtered_dependency(
                        &task.name,
                        dependency,
                        Some(stage.to_string()),
                    ));
                };
                graph.update_edge(from, to, ());
                continue;
            }
            if !stage_filter.is_empty() && !stage_filter.contains(&dep.stage) {
                return Err(Error::skipped_stage_dependency(
                    &task.name,
                    dependency,
                    dep.stage.to_string(),
                ));
            }
            if !task_filter.is_empty() && !task_filter.contains(dependency) {
                return Err(Error::filtered_dependency(&task.name, dependency, None));
            }
        }
    }

    let mut pending: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = pending
        .iter()
        .filter(|(_, deps)| **deps == 0)
        .map(|(&n, _)| Reverse(n))
        .collect();

    let mut ordered = Vec::with_capacity(stage_tasks.len());
    while let Some(Reverse(node)) = ready.pop() {
        if let Some(task) = stage_tasks.get(node.index()) {
            ordered.push((*task).clone());
        }
        for follower in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(count) = pending.get_mut(&follower) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push(Reverse(follower));
                }
            }
        }
    }

    if ordered.len() != stage_tasks.len() {
        return Err(Error::cyclic_dependency(stage.to_string()));
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use proptest::prelude::*;

    use super::*;
    use crate::task::TaskOutput;

    fn task(name: &str, stage: SetupStage, deps: &[&str]) -> SetupTask {
        SetupTask::new(name, stage, |_| Ok(TaskOutput::empty())).with_dependencies(deps.iter().copied())
    }

    fn names(plan: &ExecutionPlan, stage: SetupStage) -> Vec<&str> {
        plan[&stage].iter().map(|t| t.name.as_str()).collect()
    }

    fn no_filter() -> (HashSet<SetupStage>, HashSet<String>) {
        (HashSet::new(), HashSet::new())
    }

    #[test]
    fn should_order_by_dependencies_then_declaration() {
        let tasks = vec![
            task("c", SetupStage::Preflight, &["b"]),
            task("a", SetupStage::Preflight, &[]),
            task("b", SetupStage::Preflight, &[]),
        ];
        let (stages, names_filter) = no_filter();
        let plan = build_execution_plan(&tasks, &stages, &names_filter).unwrap();
        assert_eq!(names(&plan, SetupStage::Preflight), vec!["a", "b", "c"]);
        assert!(plan[&SetupStage::Summaries].is_empty());
    }

    #[test]
    fn should_reject_unknown_and_future_dependencies() {
        let (stages, names_filter) = no_filter();
        let unknown = vec![task("a", SetupStage::Preflight, &["ghost"])];
        assert_eq!(
            build_execution_plan(&unknown, &stages, &names_filter)
                .unwrap_err()
                .to_string(),
            "Task 'a' depends on unknown task 'ghost'"
        );

        let future = vec![
            task("a", SetupStage::Preflight, &["b"]),
            task("b", SetupStage::Installers, &[]),
        ];
        assert_eq!(
            build_execution_plan(&future, &stages, &names_filter)
                .unwrap_err()
                .to_string(),
            "Task 'a' depends on future stage task 'b'"
        );
    }

    #[test]
    fn should_reject_filtered_and_skipped_dependencies() {
        let tasks = vec![
            task("a", SetupStage::Preflight, &[]),
            task("b", SetupStage::Installers, &[]),
            task("c", SetupStage::Installers, &["b", "a"]),
        ];

        let only_c: HashSet<String> = ["c".to_string()].into();
        let err = build_execution_plan(&tasks, &HashSet::new(), &only_c).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Task 'c' depends on filtered task 'b' in stage 'installers'"
        );

        let installers: HashSet<SetupStage> = [SetupStage::Installers].into();
        let err = build_execution_plan(&tasks, &installers, &HashSet::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Task 'c' depends on task 'a' from skipped stage 'preflight'"
        );

        let b_and_c: HashSet<String> = ["b".to_string(), "c".to_string()].into();
        let err = build_execution_plan(&tasks, &HashSet::new(), &b_and_c).unwrap_err();
        assert_eq!(err.to_string(), "Task 'c' depends on filtered task 'a'");
    }

    #[test]
    fn should_detect_cycles() {
        let tasks = vec![
            task("a", SetupStage::Verification, &["b"]),
            task("b", SetupStage::Verification, &["a"]),
        ];
        let (stages, names_filter) = no_filter();
        let err = build_execution_plan(&tasks, &stages, &names_filter).unwrap_err();
        assert_eq!(err.to_string(), "Cyclic dependency detected in stage 'verification'");
    }

    #[test]
    fn should_omit_stages_outside_filter() {
        let tasks = vec![task("a", SetupStage::Preflight, &[])];
        let filter: HashSet<SetupStage> = [SetupStage::Preflight].into();
        let plan = build_execution_plan(&tasks, &filter, &HashSet::new()).unwrap();
        assert_eq!(plan.len(), 1);
    }

    proptest! {
        #[test]
        fn plan_respects_every_same_stage_edge(
            edges in proptest::collection::vec((0usize..8, 0usize..8), 0..20)
        ) {
            // Only point edges backwards so the graph stays acyclic.
            let tasks: Vec<SetupTask> = (0..8)
                .map(|i| {
                    let deps: Vec<String> = edges
                        .iter()
                        .filter(|(from, to)| *to == i && from < to)
                        .map(|(from, _)| format!("t{from}"))
                        .collect();
                    SetupTask::new(format!("t{i}"), SetupStage::Installers, |_| Ok(TaskOutput::empty()))
                        .with_dependencies(deps)
                })
                .collect();
            let plan = build_execution_plan(&tasks, &HashSet::new(), &HashSet::new()).unwrap();
            let order = names(&plan, SetupStage::Installers);
            prop_assert_eq!(order.len(), 8);
            for task in &tasks {
                let at = order.iter().position(|n| *n == task.name).unwrap();
                for dep in &task.dependencies {
                    let dep_at = order.iter().position(|n| n == dep).unwrap();
                    prop_assert!(dep_at < at);
                }
            }
        }
    }
}
