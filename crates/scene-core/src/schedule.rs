//! Manager ordering.
//!
//! Kinds are sorted topologically over their declared dependencies, with
//! ties broken by registration order so the schedule is reproducible. Each
//! kind also gets a level: 0 without dependencies, otherwise one more than
//! the deepest dependency. Managers of one level never depend on each other
//! and may run in parallel; levels run one after another.

use std::{cmp::Reverse, collections::BinaryHeap};

use crate::{
    component::{KindRegistry, Phase},
    error::{Error, Result},
    manager::ManagerTable,
};

/// Topological order of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Registry positions in execution order.
    order: Vec<usize>,
    /// Level of each entry in `order`.
    levels: Vec<u32>,
}

impl Schedule {
    /// Sort the registry's kinds. Fails with [`Error::UnknownKind`] for a
    /// dependency that is not registered and [`Error::DependencyCycle`] if
    /// the dependencies do not form a DAG.
    pub fn build(registry: &KindRegistry) -> Result<Self> {
        let kinds: Vec<_> = registry.iter().collect();
        let mut indegree = vec![0usize; kinds.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); kinds.len()];

        for (index, kind) in kinds.iter().enumerate() {
            for dependency in &kind.dependencies {
                let on = registry
                    .position(*dependency)
                    .ok_or(Error::UnknownKind(*dependency))?;
                indegree[index] += 1;
                dependents[on].push(index);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();
        let mut level_of = vec![0u32; kinds.len()];
        let mut order = Vec::with_capacity(kinds.len());

        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &dependent in &dependents[index] {
                level_of[dependent] = level_of[dependent].max(level_of[index] + 1);
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() != kinds.len() {
            let unordered: Vec<bool> = indegree.iter().map(|&degree| degree > 0).collect();
            let kinds = (0..kinds.len())
                .filter(|&index| unordered[index] && on_cycle(index, &unordered, &dependents))
                .map(|index| kinds[index].name)
                .collect();
            return Err(Error::DependencyCycle { kinds });
        }

        let levels = order.iter().map(|&index| level_of[index]).collect();
        Ok(Self { order, levels })
    }

    /// Registry positions in execution order.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Level of the `position`-th scheduled kind.
    #[must_use]
    pub fn level(&self, position: usize) -> u32 {
        self.levels[position]
    }

    /// Number of distinct levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.iter().max().map_or(0, |&max| max as usize + 1)
    }
}

/// Whether `start` can reach itself through kinds Kahn's pass left unordered.
/// Kinds that merely depend on a cycle cannot.
fn on_cycle(start: usize, unordered: &[bool], dependents: &[Vec<usize>]) -> bool {
    let mut seen = vec![false; unordered.len()];
    let mut stack = vec![start];
    while let Some(index) = stack.pop() {
        for &next in &dependents[index] {
            if next == start {
                return true;
            }
            if unordered[next] && !seen[next] {
                seen[next] = true;
                stack.push(next);
            }
        }
    }
    false
}

/// Managers that run in one phase, grouped by level.
#[derive(Debug, Clone)]
pub(crate) struct PhasePlan {
    pub(crate) phase: Phase,
    /// Manager table positions per level. Empty levels are dropped.
    pub(crate) levels: Vec<Vec<usize>>,
}

impl PhasePlan {
    /// `managers` must be laid out in `schedule` order.
    pub(crate) fn build(phase: Phase, schedule: &Schedule, managers: &ManagerTable) -> Self {
        let mut levels = vec![Vec::new(); schedule.depth()];
        for position in 0..managers.len() {
            if managers.at(position).phases().has(phase) {
                levels[schedule.level(position) as usize].push(position);
            }
        }
        levels.retain(|level| !level.is_empty());
        Self { phase, levels }
    }
}
