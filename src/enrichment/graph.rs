//! Dependency graph of one enricher group.
//!
//! Nodes are enrichers; an edge `a -> b` means `a` needs a signal that `b`
//! provides. Everything is computed in name order, so the resulting plan
//! does not depend on registration order.

use std::collections::{BTreeMap, BTreeSet};

use super::Enricher;

/// Execution plan for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupPlan {
    /// Indices into the group's enricher slice, in execution order.
    Ordered(Vec<usize>),
    /// The group has a cycle; names along it, first name repeated at the end.
    Cyclic(Vec<String>),
}

/// Signal name → indices of the enrichers in `enrichers` that declare it.
pub fn providers<C>(enrichers: &[Enricher<C>]) -> BTreeMap<&str, Vec<usize>> {
    let mut providers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, enricher) in enrichers.iter().enumerate() {
        for signal in enricher.provided() {
            providers.entry(signal.as_str()).or_default().push(index);
        }
    }
    providers
}

/// For each enricher, the set of enrichers whose signals it needs.
///
/// Dependencies with no provider inside the group produce no edge; they
/// are resolved at run time against the accumulated signal map.
pub fn edges<C>(enrichers: &[Enricher<C>]) -> Vec<BTreeSet<usize>> {
    let providers = providers(enrichers);
    enrichers
        .iter()
        .map(|enricher| {
            enricher
                .dependencies()
                .iter()
                .filter_map(|signal| providers.get(signal.as_str()))
                .flatten()
                .copied()
                .collect()
        })
        .collect()
}

/// Detect cycles, then order the group topologically.
pub fn plan<C>(enrichers: &[Enricher<C>]) -> GroupPlan {
    // Work in rank space: rank order is lexicographic name order.
    let mut by_name: Vec<usize> = (0..enrichers.len()).collect();
    by_name.sort_by(|&a, &b| enrichers[a].name().cmp(enrichers[b].name()));
    let mut rank_of = vec![0usize; enrichers.len()];
    for (rank, &index) in by_name.iter().enumerate() {
        rank_of[index] = rank;
    }

    let ranked_edges: Vec<BTreeSet<usize>> = {
        let raw = edges(enrichers);
        by_name
            .iter()
            .map(|&index| raw[index].iter().map(|&dep| rank_of[dep]).collect())
            .collect()
    };

    if let Some(cycle) = find_cycle(&ranked_edges) {
        let path = cycle
            .into_iter()
            .map(|rank| enrichers[by_name[rank]].name().to_owned())
            .collect();
        return GroupPlan::Cyclic(path);
    }

    let order = topological_order(&ranked_edges)
        .into_iter()
        .map(|rank| by_name[rank])
        .collect();
    GroupPlan::Ordered(order)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search for the first cycle, visiting nodes in rank order.
fn find_cycle(edges: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; edges.len()];
    let mut stack = Vec::new();
    (0..edges.len()).find_map(|start| {
        if marks[start] == Mark::Unvisited {
            visit(start, edges, &mut marks, &mut stack)
        } else {
            None
        }
    })
}

fn visit(
    node: usize,
    edges: &[BTreeSet<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[node] = Mark::OnStack;
    stack.push(node);
    for &next in &edges[node] {
        match marks[next] {
            Mark::OnStack => {
                let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<usize> = stack.get(start..).unwrap_or_default().to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, edges, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }
    stack.pop();
    marks[node] = Mark::Done;
    None
}

/// Kahn's algorithm; ties broken by lowest rank. Expects an acyclic graph.
fn topological_order(edges: &[BTreeSet<usize>]) -> Vec<usize> {
    let mut pending: Vec<usize> = edges.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); edges.len()];
    for (node, deps) in edges.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..edges.len()).filter(|&n| pending[n] == 0).collect();
    let mut order = Vec::with_capacity(edges.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in &dependents[node] {
            pending[dependent] = pending[dependent].saturating_sub(1);
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    order
}
