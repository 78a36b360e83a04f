use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::bail;

use crate::TractResult;
use crate::pb::*;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub nodes_removed: usize,
    pub initializers_removed: usize,
    pub value_infos_removed: usize,
}

/// Drop everything that does not contribute to a graph output, then
/// re-sort the surviving nodes topologically.
///
/// The sort is stable: among nodes ready at the same time, the one appearing
/// first in the input graph comes first, so an already sorted graph is left
/// untouched.
pub fn cleanup(graph: &mut GraphProto) -> TractResult<CleanupStats> {
    let mut stats = CleanupStats::default();
    let producers: HashMap<String, usize> = graph
        .node
        .iter()
        .enumerate()
        .flat_map(|(ix, n)| n.output.iter().map(move |o| (o.clone(), ix)))
        .collect();

    let mut live = vec![false; graph.node.len()];
    let mut needed: Vec<usize> =
        graph.output.iter().filter_map(|o| producers.get(&o.name).copied()).collect();
    while let Some(ix) = needed.pop() {
        if live[ix] {
            continue;
        }
        live[ix] = true;
        for input in graph.node[ix].wired_inputs() {
            if let Some(&p) = producers.get(input) {
                if !live[p] {
                    needed.push(p);
                }
            }
        }
    }

    let order = stable_toposort(&graph.node, &live, &producers)?;
    let mut nodes: Vec<Option<NodeProto>> = graph.node.drain(..).map(Some).collect();
    stats.nodes_removed = nodes.len() - order.len();
    graph.node = order.into_iter().filter_map(|ix| nodes[ix].take()).collect();

    let used: HashSet<&str> = graph
        .node
        .iter()
        .flat_map(|n| n.input.iter().chain(n.output.iter()))
        .chain(graph.output.iter().map(|o| &o.name))
        .chain(graph.input.iter().map(|i| &i.name))
        .map(|s| &**s)
        .collect();
    let before = graph.initializer.len();
    let kept: Vec<TensorProto> =
        graph.initializer.iter().filter(|t| used.contains(&*t.name)).cloned().collect();
    stats.initializers_removed = before - kept.len();
    let before = graph.value_info.len();
    let kept_vi: Vec<ValueInfoProto> =
        graph.value_info.iter().filter(|v| used.contains(&*v.name)).cloned().collect();
    stats.value_infos_removed = before - kept_vi.len();
    graph.initializer = kept;
    graph.value_info = kept_vi;
    Ok(stats)
}

fn stable_toposort(
    nodes: &[NodeProto],
    live: &[bool],
    producers: &HashMap<String, usize>,
) -> TractResult<Vec<usize>> {
    let mut pending: Vec<usize> = vec![0; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![vec![]; nodes.len()];
    for (ix, n) in nodes.iter().enumerate().filter(|(ix, _)| live[*ix]) {
        let deps: BTreeSet<usize> =
            n.wired_inputs().filter_map(|i| producers.get(i).copied()).collect();
        pending[ix] = deps.len();
        for d in deps {
            successors[d].push(ix);
        }
    }
    let mut ready: BTreeSet<usize> =
        (0..nodes.len()).filter(|&ix| live[ix] && pending[ix] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(ix) = ready.pop_first() {
        order.push(ix);
        for &s in &successors[ix] {
            pending[s] -= 1;
            if pending[s] == 0 {
                ready.insert(s);
            }
        }
    }
    let expected = live.iter().filter(|l| **l).count();
    if order.len() != expected {
        bail!("Graph has a cycle ({} of {} live nodes sorted)", order.len(), expected);
    }
    Ok(order)
}
