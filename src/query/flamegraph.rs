//! Call-tree reconstruction from flat `(hash, parent_hash, name, weight)`
//! rows.
//!
//! Nodes live in an arena indexed by position; index 0 is the synthetic
//! root. Every traversal uses an explicit stack so stack depth is bounded
//! regardless of call-tree depth.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::stack::hash::ROOT_PARENT;
use crate::store::StackRow;

pub const ROOT_NAME: &str = "root";
const ROOT: usize = 0;

#[derive(Debug, Clone)]
struct Node {
    name: Arc<str>,
    hash: u64,
    parent_hash: u64,
    weight: u64,
    parent: usize,
    children: Vec<usize>,
}

/// Nested view of the call tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlameGraphNode {
    pub name: String,
    pub value: u64,
    pub children: Vec<FlameGraphNode>,
}

impl Drop for FlameGraphNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

/// Nearest-rank percentiles over leaf weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Reconstructed call tree.
#[derive(Debug, Clone)]
pub struct FlameGraph {
    nodes: Vec<Node>,
    violations: u64,
}

impl FlameGraph {
    /// Builds the tree in two passes.
    ///
    /// The index pass creates one node per hash, summing weights of rows
    /// that share it. The attach pass links each node to its parent. Roots,
    /// orphans (parent hash not present) and nodes caught in a parent cycle
    /// hang off the synthetic root, so no weight is lost.
    pub fn build(rows: &[StackRow]) -> Self {
        let mut nodes = vec![Node {
            name: Arc::from(ROOT_NAME),
            hash: ROOT_PARENT,
            parent_hash: ROOT_PARENT,
            weight: 0,
            parent: ROOT,
            children: Vec::new(),
        }];
        let mut index: HashMap<u64, usize> = HashMap::with_capacity(rows.len());

        for row in rows {
            match index.get(&row.hash) {
                Some(&i) => {
                    nodes[i].weight = nodes[i].weight.saturating_add(row.num_samples);
                }
                None => {
                    index.insert(row.hash, nodes.len());
                    nodes.push(Node {
                        name: Arc::clone(&row.name),
                        hash: row.hash,
                        parent_hash: row.parent_hash,
                        weight: row.num_samples,
                        parent: ROOT,
                        children: Vec::new(),
                    });
                }
            }
        }

        let mut orphans = 0usize;
        for i in 1..nodes.len() {
            let parent_hash = nodes[i].parent_hash;
            let parent = if parent_hash == ROOT_PARENT {
                ROOT
            } else {
                match index.get(&parent_hash) {
                    Some(&p) if p != i => p,
                    _ => {
                        orphans += 1;
                        ROOT
                    }
                }
            };
            nodes[i].parent = parent;
            nodes[parent].children.push(i);
        }

        let cycles = break_cycles(&mut nodes);
        if orphans > 0 || cycles > 0 {
            debug!(orphans, cycles, "reattached frames under the synthetic root");
        }

        for i in 0..nodes.len() {
            let mut children = std::mem::take(&mut nodes[i].children);
            children.sort_by(|&a, &b| {
                nodes[a]
                    .name
                    .cmp(&nodes[b].name)
                    .then(nodes[a].hash.cmp(&nodes[b].hash))
            });
            nodes[i].children = children;
        }

        let total = nodes[ROOT]
            .children
            .iter()
            .fold(0u64, |acc, &c| acc.saturating_add(nodes[c].weight));
        nodes[ROOT].weight = total;

        let violations = nodes
            .iter()
            .skip(1)
            .map(|n| {
                n.children
                    .iter()
                    .filter(|&&c| nodes[c].weight > n.weight)
                    .count() as u64
            })
            .sum();

        Self { nodes, violations }
    }

    /// Root weight: sum of every top-level frame, orphans included.
    pub fn total(&self) -> u64 {
        self.nodes[ROOT].weight
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Number of frames, excluding the synthetic root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Parent/child pairs where the child outweighs its parent.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    fn self_weight(&self, i: usize) -> u64 {
        let node = &self.nodes[i];
        let children = node
            .children
            .iter()
            .fold(0u64, |acc, &c| acc.saturating_add(self.nodes[c].weight));
        node.weight.saturating_sub(children)
    }

    /// Node indices in depth-first pre-order with children in sorted order.
    fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(i) = stack.pop() {
            order.push(i);
            stack.extend(self.nodes[i].children.iter().rev());
        }
        order
    }

    /// Nested tree rooted at the synthetic root.
    pub fn tree(&self) -> FlameGraphNode {
        let mut built: Vec<Option<FlameGraphNode>> = vec![None; self.nodes.len()];

        // Reverse pre-order visits every child before its parent.
        for &i in self.preorder().iter().rev() {
            let node = &self.nodes[i];
            let children = node
                .children
                .iter()
                .filter_map(|&c| built[c].take())
                .collect();
            built[i] = Some(FlameGraphNode {
                name: node.name.to_string(),
                value: node.weight,
                children,
            });
        }

        built[ROOT].take().unwrap_or(FlameGraphNode {
            name: ROOT_NAME.to_string(),
            value: 0,
            children: Vec::new(),
        })
    }

    /// Writes the tree as nested `{"name","value","children"}` JSON.
    pub fn write_json(&self, out: &mut String) {
        enum Step {
            Open(usize),
            Close,
        }

        let mut stack = vec![Step::Open(ROOT)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Open(i) => {
                    let node = &self.nodes[i];
                    if out.ends_with('}') {
                        out.push(',');
                    }
                    out.push_str("{\"name\":");
                    push_json_str(out, &node.name);
                    let _ = write!(out, ",\"value\":{},\"children\":[", node.weight);
                    stack.push(Step::Close);
                    stack.extend(node.children.iter().rev().map(|&c| Step::Open(c)));
                }
                Step::Close => out.push_str("]}"),
            }
        }
    }

    /// One `frame;frame;... self_weight` line per frame with self weight,
    /// in depth-first order.
    pub fn collapsed(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut path: Vec<&str> = Vec::new();
        let mut stack: Vec<(usize, usize)> = self.nodes[ROOT]
            .children
            .iter()
            .rev()
            .map(|&c| (c, 0))
            .collect();

        while let Some((i, depth)) = stack.pop() {
            path.truncate(depth);
            path.push(&self.nodes[i].name);

            let own = self.self_weight(i);
            if own > 0 {
                lines.push(format!("{} {own}", path.join(";")));
            }
            stack.extend(self.nodes[i].children.iter().rev().map(|&c| (c, depth + 1)));
        }

        lines
    }

    /// Percentiles over the weights of leaf frames.
    pub fn percentiles(&self) -> Percentiles {
        let mut leaves: Vec<u64> = self
            .nodes
            .iter()
            .skip(1)
            .filter(|n| n.children.is_empty())
            .map(|n| n.weight)
            .collect();
        leaves.sort_unstable();

        Percentiles {
            p50: nearest_rank(&leaves, 50),
            p90: nearest_rank(&leaves, 90),
            p95: nearest_rank(&leaves, 95),
            p99: nearest_rank(&leaves, 99),
        }
    }
}

/// Reparents nodes that cannot reach the root. Returns how many cycles
/// were broken.
fn break_cycles(nodes: &mut [Node]) -> usize {
    let mut reachable = vec![false; nodes.len()];
    mark_reachable(nodes, ROOT, &mut reachable);

    let mut broken = 0;
    for i in 1..nodes.len() {
        if reachable[i] {
            continue;
        }
        let old_parent = nodes[i].parent;
        nodes[old_parent].children.retain(|&c| c != i);
        nodes[i].parent = ROOT;
        nodes[ROOT].children.push(i);
        mark_reachable(nodes, i, &mut reachable);
        broken += 1;
    }
    broken
}

fn mark_reachable(nodes: &[Node], from: usize, reachable: &mut [bool]) {
    let mut stack = vec![from];
    while let Some(i) = stack.pop() {
        if reachable[i] {
            continue;
        }
        reachable[i] = true;
        stack.extend(nodes[i].children.iter().copied());
    }
}

fn nearest_rank(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

fn push_json_str(out: &mut String, s: &str) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}
