//! Topological analysis of workflow graphs.
//!
//! Before a run starts, the graph is analyzed once:
//!
//! 1. Loop nodes are located and their scopes detected (the nodes reachable
//!    from the loop output that feed back into the loop node).
//! 2. Loop back-edges are excluded, and Kahn layering computes execution
//!    waves over the remaining acyclic graph.
//! 3. Nodes are classified as branch (out-degree > 1), merge (in-degree > 1),
//!    or loop (by node type).
//!
//! Any cycle that survives back-edge exclusion is a rejected workflow; the
//! error carries the offending path.

use crate::error::{EngineError, Result};
use crate::graph::{Edge, Node, DONE_PORT};
use std::collections::{HashMap, HashSet, VecDeque};
use wavefront_store::NodeId;

/// One loop node's detected iteration scope.
#[derive(Debug, Clone)]
pub struct LoopScope {
    pub loop_node_id: NodeId,
    /// Nodes participating in one iteration.
    pub scope: HashSet<NodeId>,
    /// Scope nodes with an edge back into the loop node.
    pub feedback_node_ids: HashSet<NodeId>,
    /// First node of the iteration body.
    pub loop_target: Option<NodeId>,
    /// First node of the exit path.
    pub done_target: Option<NodeId>,
}

/// The result of analyzing a workflow graph.
#[derive(Debug, Clone)]
pub struct DagAnalysis {
    /// All node ids in topological order (back-edges excluded).
    pub sorted_node_ids: Vec<NodeId>,
    /// Wave k holds the nodes whose scheduling predecessors all lie in
    /// waves < k. Intra-wave nodes are mutually independent.
    pub waves: Vec<Vec<NodeId>>,
    pub branch_node_ids: HashSet<NodeId>,
    pub merge_node_ids: HashSet<NodeId>,
    pub loop_node_ids: HashSet<NodeId>,
    /// Edge ids excluded from acyclicity analysis.
    pub loop_back_edges: Vec<String>,
    pub loop_scopes: HashMap<NodeId, LoopScope>,
    /// Scheduling predecessors (back-edges excluded).
    pub predecessors: HashMap<NodeId, Vec<NodeId>>,
    /// Scheduling successors (back-edges excluded).
    pub successors: HashMap<NodeId, Vec<NodeId>>,
}

impl DagAnalysis {
    /// The loop scope a node belongs to, if any. The loop node itself is not
    /// part of its own scope.
    pub fn scope_owner(&self, node_id: &str) -> Option<&LoopScope> {
        self.loop_scopes
            .values()
            .find(|s| s.scope.contains(node_id))
    }

    /// Whether the node executes under a loop controller rather than the
    /// wave scheduler.
    pub fn in_loop_scope(&self, node_id: &str) -> bool {
        self.scope_owner(node_id).is_some()
    }

    /// Scheduling predecessors of a node.
    pub fn parents_of(&self, node_id: &str) -> &[NodeId] {
        self.predecessors
            .get(node_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Analyze a workflow graph. Returns [`EngineError::CycleDetected`] when a
/// cycle exists outside every loop scope, and
/// [`EngineError::Validation`] for structural defects.
pub fn analyze(nodes: &[Node], edges: &[Edge]) -> Result<DagAnalysis> {
    let mut ids: HashSet<&str> = HashSet::new();
    for node in nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
    }
    for edge in edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                return Err(EngineError::Validation(format!(
                    "edge '{}' references unknown node '{}'",
                    edge.id, endpoint
                )));
            }
        }
    }

    let loop_node_ids: HashSet<NodeId> = nodes
        .iter()
        .filter(|n| n.is_loop())
        .map(|n| n.id.clone())
        .collect();

    let mut loop_scopes = HashMap::new();
    for loop_id in &loop_node_ids {
        loop_scopes.insert(loop_id.clone(), detect_scope(loop_id, edges));
    }

    // An edge is excluded from layering when it is part of loop plumbing:
    // the loop-port edge, any loop-node edge into its own scope, or a
    // feedback edge from scope back to the loop node.
    let mut excluded_edge_ids: HashSet<&str> = HashSet::new();
    for edge in edges {
        if edge.is_loop_port() {
            excluded_edge_ids.insert(edge.id.as_str());
            continue;
        }
        if let Some(scope) = loop_scopes.get(&edge.source) {
            if scope.scope.contains(&edge.target) {
                excluded_edge_ids.insert(edge.id.as_str());
                continue;
            }
        }
        if let Some(scope) = loop_scopes.get(&edge.target) {
            if scope.scope.contains(&edge.source) {
                excluded_edge_ids.insert(edge.id.as_str());
            }
        }
    }

    let scheduling_edges: Vec<&Edge> = edges
        .iter()
        .filter(|e| !excluded_edge_ids.contains(e.id.as_str()))
        .collect();

    let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut predecessors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for node in nodes {
        successors.entry(node.id.clone()).or_default();
        predecessors.entry(node.id.clone()).or_default();
        in_degree.entry(node.id.as_str()).or_insert(0);
    }
    for edge in &scheduling_edges {
        successors
            .get_mut(&edge.source)
            .unwrap()
            .push(edge.target.clone());
        predecessors
            .get_mut(&edge.target)
            .unwrap()
            .push(edge.source.clone());
        *in_degree.get_mut(edge.target.as_str()).unwrap() += 1;
    }

    // Kahn layering: wave 0 is the in-degree-0 frontier, each later wave is
    // the frontier released by the previous one.
    let mut remaining = in_degree.clone();
    let mut frontier: VecDeque<&str> = {
        let mut seed: Vec<&str> = remaining
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        seed.sort_unstable();
        seed.into_iter().collect()
    };

    let mut waves: Vec<Vec<NodeId>> = Vec::new();
    let mut sorted_node_ids: Vec<NodeId> = Vec::with_capacity(nodes.len());

    while !frontier.is_empty() {
        let mut wave: Vec<NodeId> = Vec::with_capacity(frontier.len());
        let mut next: Vec<&str> = Vec::new();
        while let Some(id) = frontier.pop_front() {
            wave.push(id.to_string());
            sorted_node_ids.push(id.to_string());
            for succ in &successors[id] {
                let d = remaining.get_mut(succ.as_str()).unwrap();
                *d -= 1;
                if *d == 0 {
                    next.push(succ.as_str());
                }
            }
        }
        next.sort_unstable();
        frontier = next.into_iter().collect();
        waves.push(wave);
    }

    if sorted_node_ids.len() != nodes.len() {
        let stuck: Vec<&str> = remaining
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        let path = cycle_path(&stuck, &successors);
        return Err(EngineError::CycleDetected { path });
    }

    let branch_node_ids: HashSet<NodeId> = nodes
        .iter()
        .filter(|n| !loop_node_ids.contains(&n.id))
        .filter(|n| successors.get(&n.id).map(|s| s.len()).unwrap_or(0) > 1)
        .map(|n| n.id.clone())
        .collect();
    let merge_node_ids: HashSet<NodeId> = nodes
        .iter()
        .filter(|n| predecessors.get(&n.id).map(|p| p.len()).unwrap_or(0) > 1)
        .map(|n| n.id.clone())
        .collect();

    Ok(DagAnalysis {
        sorted_node_ids,
        waves,
        branch_node_ids,
        merge_node_ids,
        loop_node_ids,
        loop_back_edges: excluded_edge_ids.iter().map(|s| s.to_string()).collect(),
        loop_scopes,
        predecessors,
        successors,
    })
}

/// Detect the iteration scope of one loop node.
///
/// The scope is every node reachable from the loop output that can reach the
/// loop node again without crossing the done edge. Feedback nodes are the
/// scope members with a direct edge back to the loop node.
fn detect_scope(loop_id: &str, edges: &[Edge]) -> LoopScope {
    let outgoing: Vec<&Edge> = edges.iter().filter(|e| e.source == loop_id).collect();

    let loop_out = outgoing
        .iter()
        .find(|e| e.is_loop_port())
        .or_else(|| outgoing.first())
        .copied();
    let done_out = outgoing
        .iter()
        .find(|e| e.source_port.as_deref() == Some(DONE_PORT))
        .or_else(|| {
            outgoing
                .iter()
                .find(|e| loop_out.map(|l| l.id != e.id).unwrap_or(false))
        })
        .copied();

    let mut scope = HashSet::new();
    let mut feedback = HashSet::new();

    if let Some(entry) = loop_out {
        let done_edge_id = done_out.map(|e| e.id.as_str());

        // Forward reachability from the loop output, not crossing the done
        // edge and not expanding past the loop node.
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut stack = vec![entry.target.as_str()];
        while let Some(current) = stack.pop() {
            if current == loop_id || !reachable.insert(current) {
                continue;
            }
            for edge in edges {
                if edge.source == current && Some(edge.id.as_str()) != done_edge_id {
                    stack.push(edge.target.as_str());
                }
            }
        }

        // Backward reachability from the loop node, restricted to the
        // forward-reachable set.
        let mut closes: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = edges
            .iter()
            .filter(|e| e.target == loop_id && reachable.contains(e.source.as_str()))
            .map(|e| e.source.as_str())
            .collect();
        while let Some(current) = stack.pop() {
            if !closes.insert(current) {
                continue;
            }
            for edge in edges {
                if edge.target == current
                    && reachable.contains(edge.source.as_str())
                    && !closes.contains(edge.source.as_str())
                {
                    stack.push(edge.source.as_str());
                }
            }
        }

        scope = reachable
            .intersection(&closes)
            .map(|s| s.to_string())
            .collect();
        feedback = edges
            .iter()
            .filter(|e| e.target == loop_id && scope.contains(e.source.as_str()))
            .map(|e| e.source.clone())
            .collect();

        // A body with no feedback edge is still a scope: a single pass over
        // the nodes reachable from the loop output before the done path.
        if scope.is_empty() {
            scope = reachable.iter().map(|s| s.to_string()).collect();
            if let Some(done) = done_out {
                // The done path is not part of the iteration body.
                let mut done_side: HashSet<&str> = HashSet::new();
                let mut stack = vec![done.target.as_str()];
                while let Some(current) = stack.pop() {
                    if !done_side.insert(current) {
                        continue;
                    }
                    for edge in edges {
                        if edge.source == current {
                            stack.push(edge.target.as_str());
                        }
                    }
                }
                scope.retain(|n| !done_side.contains(n.as_str()));
            }
        }
    }

    LoopScope {
        loop_node_id: loop_id.to_string(),
        scope,
        feedback_node_ids: feedback,
        loop_target: loop_out.map(|e| e.target.clone()),
        done_target: done_out.map(|e| e.target.clone()),
    }
}

/// Walk the residual graph to produce a representative cycle path.
fn cycle_path(stuck: &[&str], successors: &HashMap<NodeId, Vec<NodeId>>) -> Vec<String> {
    let stuck_set: HashSet<&str> = stuck.iter().copied().collect();
    let start = match stuck.iter().min() {
        Some(s) => *s,
        None => return vec![],
    };

    let mut path: Vec<&str> = vec![start];
    let mut on_path: HashSet<&str> = HashSet::from([start]);
    let mut current: &str = start;
    loop {
        let next = successors
            .get(current)
            .and_then(|succs| succs.iter().find(|s| stuck_set.contains(s.as_str())))
            .map(|s| s.as_str());
        match next {
            Some(next) => {
                if on_path.contains(next) {
                    // Close the cycle at the first revisited node.
                    let from = path.iter().position(|p| *p == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[from..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.to_string());
                    return cycle;
                }
                on_path.insert(next);
                path.push(next);
                current = next;
            }
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}
