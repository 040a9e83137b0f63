//! Snapshot validation and graph traversal.
//!
//! Rules enforced before a snapshot is stored:
//! 1. Job and trigger IDs must be unique within the snapshot.
//! 2. Every edge must reference valid nodes: trigger sources must be
//!    triggers, job sources and all targets must be jobs.
//! 3. `js_expression` edges must carry a non-empty expression.
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! Edges are treated as structure only: disabled edges and conditions are
//! still part of the graph's shape, since they decide what a worker *may*
//! execute, and the rerun planner reasons about shape.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::models::{EdgeCondition, EdgeSource, GraphSnapshot};
use crate::EngineError;

/// Validate the snapshot's graph and return its jobs in topological order.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::InvalidEdge`] for malformed edges.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_snapshot(snapshot: &GraphSnapshot) -> Result<Vec<Uuid>, EngineError> {
    let graph = &snapshot.graph;

    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<Uuid> = HashSet::new();
    let node_ids = graph
        .jobs
        .iter()
        .map(|j| j.id)
        .chain(graph.triggers.iter().map(|t| t.id));
    for id in node_ids {
        if !seen_ids.insert(id) {
            return Err(EngineError::DuplicateNodeId(id));
        }
    }

    let jobs: HashSet<Uuid> = graph.jobs.iter().map(|j| j.id).collect();
    let triggers: HashSet<Uuid> = graph.triggers.iter().map(|t| t.id).collect();

    // -----------------------------------------------------------------------
    // 2./3. Validate edge endpoints and conditions
    // -----------------------------------------------------------------------
    for edge in &graph.edges {
        let source_known = match edge.source {
            EdgeSource::Trigger(id) => triggers.contains(&id),
            EdgeSource::Job(id) => jobs.contains(&id),
        };
        if !source_known {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.source.id(),
                side: "source",
            });
        }
        if !jobs.contains(&edge.target_job_id) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.target_job_id,
                side: "target",
            });
        }
        if let EdgeCondition::JsExpression { expression, .. } = &edge.condition {
            if expression.trim().is_empty() {
                return Err(EngineError::InvalidEdge {
                    edge_id: edge.id,
                    message: "js_expression edges need a condition_expression".into(),
                });
            }
        }
        if let EdgeSource::Trigger(_) = edge.source {
            if !matches!(edge.condition, EdgeCondition::Always) {
                return Err(EngineError::InvalidEdge {
                    edge_id: edge.id,
                    message: "trigger edges must use the 'always' condition".into(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 4. Topological sort over jobs (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let index = GraphIndex::new(snapshot);
    let mut in_degree: HashMap<Uuid, usize> = graph.jobs.iter().map(|j| (j.id, 0)).collect();
    for edge in &graph.edges {
        if let EdgeSource::Job(_) = edge.source {
            *in_degree.entry(edge.target_job_id).or_insert(0) += 1;
        }
    }

    // Seed in declaration order so the result is deterministic.
    let mut queue: VecDeque<Uuid> = graph
        .jobs
        .iter()
        .map(|j| j.id)
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut sorted: Vec<Uuid> = Vec::with_capacity(graph.jobs.len());

    while let Some(job_id) = queue.pop_front() {
        sorted.push(job_id);

        for &child in index.children(job_id) {
            if let Some(deg) = in_degree.get_mut(&child) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if sorted.len() != graph.jobs.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(sorted)
}

/// Adjacency view of a snapshot, keyed by node id.
pub struct GraphIndex<'a> {
    snapshot: &'a GraphSnapshot,
    children: HashMap<Uuid, Vec<Uuid>>,
}

impl<'a> GraphIndex<'a> {
    pub fn new(snapshot: &'a GraphSnapshot) -> Self {
        let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for edge in &snapshot.graph.edges {
            children
                .entry(edge.source.id())
                .or_default()
                .push(edge.target_job_id);
        }
        Self { snapshot, children }
    }

    pub fn children(&self, node: Uuid) -> &[Uuid] {
        self.children.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Jobs a trigger feeds directly.
    pub fn entry_jobs(&self, trigger_id: Uuid) -> Vec<Uuid> {
        self.children(trigger_id).to_vec()
    }

    /// Every job strictly after `job_id`.
    pub fn descendants(&self, job_id: Uuid) -> HashSet<Uuid> {
        self.walk(self.children(job_id).iter().copied(), |_| true)
    }

    /// Jobs reachable from the graph's roots without entering `avoid`.
    /// Roots are all triggers plus jobs nothing points at.
    pub fn reachable_avoiding(&self, avoid: Uuid) -> HashSet<Uuid> {
        let targets: HashSet<Uuid> = self
            .snapshot
            .graph
            .edges
            .iter()
            .map(|e| e.target_job_id)
            .collect();
        let roots = self
            .snapshot
            .graph
            .triggers
            .iter()
            .map(|t| t.id)
            .chain(
                self.snapshot
                    .graph
                    .jobs
                    .iter()
                    .map(|j| j.id)
                    .filter(|id| !targets.contains(id)),
            )
            .filter(|id| *id != avoid);

        let mut reached = self.walk(roots, |id| id != avoid);
        for trigger in &self.snapshot.graph.triggers {
            reached.remove(&trigger.id);
        }
        reached
    }

    /// Jobs that come strictly before `target`: reachable without passing
    /// through it and not downstream of it.
    pub fn upstream_of(&self, target: Uuid) -> HashSet<Uuid> {
        let downstream = self.descendants(target);
        self.reachable_avoiding(target)
            .into_iter()
            .filter(|id| *id != target && !downstream.contains(id))
            .collect()
    }

    fn walk(
        &self,
        start: impl IntoIterator<Item = Uuid>,
        allow: impl Fn(Uuid) -> bool,
    ) -> HashSet<Uuid> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut queue: VecDeque<Uuid> = start.into_iter().filter(|id| allow(*id)).collect();
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            for &child in self.children(node) {
                if allow(child) && !seen.contains(&child) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }
}
