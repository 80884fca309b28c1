//! Document partitioning.
//!
//! Splits a Markdown document into ordered [`Unit`]s and computes a
//! dependency-aware iteration order: a unit that declares a fact is scheduled
//! before every unit citing it. Units in a reference cycle fall back to
//! document order inside their strongly connected component.
//!
//! Partition problems never abort a run. They are reported in
//! [`Partition::diagnostics`] and flag the partition as degraded.

pub mod complexity;
pub mod facts;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::unit::{Unit, UnitId};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionError {
    #[error("required grouping '{grouping}' could not be isolated")]
    MissingGrouping { grouping: String },

    #[error("document is empty")]
    EmptyDocument,

    #[error("fact '{key}' declared by several units: {}", .units.join(", "))]
    DuplicateFact { key: String, units: Vec<UnitId> },
}

/// Partitioning bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionRules {
    /// Sections above this size are split at paragraph boundaries.
    pub max_unit_words: usize,
    /// Section titles that must come out as their own unit (case-insensitive).
    pub required_groupings: Vec<String>,
}

impl Default for PartitionRules {
    fn default() -> Self {
        Self {
            max_unit_words: 600,
            required_groupings: Vec::new(),
        }
    }
}

/// Output of [`UnitPartitioner::partition`].
#[derive(Debug, Clone)]
pub struct Partition {
    /// Units in document order.
    pub units: Vec<Unit>,
    /// Scheduling order, definers before referencers.
    pub iteration_order: Vec<UnitId>,
    /// Units each unit must wait for. Never contains a unit scheduled later.
    pub depends_on: BTreeMap<UnitId, BTreeSet<UnitId>>,
    pub diagnostics: Vec<PartitionError>,
    pub degraded: bool,
}

struct Section {
    heading: Option<String>,
    title: String,
    body: String,
}

pub struct UnitPartitioner {
    rules: PartitionRules,
}

impl UnitPartitioner {
    pub fn new(rules: PartitionRules) -> Self {
        Self { rules }
    }

    pub fn partition(&self, document: &str) -> Partition {
        let mut diagnostics = Vec::new();

        if document.trim().is_empty() {
            warn!("Empty document, producing a single empty unit");
            let unit = build_unit(0, None, "Document".to_string(), String::new(), true);
            let id = unit.id.clone();
            return Partition {
                units: vec![unit],
                iteration_order: vec![id.clone()],
                depends_on: BTreeMap::from([(id, BTreeSet::new())]),
                diagnostics: vec![PartitionError::EmptyDocument],
                degraded: true,
            };
        }

        let mut units = Vec::new();
        for section in split_sections(document) {
            let parts = split_paragraphs(&section.body, self.rules.max_unit_words);
            let multi = parts.len() > 1;
            for (n, body) in parts.into_iter().enumerate() {
                let (heading, title) = if multi {
                    let heading = if n == 0 { section.heading.clone() } else { None };
                    (heading, format!("{} ({})", section.title, n + 1))
                } else {
                    (section.heading.clone(), section.title.clone())
                };
                units.push(build_unit(units.len(), heading, title, body, false));
            }
        }

        let mut degraded = false;
        for grouping in &self.rules.required_groupings {
            if isolate_grouping(&mut units, grouping) {
                continue;
            }
            warn!(grouping = %grouping, "Required grouping not isolated");
            diagnostics.push(PartitionError::MissingGrouping {
                grouping: grouping.clone(),
            });
            degraded = true;
        }

        let (iteration_order, depends_on, duplicates) = dependency_order(&units);
        diagnostics.extend(duplicates);

        debug!(
            units = units.len(),
            degraded,
            order = %iteration_order.join(","),
            "Partitioned document"
        );

        Partition {
            units,
            iteration_order,
            depends_on,
            diagnostics,
            degraded,
        }
    }
}

impl Default for UnitPartitioner {
    fn default() -> Self {
        Self::new(PartitionRules::default())
    }
}

fn heading_title(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    Some(rest.trim().to_string())
}

/// Opening or closing line of a fenced code block.
fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn split_sections(document: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Section {
        heading: None,
        title: "Preamble".to_string(),
        body: String::new(),
    };
    let mut in_fence = false;

    for line in document.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
        }
        let title = if in_fence { None } else { heading_title(line) };
        if let Some(title) = title {
            if current.heading.is_some() || !current.body.trim().is_empty() {
                sections.push(current);
            }
            current = Section {
                heading: Some(line.trim().to_string()),
                title,
                body: String::new(),
            };
        } else {
            current.body.push_str(line);
            current.body.push('\n');
        }
    }
    if current.heading.is_some() || !current.body.trim().is_empty() {
        sections.push(current);
    }

    for section in &mut sections {
        section.body = section.body.trim().to_string();
    }
    sections
}

/// Paragraphs separated by blank (or whitespace-only) lines. A fenced code
/// block stays in one paragraph.
fn paragraphs(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_fence = false;
    for line in body.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
        }
        if !in_fence && line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}

/// Greedy paragraph packing. A single paragraph above the bound stays whole.
fn split_paragraphs(body: &str, max_words: usize) -> Vec<String> {
    let words = body.split_whitespace().count();
    if words <= max_words {
        return vec![body.to_string()];
    }

    let mut parts: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_words = 0;
    for paragraph in paragraphs(body) {
        let n = paragraph.split_whitespace().count();
        if !current.is_empty() && current_words + n > max_words {
            parts.push(current.join("\n\n"));
            current.clear();
            current_words = 0;
        }
        current.push(paragraph);
        current_words += n;
    }
    if !current.is_empty() {
        parts.push(current.join("\n\n"));
    }
    parts
}

fn build_unit(
    order: usize,
    heading: Option<String>,
    title: String,
    content: String,
    degraded: bool,
) -> Unit {
    Unit {
        id: format!("u-{:02}", order + 1),
        order,
        heading,
        title,
        dependency_summary: String::new(),
        complexity: complexity::score(&content),
        defines: facts::defined_keys(&content),
        references: facts::extract_references(&content),
        content,
        degraded,
    }
}

/// Whether `grouping` came out as its own unit. When it only appears buried
/// inside another unit, that unit is flagged degraded.
fn isolate_grouping(units: &mut [Unit], grouping: &str) -> bool {
    let wanted = grouping.to_lowercase();
    let isolated = units.iter().any(|u| {
        let title = u.title.to_lowercase();
        title == wanted || title.starts_with(&format!("{} (", wanted))
    });
    if isolated {
        return true;
    }
    for unit in units.iter_mut() {
        if unit.content.to_lowercase().contains(&wanted) {
            unit.degraded = true;
        }
    }
    false
}

type DependencyOrder = (
    Vec<UnitId>,
    BTreeMap<UnitId, BTreeSet<UnitId>>,
    Vec<PartitionError>,
);

/// Topological order over strongly connected components, with document order
/// as the tie-break, so the result is deterministic and cycles terminate.
fn dependency_order(units: &[Unit]) -> DependencyOrder {
    let mut duplicates = Vec::new();
    let mut definers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, unit) in units.iter().enumerate() {
        for key in &unit.defines {
            definers.entry(key.as_str()).or_default().push(i);
        }
    }
    for (key, owners) in &definers {
        if owners.len() > 1 {
            duplicates.push(PartitionError::DuplicateFact {
                key: key.to_string(),
                units: owners.iter().map(|&i| units[i].id.clone()).collect(),
            });
        }
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..units.len()).map(|i| graph.add_node(i)).collect();
    for (i, unit) in units.iter().enumerate() {
        for key in &unit.references {
            // First definer in document order owns the fact.
            if let Some(&owner) = definers.get(key.as_str()).and_then(|o| o.first()) {
                if owner != i && !graph.contains_edge(nodes[owner], nodes[i]) {
                    graph.add_edge(nodes[owner], nodes[i], ());
                }
            }
        }
    }

    let components = tarjan_scc(&graph);
    let mut component_of = vec![0usize; units.len()];
    let mut members: Vec<Vec<usize>> = Vec::with_capacity(components.len());
    for (c, component) in components.iter().enumerate() {
        let mut m: Vec<usize> = component.iter().map(|n| graph[*n]).collect();
        m.sort_unstable();
        for &i in &m {
            component_of[i] = c;
        }
        if m.len() > 1 {
            debug!(
                units = %m.iter().map(|&i| units[i].id.as_str()).collect::<Vec<_>>().join(","),
                "Reference cycle, falling back to document order"
            );
        }
        members.push(m);
    }

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); members.len()];
    let mut indegree = vec![0usize; members.len()];
    for edge in graph.raw_edges() {
        let from = component_of[graph[edge.source()]];
        let to = component_of[graph[edge.target()]];
        if from != to && successors[from].insert(to) {
            indegree[to] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(c, _)| Reverse((members[c][0], c)))
        .collect();

    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut order = Vec::with_capacity(units.len());
    while let Some(Reverse((_, c))) = ready.pop() {
        for &i in &members[c] {
            position.insert(i, order.len());
            order.push(i);
        }
        for &next in &successors[c] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((members[next][0], next)));
            }
        }
    }

    let mut depends_on = BTreeMap::new();
    for (i, unit) in units.iter().enumerate() {
        let deps: BTreeSet<UnitId> = graph
            .neighbors_directed(nodes[i], petgraph::Direction::Incoming)
            .map(|n| graph[n])
            .filter(|&owner| position[&owner] < position[&i])
            .map(|owner| units[owner].id.clone())
            .collect();
        depends_on.insert(unit.id.clone(), deps);
    }

    let iteration_order = order.into_iter().map(|i| units[i].id.clone()).collect();
    (iteration_order, depends_on, duplicates)
}
