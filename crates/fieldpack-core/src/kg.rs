//! Knowledge-graph delta operations, validation and an in-memory graph.
//!
//! A delta is an ordered list of [`KgOp`]s. Applying a delta is idempotent:
//! nodes are upserted by id and edges are keyed by a hash of their
//! `(src, dst, type, attrs)`, so the same edge can never be inserted twice.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{CanonicalizationError, Hash256, digest_canonical};

pub type Attrs = BTreeMap<String, Value>;

// ─── Operations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KgOp {
  AddNode {
    id:        String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    attrs:     Attrs,
  },
  AddEdge {
    src:       String,
    dst:       String,
    #[serde(rename = "type")]
    edge_type: String,
    #[serde(default)]
    attrs:     Attrs,
  },
  /// Merge `attrs` into an existing node's attributes.
  UpdateNode {
    id:    String,
    attrs: Attrs,
  },
  /// Remove a node and every edge touching it.
  RemoveNode { id: String },
  RemoveEdge { edge_key: Hash256 },
}

impl KgOp {
  pub fn name(&self) -> &'static str {
    match self {
      KgOp::AddNode { .. } => "ADD_NODE",
      KgOp::AddEdge { .. } => "ADD_EDGE",
      KgOp::UpdateNode { .. } => "UPDATE_NODE",
      KgOp::RemoveNode { .. } => "REMOVE_NODE",
      KgOp::RemoveEdge { .. } => "REMOVE_EDGE",
    }
  }

  /// Stable identity: the digest of the operation's canonical encoding.
  pub fn identity(&self) -> Result<Hash256, CanonicalizationError> {
    digest_canonical(self)
  }
}

/// Digest of an ordered delta.
pub fn delta_hash(ops: &[KgOp]) -> Result<Hash256, CanonicalizationError> {
  digest_canonical(ops)
}

#[derive(Serialize)]
struct EdgeIdentity<'a> {
  src:   &'a str,
  dst:   &'a str,
  #[serde(rename = "type")]
  kind:  &'a str,
  attrs: &'a Attrs,
}

/// Deterministic edge key over `(src, dst, type, canonical(attrs))`.
pub fn edge_key(
  src: &str,
  dst: &str,
  edge_type: &str,
  attrs: &Attrs,
) -> Result<Hash256, CanonicalizationError> {
  digest_canonical(&EdgeIdentity { src, dst, kind: edge_type, attrs })
}

// ─── Graph elements ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub id:        String,
  #[serde(rename = "type")]
  pub node_type: String,
  pub attrs:     Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
  pub edge_key:  Hash256,
  pub src:       String,
  pub dst:       String,
  #[serde(rename = "type")]
  pub edge_type: String,
  pub attrs:     Attrs,
}

/// A full, ordered dump of a graph: nodes by id, edges by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KgSnapshot {
  pub nodes: Vec<Node>,
  pub edges: Vec<Edge>,
}

impl KgSnapshot {
  pub fn hash(&self) -> Result<Hash256, CanonicalizationError> { digest_canonical(self) }
}

/// Read access to existing graph state, for validation.
pub trait GraphView {
  type Error;

  fn has_node(&self, id: &str) -> Result<bool, Self::Error>;
  fn has_edge(&self, edge_key: &Hash256) -> Result<bool, Self::Error>;
}

// ─── In-memory graph ─────────────────────────────────────────────────────────

/// A graph held entirely in memory. Used by replay, where nothing may touch
/// the local store.
#[derive(Debug, Clone, Default)]
pub struct KgState {
  nodes: BTreeMap<String, Node>,
  edges: BTreeMap<Hash256, Edge>,
}

impl KgState {
  pub fn new() -> Self { Self::default() }

  /// Apply one operation. Returns whether the graph changed.
  pub fn apply(&mut self, op: &KgOp) -> Result<bool, CanonicalizationError> {
    Ok(match op {
      KgOp::AddNode { id, node_type, attrs } => {
        let node = Node { id: id.clone(), node_type: node_type.clone(), attrs: attrs.clone() };
        self.nodes.insert(id.clone(), node.clone()) != Some(node)
      }
      KgOp::AddEdge { src, dst, edge_type, attrs } => {
        let key = edge_key(src, dst, edge_type, attrs)?;
        if self.edges.contains_key(&key) {
          false
        } else {
          self.edges.insert(key, Edge {
            edge_key:  key,
            src:       src.clone(),
            dst:       dst.clone(),
            edge_type: edge_type.clone(),
            attrs:     attrs.clone(),
          });
          true
        }
      }
      KgOp::UpdateNode { id, attrs } => match self.nodes.get_mut(id) {
        Some(node) => {
          let before = node.attrs.clone();
          node.attrs.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
          node.attrs != before
        }
        None => false,
      },
      KgOp::RemoveNode { id } => {
        let removed = self.nodes.remove(id).is_some();
        let before = self.edges.len();
        self.edges.retain(|_, e| e.src != *id && e.dst != *id);
        removed || self.edges.len() != before
      }
      KgOp::RemoveEdge { edge_key } => self.edges.remove(edge_key).is_some(),
    })
  }

  pub fn apply_all(&mut self, ops: &[KgOp]) -> Result<usize, CanonicalizationError> {
    let mut changed = 0;
    for op in ops {
      if self.apply(op)? {
        changed += 1;
      }
    }
    Ok(changed)
  }

  pub fn node(&self, id: &str) -> Option<&Node> { self.nodes.get(id) }

  pub fn node_count(&self) -> usize { self.nodes.len() }

  pub fn edge_count(&self) -> usize { self.edges.len() }

  pub fn snapshot(&self) -> KgSnapshot {
    KgSnapshot {
      nodes: self.nodes.values().cloned().collect(),
      edges: self.edges.values().cloned().collect(),
    }
  }
}

impl GraphView for KgState {
  type Error = std::convert::Infallible;

  fn has_node(&self, id: &str) -> Result<bool, Self::Error> { Ok(self.nodes.contains_key(id)) }

  fn has_edge(&self, edge_key: &Hash256) -> Result<bool, Self::Error> {
    Ok(self.edges.contains_key(edge_key))
  }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Shape constraints on deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KgSchema {
  /// Permitted node types; empty permits any.
  pub node_types:     BTreeSet<String>,
  /// Permitted edge types; empty permits any.
  pub edge_types:     BTreeSet<String>,
  /// Attributes every node of a given type must carry.
  pub required_attrs: BTreeMap<String, Vec<String>>,
  pub no_self_edges:  bool,
}

/// Upper bounds on a single delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaLimits {
  pub max_ops:       usize,
  pub max_new_nodes: usize,
  pub max_new_edges: usize,
}

impl Default for DeltaLimits {
  fn default() -> Self { Self { max_ops: 50_000, max_new_nodes: 20_000, max_new_edges: 40_000 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
  EmptyId,
  EmptyType,
  UnknownNodeType,
  UnknownEdgeType,
  MissingAttr,
  SelfEdge,
  DanglingSource,
  DanglingTarget,
  NodeNotFound,
  EdgeNotFound,
  TooManyOps,
  TooManyNodes,
  TooManyEdges,
  Unencodable,
}

/// One problem with one operation. Delta-wide limit issues carry no index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
  pub index:  Option<usize>,
  pub op:     Option<String>,
  pub code:   IssueCode,
  pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
  pub ops:    usize,
  pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
  pub fn is_ok(&self) -> bool { self.issues.is_empty() }

  /// First issue, formatted for a refusal message.
  pub fn summary(&self) -> Option<String> {
    self.issues.first().map(|i| match (i.index, &i.op) {
      (Some(index), Some(op)) => format!("op {index} ({op}): {:?}: {}", i.code, i.detail),
      _ => format!("{:?}: {}", i.code, i.detail),
    })
  }
}

/// Validate `ops` against `schema`, `limits` and the graph behind `view`.
///
/// Referential integrity is checked against the existing graph overlaid with
/// the nodes and edges introduced (or removed) earlier in the same delta.
pub fn validate_delta<V: GraphView>(
  ops: &[KgOp],
  view: &V,
  schema: &KgSchema,
  limits: &DeltaLimits,
) -> Result<ValidationReport, V::Error> {
  let mut report = ValidationReport { ops: ops.len(), issues: Vec::new() };

  if ops.len() > limits.max_ops {
    report.issues.push(ValidationIssue {
      index:  None,
      op:     None,
      code:   IssueCode::TooManyOps,
      detail: format!("{} operations exceed the limit of {}", ops.len(), limits.max_ops),
    });
    return Ok(report);
  }

  let mut added_nodes: HashSet<&str> = HashSet::new();
  let mut removed_nodes: HashSet<&str> = HashSet::new();
  let mut added_edges: HashSet<Hash256> = HashSet::new();
  let mut removed_edges: HashSet<Hash256> = HashSet::new();
  let mut new_nodes = 0usize;
  let mut new_edges = 0usize;

  for (index, op) in ops.iter().enumerate() {
    let mut issue = |code: IssueCode, detail: String| {
      report.issues.push(ValidationIssue {
        index: Some(index),
        op: Some(op.name().to_owned()),
        code,
        detail,
      });
    };

    let node_exists = |id: &str| -> Result<bool, V::Error> {
      if removed_nodes.contains(id) {
        return Ok(false);
      }
      Ok(added_nodes.contains(id) || view.has_node(id)?)
    };

    match op {
      KgOp::AddNode { id, node_type, attrs } => {
        if id.is_empty() {
          issue(IssueCode::EmptyId, "node id is empty".into());
        }
        if node_type.is_empty() {
          issue(IssueCode::EmptyType, "node type is empty".into());
        } else if !schema.node_types.is_empty() && !schema.node_types.contains(node_type) {
          issue(IssueCode::UnknownNodeType, format!("node type {node_type:?} is not permitted"));
        }
        if let Some(required) = schema.required_attrs.get(node_type) {
          for attr in required.iter().filter(|a| !attrs.contains_key(*a)) {
            issue(IssueCode::MissingAttr, format!("{node_type} node {id:?} lacks {attr:?}"));
          }
        }
        if !node_exists(id.as_str())? {
          new_nodes += 1;
        }
        removed_nodes.remove(id.as_str());
        added_nodes.insert(id);
      }

      KgOp::AddEdge { src, dst, edge_type, attrs } => {
        if edge_type.is_empty() {
          issue(IssueCode::EmptyType, "edge type is empty".into());
        } else if !schema.edge_types.is_empty() && !schema.edge_types.contains(edge_type) {
          issue(IssueCode::UnknownEdgeType, format!("edge type {edge_type:?} is not permitted"));
        }
        if schema.no_self_edges && src == dst {
          issue(IssueCode::SelfEdge, format!("{edge_type} edge loops on {src:?}"));
        }
        if !node_exists(src.as_str())? {
          issue(IssueCode::DanglingSource, format!("source node {src:?} does not exist"));
        }
        if !node_exists(dst.as_str())? {
          issue(IssueCode::DanglingTarget, format!("target node {dst:?} does not exist"));
        }
        match edge_key(src, dst, edge_type, attrs) {
          Ok(key) => {
            let present = !removed_edges.contains(&key)
              && (added_edges.contains(&key) || view.has_edge(&key)?);
            if !present {
              new_edges += 1;
            }
            removed_edges.remove(&key);
            added_edges.insert(key);
          }
          Err(e) => issue(IssueCode::Unencodable, e.to_string()),
        }
      }

      KgOp::UpdateNode { id, .. } => {
        if !node_exists(id.as_str())? {
          issue(IssueCode::NodeNotFound, format!("node {id:?} does not exist"));
        }
      }

      KgOp::RemoveNode { id } => {
        if !node_exists(id.as_str())? {
          issue(IssueCode::NodeNotFound, format!("node {id:?} does not exist"));
        }
        added_nodes.remove(id.as_str());
        removed_nodes.insert(id);
      }

      KgOp::RemoveEdge { edge_key } => {
        let present = !removed_edges.contains(edge_key)
          && (added_edges.contains(edge_key) || view.has_edge(edge_key)?);
        if !present {
          issue(IssueCode::EdgeNotFound, format!("edge {} does not exist", edge_key.short()));
        }
        added_edges.remove(edge_key);
        removed_edges.insert(*edge_key);
      }
    }
  }

  if new_nodes > limits.max_new_nodes {
    report.issues.push(ValidationIssue {
      index:  None,
      op:     None,
      code:   IssueCode::TooManyNodes,
      detail: format!("{new_nodes} new nodes exceed the limit of {}", limits.max_new_nodes),
    });
  }
  if new_edges > limits.max_new_edges {
    report.issues.push(ValidationIssue {
      index:  None,
      op:     None,
      code:   IssueCode::TooManyEdges,
      detail: format!("{new_edges} new edges exceed the limit of {}", limits.max_new_edges),
    });
  }

  Ok(report)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn node(id: &str, ty: &str) -> KgOp {
    KgOp::AddNode { id: id.into(), node_type: ty.into(), attrs: Attrs::new() }
  }

  fn edge(src: &str, dst: &str, ty: &str) -> KgOp {
    KgOp::AddEdge { src: src.into(), dst: dst.into(), edge_type: ty.into(), attrs: Attrs::new() }
  }

  #[test]
  fn ops_use_tagged_wire_format() {
    let op = edge("a", "b", "LINKS");
    let line = String::from_utf8(crate::canonical::canonicalize(&op).unwrap()).unwrap();
    assert_eq!(line, r#"{"attrs":{},"dst":"b","op":"ADD_EDGE","src":"a","type":"LINKS"}"#);

    let parsed: KgOp =
      serde_json::from_value(json!({"op": "REMOVE_NODE", "id": "a"})).unwrap();
    assert_eq!(parsed, KgOp::RemoveNode { id: "a".into() });
  }

  #[test]
  fn edge_key_ignores_attr_insertion_order() {
    let mut a = Attrs::new();
    a.insert("x".into(), json!(1));
    a.insert("y".into(), json!(2));
    let mut b = Attrs::new();
    b.insert("y".into(), json!(2));
    b.insert("x".into(), json!(1));
    assert_eq!(edge_key("s", "d", "T", &a).unwrap(), edge_key("s", "d", "T", &b).unwrap());
    assert_ne!(edge_key("s", "d", "T", &a).unwrap(), edge_key("d", "s", "T", &a).unwrap());
  }

  #[test]
  fn applying_twice_is_a_no_op() {
    let ops = vec![node("a", "Doc"), node("b", "Doc"), edge("a", "b", "LINKS")];
    let mut graph = KgState::new();
    assert_eq!(graph.apply_all(&ops).unwrap(), 3);
    let first = graph.snapshot().hash().unwrap();

    assert_eq!(graph.apply_all(&ops).unwrap(), 0);
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(graph.snapshot().hash().unwrap(), first);
  }

  #[test]
  fn removing_a_node_drops_its_edges() {
    let mut graph = KgState::new();
    graph
      .apply_all(&[node("a", "Doc"), node("b", "Doc"), edge("a", "b", "LINKS")])
      .unwrap();
    graph.apply(&KgOp::RemoveNode { id: "b".into() }).unwrap();
    assert_eq!(graph.node_count(), 1);
    assert_eq!(graph.edge_count(), 0);
  }

  #[test]
  fn update_merges_attributes() {
    let mut graph = KgState::new();
    graph.apply(&node("a", "Doc")).unwrap();
    let mut attrs = Attrs::new();
    attrs.insert("title".into(), json!("hello"));
    assert!(graph.apply(&KgOp::UpdateNode { id: "a".into(), attrs: attrs.clone() }).unwrap());
    assert!(!graph.apply(&KgOp::UpdateNode { id: "a".into(), attrs }).unwrap());
    assert_eq!(graph.node("a").unwrap().attrs["title"], json!("hello"));
  }

  #[test]
  fn edges_may_reference_nodes_introduced_earlier_in_the_delta() {
    let ops = vec![node("a", "Doc"), node("b", "Doc"), edge("a", "b", "LINKS")];
    let report =
      validate_delta(&ops, &KgState::new(), &KgSchema::default(), &DeltaLimits::default())
        .unwrap();
    assert!(report.is_ok(), "{:?}", report.issues);
  }

  #[test]
  fn dangling_edges_are_reported_per_operation() {
    let ops = vec![node("a", "Doc"), edge("a", "ghost", "LINKS"), edge("b", "a", "LINKS")];
    let report =
      validate_delta(&ops, &KgState::new(), &KgSchema::default(), &DeltaLimits::default())
        .unwrap();
    assert_eq!(report.issues.len(), 2);
    assert_eq!(report.issues[0].index, Some(1));
    assert_eq!(report.issues[0].code, IssueCode::DanglingTarget);
    assert_eq!(report.issues[1].index, Some(2));
    assert_eq!(report.issues[1].code, IssueCode::DanglingSource);
  }

  #[test]
  fn edges_to_nodes_removed_earlier_are_dangling() {
    let mut graph = KgState::new();
    graph.apply_all(&[node("a", "Doc"), node("b", "Doc")]).unwrap();
    let ops = vec![KgOp::RemoveNode { id: "b".into() }, edge("a", "b", "LINKS")];
    let report =
      validate_delta(&ops, &graph, &KgSchema::default(), &DeltaLimits::default()).unwrap();
    assert_eq!(report.issues[0].code, IssueCode::DanglingTarget);
  }

  #[test]
  fn schema_and_limits_are_enforced() {
    let schema = KgSchema {
      node_types:     ["Doc".to_string()].into(),
      edge_types:     ["LINKS".to_string()].into(),
      required_attrs: [("Doc".to_string(), vec!["path".to_string()])].into(),
      no_self_edges:  true,
    };
    let ops = vec![node("a", "Doc"), node("p", "Person"), edge("a", "a", "OWNS")];
    let report =
      validate_delta(&ops, &KgState::new(), &schema, &DeltaLimits::default()).unwrap();
    let codes: Vec<IssueCode> = report.issues.iter().map(|i| i.code).collect();
    assert!(codes.contains(&IssueCode::MissingAttr));
    assert!(codes.contains(&IssueCode::UnknownNodeType));
    assert!(codes.contains(&IssueCode::UnknownEdgeType));
    assert!(codes.contains(&IssueCode::SelfEdge));

    let limits = DeltaLimits { max_ops: 10, max_new_nodes: 1, max_new_edges: 10 };
    let report = validate_delta(
      &[node("a", "Doc"), node("b", "Doc")],
      &KgState::new(),
      &KgSchema::default(),
      &limits,
    )
    .unwrap();
    assert_eq!(report.issues[0].code, IssueCode::TooManyNodes);
    assert_eq!(report.issues[0].index, None);
  }
}
