//! Knowledge-graph storage.
//!
//! Mutations go through [`LedgerTx`], so they only ever happen inside a
//! `kg_delta_events` append. The semantics match
//! [`KgState::apply`](fieldpack_core::kg::KgState::apply) exactly; the
//! local-graph replay relies on it.

use fieldpack_core::{
  Hash256,
  kg::{Attrs, Edge, GraphView, KgOp, KgSnapshot, Node, edge_key},
};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::{
  Error, Result, Store,
  encode::{RawEdge, RawNode, encode_json},
  ledger::LedgerTx,
};

const NODE_COLUMNS: &str = "id, type, attrs_json";
const EDGE_COLUMNS: &str = "edge_key, src, dst, type, attrs_json";

fn load_node(conn: &Connection, id: &str) -> Result<Option<Node>> {
  let raw = conn
    .query_row(
      &format!("SELECT {NODE_COLUMNS} FROM kg_nodes WHERE id = ?1"),
      [id],
      RawNode::from_row,
    )
    .optional()?;
  raw.map(RawNode::into_node).transpose()
}

fn has_node(conn: &Connection, id: &str) -> Result<bool> {
  Ok(conn.query_row("SELECT 1 FROM kg_nodes WHERE id = ?1", [id], |_| Ok(())).optional()?.is_some())
}

fn has_edge(conn: &Connection, key: &Hash256) -> Result<bool> {
  Ok(
    conn
      .query_row("SELECT 1 FROM kg_edges WHERE edge_key = ?1", [key.to_hex()], |_| Ok(()))
      .optional()?
      .is_some(),
  )
}

fn snapshot(conn: &Connection) -> Result<KgSnapshot> {
  let mut nodes_stmt =
    conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM kg_nodes ORDER BY id ASC"))?;
  let nodes = nodes_stmt
    .query_map([], RawNode::from_row)?
    .map(|r| r?.into_node())
    .collect::<Result<Vec<_>>>()?;

  let mut edges_stmt =
    conn.prepare(&format!("SELECT {EDGE_COLUMNS} FROM kg_edges ORDER BY edge_key ASC"))?;
  let edges = edges_stmt
    .query_map([], RawEdge::from_row)?
    .map(|r| r?.into_edge())
    .collect::<Result<Vec<_>>>()?;

  Ok(KgSnapshot { nodes, edges })
}

// ─── Writes ──────────────────────────────────────────────────────────────────

impl LedgerTx<'_> {
  /// Apply one operation. Returns whether the graph changed.
  pub fn apply_op(&self, op: &KgOp) -> Result<bool> {
    let conn = self.conn;
    match op {
      KgOp::AddNode { id, node_type, attrs } => {
        let attrs_json = encode_json(attrs)?;
        let changed = conn.execute(
          "INSERT INTO kg_nodes (id, type, attrs_json) VALUES (?1, ?2, ?3)
           ON CONFLICT(id) DO UPDATE SET type = excluded.type, attrs_json = excluded.attrs_json
           WHERE kg_nodes.type != excluded.type OR kg_nodes.attrs_json != excluded.attrs_json",
          params![id, node_type, attrs_json],
        )?;
        Ok(changed > 0)
      }

      KgOp::AddEdge { src, dst, edge_type, attrs } => {
        let key = edge_key(src, dst, edge_type, attrs)?;
        let inserted = conn.execute(
          &format!("INSERT OR IGNORE INTO kg_edges ({EDGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
          params![key.to_hex(), src, dst, edge_type, encode_json(attrs)?],
        )?;
        Ok(inserted > 0)
      }

      KgOp::UpdateNode { id, attrs } => {
        let Some(node) = load_node(conn, id)? else {
          return Ok(false);
        };
        let mut merged: Attrs = node.attrs.clone();
        merged.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        if merged == node.attrs {
          return Ok(false);
        }
        conn.execute(
          "UPDATE kg_nodes SET attrs_json = ?2 WHERE id = ?1",
          params![id, encode_json(&merged)?],
        )?;
        Ok(true)
      }

      KgOp::RemoveNode { id } => {
        let edges = conn.execute("DELETE FROM kg_edges WHERE src = ?1 OR dst = ?1", [id])?;
        let nodes = conn.execute("DELETE FROM kg_nodes WHERE id = ?1", [id])?;
        Ok(edges + nodes > 0)
      }

      KgOp::RemoveEdge { edge_key } => {
        let removed =
          conn.execute("DELETE FROM kg_edges WHERE edge_key = ?1", [edge_key.to_hex()])?;
        Ok(removed > 0)
      }
    }
  }

  /// Whether `bundle_sha256` has been merged, as seen by this transaction.
  pub fn is_merged(&self, bundle_sha256: &Hash256) -> Result<bool> {
    is_merged(self.conn, bundle_sha256)
  }

  /// Record a merge. Fails with [`Error::AlreadyMerged`] on a duplicate.
  pub fn record_merge(
    &self,
    bundle_sha256: &Hash256,
    delta_hash: &Hash256,
    ops: usize,
    decision_kind: &str,
    merged_utc: &str,
  ) -> Result<()> {
    let inserted = self.conn.execute(
      "INSERT OR IGNORE INTO merged_bundles
         (bundle_sha256, delta_hash, ops, decision_kind, merged_utc)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![bundle_sha256.to_hex(), delta_hash.to_hex(), ops as i64, decision_kind, merged_utc],
    )?;
    if inserted == 0 {
      return Err(Error::AlreadyMerged(*bundle_sha256));
    }
    Ok(())
  }
}

fn is_merged(conn: &Connection, bundle_sha256: &Hash256) -> Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM merged_bundles WHERE bundle_sha256 = ?1",
        [bundle_sha256.to_hex()],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

impl GraphView for LedgerTx<'_> {
  type Error = Error;

  fn has_node(&self, id: &str) -> Result<bool> { has_node(self.conn, id) }

  fn has_edge(&self, key: &Hash256) -> Result<bool> { has_edge(self.conn, key) }
}

// ─── Reads ───────────────────────────────────────────────────────────────────

impl Store {
  pub fn node(&self, id: &str) -> Result<Option<Node>> { load_node(&self.conn(), id) }

  /// Every edge touching `id`, ordered by key.
  pub fn edges_of(&self, id: &str) -> Result<Vec<Edge>> {
    let conn = self.conn();
    let mut stmt = conn.prepare(&format!(
      "SELECT {EDGE_COLUMNS} FROM kg_edges WHERE src = ?1 OR dst = ?1 ORDER BY edge_key ASC"
    ))?;
    let rows = stmt.query_map([id], RawEdge::from_row)?;
    rows.map(|r| r?.into_edge()).collect()
  }

  pub fn node_count(&self) -> Result<u64> {
    let n: i64 = self.conn().query_row("SELECT COUNT(*) FROM kg_nodes", [], |r| r.get(0))?;
    Ok(n as u64)
  }

  pub fn edge_count(&self) -> Result<u64> {
    let n: i64 = self.conn().query_row("SELECT COUNT(*) FROM kg_edges", [], |r| r.get(0))?;
    Ok(n as u64)
  }

  /// The whole graph, read inside one transaction so it is never torn.
  pub fn graph_snapshot(&self) -> Result<KgSnapshot> {
    let mut conn = self.conn();
    let tx = conn.transaction()?;
    let snap = snapshot(&tx)?;
    tx.commit()?;
    Ok(snap)
  }

  pub fn is_merged(&self, bundle_sha256: &Hash256) -> Result<bool> {
    is_merged(&self.conn(), bundle_sha256)
  }
}

impl GraphView for Store {
  type Error = Error;

  fn has_node(&self, id: &str) -> Result<bool> { has_node(&self.conn(), id) }

  fn has_edge(&self, key: &Hash256) -> Result<bool> { has_edge(&self.conn(), key) }
}
