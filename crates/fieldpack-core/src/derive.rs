//! Graph operations implied by ingestion provenance.
//!
//! The sealer and the replayer both call [`ingest_ops`]; a bundle whose
//! `kg_delta.jsonl` differs from what its own provenance implies cannot replay.

use serde_json::json;

use crate::{
  kg::{Attrs, KgOp},
  ledger::LedgerEvent,
  records::IngestRecord,
};

/// Chunk nodes emitted per document.
pub const MAX_CHUNK_NODES: usize = 200;

pub fn doc_node_id(record: &IngestRecord) -> String { format!("doc:{}", record.raw_sha256) }

fn attrs(pairs: impl IntoIterator<Item = (&'static str, serde_json::Value)>) -> Attrs {
  pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

/// Operations for one ingested document.
pub fn record_ops(record: &IngestRecord) -> Vec<KgOp> {
  let doc = doc_node_id(record);
  let mut ops = vec![KgOp::AddNode {
    id:        doc.clone(),
    node_type: "Document".into(),
    attrs:     attrs([
      ("path", json!(record.path)),
      ("mime", json!(record.mime)),
      ("size", json!(record.size)),
      ("sha256", json!(record.raw_sha256)),
    ]),
  }];

  let blobs = std::iter::once(("raw", record.raw_sha256))
    .chain(record.extract_sha256.map(|sha| ("extract", sha)));
  for (kind, sha) in blobs {
    let id = format!("blob:{kind}:{sha}");
    ops.push(KgOp::AddNode {
      id:        id.clone(),
      node_type: "Blob".into(),
      attrs:     attrs([("kind", json!(kind)), ("sha256", json!(sha))]),
    });
    ops.push(KgOp::AddEdge {
      src:       doc.clone(),
      dst:       id,
      edge_type: "HAS_BLOB".into(),
      attrs:     attrs([("kind", json!(kind))]),
    });
  }

  for chunk in record.chunks.iter().take(MAX_CHUNK_NODES) {
    let id = format!("chunk:{}:{}", record.raw_sha256, chunk.index);
    ops.push(KgOp::AddNode {
      id:        id.clone(),
      node_type: "Chunk".into(),
      attrs:     attrs([
        ("index", json!(chunk.index)),
        ("start", json!(chunk.start)),
        ("end", json!(chunk.end)),
        ("sha256", json!(chunk.sha256)),
      ]),
    });
    ops.push(KgOp::AddEdge {
      src:       doc.clone(),
      dst:       id,
      edge_type: "HAS_CHUNK".into(),
      attrs:     attrs([("index", json!(chunk.index))]),
    });
  }
  ops
}

/// Operations for a slice of `INGEST` events, in ledger order.
pub fn ingest_ops(events: &[LedgerEvent<IngestRecord>]) -> Vec<KgOp> {
  events.iter().flat_map(|e| record_ops(&e.payload)).collect()
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  use super::*;
  use crate::{
    canonical::digest,
    kg::{DeltaLimits, KgSchema, KgState, validate_delta},
    records::ChunkRef,
  };

  fn record(chunks: usize) -> IngestRecord {
    IngestRecord {
      doc_id:           Uuid::nil(),
      path:             "notes.txt".into(),
      mime:             "text/plain".into(),
      size:             10,
      raw_sha256:       digest(b"raw"),
      extract_sha256:   Some(digest(b"text")),
      extract_strategy: "utf8".into(),
      toolchain_id:     "tc".into(),
      chunks:           (0..chunks)
        .map(|i| ChunkRef { index: i, start: i, end: i + 1, sha256: digest(&[i as u8]) })
        .collect(),
    }
  }

  #[test]
  fn document_blobs_and_chunks_are_linked() {
    let ops = record_ops(&record(2));
    // doc + 2 blobs with edges + 2 chunks with edges
    assert_eq!(ops.len(), 1 + 4 + 4);
    let report =
      validate_delta(&ops, &KgState::new(), &KgSchema::default(), &DeltaLimits::default())
        .unwrap();
    assert!(report.is_ok());
  }

  #[test]
  fn chunk_nodes_are_capped() {
    let ops = record_ops(&record(MAX_CHUNK_NODES + 5));
    let chunks = ops
      .iter()
      .filter(|op| matches!(op, KgOp::AddNode { node_type, .. } if node_type == "Chunk"))
      .count();
    assert_eq!(chunks, MAX_CHUNK_NODES);
  }

  #[test]
  fn derivation_is_stable() {
    assert_eq!(record_ops(&record(3)), record_ops(&record(3)));
  }
}
