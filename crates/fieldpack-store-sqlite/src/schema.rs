//! SQL schema for the fieldpack SQLite store.
//!
//! Executed on every open; idempotent thanks to `IF NOT EXISTS`. The version
//! is recorded in `PRAGMA user_version` for future migrations.

/// Per-connection settings.
pub const CONNECTION_PRAGMAS: &str = "
PRAGMA foreign_keys = ON;
PRAGMA synchronous = FULL;
";

/// Full schema DDL.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- ── Ledgers ─────────────────────────────────────────────────────────────────
-- Hash-chained and append-only: the triggers refuse UPDATE and DELETE.

CREATE TABLE IF NOT EXISTS ingest_events (
    seq          INTEGER PRIMARY KEY,
    ts_utc       TEXT NOT NULL,   -- RFC 3339, microseconds, UTC
    event_type   TEXT NOT NULL,
    payload_json TEXT NOT NULL,   -- canonical JSON
    prev_hash    TEXT,            -- NULL for the first event
    event_hash   TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS tool_run_events (
    seq          INTEGER PRIMARY KEY,
    ts_utc       TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    prev_hash    TEXT,
    event_hash   TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS llm_call_events (
    seq          INTEGER PRIMARY KEY,
    ts_utc       TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    prev_hash    TEXT,
    event_hash   TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS kg_delta_events (
    seq          INTEGER PRIMARY KEY,
    ts_utc       TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    prev_hash    TEXT,
    event_hash   TEXT NOT NULL UNIQUE
);

CREATE TRIGGER IF NOT EXISTS ingest_events_no_update BEFORE UPDATE ON ingest_events
BEGIN SELECT RAISE(ABORT, 'ingest_events is append-only'); END;
CREATE TRIGGER IF NOT EXISTS ingest_events_no_delete BEFORE DELETE ON ingest_events
BEGIN SELECT RAISE(ABORT, 'ingest_events is append-only'); END;

CREATE TRIGGER IF NOT EXISTS tool_run_events_no_update BEFORE UPDATE ON tool_run_events
BEGIN SELECT RAISE(ABORT, 'tool_run_events is append-only'); END;
CREATE TRIGGER IF NOT EXISTS tool_run_events_no_delete BEFORE DELETE ON tool_run_events
BEGIN SELECT RAISE(ABORT, 'tool_run_events is append-only'); END;

CREATE TRIGGER IF NOT EXISTS llm_call_events_no_update BEFORE UPDATE ON llm_call_events
BEGIN SELECT RAISE(ABORT, 'llm_call_events is append-only'); END;
CREATE TRIGGER IF NOT EXISTS llm_call_events_no_delete BEFORE DELETE ON llm_call_events
BEGIN SELECT RAISE(ABORT, 'llm_call_events is append-only'); END;

CREATE TRIGGER IF NOT EXISTS kg_delta_events_no_update BEFORE UPDATE ON kg_delta_events
BEGIN SELECT RAISE(ABORT, 'kg_delta_events is append-only'); END;
CREATE TRIGGER IF NOT EXISTS kg_delta_events_no_delete BEFORE DELETE ON kg_delta_events
BEGIN SELECT RAISE(ABORT, 'kg_delta_events is append-only'); END;

-- ── Catalog ─────────────────────────────────────────────────────────────────

-- Metadata for CAS blobs. The bytes live on disk under the CAS root.
CREATE TABLE IF NOT EXISTS blobs (
    sha256      TEXT NOT NULL,
    kind        TEXT NOT NULL,     -- 'raw' | 'extract' | 'aux'
    size        INTEGER NOT NULL,
    created_utc TEXT NOT NULL,
    source_path TEXT,
    PRIMARY KEY (sha256, kind)
);

CREATE TABLE IF NOT EXISTS documents (
    doc_id           TEXT PRIMARY KEY,
    path             TEXT NOT NULL,
    mime             TEXT NOT NULL,
    size             INTEGER NOT NULL,
    raw_sha256       TEXT NOT NULL,
    extract_sha256   TEXT,
    extract_strategy TEXT NOT NULL,
    created_utc      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    doc_id     TEXT NOT NULL REFERENCES documents(doc_id),
    idx        INTEGER NOT NULL,
    start_char INTEGER NOT NULL,
    end_char   INTEGER NOT NULL,
    text       TEXT NOT NULL,
    sha256     TEXT NOT NULL,
    PRIMARY KEY (doc_id, idx)
);

CREATE INDEX IF NOT EXISTS documents_raw_idx ON documents(raw_sha256);

-- ── Knowledge graph ─────────────────────────────────────────────────────────
-- Mutated only inside a kg_delta_events append.

CREATE TABLE IF NOT EXISTS kg_nodes (
    id         TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    attrs_json TEXT NOT NULL       -- canonical JSON object
);

CREATE TABLE IF NOT EXISTS kg_edges (
    edge_key   TEXT PRIMARY KEY,   -- sha256(canonical {src, dst, type, attrs})
    src        TEXT NOT NULL,
    dst        TEXT NOT NULL,
    type       TEXT NOT NULL,
    attrs_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS kg_edges_src_idx ON kg_edges(src);
CREATE INDEX IF NOT EXISTS kg_edges_dst_idx ON kg_edges(dst);

-- ── Acceptance ──────────────────────────────────────────────────────────────

-- One row per bundle digest ever merged; the import idempotency key.
CREATE TABLE IF NOT EXISTS merged_bundles (
    bundle_sha256 TEXT PRIMARY KEY,
    delta_hash    TEXT NOT NULL,
    ops           INTEGER NOT NULL,
    decision_kind TEXT NOT NULL,
    merged_utc    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS staged_bundles (
    staged_id         TEXT PRIMARY KEY,
    bundle_sha256     TEXT NOT NULL UNIQUE,
    bundle_path       TEXT NOT NULL,
    status            TEXT NOT NULL,   -- 'PENDING' | 'APPROVED' | 'REJECTED' | 'QUARANTINED'
    policy_mode       TEXT NOT NULL,
    verification_json TEXT NOT NULL,
    validation_json   TEXT NOT NULL,
    created_utc       TEXT NOT NULL,
    submitted_by      TEXT NOT NULL,
    notes             TEXT NOT NULL DEFAULT '',
    decision_json     TEXT,            -- actor, notes, timestamp once decided
    last_error        TEXT
);

CREATE INDEX IF NOT EXISTS staged_status_idx ON staged_bundles(status);

-- ── Sealing ─────────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS seal_checkpoints (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    label         TEXT NOT NULL,
    bundle_sha256 TEXT NOT NULL,
    bundle_path   TEXT NOT NULL,
    sealed_utc    TEXT NOT NULL,
    ranges_json   TEXT NOT NULL        -- {ledger: {from_seq, to_seq}}
);

PRAGMA user_version = 1;
";
