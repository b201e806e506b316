/// Schema for the persistent bucket cache.
pub const SCHEMA: &str = r#"
-- Named, versioned buckets; a row exists once the bucket was first written
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Stored responses, keyed by request fingerprint
CREATE TABLE IF NOT EXISTS bucket_entries (
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (bucket, request_key),
    FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_bucket_entries_age
    ON bucket_entries(bucket, stored_at, seq);

-- Small key/value store for lifecycle bookkeeping (e.g. the active version)
CREATE TABLE IF NOT EXISTS registry_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

PRAGMA foreign_keys = ON;
"#;
