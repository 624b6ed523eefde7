/// Complete database schema for the tagging engine.
///
/// Uses CREATE TABLE/INDEX IF NOT EXISTS for idempotent execution.
/// All statements are designed to be run in a single batch.
///
/// The unique constraint on `tags.name` (and on `tag_synonyms.synonym`) is
/// what makes tag creation an atomic check-and-insert under concurrency: a
/// losing creator gets a constraint violation, surfaced as a conflict.
pub const INITIAL_SCHEMA: &str = r#"
-- Canonical tags: names unique case-insensitively
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    description TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
    created_at INTEGER NOT NULL
);

-- Alternate labels resolving to a canonical tag
CREATE TABLE IF NOT EXISTS tag_synonyms (
    synonym TEXT NOT NULL UNIQUE COLLATE NOCASE,
    tag_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

-- Classification buckets
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    description TEXT
);

-- Typed tag relations: child_of targets a tag, belongs_to targets a category
CREATE TABLE IF NOT EXISTS tag_edges (
    edge_type TEXT NOT NULL CHECK (edge_type IN ('child_of', 'belongs_to')),
    source_tag_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    PRIMARY KEY (edge_type, source_tag_id, target_id),
    CHECK (NOT (edge_type = 'child_of' AND source_tag_id = target_id)),
    FOREIGN KEY (source_tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

-- Clusters: membership lives on documents.cluster_id, rewritten wholesale
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Documents: embedding stored as little-endian f32 BLOB, NULL cluster = noise
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    content TEXT NOT NULL,
    embedding BLOB,
    cluster_id INTEGER REFERENCES clusters(id) ON DELETE SET NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Junction table: tag attachments with confidence and provenance
CREATE TABLE IF NOT EXISTS document_tags (
    document_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    source TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (document_id, tag_id),
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

-- One category assignment per document
CREATE TABLE IF NOT EXISTS document_categories (
    document_id INTEGER PRIMARY KEY,
    category_id INTEGER NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
    FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
);

-- Latest committed classifier artifact (vectorizer + weights + categories)
CREATE TABLE IF NOT EXISTS classifier_models (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    artifact TEXT NOT NULL,
    trained_at INTEGER NOT NULL
);

-- Indexes for junction table lookups and co-occurrence scans
CREATE INDEX IF NOT EXISTS idx_document_tags_doc ON document_tags(document_id);
CREATE INDEX IF NOT EXISTS idx_document_tags_tag ON document_tags(tag_id);
CREATE INDEX IF NOT EXISTS idx_tag_synonyms_tag ON tag_synonyms(tag_id);
CREATE INDEX IF NOT EXISTS idx_tag_edges_target ON tag_edges(edge_type, target_id);
CREATE INDEX IF NOT EXISTS idx_documents_cluster ON documents(cluster_id);
"#;
