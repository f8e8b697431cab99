pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cards (
    id TEXT PRIMARY KEY,
    card_type TEXT NOT NULL,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    owner_agent_id TEXT NOT NULL,
    parent_card_id TEXT,
    child_card_ids TEXT NOT NULL,
    links TEXT NOT NULL,
    risk REAL NOT NULL,
    confidence REAL NOT NULL,
    coverage_impact REAL NOT NULL,
    from_view TEXT,
    to_view TEXT,
    proposed_fix TEXT,
    audit_log TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cards_status ON cards(status);
CREATE INDEX IF NOT EXISTS idx_cards_owner_agent ON cards(owner_agent_id);
CREATE INDEX IF NOT EXISTS idx_cards_parent ON cards(parent_card_id);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    target_path TEXT NOT NULL,
    target_qualifier TEXT,
    status TEXT NOT NULL,
    parent_id TEXT,
    child_ids TEXT NOT NULL,
    session_id TEXT NOT NULL,
    messages TEXT NOT NULL,
    findings TEXT NOT NULL,
    created_card_ids TEXT NOT NULL,
    total_tokens_in INTEGER NOT NULL,
    total_tokens_out INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents(parent_id);
CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

CREATE TABLE IF NOT EXISTS analysis_sessions (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    mode TEXT NOT NULL,
    base_reference TEXT,
    current_commit TEXT,
    files_analyzed TEXT NOT NULL,
    files_skipped TEXT NOT NULL,
    module_count INTEGER NOT NULL,
    function_count INTEGER NOT NULL,
    cache_hits INTEGER NOT NULL,
    cache_misses INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    errors TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS id_sequences (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;
