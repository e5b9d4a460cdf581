//! SQL migration definitions for the Wise task database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: tasks, task_steps",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per submitted unit of work
CREATE TABLE IF NOT EXISTS tasks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    tid           TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    task_type     TEXT NOT NULL,
    status        TEXT NOT NULL,
    current_state TEXT NOT NULL,
    total_steps   INTEGER NOT NULL,
    current_step  INTEGER NOT NULL,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    params        TEXT NOT NULL,
    result        TEXT NOT NULL,
    error         TEXT NOT NULL,
    extend        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(task_type);

-- Ordered step chain, one row per registered state
CREATE TABLE IF NOT EXISTS task_steps (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tid         TEXT NOT NULL,
    pid         TEXT NOT NULL UNIQUE,
    before_pid  TEXT,
    next_pid    TEXT,
    code        TEXT NOT NULL,
    name        TEXT NOT NULL,
    step_index  INTEGER NOT NULL,
    status      TEXT NOT NULL,
    params      TEXT NOT NULL,
    result      TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    error       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE(tid, step_index)
);

CREATE INDEX IF NOT EXISTS idx_task_steps_tid ON task_steps(tid);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
