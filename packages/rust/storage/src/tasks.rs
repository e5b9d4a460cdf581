//! [`TaskStore`] implementation over the `tasks` table.

use async_trait::async_trait;
use libsql::{Value, params, params_from_iter};
use wise_shared::{Result, Task, TaskPage, TaskQuery, TaskStatus, WiseError};

use crate::store::TaskStore;
use crate::{Storage, now_rfc3339, parse_timestamp, storage_err};

const TASK_COLUMNS: &str = "id, tid, name, task_type, status, current_state, total_steps, \
     current_step, retry_count, params, result, error, extend, created_at, updated_at";

#[async_trait]
impl TaskStore for Storage {
    async fn create_task(&self, task: &Task) -> Result<i64> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO tasks (tid, name, task_type, status, current_state, total_steps,
                                    current_step, retry_count, params, result, error, extend,
                                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    task.tid.as_str(),
                    task.name.as_str(),
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.current_state.as_str(),
                    i64::from(task.total_steps),
                    i64::from(task.current_step),
                    i64::from(task.retry_count),
                    task.params.as_str(),
                    task.result.as_str(),
                    task.error.as_str(),
                    task.extend.as_str(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET name = ?1, task_type = ?2, status = ?3, current_state = ?4,
                        total_steps = ?5, current_step = ?6, retry_count = ?7, params = ?8,
                        result = ?9, error = ?10, extend = ?11, updated_at = ?12
                 WHERE tid = ?13",
                params![
                    task.name.as_str(),
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.current_state.as_str(),
                    i64::from(task.total_steps),
                    i64::from(task.current_step),
                    i64::from(task.retry_count),
                    task.params.as_str(),
                    task.result.as_str(),
                    task.error.as_str(),
                    task.extend.as_str(),
                    now_rfc3339(),
                    task.tid.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(WiseError::TaskNotFound(task.tid.clone()));
        }
        Ok(())
    }

    async fn get_task(&self, tid: &str) -> Result<Option<Task>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE tid = ?1"),
                params![tid],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn get_task_by_id(&self, id: i64) -> Result<Option<Task>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn tasks_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                     ORDER BY created_at, id LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_task(&row)?);
        }
        Ok(results)
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(name) = query.name.as_deref().filter(|n| !n.is_empty()) {
            values.push(Value::Text(format!("%{name}%")));
            clauses.push(format!("name LIKE ?{}", values.len()));
        }
        if let Some(status) = query.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(task_type) = query.task_type.as_deref().filter(|t| !t.is_empty()) {
            values.push(Value::Text(task_type.to_string()));
            clauses.push(format!("task_type = ?{}", values.len()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM tasks {where_sql}"),
                params_from_iter(values.clone()),
            )
            .await
            .map_err(storage_err)?;
        let total = match rows.next().await.map_err(storage_err)? {
            Some(row) => row.get::<i64>(0).map_err(storage_err)? as u64,
            None => 0,
        };

        let limit_idx = values.len() + 1;
        let offset_idx = values.len() + 2;
        values.push(Value::Integer(i64::from(query.page_size)));
        values.push(Value::Integer(query.offset() as i64));

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks {where_sql}
                     ORDER BY created_at DESC, id DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                ),
                params_from_iter(values),
            )
            .await
            .map_err(storage_err)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            items.push(row_to_task(&row)?);
        }
        Ok(TaskPage { total, items })
    }

    async fn update_status(&self, tid: &str, status: TaskStatus, error: &str) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3 WHERE tid = ?4",
                params![status.as_str(), error, now_rfc3339(), tid],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(WiseError::TaskNotFound(tid.to_string()));
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        tid: &str,
        state: &str,
        step: u32,
        result: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET current_state = ?1, current_step = ?2, result = ?3, updated_at = ?4
                 WHERE tid = ?5",
                params![state, i64::from(step), result, now_rfc3339(), tid],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(WiseError::TaskNotFound(tid.to_string()));
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        tid: &str,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        self.check_writable()?;
        let changed = match error {
            Some(error) => self
                .conn
                .execute(
                    "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3
                     WHERE tid = ?4 AND status = ?5",
                    params![to.as_str(), error, now_rfc3339(), tid, from.as_str()],
                )
                .await
                .map_err(storage_err)?,
            None => self
                .conn
                .execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE tid = ?3 AND status = ?4",
                    params![to.as_str(), now_rfc3339(), tid, from.as_str()],
                )
                .await
                .map_err(storage_err)?,
        };
        Ok(changed > 0)
    }

    async fn record_retry(&self, tid: &str, retry_count: u32, error: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, retry_count = ?2, error = ?3, updated_at = ?4
                 WHERE tid = ?5 AND status = ?6",
                params![
                    TaskStatus::Retry.as_str(),
                    i64::from(retry_count),
                    error,
                    now_rfc3339(),
                    tid,
                    TaskStatus::Running.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    async fn reset_for_retry(&self, tid: &str, from: TaskStatus) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, retry_count = 0, error = '', updated_at = ?2
                 WHERE tid = ?3 AND status = ?4",
                params![TaskStatus::Init.as_str(), now_rfc3339(), tid, from.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    async fn recover_running(&self) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE status = ?3",
                params![
                    TaskStatus::Retry.as_str(),
                    now_rfc3339(),
                    TaskStatus::Running.as_str()
                ],
            )
            .await
            .map_err(storage_err)
    }

    async fn delete_task(&self, tid: &str) -> Result<bool> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM task_steps WHERE tid = ?1", params![tid])
            .await
            .map_err(storage_err)?;
        let changed = self
            .conn
            .execute("DELETE FROM tasks WHERE tid = ?1", params![tid])
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }
}

/// Convert a database row to a [`Task`].
fn row_to_task(row: &libsql::Row) -> Result<Task> {
    let status: String = row.get(4).map_err(storage_err)?;
    let created_at: String = row.get(13).map_err(storage_err)?;
    let updated_at: String = row.get(14).map_err(storage_err)?;

    Ok(Task {
        id: row.get::<i64>(0).map_err(storage_err)?,
        tid: row.get::<String>(1).map_err(storage_err)?,
        name: row.get::<String>(2).map_err(storage_err)?,
        task_type: row.get::<String>(3).map_err(storage_err)?,
        status: status.parse()?,
        current_state: row.get::<String>(5).map_err(storage_err)?,
        total_steps: row.get::<i64>(6).map_err(storage_err)? as u32,
        current_step: row.get::<i64>(7).map_err(storage_err)? as u32,
        retry_count: row.get::<i64>(8).map_err(storage_err)? as u32,
        params: row.get::<String>(9).map_err(storage_err)?,
        result: row.get::<String>(10).map_err(storage_err)?,
        error: row.get::<String>(11).map_err(storage_err)?,
        extend: row.get::<String>(12).map_err(storage_err)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
