//! [`StepStore`] implementation over the `task_steps` table.

use async_trait::async_trait;
use libsql::params;
use wise_shared::{Result, Step, WiseError};

use crate::store::StepStore;
use crate::{Storage, now_rfc3339, parse_timestamp, storage_err};

const STEP_COLUMNS: &str = "id, tid, pid, before_pid, next_pid, code, name, step_index, status, \
     params, result, duration_ms, error, created_at, updated_at";

#[async_trait]
impl StepStore for Storage {
    async fn create_steps(&self, steps: &[Step]) -> Result<()> {
        self.check_writable()?;
        for step in steps {
            self.conn
                .execute(
                    "INSERT INTO task_steps (tid, pid, before_pid, next_pid, code, name, step_index,
                                             status, params, result, duration_ms, error,
                                             created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        step.tid.as_str(),
                        step.pid.as_str(),
                        step.before_pid.clone(),
                        step.next_pid.clone(),
                        step.code.as_str(),
                        step.name.as_str(),
                        i64::from(step.index),
                        step.status.as_str(),
                        step.params.as_str(),
                        step.result.as_str(),
                        step.duration_ms as i64,
                        step.error.as_str(),
                        step.created_at.to_rfc3339(),
                        step.updated_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn update_step(&self, step: &Step) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE task_steps SET status = ?1, params = ?2, result = ?3, duration_ms = ?4,
                        error = ?5, updated_at = ?6
                 WHERE pid = ?7",
                params![
                    step.status.as_str(),
                    step.params.as_str(),
                    step.result.as_str(),
                    step.duration_ms as i64,
                    step.error.as_str(),
                    now_rfc3339(),
                    step.pid.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(WiseError::Storage(format!("step not found: {}", step.pid)));
        }
        Ok(())
    }

    async fn steps_by_task(&self, tid: &str) -> Result<Vec<Step>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM task_steps WHERE tid = ?1 ORDER BY step_index"),
                params![tid],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_step(&row)?);
        }
        Ok(results)
    }

    async fn get_step(&self, pid: &str) -> Result<Option<Step>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM task_steps WHERE pid = ?1"),
                params![pid],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_step(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn get_step_by_id(&self, id: i64) -> Result<Option<Step>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM task_steps WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_step(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}

/// Convert a database row to a [`Step`].
fn row_to_step(row: &libsql::Row) -> Result<Step> {
    let status: String = row.get(8).map_err(storage_err)?;
    let created_at: String = row.get(13).map_err(storage_err)?;
    let updated_at: String = row.get(14).map_err(storage_err)?;

    Ok(Step {
        id: row.get::<i64>(0).map_err(storage_err)?,
        tid: row.get::<String>(1).map_err(storage_err)?,
        pid: row.get::<String>(2).map_err(storage_err)?,
        before_pid: row.get::<Option<String>>(3).map_err(storage_err)?,
        next_pid: row.get::<Option<String>>(4).map_err(storage_err)?,
        code: row.get::<String>(5).map_err(storage_err)?,
        name: row.get::<String>(6).map_err(storage_err)?,
        index: row.get::<i64>(7).map_err(storage_err)? as u32,
        status: status.parse()?,
        params: row.get::<String>(9).map_err(storage_err)?,
        result: row.get::<String>(10).map_err(storage_err)?,
        duration_ms: row.get::<i64>(11).map_err(storage_err)? as u64,
        error: row.get::<String>(12).map_err(storage_err)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_chain, test_storage};
    use wise_shared::StepStatus;

    #[tokio::test]
    async fn chain_roundtrip_preserves_links() {
        let storage = test_storage().await;
        let chain = sample_chain("t-1", &["start", "check", "read", "split"]);
        storage.create_steps(&chain).await.expect("create steps");

        let steps = storage.steps_by_task("t-1").await.unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(
            steps.iter().map(|s| s.code.as_str()).collect::<Vec<_>>(),
            vec!["start", "check", "read", "split"]
        );
        assert!(steps[0].before_pid.is_none());
        assert_eq!(steps[0].next_pid.as_deref(), Some(steps[1].pid.as_str()));
        assert_eq!(steps[3].before_pid.as_deref(), Some(steps[2].pid.as_str()));
        assert!(steps[3].next_pid.is_none());
        assert_eq!(steps[2].index, 3);
        assert!(steps.iter().all(|s| s.status == StepStatus::Init));
    }

    #[tokio::test]
    async fn step_roundtrip_for_every_status() {
        let storage = test_storage().await;
        let codes = ["init", "running", "success", "failed", "cancelled"];
        let mut chain = sample_chain("t-all", &codes);
        for (step, status) in chain.iter_mut().zip(StepStatus::ALL) {
            step.status = status;
        }
        storage.create_steps(&chain).await.unwrap();

        let stored = storage.steps_by_task("t-all").await.unwrap();
        assert_eq!(stored.len(), StepStatus::ALL.len());
        for (expected, found) in chain.iter().zip(&stored) {
            assert_eq!(found.status, expected.status);
            assert_eq!(found.index, expected.index);
            assert_eq!(found.pid, expected.pid);
            assert_eq!(found.before_pid, expected.before_pid);
            assert_eq!(found.next_pid, expected.next_pid);
            assert_eq!(found.code, expected.code);
        }

        // Status written through an update comes back as well.
        for status in StepStatus::ALL {
            let mut step = stored[0].clone();
            step.status = status;
            storage.update_step(&step).await.unwrap();
            let found = storage.get_step(&step.pid).await.unwrap().expect("step");
            assert_eq!(found.status, status);
            assert_eq!(found.before_pid, None);
            assert_eq!(found.next_pid.as_deref(), Some(stored[1].pid.as_str()));
        }
    }

    #[tokio::test]
    async fn steps_are_scoped_to_their_task() {
        let storage = test_storage().await;
        storage
            .create_steps(&sample_chain("t-a", &["start", "read"]))
            .await
            .unwrap();
        storage
            .create_steps(&sample_chain("t-b", &["start"]))
            .await
            .unwrap();

        assert_eq!(storage.steps_by_task("t-a").await.unwrap().len(), 2);
        assert_eq!(storage.steps_by_task("t-b").await.unwrap().len(), 1);
        assert!(storage.steps_by_task("t-c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_and_lookup() {
        let storage = test_storage().await;
        let chain = sample_chain("t-2", &["start", "check"]);
        storage.create_steps(&chain).await.unwrap();

        let mut step = storage.get_step(&chain[1].pid).await.unwrap().expect("step");
        step.status = StepStatus::Success;
        step.result = r#"{"types":"wechat"}"#.into();
        step.duration_ms = 42;
        storage.update_step(&step).await.unwrap();

        let found = storage.get_step_by_id(step.id).await.unwrap().expect("by id");
        assert_eq!(found.status, StepStatus::Success);
        assert_eq!(found.result, r#"{"types":"wechat"}"#);
        assert_eq!(found.duration_ms, 42);
        assert_eq!(found.code, "check");
    }

    #[tokio::test]
    async fn update_unknown_step_fails() {
        let storage = test_storage().await;
        let mut chain = sample_chain("t-3", &["start"]);
        chain[0].pid = "never-inserted".into();
        assert!(storage.update_step(&chain[0]).await.is_err());
        assert!(storage.get_step("never-inserted").await.unwrap().is_none());
    }
}
