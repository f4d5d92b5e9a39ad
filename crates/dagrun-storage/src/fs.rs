//! File-backed run store
//!
//! Layout, per run:
//!
//! ```text
//! <data_dir>/<dag_name>/runs/<workflow_id>/status.json
//! <data_dir>/<dag_name>/runs/<workflow_id>/logs/<step>.log
//! ```
//!
//! `status.json` is rewritten atomically (write to a temp file, then
//! rename) on every transition, so readers always see a complete snapshot.
//! History ordering comes from the snapshots' creation timestamps.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dagrun_core::RunSnapshot;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{RunStore, StoreError};

/// Production run store rooted at a data directory
pub struct FileRunStore {
    base: PathBuf,
}

impl FileRunStore {
    /// Create a store rooted at `base`. The directory is created lazily.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn runs_dir(&self, dag_name: &str) -> PathBuf {
        self.base.join(dag_name).join("runs")
    }

    fn run_dir(&self, dag_name: &str, workflow_id: Uuid) -> PathBuf {
        self.runs_dir(dag_name).join(workflow_id.to_string())
    }

    fn status_path(&self, dag_name: &str, workflow_id: Uuid) -> PathBuf {
        self.run_dir(dag_name, workflow_id).join("status.json")
    }

    /// Run directories for a DAG, in no particular order.
    async fn run_ids(&self, dag_name: &str) -> Result<Vec<Uuid>, StoreError> {
        let dir = self.runs_dir(dag_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                match Uuid::parse_str(name) {
                    Ok(id) => ids.push(id),
                    Err(_) => warn!(dir = %dir.display(), entry = name, "ignoring stray entry"),
                }
            }
        }
        Ok(ids)
    }

    /// All readable snapshots of a DAG, newest first by creation time.
    async fn load_all(&self, dag_name: &str) -> Result<Vec<RunSnapshot>, StoreError> {
        let mut snapshots = Vec::new();
        for id in self.run_ids(dag_name).await? {
            let path = self.status_path(dag_name, id);
            match self.read_snapshot(&path).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(%id, "unreadable snapshot: {e}"),
            }
        }
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.workflow_id.cmp(&a.workflow_id))
        });
        Ok(snapshots)
    }

    async fn read_snapshot(&self, path: &Path) -> Result<RunSnapshot, StoreError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
        let dir = self.run_dir(&snapshot.dag_name, snapshot.workflow_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join("status.json");
        let tmp = dir.join("status.json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            workflow_id = %snapshot.workflow_id,
            status = %snapshot.status,
            "persisted run snapshot"
        );
        Ok(())
    }

    async fn latest(&self, dag_name: &str) -> Result<Option<RunSnapshot>, StoreError> {
        Ok(self.load_all(dag_name).await?.into_iter().next())
    }

    async fn last_terminal(&self, dag_name: &str) -> Result<Option<RunSnapshot>, StoreError> {
        Ok(self.recent(dag_name, 1).await?.into_iter().next())
    }

    async fn recent(&self, dag_name: &str, n: usize) -> Result<Vec<RunSnapshot>, StoreError> {
        Ok(self
            .load_all(dag_name)
            .await?
            .into_iter()
            .filter(|s| s.status.is_terminal())
            .take(n)
            .collect())
    }

    async fn find(&self, dag_name: &str, workflow_id: Uuid) -> Result<RunSnapshot, StoreError> {
        let path = self.status_path(dag_name, workflow_id);
        if !path.exists() {
            return Err(StoreError::RunNotFound(workflow_id));
        }
        self.read_snapshot(&path).await
    }

    async fn append_step_log(
        &self,
        dag_name: &str,
        workflow_id: Uuid,
        step: &str,
        line: &str,
    ) -> Result<(), StoreError> {
        let dir = self.run_dir(dag_name, workflow_id).join("logs");
        tokio::fs::create_dir_all(&dir).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{step}.log")))
            .await?;
        file.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn prune(&self, dag_name: &str, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let mut removed = 0;

        for id in self.run_ids(dag_name).await? {
            let path = self.status_path(dag_name, id);
            let snapshot = match self.read_snapshot(&path).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let expired = matches!(snapshot.finished_at, Some(t) if t < cutoff);
            if expired {
                tokio::fs::remove_dir_all(self.run_dir(dag_name, id)).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(dag = dag_name, removed, "pruned run history");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_core::{Dag, RunStatus, Step};

    fn dag() -> Dag {
        Dag::new("demo", vec![Step::command("a", "true")])
    }

    fn store() -> (tempfile::TempDir, FileRunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let (_dir, store) = store();
        let snapshot = RunSnapshot::new(&dag(), "foo");
        store.save(&snapshot).await.unwrap();

        let loaded = store.find("demo", snapshot.workflow_id).await.unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_find_missing_run() {
        let (_dir, store) = store();
        let err = store.find("demo", Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_recent_newest_first_terminal_only() {
        let (_dir, store) = store();

        let mut first = RunSnapshot::new(&dag(), "one");
        first.status = RunStatus::Succeeded;
        first.finished_at = Some(Utc::now());
        store.save(&first).await.unwrap();

        let mut second = RunSnapshot::new(&dag(), "two");
        second.status = RunStatus::Failed;
        second.finished_at = Some(Utc::now());
        store.save(&second).await.unwrap();

        // Still running: excluded from terminal history
        let mut third = RunSnapshot::new(&dag(), "three");
        third.status = RunStatus::Running;
        store.save(&third).await.unwrap();

        let recent = store.recent("demo", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].params, "two");
        assert_eq!(recent[1].params, "one");

        let latest = store.latest("demo").await.unwrap().unwrap();
        assert_eq!(latest.params, "three");

        let last = store.last_terminal("demo").await.unwrap().unwrap();
        assert_eq!(last.params, "two");
    }

    #[tokio::test]
    async fn test_snapshot_overwrite_is_atomic_replace() {
        let (_dir, store) = store();
        let mut snapshot = RunSnapshot::new(&dag(), "foo");
        store.save(&snapshot).await.unwrap();

        snapshot.status = RunStatus::Succeeded;
        snapshot.finished_at = Some(Utc::now());
        store.save(&snapshot).await.unwrap();

        let loaded = store.find("demo", snapshot.workflow_id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_step_logs_append() {
        let (dir, store) = store();
        let snapshot = RunSnapshot::new(&dag(), "");
        store.save(&snapshot).await.unwrap();

        store
            .append_step_log("demo", snapshot.workflow_id, "a", "line one")
            .await
            .unwrap();
        store
            .append_step_log("demo", snapshot.workflow_id, "a", "line two")
            .await
            .unwrap();

        let log = std::fs::read_to_string(
            dir.path()
                .join("demo/runs")
                .join(snapshot.workflow_id.to_string())
                .join("logs/a.log"),
        )
        .unwrap();
        assert_eq!(log, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_prune_respects_retention_and_unfinished() {
        let (_dir, store) = store();

        let mut old = RunSnapshot::new(&dag(), "old");
        old.status = RunStatus::Succeeded;
        old.finished_at = Some(Utc::now() - ChronoDuration::days(10));
        store.save(&old).await.unwrap();

        let mut active = RunSnapshot::new(&dag(), "active");
        active.status = RunStatus::Running;
        store.save(&active).await.unwrap();

        let removed = store.prune("demo", 7).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find("demo", old.workflow_id).await.is_err());
        assert!(store.find("demo", active.workflow_id).await.is_ok());
    }
}
