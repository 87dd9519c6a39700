//! Progress store: FileRecord / FileProgress persistence.
//!
//! Everything race-sensitive is either transactional (first insert of a
//! record plus its progress row) or guarded in SQL (the monotonic report
//! update). All raw statements use bind parameters.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    FromQueryResult, Order, QueryFilter, QueryOrder, Set, Statement, TransactionTrait, Value,
};

use crate::db::entities::file_progress::{self, Entity as FileProgress, STATUS_BREAK,
    STATUS_DOWNLOADING};
use crate::db::entities::file_record::{self, Entity as FileRecord};
use crate::error::Result;

/// Identity of one file within a repo.
#[derive(Debug, Clone)]
pub struct FileKey {
    pub datatype: String,
    pub org: String,
    pub repo: String,
    pub name: String,
    pub etag: String,
    pub file_size: i64,
}

/// A `(datatype, org, repo)` with progress on an instance but no catalog row.
#[derive(Debug, Clone, FromQueryResult, PartialEq, Eq)]
pub struct FreeRepo {
    pub datatype: String,
    pub org: String,
    pub repo: String,
}

pub struct ProgressStore {
    db: DatabaseConnection,
}

impl ProgressStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get_record(
        &self,
        datatype: &str,
        org: &str,
        repo: &str,
        name: Option<&str>,
        etag: &str,
    ) -> Result<Option<file_record::Model>> {
        let mut q = FileRecord::find()
            .filter(file_record::Column::Datatype.eq(datatype))
            .filter(file_record::Column::Org.eq(org))
            .filter(file_record::Column::Repo.eq(repo))
            .filter(file_record::Column::Etag.eq(etag));
        if let Some(name) = name {
            q = q.filter(file_record::Column::Name.eq(name));
        }
        Ok(q.one(&self.db).await?)
    }

    /// Create the FileRecord and its first FileProgress atomically; returns
    /// `(record_id, process_id)`.
    pub async fn save_scheduler_record(
        &self,
        key: &FileKey,
        instance_id: &str,
        offset_num: i64,
        status: i32,
        master_instance_id: &str,
    ) -> Result<(i64, i64)> {
        let now = Utc::now();
        let txn = self.db.begin().await?;
        let record = file_record::ActiveModel {
            datatype: Set(key.datatype.clone()),
            org: Set(key.org.clone()),
            repo: Set(key.repo.clone()),
            name: Set(key.name.clone()),
            etag: Set(key.etag.clone()),
            file_size: Set(key.file_size),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        let progress = file_progress::ActiveModel {
            record_id: Set(record.id),
            instance_id: Set(instance_id.to_string()),
            offset_num: Set(offset_num),
            status: Set(status),
            master_instance_id: Set(master_instance_id.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;
        Ok((record.id, progress.id))
    }

    pub async fn insert_progress(
        &self,
        record_id: i64,
        instance_id: &str,
        offset_num: i64,
        status: i32,
        master_instance_id: &str,
    ) -> Result<i64> {
        let now = Utc::now();
        let progress = file_progress::ActiveModel {
            record_id: Set(record_id),
            instance_id: Set(instance_id.to_string()),
            offset_num: Set(offset_num),
            status: Set(status),
            master_instance_id: Set(master_instance_id.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(progress.id)
    }

    /// Rewind a requester's row in place after a local cache wipe. The row is
    /// never deleted.
    pub async fn reset_progress(
        &self,
        process_id: i64,
        offset_num: i64,
        master_instance_id: &str,
    ) -> Result<()> {
        self.db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "UPDATE file_progress SET offset_num = ?, status = ?, master_instance_id = ?, \
                 updated_at = ? WHERE id = ?",
                [
                    offset_num.into(),
                    STATUS_DOWNLOADING.into(),
                    master_instance_id.into(),
                    Value::from(Utc::now()),
                    process_id.into(),
                ],
            ))
            .await?;
        Ok(())
    }

    /// Apply a node's progress report. `Break` only flips the status; any
    /// other status advances the offset, and the `offset_num <= sta_pos`
    /// guard silently drops out-of-order reports.
    pub async fn report_file_process(
        &self,
        process_id: i64,
        sta_pos: i64,
        end_pos: i64,
        status: i32,
    ) -> Result<()> {
        let backend = self.db.get_database_backend();
        let stmt = if status == STATUS_BREAK {
            Statement::from_sql_and_values(
                backend,
                "UPDATE file_progress SET status = ?, updated_at = ? WHERE id = ?",
                [status.into(), Value::from(Utc::now()), process_id.into()],
            )
        } else {
            Statement::from_sql_and_values(
                backend,
                "UPDATE file_progress SET offset_num = ?, status = ?, updated_at = ? \
                 WHERE id = ? AND offset_num <= ?",
                [
                    end_pos.into(),
                    status.into(),
                    Value::from(Utc::now()),
                    process_id.into(),
                    sta_pos.into(),
                ],
            )
        };
        self.db.execute(stmt).await?;
        Ok(())
    }

    /// All progress rows for a record, furthest offset first.
    pub async fn get_progress_by_record(
        &self,
        record_id: i64,
    ) -> Result<Vec<file_progress::Model>> {
        Ok(FileProgress::find()
            .filter(file_progress::Column::RecordId.eq(record_id))
            .order_by(file_progress::Column::OffsetNum, Order::Desc)
            .order_by(file_progress::Column::UpdatedAt, Order::Desc)
            .all(&self.db)
            .await?)
    }

    pub async fn get_progress_by_instance(
        &self,
        record_id: i64,
        instance_id: &str,
    ) -> Result<Option<file_progress::Model>> {
        Ok(FileProgress::find()
            .filter(file_progress::Column::RecordId.eq(record_id))
            .filter(file_progress::Column::InstanceId.eq(instance_id))
            .one(&self.db)
            .await?)
    }

    pub async fn get_progress(&self, process_id: i64) -> Result<Option<file_progress::Model>> {
        Ok(FileProgress::find_by_id(process_id).one(&self.db).await?)
    }

    /// Record ids matched by etag or the field tuple; used by the delete
    /// cascade.
    pub async fn get_record_ids(
        &self,
        etag: &str,
        datatype: &str,
        org: &str,
        repo: &str,
        name: &str,
    ) -> Result<Vec<i64>> {
        let mut q = FileRecord::find();
        if !etag.is_empty() {
            q = q.filter(file_record::Column::Etag.eq(etag));
        }
        if !datatype.is_empty() {
            q = q.filter(file_record::Column::Datatype.eq(datatype));
        }
        if !org.is_empty() {
            q = q.filter(file_record::Column::Org.eq(org));
        }
        if !repo.is_empty() {
            q = q.filter(file_record::Column::Repo.eq(repo));
        }
        if !name.is_empty() {
            q = q.filter(file_record::Column::Name.eq(name));
        }
        Ok(q.all(&self.db).await?.into_iter().map(|r| r.id).collect())
    }

    pub async fn delete_progress_by_records_and_instance(
        &self,
        record_ids: &[i64],
        instance_id: &str,
    ) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        let res = FileProgress::delete_many()
            .filter(file_progress::Column::RecordId.is_in(record_ids.iter().copied()))
            .filter(file_progress::Column::InstanceId.eq(instance_id))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    /// Number of files of `(instance, datatype, org, repo)` whose progress
    /// has reached the full file size. Drives the completeness gate.
    pub async fn completed_count(
        &self,
        instance_id: &str,
        datatype: &str,
        org: &str,
        repo: &str,
    ) -> Result<i64> {
        #[derive(FromQueryResult)]
        struct CountRow {
            cnt: i64,
        }
        let row = CountRow::find_by_statement(Statement::from_sql_and_values(
            self.db.get_database_backend(),
            "SELECT COUNT(*) AS cnt FROM file_record r \
             INNER JOIN file_progress p ON p.record_id = r.id \
             WHERE p.instance_id = ? AND r.datatype = ? AND r.org = ? AND r.repo = ? \
             AND p.offset_num = r.file_size",
            [
                instance_id.into(),
                datatype.into(),
                org.into(),
                repo.into(),
            ],
        ))
        .one(&self.db)
        .await?;
        Ok(row.map(|r| r.cnt).unwrap_or(0))
    }

    /// Distinct repos with progress on `instance_id` and no Repository row
    /// yet for that instance, optionally narrowed to one org/repo.
    pub async fn free_repositories(
        &self,
        instance_id: &str,
        org: Option<&str>,
        repo: Option<&str>,
    ) -> Result<Vec<FreeRepo>> {
        let mut sql = String::from(
            "SELECT DISTINCT r.datatype, r.org, r.repo FROM file_record r \
             INNER JOIN file_progress p ON p.record_id = r.id \
             WHERE p.instance_id = ? AND NOT EXISTS (\
               SELECT 1 FROM repository x WHERE x.instance_id = p.instance_id \
               AND x.datatype = r.datatype AND x.org = r.org AND x.repo = r.repo)",
        );
        let mut values: Vec<Value> = vec![instance_id.into()];
        if let Some(org) = org.filter(|s| !s.is_empty()) {
            sql.push_str(" AND r.org = ?");
            values.push(org.into());
        }
        if let Some(repo) = repo.filter(|s| !s.is_empty()) {
            sql.push_str(" AND r.repo = ?");
            values.push(repo.into());
        }
        Ok(FreeRepo::find_by_statement(Statement::from_sql_and_values(
            self.db.get_database_backend(),
            sql,
            values,
        ))
        .all(&self.db)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::file_progress::STATUS_COMPLETE;
    use crate::db::test_db;

    fn key(name: &str, etag: &str) -> FileKey {
        FileKey {
            datatype: "models".to_string(),
            org: "o".to_string(),
            repo: "r".to_string(),
            name: name.to_string(),
            etag: etag.to_string(),
            file_size: 100,
        }
    }

    #[tokio::test]
    async fn test_save_scheduler_record_creates_both_rows() {
        let store = ProgressStore::new(test_db().await);
        let (record_id, process_id) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        assert!(record_id > 0 && process_id > 0);
        let record = store
            .get_record("models", "o", "r", Some("a.bin"), "e1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.id, record_id);
        let rows = store.get_progress_by_record(record_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instance_id, "node-a");
        assert_eq!(rows[0].offset_num, 0);
    }

    #[tokio::test]
    async fn test_report_advances_offset() {
        let store = ProgressStore::new(test_db().await);
        let (_, pid) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .report_file_process(pid, 0, 60, STATUS_DOWNLOADING)
            .await
            .unwrap();
        let row = store.get_progress(pid).await.unwrap().unwrap();
        assert_eq!(row.offset_num, 60);
    }

    #[tokio::test]
    async fn test_report_is_monotonic() {
        let store = ProgressStore::new(test_db().await);
        let (_, pid) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .report_file_process(pid, 0, 60, STATUS_DOWNLOADING)
            .await
            .unwrap();
        // Out-of-order report: the guard offset_num <= sta_pos fails.
        store
            .report_file_process(pid, 10, 40, STATUS_DOWNLOADING)
            .await
            .unwrap();
        let row = store.get_progress(pid).await.unwrap().unwrap();
        assert_eq!(row.offset_num, 60);
    }

    #[tokio::test]
    async fn test_break_keeps_offset() {
        let store = ProgressStore::new(test_db().await);
        let (_, pid) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .report_file_process(pid, 0, 60, STATUS_DOWNLOADING)
            .await
            .unwrap();
        store
            .report_file_process(pid, 0, 0, STATUS_BREAK)
            .await
            .unwrap();
        let row = store.get_progress(pid).await.unwrap().unwrap();
        assert_eq!(row.offset_num, 60);
        assert_eq!(row.status, STATUS_BREAK);
    }

    #[tokio::test]
    async fn test_reset_progress_rewinds_in_place() {
        let store = ProgressStore::new(test_db().await);
        let (_, pid) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .report_file_process(pid, 0, 80, STATUS_DOWNLOADING)
            .await
            .unwrap();
        store.reset_progress(pid, 20, "node-b").await.unwrap();
        let row = store.get_progress(pid).await.unwrap().unwrap();
        assert_eq!(row.offset_num, 20);
        assert_eq!(row.status, STATUS_DOWNLOADING);
        assert_eq!(row.master_instance_id, "node-b");
    }

    #[tokio::test]
    async fn test_progress_ordering() {
        let store = ProgressStore::new(test_db().await);
        let (rid, _) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .insert_progress(rid, "node-b", 70, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .insert_progress(rid, "node-c", 30, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        let rows = store.get_progress_by_record(rid).await.unwrap();
        let order: Vec<_> = rows.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(order, vec!["node-b", "node-c", "node-a"]);
    }

    #[tokio::test]
    async fn test_completed_count_and_free_repos() {
        let store = ProgressStore::new(test_db().await);
        let (_, p1) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .save_scheduler_record(&key("b.bin", "e2"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        assert_eq!(store.completed_count("node-a", "models", "o", "r").await.unwrap(), 0);
        store
            .report_file_process(p1, 0, 100, STATUS_COMPLETE)
            .await
            .unwrap();
        assert_eq!(store.completed_count("node-a", "models", "o", "r").await.unwrap(), 1);

        let free = store.free_repositories("node-a", None, None).await.unwrap();
        assert_eq!(
            free,
            vec![FreeRepo {
                datatype: "models".to_string(),
                org: "o".to_string(),
                repo: "r".to_string()
            }]
        );
        let none = store
            .free_repositories("node-a", Some("absent"), None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascade_helpers() {
        let store = ProgressStore::new(test_db().await);
        let (rid, _) = store
            .save_scheduler_record(&key("a.bin", "e1"), "node-a", 0, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        store
            .insert_progress(rid, "node-b", 10, STATUS_DOWNLOADING, "")
            .await
            .unwrap();
        let ids = store
            .get_record_ids("e1", "models", "o", "r", "a.bin")
            .await
            .unwrap();
        assert_eq!(ids, vec![rid]);
        let deleted = store
            .delete_progress_by_records_and_instance(&ids, "node-a")
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        // node-b's row survives.
        assert_eq!(store.get_progress_by_record(rid).await.unwrap().len(), 1);
    }
}
