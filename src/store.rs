//! Persistent state: waiting queue, history, and termination queue (§4.1).
//!
//! Backed by an embedded SQLite database reached through a pooled async
//! connection (`sqlx`). `sqlx::SqlitePool` serializes writers for us via
//! SQLite's own locking plus a busy timeout, matching the "Store serializes
//! writers, readers may see a consistent snapshot per operation" contract
//! without a hand-rolled actor thread.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::{EdgeError, Result};
use crate::message::Priority;

/// A row shared by the waiting queue and the history table — the row
/// identity (and shape) is preserved across the move (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: i64,
    pub client_name: String,
    pub client_ip: String,
    pub client_port: i64,
    pub priority: Priority,
    pub requested_ports: String,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `path` and ensures
    /// the schema exists, seeding `job_queue`'s autoincrement sequence at
    /// 1000 the first time the tables are created (§6 "Persisted state
    /// layout" — the container runtime's minimum name-length requirement).
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| EdgeError::Configuration(e.to_string()))?
            .create_if_missing(true);
        // A single writer connection mirrors sqlite3's single-writer-lock
        // behavior in the original implementation; readers share the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Store { pool };
        store.setup_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Store { pool };
        store.setup_schema().await?;
        Ok(store)
    }

    async fn setup_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs(
                id INTEGER PRIMARY KEY,
                cust_name TEXT NOT NULL,
                cust_ip TEXT NOT NULL,
                cust_port INTEGER,
                priority INTEGER,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
                ports TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        let created_queue = sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_queue(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cust_name TEXT NOT NULL,
                cust_ip TEXT NOT NULL,
                cust_port INTEGER,
                priority INTEGER DEFAULT 1,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
                ports TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS term_queue(
                job_id INTEGER PRIMARY KEY,
                reason TEXT,
                FOREIGN KEY(job_id) REFERENCES jobs(id)
            );",
        )
        .execute(&self.pool)
        .await?;

        // created_queue.rows_affected() > 0 whenever the CREATE actually ran
        // (vs. a no-op on an already-existing table); SQLite reports this
        // via the change count of the statement.
        if created_queue.rows_affected() > 0 {
            let seeded: Option<i64> =
                sqlx::query_scalar("SELECT seq FROM sqlite_sequence WHERE name = 'job_queue'")
                    .fetch_optional(&self.pool)
                    .await?;
            if seeded.is_none() {
                sqlx::query(
                    "INSERT INTO sqlite_sequence(name, seq) VALUES ('job_queue', 999)",
                )
                .execute(&self.pool)
                .await
                .ok();
            }
        }
        Ok(())
    }

    /// Admits a job if the waiting queue has room (§8's S2: a strict cap of
    /// `max_queue` rows — see SPEC_FULL.md's queue-cap Open Question).
    pub async fn enqueue_job(
        &self,
        client: &str,
        ip: &str,
        port: u16,
        priority: Priority,
        ports: &str,
        max_queue: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let current: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&mut *tx)
            .await?;
        if current >= max_queue {
            return Err(EdgeError::QueueFull);
        }
        let result = sqlx::query(
            "INSERT INTO job_queue (cust_name, cust_ip, cust_port, priority, ports) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(client)
        .bind(ip)
        .bind(port as i64)
        .bind(priority as i64)
        .bind(ports)
        .execute(&mut *tx)
        .await?;
        let job_id = result.last_insert_rowid();
        tx.commit().await?;
        Ok(job_id)
    }

    pub async fn remove_waiting(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn enqueue_termination(&self, job_id: i64, reason: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO term_queue (job_id, reason) VALUES (?, ?)")
            .bind(job_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn waiting_size(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_termination_requests(&self) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query("SELECT job_id, reason FROM term_queue")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>("job_id"), r.get::<String, _>("reason")))
            .collect())
    }

    pub async fn delete_termination_request(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM term_queue WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `(client_name, client_ip, client_port)` for a dispatched job, used to
    /// address the outbound termination callback.
    pub async fn lookup_history(&self, job_id: i64) -> Result<Option<(String, String, i64)>> {
        let row = sqlx::query("SELECT cust_name, cust_ip, cust_port FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            (
                r.get::<String, _>("cust_name"),
                r.get::<String, _>("cust_ip"),
                r.get::<i64, _>("cust_port"),
            )
        }))
    }

    /// Atomically moves one waiting row into history (§4.1 `MoveToHistory`).
    /// Returns `false` without side effects if the row is already gone (e.g.
    /// a concurrent `remove_waiting` won the race) — the caller must not
    /// treat that as success.
    pub async fn move_to_history(&self, job_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO jobs (id, cust_name, cust_ip, cust_port, priority, timestamp, ports)
             SELECT id, cust_name, cust_ip, cust_port, priority, timestamp, ports
             FROM job_queue WHERE id = ?",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() == 1)
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> JobRow {
        JobRow {
            id: row.get::<i64, _>("id"),
            client_name: row.get::<String, _>("cust_name"),
            client_ip: row.get::<String, _>("cust_ip"),
            client_port: row.get::<i64, _>("cust_port"),
            priority: Priority::try_from(row.get::<i64, _>("priority")).unwrap_or(Priority::Low),
            requested_ports: row.get::<String, _>("ports"),
        }
    }

    pub async fn oldest_waiting(&self) -> Result<Option<JobRow>> {
        let row = sqlx::query("SELECT * FROM job_queue ORDER BY datetime(timestamp) ASC, id ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_job))
    }

    pub async fn oldest_waiting_for_client(&self, client: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query(
            "SELECT * FROM job_queue WHERE cust_name = ? ORDER BY datetime(timestamp) ASC, id ASC LIMIT 1",
        )
        .bind(client)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_job))
    }

    pub async fn oldest_waiting_for_priority(&self, priority: Priority) -> Result<Option<JobRow>> {
        let row = sqlx::query(
            "SELECT * FROM job_queue WHERE priority = ? ORDER BY datetime(timestamp) ASC, id ASC LIMIT 1",
        )
        .bind(priority as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_job))
    }

    pub async fn oldest_waiting_for_client_priority(
        &self,
        client: &str,
        priority: Priority,
    ) -> Result<Option<JobRow>> {
        let row = sqlx::query(
            "SELECT * FROM job_queue WHERE cust_name = ? AND priority = ?
             ORDER BY datetime(timestamp) ASC, id ASC LIMIT 1",
        )
        .bind(client)
        .bind(priority as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_job))
    }

    /// Distinct clients with a waiting job, optionally filtered to a single
    /// priority (§4.1).
    pub async fn distinct_waiting_clients(&self, priority: Option<Priority>) -> Result<Vec<String>> {
        let rows = match priority {
            Some(p) => {
                sqlx::query("SELECT DISTINCT cust_name FROM job_queue WHERE priority = ?")
                    .bind(p as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT DISTINCT cust_name FROM job_queue")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|r| r.get::<String, _>("cust_name")).collect())
    }

    /// Distinct waiting priorities (§4.3 `SelectPriority`).
    pub async fn distinct_waiting_priorities(&self) -> Result<Vec<Priority>> {
        let rows = sqlx::query("SELECT DISTINCT priority FROM job_queue")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| Priority::try_from(r.get::<i64, _>("priority")).ok())
            .collect())
    }

    /// Rolling-7-day history count, optionally filtered by client and/or
    /// priority (§4.1 "count of history rows in the last 7 days").
    pub async fn history_count_7d(
        &self,
        client: Option<&str>,
        priority: Option<Priority>,
    ) -> Result<i64> {
        let count: i64 = match (client, priority) {
            (Some(c), Some(p)) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM jobs WHERE timestamp >= datetime('now', '-7 day')
                     AND cust_name = ? AND priority = ?",
                )
                .bind(c)
                .bind(p as i64)
                .fetch_one(&self.pool)
                .await?
            }
            (Some(c), None) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM jobs WHERE timestamp >= datetime('now', '-7 day')
                     AND cust_name = ?",
                )
                .bind(c)
                .fetch_one(&self.pool)
                .await?
            }
            (None, Some(p)) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM jobs WHERE timestamp >= datetime('now', '-7 day')
                     AND priority = ?",
                )
                .bind(p as i64)
                .fetch_one(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM jobs WHERE timestamp >= datetime('now', '-7 day')",
                )
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_assigns_monotone_ids_starting_at_1000() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store
            .enqueue_job("alice", "10.0.0.1", 9001, Priority::Medium, "8080", 10)
            .await
            .unwrap();
        let b = store
            .enqueue_job("bob", "10.0.0.2", 9002, Priority::Low, "80", 10)
            .await
            .unwrap();
        assert_eq!(a, 1000);
        assert_eq!(b, 1001);
    }

    #[tokio::test]
    async fn enqueue_rejects_once_queue_is_full() {
        let store = Store::open_in_memory().await.unwrap();
        for _ in 0..10 {
            store
                .enqueue_job("alice", "10.0.0.1", 9001, Priority::Low, "80", 10)
                .await
                .unwrap();
        }
        let result = store
            .enqueue_job("alice", "10.0.0.1", 9001, Priority::Low, "80", 10)
            .await;
        assert!(matches!(result, Err(EdgeError::QueueFull)));
    }

    #[tokio::test]
    async fn move_to_history_removes_from_waiting_and_appears_in_history() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .enqueue_job("alice", "10.0.0.1", 9001, Priority::High, "8080", 10)
            .await
            .unwrap();
        assert!(store.move_to_history(id).await.unwrap());
        assert_eq!(store.waiting_size().await.unwrap(), 0);
        let found = store.lookup_history(id).await.unwrap();
        assert_eq!(found.unwrap().0, "alice");
    }

    #[tokio::test]
    async fn move_to_history_returns_false_for_a_row_that_is_already_gone() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .enqueue_job("alice", "10.0.0.1", 9001, Priority::High, "8080", 10)
            .await
            .unwrap();
        assert!(store.remove_waiting(id).await.unwrap());
        assert!(!store.move_to_history(id).await.unwrap());
        assert!(store.lookup_history(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn termination_queue_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        store.enqueue_termination(1000, "Container Idle").await.unwrap();
        let reqs = store.list_termination_requests().await.unwrap();
        assert_eq!(reqs, vec![(1000, "Container Idle".to_string())]);
        store.delete_termination_request(1000).await.unwrap();
        assert!(store.list_termination_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fair_by_client_picks_the_least_recently_served_client() {
        let store = Store::open_in_memory().await.unwrap();
        // A:5, B:2, C:3 history rows, then one waiting job per client.
        for client in ["a", "a", "a", "a", "a", "b", "b", "c", "c", "c"] {
            let id = store
                .enqueue_job(client, "10.0.0.1", 9001, Priority::Low, "80", 100)
                .await
                .unwrap();
            store.move_to_history(id).await.unwrap();
        }
        for client in ["a", "b", "c"] {
            store
                .enqueue_job(client, "10.0.0.1", 9001, Priority::Low, "80", 100)
                .await
                .unwrap();
        }
        let clients = store.distinct_waiting_clients(None).await.unwrap();
        let mut freqs: Vec<(String, i64)> = Vec::new();
        for c in clients {
            let n = store.history_count_7d(Some(&c), None).await.unwrap();
            freqs.push((c, n));
        }
        let (least, _) = freqs.iter().min_by_key(|(_, n)| *n).unwrap();
        assert_eq!(least, "b");
    }
}
