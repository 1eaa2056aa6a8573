use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};

use crate::error::{MetricsError, MetricsResult};
use crate::types::{Tags, TimeSeriesDataPoint};

/// Durable sink for time-series points.
#[async_trait]
pub trait MetricsStorage: Send + Sync {
    async fn init(&self) -> MetricsResult<()>;

    /// Appends points in one transaction and returns how many were written.
    async fn insert_points(&self, points: Vec<TimeSeriesDataPoint>) -> MetricsResult<usize>;

    /// Points with `start <= timestamp <= end`, oldest first.
    async fn points_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metric: Option<&str>,
    ) -> MetricsResult<Vec<TimeSeriesDataPoint>>;

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> MetricsResult<u64>;

    async fn point_count(&self) -> MetricsResult<u64>;
}

#[derive(Debug, Clone)]
pub struct SqliteMetricsStorage {
    db_path: PathBuf,
}

impl SqliteMetricsStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, func: F) -> MetricsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> MetricsResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_connection(&db_path)?;
            func(&connection)
        })
        .await
        .map_err(|error| MetricsError::Task(error.to_string()))?
    }
}

#[async_trait]
impl MetricsStorage for SqliteMetricsStorage {
    async fn init(&self) -> MetricsResult<()> {
        self.with_connection(|connection| {
            connection.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS metric_points (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    metric TEXT NOT NULL,
                    value REAL NOT NULL,
                    tags TEXT NOT NULL DEFAULT '{}'
                );

                CREATE INDEX IF NOT EXISTS idx_metric_points_timestamp
                    ON metric_points(timestamp);
                CREATE INDEX IF NOT EXISTS idx_metric_points_metric_timestamp
                    ON metric_points(metric, timestamp);
                "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_points(&self, points: Vec<TimeSeriesDataPoint>) -> MetricsResult<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        self.with_connection(move |connection| {
            let transaction = connection.unchecked_transaction()?;
            {
                let mut stmt = transaction.prepare(
                    "INSERT INTO metric_points (timestamp, metric, value, tags) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for point in &points {
                    let tags = serde_json::to_string(&point.tags)?;
                    stmt.execute(params![point.timestamp, point.metric, point.value, tags])?;
                }
            }
            transaction.commit()?;
            Ok(points.len())
        })
        .await
    }

    async fn points_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metric: Option<&str>,
    ) -> MetricsResult<Vec<TimeSeriesDataPoint>> {
        let metric = metric.map(str::to_string);
        self.with_connection(move |connection| {
            let mut sql = String::from(
                "SELECT timestamp, metric, value, tags FROM metric_points WHERE timestamp >= ?1 AND timestamp <= ?2",
            );
            let mut values: Vec<rusqlite::types::Value> = vec![
                start.timestamp_millis().into(),
                end.timestamp_millis().into(),
            ];
            if let Some(metric) = metric {
                sql.push_str(" AND metric = ?3");
                values.push(metric.into());
            }
            sql.push_str(" ORDER BY timestamp ASC, id ASC");

            let mut stmt = connection.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(timestamp, metric, value, tags)| -> MetricsResult<TimeSeriesDataPoint> {
                    let tags: Tags = serde_json::from_str(&tags)?;
                    Ok(TimeSeriesDataPoint::new(timestamp, metric, value, tags))
                })
                .collect()
        })
        .await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> MetricsResult<u64> {
        self.with_connection(move |connection| {
            let deleted = connection.execute(
                "DELETE FROM metric_points WHERE timestamp < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn point_count(&self) -> MetricsResult<u64> {
        self.with_connection(|connection| {
            let count: i64 =
                connection.query_row("SELECT COUNT(*) FROM metric_points", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

fn open_connection(path: &Path) -> MetricsResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let connection = Connection::open(path)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}
