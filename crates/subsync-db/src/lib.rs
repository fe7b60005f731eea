//! subsync-db
//!
//! Traffic repository over the panel's SQLite database.
//!
//! Reads `inbounds` and `client_traffics`, writes back reconciled rows and
//! rebuilt inbound settings. Schema ownership stays with the panel: this
//! crate never creates or migrates tables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use subsync_reconcile::{ClientTraffic, InboundRow, InboundSettingsUpdate, RawClientTraffic};
use tracing::warn;

pub const ENV_DB_PATH: &str = "SUBSYNC_DB_PATH";
pub const DEFAULT_DB_PATH: &str = "/etc/x-ui/x-ui.db";
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Narrow contract the sync cycle needs from the authoritative store.
#[async_trait]
pub trait TrafficRepository: Send + Sync {
    async fn fetch_inbounds(&self) -> Result<Vec<InboundRow>>;

    async fn fetch_client_traffics(&self) -> Result<Vec<ClientTraffic>>;

    /// Update rows by email. Returns the number of rows affected.
    async fn update_client_traffics(&self, rows: &[ClientTraffic]) -> Result<u64>;

    /// Replace `settings` by inbound id. Returns the number of rows affected.
    async fn update_inbounds(&self, rows: &[InboundSettingsUpdate]) -> Result<u64>;
}

/// sqlx-backed [`TrafficRepository`].
#[derive(Clone, Debug)]
pub struct SqliteTrafficRepository {
    pool: SqlitePool,
}

impl SqliteTrafficRepository {
    /// Build a repository whose single connection is opened on first use.
    ///
    /// A missing or locked database therefore surfaces as a per-cycle error,
    /// never as a startup failure.
    pub fn connect_lazy(path: &Path, busy_timeout: Duration) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(busy_timeout)
            .connect_lazy_with(options);

        Self { pool }
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Resolve the database path: env override first, then the configured value.
pub fn db_path_from_env_or(configured: &Path) -> std::path::PathBuf {
    match std::env::var(ENV_DB_PATH) {
        Ok(p) if !p.trim().is_empty() => p.into(),
        _ => configured.to_path_buf(),
    }
}

fn traffic_from_row(row: &SqliteRow) -> Result<RawClientTraffic> {
    Ok(RawClientTraffic {
        email: row.try_get("email")?,
        up: row.try_get("up")?,
        down: row.try_get("down")?,
        total: row.try_get("total")?,
        expiry_time: row.try_get("expiry_time")?,
        enable: row.try_get::<Option<i64>, _>("enable")?.map(|v| v != 0),
        inbound_id: row.try_get("inbound_id")?,
        reset: row.try_get("reset")?,
    })
}

#[async_trait]
impl TrafficRepository for SqliteTrafficRepository {
    async fn fetch_inbounds(&self) -> Result<Vec<InboundRow>> {
        let rows = sqlx::query(
            r#"
            select id, settings, protocol
            from inbounds
            order by id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("fetch_inbounds failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(InboundRow {
                id: row.try_get("id")?,
                protocol: row
                    .try_get::<Option<String>, _>("protocol")?
                    .unwrap_or_default(),
                settings: row.try_get("settings")?,
            });
        }
        Ok(out)
    }

    async fn fetch_client_traffics(&self) -> Result<Vec<ClientTraffic>> {
        let rows = sqlx::query(
            r#"
            select email, up, down, total, expiry_time, enable, inbound_id, reset
            from client_traffics
            order by id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("fetch_client_traffics failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw = traffic_from_row(&row).context("decode client_traffics row failed")?;
            match raw.with_defaults() {
                Ok(t) => out.push(t),
                Err(e) => warn!(error = %e, "skipping client_traffics row"),
            }
        }
        Ok(out)
    }

    async fn update_client_traffics(&self, rows: &[ClientTraffic]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("update_client_traffics begin failed")?;

        let mut affected: u64 = 0;
        for t in rows {
            let res = sqlx::query(
                r#"
                update client_traffics
                set up = ?, down = ?, total = ?, expiry_time = ?,
                    enable = ?, reset = ?, inbound_id = ?
                where email = ?
                "#,
            )
            .bind(t.up)
            .bind(t.down)
            .bind(t.total)
            .bind(t.expiry_time)
            .bind(t.enable)
            .bind(t.reset)
            .bind(t.inbound_id)
            .bind(&t.email)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("update client_traffics failed for {}", t.email))?;
            affected += res.rows_affected();
        }

        tx.commit()
            .await
            .context("update_client_traffics commit failed")?;
        Ok(affected)
    }

    async fn update_inbounds(&self, rows: &[InboundSettingsUpdate]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("update_inbounds begin failed")?;

        let mut affected: u64 = 0;
        for ib in rows {
            let res = sqlx::query("update inbounds set settings = ? where id = ?")
                .bind(&ib.settings)
                .bind(ib.id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("update inbounds failed for id {}", ib.id))?;
            affected += res.rows_affected();
        }

        tx.commit().await.context("update_inbounds commit failed")?;
        Ok(affected)
    }
}
