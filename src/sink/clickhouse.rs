use std::fmt::Write;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use tracing::{debug, info};

use crate::config::ClickHouseConfig;
use crate::migrate::{ClickHouseMigrator, Migrator};

use super::rows::{DeviceRow, DnsRow, FlowRow, RowBatch, TlsRow};
use super::{SnapshotStore, WriteSummary};

/// Snapshot store backed by ClickHouse over the native TCP protocol.
///
/// Each table's rows go out as one multi-row INSERT, which ClickHouse
/// commits atomically.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
    endpoint: String,
}

impl ClickHouseStore {
    /// Creates the store. The pool connects lazily on first use.
    pub fn new(cfg: &ClickHouseConfig) -> Self {
        Self {
            pool: Pool::new(cfg.dsn()),
            database: cfg.database.clone(),
            endpoint: cfg.endpoint.clone(),
        }
    }

    async fn execute(&self, table: &str, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {table} insert"))?;

        handle
            .execute(sql)
            .await
            .with_context(|| format!("inserting {table} batch"))
    }
}

impl SnapshotStore for ClickHouseStore {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn ensure_schema(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        let version = ClickHouseMigrator::new(self.pool.clone())
            .up()
            .await
            .context("applying schema migrations")?;

        info!(
            endpoint = %self.endpoint,
            database = %self.database,
            version,
            "ClickHouse schema ready",
        );

        Ok(())
    }

    async fn write_batch(&self, batch: &RowBatch) -> Result<WriteSummary> {
        // Format everything first so a formatting problem cannot leave
        // half a snapshot behind.
        let statements = insert_statements(&self.database, batch);

        for (table, sql) in &statements {
            self.execute(table, sql).await?;
            debug!(table, "snapshot rows inserted");
        }

        Ok(WriteSummary {
            devices: batch.devices.len(),
            dns: batch.dns.len(),
            flows: batch.flows.len(),
            tls: batch.tls.len(),
        })
    }
}

/// Builds one INSERT per non-empty table.
pub fn insert_statements(database: &str, batch: &RowBatch) -> Vec<(&'static str, String)> {
    let mut statements = Vec::with_capacity(4);

    if !batch.devices.is_empty() {
        statements.push(("devices", devices_insert(database, &batch.devices)));
    }
    if !batch.dns.is_empty() {
        statements.push(("dns", dns_insert(database, &batch.dns)));
    }
    if !batch.flows.is_empty() {
        statements.push(("flows", flows_insert(database, &batch.flows)));
    }
    if !batch.tls.is_empty() {
        statements.push(("tls", tls_insert(database, &batch.tls)));
    }

    statements
}

fn devices_insert(database: &str, rows: &[DeviceRow]) -> String {
    let mut sql = String::with_capacity(160 + rows.len() * 160);
    let _ = write!(
        sql,
        "INSERT INTO {database}.devices (device_id, dhcp_hostname, device_ip, device_name, \
         device_type, device_vendor, device_oui, user_agents, client_ts) VALUES "
    );

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "('{}', '{}', '{}', '{}', '{}', '{}', '{}', '{}', {})",
            escape_sql(&r.device_id),
            escape_sql(&r.dhcp_hostname),
            escape_sql(&r.device_ip),
            escape_sql(&r.device_name),
            escape_sql(&r.device_type),
            escape_sql(&r.device_vendor),
            escape_sql(&r.device_oui),
            escape_sql(&r.user_agents),
            r.client_ts,
        );
    }

    sql
}

fn dns_insert(database: &str, rows: &[DnsRow]) -> String {
    let mut sql = String::with_capacity(120 + rows.len() * 120);
    let _ = write!(
        sql,
        "INSERT INTO {database}.dns (user_key, device_id, ts, ip, hostname, device_port, \
         data_source) VALUES "
    );

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "('{}', '{}', {}, '{}', '{}', {}, '{}')",
            escape_sql(&r.user_key),
            escape_sql(&r.device_id),
            r.ts,
            escape_sql(&r.ip),
            escape_sql(&r.hostname),
            r.device_port,
            escape_sql(&r.data_source),
        );
    }

    sql
}

fn flows_insert(database: &str, rows: &[FlowRow]) -> String {
    let mut sql = String::with_capacity(240 + rows.len() * 180);
    let _ = write!(
        sql,
        "INSERT INTO {database}.flows (user_key, device_id, device_port, remote_ip, remote_port, \
         protocol, inbound_byte_count, outbound_byte_count, total_byte_count, ts, ts_min, \
         ts_mod10, ts_mod60, ts_mod600, ts_mod3600) VALUES "
    );

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "('{}', '{}', {}, '{}', {}, '{}', {}, {}, {}, {}, {}, {}, {}, {}, {})",
            escape_sql(&r.user_key),
            escape_sql(&r.device_id),
            r.device_port,
            escape_sql(&r.remote_ip),
            r.remote_port,
            escape_sql(&r.protocol),
            r.inbound_byte_count,
            r.outbound_byte_count,
            r.total_byte_count,
            r.ts,
            r.ts_min,
            r.ts_mod10,
            r.ts_mod60,
            r.ts_mod600,
            r.ts_mod3600,
        );
    }

    sql
}

fn tls_insert(database: &str, rows: &[TlsRow]) -> String {
    let mut sql = String::with_capacity(160 + rows.len() * 140);
    let _ = write!(
        sql,
        "INSERT INTO {database}.tls (user_key, device_id, device_port, remote_ip, remote_port, \
         type, version, sni, client_ts) VALUES "
    );

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "('{}', '{}', {}, '{}', {}, '{}', '{}', '{}', {})",
            escape_sql(&r.user_key),
            escape_sql(&r.device_id),
            r.device_port,
            escape_sql(&r.remote_ip),
            r.remote_port,
            escape_sql(&r.kind),
            escape_sql(&r.version),
            escape_sql(&r.sni),
            r.client_ts,
        );
    }

    sql
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
