use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;
use tracing::info;

/// Embedded forward migration.
struct Migration {
    version: u32,
    up_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
}];

/// Applies the snapshot schema.
///
/// Tracks progress in a golang-migrate compatible `schema_migrations` table,
/// and every statement is `IF NOT EXISTS`, so reruns are harmless.
pub trait Migrator: Send + Sync {
    /// Applies all pending migrations and returns the resulting version.
    fn up(&self) -> impl std::future::Future<Output = Result<u32>> + Send;
}

/// ClickHouse migration runner.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Returns the recorded version and dirty flag, creating the tracking table if needed.
    async fn current_version(
        &self,
        handle: &mut clickhouse_rs::ClientHandle,
    ) -> Result<(u32, bool)> {
        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, false));
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

        Ok((u32::try_from(version).unwrap_or(0), dirty != 0))
    }

    async fn set_version(
        &self,
        handle: &mut clickhouse_rs::ClientHandle,
        version: u32,
        dirty: bool,
    ) -> Result<()> {
        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );

        handle
            .execute(sql.as_str())
            .await
            .context("recording migration version")
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<u32> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations")?;

        let (mut version, dirty) = self.current_version(&mut handle).await?;

        if dirty {
            bail!("schema version {version} is dirty, manual intervention required");
        }

        for migration in pending(version) {
            info!(version = migration.version, "applying schema migration");

            self.set_version(&mut handle, migration.version, true).await?;

            for statement in split_statements(migration.up_sql) {
                handle.execute(statement).await.with_context(|| {
                    let preview: String = statement.chars().take(80).collect();
                    format!("migration {} statement: {preview}...", migration.version)
                })?;
            }

            self.set_version(&mut handle, migration.version, false).await?;
            version = migration.version;
        }

        Ok(version)
    }
}

/// Migrations newer than `current`, in order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let stmts = split_statements("CREATE TABLE a (x Int32);\n\n CREATE TABLE b (y Int32);;");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[1].starts_with("CREATE TABLE b"));
        assert!(split_statements("  ").is_empty());
    }

    #[test]
    fn test_pending_from_scratch_and_current() {
        assert_eq!(pending(0).count(), MIGRATIONS.len());
        let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        assert_eq!(pending(latest).count(), 0);
    }

    #[test]
    fn test_migrations_ordered() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        for m in MIGRATIONS {
            for stmt in split_statements(m.up_sql) {
                assert!(
                    stmt.contains("IF NOT EXISTS"),
                    "migration {} statement not idempotent: {stmt}",
                    m.version
                );
            }
        }
    }

    #[test]
    fn test_schema_covers_snapshot_tables() {
        let sql = MIGRATIONS[0].up_sql;
        for table in ["devices", "dns", "flows", "tls"] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing table {table}"
            );
        }
    }
}
