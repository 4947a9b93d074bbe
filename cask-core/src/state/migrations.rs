//! Database migrations.

use crate::error::{CaskError, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 3;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| CaskError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| CaskError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    if current_version < 3 {
        migrate_to_v3(pool).await?;
    }

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| CaskError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await
        .map_err(|e| CaskError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}

async fn exec(pool: &SqlitePool, sql: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| CaskError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    // Projects table
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            config TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .await?;

    exec(pool, "INSERT OR IGNORE INTO projects (name) VALUES ('default')").await?;

    // Instances table (snapshots live here too, flagged and named parent/snap)
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            node TEXT NOT NULL DEFAULT '',
            type TEXT NOT NULL,
            architecture TEXT NOT NULL DEFAULT '',
            ephemeral INTEGER NOT NULL DEFAULT 0,
            snapshot INTEGER NOT NULL DEFAULT 0,
            stateful INTEGER NOT NULL DEFAULT 0,
            description TEXT NOT NULL DEFAULT '',
            creation_date INTEGER NOT NULL,
            last_used_date INTEGER NOT NULL DEFAULT 0,
            expiry_date INTEGER,
            config TEXT NOT NULL DEFAULT '{}',
            devices TEXT NOT NULL DEFAULT '{}',
            profiles TEXT NOT NULL DEFAULT '[]',
            UNIQUE(project, name)
        )
        "#,
    )
    .await?;

    exec(pool, "CREATE INDEX IF NOT EXISTS idx_instances_project ON instances(project)").await?;
    exec(pool, "CREATE INDEX IF NOT EXISTS idx_instances_node ON instances(node)").await?;

    // Profiles table
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            config TEXT NOT NULL DEFAULT '{}',
            devices TEXT NOT NULL DEFAULT '{}',
            UNIQUE(project, name)
        )
        "#,
    )
    .await?;

    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    // Storage pools table
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS storage_pools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            driver TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            state TEXT NOT NULL DEFAULT 'created',
            config TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .await?;

    // Storage volumes table
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS storage_volumes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pool_id INTEGER NOT NULL,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'fs',
            node_id INTEGER NOT NULL DEFAULT -1,
            config TEXT NOT NULL DEFAULT '{}',
            UNIQUE(pool_id, project, name, type),
            FOREIGN KEY(pool_id) REFERENCES storage_pools(id)
        )
        "#,
    )
    .await?;

    // Backups table (instances, custom volumes and buckets)
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS backups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_type TEXT NOT NULL,
            parent_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            creation_date INTEGER NOT NULL,
            expiry_date INTEGER,
            instance_only INTEGER NOT NULL DEFAULT 0,
            optimized_storage INTEGER NOT NULL DEFAULT 0,
            compression_algorithm TEXT NOT NULL DEFAULT '',
            UNIQUE(parent_type, parent_id, name)
        )
        "#,
    )
    .await?;

    exec(pool, "CREATE INDEX IF NOT EXISTS idx_backups_expiry ON backups(expiry_date)").await?;

    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v3(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 3");

    // Cluster members table
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            address TEXT NOT NULL DEFAULT '',
            architectures TEXT NOT NULL DEFAULT '[]',
            groups_json TEXT NOT NULL DEFAULT '[]',
            heartbeat INTEGER NOT NULL DEFAULT 0,
            evacuated INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .await?;

    // Network ACLs table
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS network_acls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            config TEXT NOT NULL DEFAULT '{}',
            ingress TEXT NOT NULL DEFAULT '[]',
            egress TEXT NOT NULL DEFAULT '[]',
            UNIQUE(project, name)
        )
        "#,
    )
    .await?;

    // Address sets referenced by ACL rules via the $name subject form
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS address_sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            addresses TEXT NOT NULL DEFAULT '[]',
            UNIQUE(project, name)
        )
        "#,
    )
    .await?;

    // Networks table (only what ACL application needs: type and config)
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS networks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            type TEXT NOT NULL DEFAULT 'bridge',
            config TEXT NOT NULL DEFAULT '{}',
            UNIQUE(project, name)
        )
        "#,
    )
    .await?;

    // Persistent warnings attached to entities
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS warnings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id INTEGER NOT NULL,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .await?;

    exec(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_warnings_entity ON warnings(entity_type, entity_id)",
    )
    .await?;

    Ok(())
}
