//! State management with SQLite persistence.
//!
//! The StateManager is the transactional façade over the replicated metadata
//! store. It owns relational integrity for:
//! - Instances, their snapshots, config and devices
//! - Profiles
//! - Storage pools and volumes
//! - Backups
//! - Network ACLs, address sets and network assignments
//! - Cluster members and warnings
//!
//! All multi-row invariants (an instance row and its root volume row live
//! and die together) are committed inside a single transaction.

use crate::error::{CaskError, Result};
use crate::types::acl::{AclRule, NetworkAcl};
use crate::types::{
    BackupParent, BackupRecord, ContentType, Devices, InstanceArgs, InstanceRecord, InstanceType,
    Member, NetworkRecord, PoolRecord, PoolState, Profile, VolumeRecord, VolumeType,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument};

pub mod migrations;

#[cfg(test)]
mod tests;

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> CaskError {
    move |e| {
        metrics::counter!("cask_db_errors_total", "operation" => operation).increment(1);
        CaskError::DatabaseError(e.to_string())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| CaskError::DatabaseError(format!("Failed to serialize column: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| CaskError::DatabaseError(format!("Failed to deserialize column: {}", e)))
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| crate::error::io_error(parent, e))?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            CaskError::BadRequest("Invalid database path".to_string())
        })?)
        .map_err(|e| CaskError::DatabaseError(e.to_string()))?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CaskError::DatabaseError(e.to_string()))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        migrations::run(&self.pool).await?;
        Ok(())
    }

    // ========================
    // Project Operations
    // ========================

    /// Insert a project.
    #[instrument(skip(self, config))]
    pub async fn insert_project(
        &self,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO projects (name, config) VALUES (?, ?)")
            .bind(name)
            .bind(to_json(config)?)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return CaskError::Conflict(format!("Project {:?} already exists", name));
                }
                db_err("insert_project")(e)
            })?;

        Ok(())
    }

    /// Get a project's config map.
    #[instrument(skip(self))]
    pub async fn get_project_config(&self, name: &str) -> Result<HashMap<String, String>> {
        let row = sqlx::query("SELECT config FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_project_config"))?
            .ok_or_else(|| CaskError::NotFound(format!("Project {:?}", name)))?;

        let config_json: String = row.get("config");
        from_json(&config_json)
    }

    /// Update a project's config map.
    #[instrument(skip(self, config))]
    pub async fn update_project_config(
        &self,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        sqlx::query("UPDATE projects SET config = ? WHERE name = ?")
            .bind(to_json(config)?)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("update_project_config"))?;

        Ok(())
    }

    // ========================
    // Instance Operations
    // ========================

    /// Insert a new instance (or snapshot) row.
    #[instrument(skip(self, args), fields(project = %args.project, instance = %args.name))]
    pub async fn insert_instance(&self, args: &InstanceArgs) -> Result<InstanceRecord> {
        let now = crate::types::unix_now();

        let result = sqlx::query(
            r#"
            INSERT INTO instances (project, name, node, type, architecture, ephemeral, snapshot,
                                   stateful, description, creation_date, last_used_date,
                                   expiry_date, config, devices, profiles)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&args.project)
        .bind(&args.name)
        .bind(&args.node)
        .bind(args.instance_type.as_str())
        .bind(&args.architecture)
        .bind(args.ephemeral)
        .bind(args.snapshot)
        .bind(args.stateful)
        .bind(&args.description)
        .bind(now)
        .bind(0i64)
        .bind(args.expiry_date)
        .bind(to_json(&args.config)?)
        .bind(to_json(&args.devices)?)
        .bind(to_json(&args.profiles)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return CaskError::InstanceAlreadyExists {
                    project: args.project.clone(),
                    instance: args.name.clone(),
                };
            }
            db_err("insert_instance")(e)
        })?;

        self.get_instance_by_id(result.last_insert_rowid()).await
    }

    /// Get an instance by project and name.
    #[instrument(skip(self))]
    pub async fn get_instance(&self, project: &str, name: &str) -> Result<InstanceRecord> {
        let row = sqlx::query("SELECT * FROM instances WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_instance"))?
            .ok_or_else(|| CaskError::InstanceNotFound {
                project: project.to_string(),
                instance: name.to_string(),
            })?;

        self.row_to_instance(row)
    }

    /// Get an instance by row id.
    #[instrument(skip(self))]
    pub async fn get_instance_by_id(&self, id: i64) -> Result<InstanceRecord> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_instance_by_id"))?
            .ok_or_else(|| CaskError::NotFound(format!("Instance id {}", id)))?;

        self.row_to_instance(row)
    }

    /// List all non-snapshot instances, optionally scoped to a project.
    #[instrument(skip(self))]
    pub async fn list_instances(&self, project: Option<&str>) -> Result<Vec<InstanceRecord>> {
        let rows = if let Some(project) = project {
            sqlx::query(
                "SELECT * FROM instances WHERE project = ? AND snapshot = 0 ORDER BY name",
            )
            .bind(project)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list_instances"))?
        } else {
            sqlx::query("SELECT * FROM instances WHERE snapshot = 0 ORDER BY project, name")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err("list_instances"))?
        };

        rows.into_iter().map(|row| self.row_to_instance(row)).collect()
    }

    /// List the names of all non-snapshot instances in a project.
    #[instrument(skip(self))]
    pub async fn list_instance_names(&self, project: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT name FROM instances WHERE project = ? AND snapshot = 0")
                .bind(project)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err("list_instance_names"))?;

        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    /// List non-snapshot instances placed on a cluster member.
    #[instrument(skip(self))]
    pub async fn list_node_instances(&self, node: &str) -> Result<Vec<InstanceRecord>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE node = ? AND snapshot = 0")
            .bind(node)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list_node_instances"))?;

        rows.into_iter().map(|row| self.row_to_instance(row)).collect()
    }

    /// Count non-snapshot instances per cluster member.
    #[instrument(skip(self))]
    pub async fn count_instances_per_node(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT node, COUNT(*) AS count FROM instances WHERE snapshot = 0 GROUP BY node",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("count_instances_per_node"))?;

        Ok(rows.into_iter().map(|row| (row.get("node"), row.get("count"))).collect())
    }

    /// Replace an instance row with updated contents.
    #[instrument(skip(self, record), fields(project = %record.project, instance = %record.name))]
    pub async fn update_instance(&self, record: &InstanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE instances SET
                architecture = ?, ephemeral = ?, stateful = ?, description = ?,
                expiry_date = ?, config = ?, devices = ?, profiles = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.architecture)
        .bind(record.ephemeral)
        .bind(record.stateful)
        .bind(&record.description)
        .bind(record.expiry_date)
        .bind(to_json(&record.config)?)
        .bind(to_json(&record.devices)?)
        .bind(to_json(&record.profiles)?)
        .bind(record.id)
        .execute(&self.pool)
        .await
        .map_err(db_err("update_instance"))?;

        Ok(())
    }

    /// Apply a set of config changes to an instance. An empty value deletes
    /// the key. The read-modify-write runs inside one transaction.
    #[instrument(skip(self, changes))]
    pub async fn update_instance_config(
        &self,
        id: i64,
        changes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("update_instance_config"))?;

        let row = sqlx::query("SELECT config FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("update_instance_config"))?
            .ok_or_else(|| CaskError::NotFound(format!("Instance id {}", id)))?;

        let config_json: String = row.get("config");
        let mut config: HashMap<String, String> = from_json(&config_json)?;

        for (key, value) in changes {
            if value.is_empty() {
                config.remove(key);
            } else {
                config.insert(key.clone(), value.clone());
            }
        }

        sqlx::query("UPDATE instances SET config = ? WHERE id = ?")
            .bind(to_json(&config)?)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("update_instance_config"))?;

        tx.commit().await.map_err(db_err("update_instance_config"))?;
        Ok(())
    }

    /// Insert a single config key unless it is already set, returning the
    /// value that ended up in the database (ours, or the concurrent
    /// writer's).
    #[instrument(skip(self, value))]
    pub async fn try_insert_instance_config_key(
        &self,
        id: i64,
        key: &str,
        value: &str,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await.map_err(db_err("try_insert_instance_config_key"))?;

        let row = sqlx::query("SELECT config FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("try_insert_instance_config_key"))?
            .ok_or_else(|| CaskError::NotFound(format!("Instance id {}", id)))?;

        let config_json: String = row.get("config");
        let mut config: HashMap<String, String> = from_json(&config_json)?;

        if let Some(existing) = config.get(key) {
            return Ok(existing.clone());
        }

        config.insert(key.to_string(), value.to_string());

        sqlx::query("UPDATE instances SET config = ? WHERE id = ?")
            .bind(to_json(&config)?)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("try_insert_instance_config_key"))?;

        tx.commit().await.map_err(db_err("try_insert_instance_config_key"))?;
        Ok(value.to_string())
    }

    /// Record the instance power state in `volatile.last_state.power`.
    #[instrument(skip(self))]
    pub async fn update_instance_power_state(&self, id: i64, power: &str) -> Result<()> {
        let mut changes = HashMap::new();
        changes.insert("volatile.last_state.power".to_string(), power.to_string());
        self.update_instance_config(id, &changes).await
    }

    /// Update the instance last used timestamp.
    #[instrument(skip(self))]
    pub async fn update_instance_last_used(&self, id: i64, timestamp: i64) -> Result<()> {
        sqlx::query("UPDATE instances SET last_used_date = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update_instance_last_used"))?;

        Ok(())
    }

    /// Rename an instance and all of its snapshot rows.
    #[instrument(skip(self))]
    pub async fn rename_instance(
        &self,
        project: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("rename_instance"))?;

        sqlx::query("UPDATE instances SET name = ? WHERE project = ? AND name = ? AND snapshot = 0")
            .bind(new_name)
            .bind(project)
            .bind(old_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return CaskError::InstanceAlreadyExists {
                        project: project.to_string(),
                        instance: new_name.to_string(),
                    };
                }
                db_err("rename_instance")(e)
            })?;

        let old_prefix = format!("{}{}", old_name, crate::types::SNAPSHOT_DELIMITER);
        let rows = sqlx::query(
            "SELECT id, name FROM instances WHERE project = ? AND snapshot = 1 AND name LIKE ?",
        )
        .bind(project)
        .bind(format!("{}%", old_prefix))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("rename_instance"))?;

        for row in rows {
            let id: i64 = row.get("id");
            let name: String = row.get("name");
            let renamed = format!(
                "{}{}{}",
                new_name,
                crate::types::SNAPSHOT_DELIMITER,
                name.strip_prefix(&old_prefix).unwrap_or(&name)
            );

            sqlx::query("UPDATE instances SET name = ? WHERE id = ?")
                .bind(renamed)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err("rename_instance"))?;
        }

        tx.commit().await.map_err(db_err("rename_instance"))?;
        Ok(())
    }

    /// Delete an instance together with its snapshots, volumes, backups and
    /// warnings. Runs inside one transaction so no orphan rows survive.
    #[instrument(skip(self))]
    pub async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        let record = self.get_instance(project, name).await?;

        let mut tx = self.pool.begin().await.map_err(db_err("delete_instance"))?;

        // Snapshot rows (and their backups) go first.
        let snap_prefix = format!("{}{}%", name, crate::types::SNAPSHOT_DELIMITER);
        let snap_rows = sqlx::query(
            "SELECT id FROM instances WHERE project = ? AND snapshot = 1 AND name LIKE ?",
        )
        .bind(project)
        .bind(&snap_prefix)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("delete_instance"))?;

        for row in &snap_rows {
            let snap_id: i64 = row.get("id");
            sqlx::query("DELETE FROM backups WHERE parent_type = 'instance' AND parent_id = ?")
                .bind(snap_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err("delete_instance"))?;
        }

        sqlx::query("DELETE FROM instances WHERE project = ? AND snapshot = 1 AND name LIKE ?")
            .bind(project)
            .bind(&snap_prefix)
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete_instance"))?;

        // Volume rows for the instance (and its snapshots, same name prefix).
        let volume_type = VolumeType::for_instance(record.instance_type);
        sqlx::query(
            "DELETE FROM storage_volumes WHERE project = ? AND type = ? AND (name = ? OR name LIKE ?)",
        )
        .bind(project)
        .bind(volume_type.as_str())
        .bind(name)
        .bind(&snap_prefix)
        .execute(&mut *tx)
        .await
        .map_err(db_err("delete_instance"))?;

        sqlx::query("DELETE FROM backups WHERE parent_type = 'instance' AND parent_id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete_instance"))?;

        sqlx::query("DELETE FROM warnings WHERE entity_type = 'instance' AND entity_id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete_instance"))?;

        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete_instance"))?;

        tx.commit().await.map_err(db_err("delete_instance"))?;
        Ok(())
    }

    /// Get snapshots of an instance, ordered by (creation date, id).
    #[instrument(skip(self))]
    pub async fn get_instance_snapshots(
        &self,
        project: &str,
        parent: &str,
    ) -> Result<Vec<InstanceRecord>> {
        let prefix = format!("{}{}%", parent, crate::types::SNAPSHOT_DELIMITER);
        let rows = sqlx::query(
            r#"
            SELECT * FROM instances
            WHERE project = ? AND snapshot = 1 AND name LIKE ?
            ORDER BY creation_date, id
            "#,
        )
        .bind(project)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get_instance_snapshots"))?;

        rows.into_iter().map(|row| self.row_to_instance(row)).collect()
    }

    /// Resolve the storage pool name backing an instance via its volume row.
    #[instrument(skip(self))]
    pub async fn get_instance_pool_name(&self, project: &str, name: &str) -> Result<String> {
        let record = self.get_instance(project, name).await?;
        let volume_type = VolumeType::for_instance(record.instance_type);

        let row = sqlx::query(
            r#"
            SELECT storage_pools.name AS pool_name FROM storage_volumes
            JOIN storage_pools ON storage_pools.id = storage_volumes.pool_id
            WHERE storage_volumes.project = ? AND storage_volumes.name = ?
              AND storage_volumes.type = ?
            "#,
        )
        .bind(project)
        .bind(name)
        .bind(volume_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_instance_pool_name"))?
        .ok_or_else(|| {
            CaskError::NotFound(format!("Storage volume for instance {:?}", name))
        })?;

        Ok(row.get("pool_name"))
    }

    fn row_to_instance(&self, row: SqliteRow) -> Result<InstanceRecord> {
        let type_str: String = row.get("type");
        let instance_type = InstanceType::parse(&type_str)
            .ok_or_else(|| CaskError::DatabaseError(format!("Bad instance type {:?}", type_str)))?;

        let config_json: String = row.get("config");
        let devices_json: String = row.get("devices");
        let profiles_json: String = row.get("profiles");

        Ok(InstanceRecord {
            id: row.get("id"),
            project: row.get("project"),
            name: row.get("name"),
            node: row.get("node"),
            instance_type,
            architecture: row.get("architecture"),
            ephemeral: row.get("ephemeral"),
            snapshot: row.get("snapshot"),
            stateful: row.get("stateful"),
            description: row.get("description"),
            creation_date: row.get("creation_date"),
            last_used_date: row.get("last_used_date"),
            expiry_date: row.get("expiry_date"),
            config: from_json(&config_json)?,
            devices: from_json(&devices_json)?,
            profiles: from_json(&profiles_json)?,
        })
    }

    // ========================
    // Profile Operations
    // ========================

    /// Insert a profile.
    #[instrument(skip(self, profile), fields(project = %profile.project, profile = %profile.name))]
    pub async fn insert_profile(&self, profile: &Profile) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO profiles (project, name, description, config, devices)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&profile.project)
        .bind(&profile.name)
        .bind(&profile.description)
        .bind(to_json(&profile.config)?)
        .bind(to_json(&profile.devices)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return CaskError::Conflict(format!("Profile {:?} already exists", profile.name));
            }
            db_err("insert_profile")(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a profile by project and name.
    #[instrument(skip(self))]
    pub async fn get_profile(&self, project: &str, name: &str) -> Result<Profile> {
        let row = sqlx::query("SELECT * FROM profiles WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_profile"))?
            .ok_or_else(|| CaskError::NotFound(format!("Profile {:?}", name)))?;

        self.row_to_profile(row)
    }

    /// Get several profiles by name, preserving the requested order.
    #[instrument(skip(self, names))]
    pub async fn get_profiles(&self, project: &str, names: &[String]) -> Result<Vec<Profile>> {
        let mut profiles = Vec::with_capacity(names.len());

        for name in names {
            profiles.push(self.get_profile(project, name).await.map_err(|e| {
                if e.is_not_found() {
                    return CaskError::BadRequest(format!(
                        "Requested profile {:?} doesn't exist",
                        name
                    ));
                }
                e
            })?);
        }

        Ok(profiles)
    }

    fn row_to_profile(&self, row: SqliteRow) -> Result<Profile> {
        let config_json: String = row.get("config");
        let devices_json: String = row.get("devices");

        Ok(Profile {
            id: row.get("id"),
            project: row.get("project"),
            name: row.get("name"),
            description: row.get("description"),
            config: from_json(&config_json)?,
            devices: from_json(&devices_json)?,
        })
    }

    // ========================
    // Storage Pool Operations
    // ========================

    /// Insert a storage pool.
    #[instrument(skip(self, config))]
    pub async fn insert_pool(
        &self,
        name: &str,
        driver: &str,
        state: PoolState,
        config: &HashMap<String, String>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO storage_pools (name, driver, state, config) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(driver)
        .bind(state.as_str())
        .bind(to_json(config)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return CaskError::Conflict(format!("Storage pool {:?} already exists", name));
            }
            db_err("insert_pool")(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a storage pool in any state.
    #[instrument(skip(self))]
    pub async fn get_pool(&self, name: &str) -> Result<PoolRecord> {
        let row = sqlx::query("SELECT * FROM storage_pools WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_pool"))?
            .ok_or_else(|| CaskError::NotFound(format!("Storage pool {:?}", name)))?;

        self.row_to_pool(row)
    }

    /// Get a storage pool by row id.
    #[instrument(skip(self))]
    pub async fn get_pool_by_id(&self, id: i64) -> Result<PoolRecord> {
        let row = sqlx::query("SELECT * FROM storage_pools WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_pool_by_id"))?
            .ok_or_else(|| CaskError::NotFound(format!("Storage pool id {}", id)))?;

        self.row_to_pool(row)
    }

    /// List all storage pool names.
    #[instrument(skip(self))]
    pub async fn list_pool_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM storage_pools ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list_pool_names"))?;

        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    /// Update a storage pool's state.
    #[instrument(skip(self))]
    pub async fn update_pool_state(&self, id: i64, state: PoolState) -> Result<()> {
        sqlx::query("UPDATE storage_pools SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update_pool_state"))?;

        Ok(())
    }

    fn row_to_pool(&self, row: SqliteRow) -> Result<PoolRecord> {
        let state_str: String = row.get("state");
        let config_json: String = row.get("config");

        Ok(PoolRecord {
            id: row.get("id"),
            name: row.get("name"),
            driver: row.get("driver"),
            description: row.get("description"),
            state: PoolState::parse(&state_str).unwrap_or(PoolState::Errored),
            config: from_json(&config_json)?,
        })
    }

    // ========================
    // Storage Volume Operations
    // ========================

    /// Insert a volume row.
    #[instrument(skip(self, config))]
    pub async fn insert_volume(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        volume_type: VolumeType,
        content_type: ContentType,
        node_id: i64,
        config: &HashMap<String, String>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO storage_volumes (pool_id, project, name, type, content_type, node_id, config)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(pool_id)
        .bind(project)
        .bind(name)
        .bind(volume_type.as_str())
        .bind(content_type.as_str())
        .bind(node_id)
        .bind(to_json(config)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return CaskError::Conflict(format!("Volume {:?} already exists", name));
            }
            db_err("insert_volume")(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a volume row.
    #[instrument(skip(self))]
    pub async fn get_volume(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        volume_type: VolumeType,
    ) -> Result<VolumeRecord> {
        let row = sqlx::query(
            "SELECT * FROM storage_volumes WHERE pool_id = ? AND project = ? AND name = ? AND type = ?",
        )
        .bind(pool_id)
        .bind(project)
        .bind(name)
        .bind(volume_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_volume"))?
        .ok_or_else(|| CaskError::NotFound(format!("Volume {:?}", name)))?;

        self.row_to_volume(row)
    }

    /// Get a volume row by id.
    #[instrument(skip(self))]
    pub async fn get_volume_by_id(&self, id: i64) -> Result<VolumeRecord> {
        let row = sqlx::query("SELECT * FROM storage_volumes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_volume_by_id"))?
            .ok_or_else(|| CaskError::NotFound(format!("Volume id {}", id)))?;

        self.row_to_volume(row)
    }

    /// Delete a volume row.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM storage_volumes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_volume"))?;

        Ok(())
    }

    /// Rename a volume row.
    #[instrument(skip(self))]
    pub async fn rename_volume(&self, id: i64, new_name: &str) -> Result<()> {
        sqlx::query("UPDATE storage_volumes SET name = ? WHERE id = ?")
            .bind(new_name)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("rename_volume"))?;

        Ok(())
    }

    fn row_to_volume(&self, row: SqliteRow) -> Result<VolumeRecord> {
        let type_str: String = row.get("type");
        let content_str: String = row.get("content_type");
        let config_json: String = row.get("config");

        Ok(VolumeRecord {
            id: row.get("id"),
            pool_id: row.get("pool_id"),
            project: row.get("project"),
            name: row.get("name"),
            volume_type: VolumeType::parse(&type_str)
                .ok_or_else(|| CaskError::DatabaseError(format!("Bad volume type {:?}", type_str)))?,
            content_type: crate::types::ContentType::parse(&content_str)
                .unwrap_or(ContentType::Fs),
            node_id: row.get("node_id"),
            config: from_json(&config_json)?,
        })
    }

    // ========================
    // Backup Operations
    // ========================

    /// Insert a backup row. Returns a conflict error when the name exists.
    #[instrument(skip(self, record), fields(backup = %record.name))]
    pub async fn insert_backup(&self, record: &BackupRecord) -> Result<i64> {
        let (parent_type, parent_id) = match record.parent {
            BackupParent::Instance(id) => ("instance", id),
            BackupParent::Volume(id) => ("volume", id),
            BackupParent::Bucket(id) => ("bucket", id),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO backups (parent_type, parent_id, name, creation_date, expiry_date,
                                 instance_only, optimized_storage, compression_algorithm)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(parent_type)
        .bind(parent_id)
        .bind(&record.name)
        .bind(record.creation_date)
        .bind(record.expiry_date)
        .bind(record.instance_only)
        .bind(record.optimized_storage)
        .bind(&record.compression_algorithm)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return CaskError::Conflict(format!("Backup {:?} already exists", record.name));
            }
            db_err("insert_backup")(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a backup of an instance by name.
    #[instrument(skip(self))]
    pub async fn get_instance_backup(
        &self,
        instance_id: i64,
        name: &str,
    ) -> Result<BackupRecord> {
        let row = sqlx::query(
            "SELECT * FROM backups WHERE parent_type = 'instance' AND parent_id = ? AND name = ?",
        )
        .bind(instance_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_instance_backup"))?
        .ok_or_else(|| CaskError::NotFound(format!("Backup {:?}", name)))?;

        self.row_to_backup(row)
    }

    /// Delete a backup row.
    #[instrument(skip(self))]
    pub async fn delete_backup(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_backup"))?;

        Ok(())
    }

    /// List backups of the given parent kind whose expiry has passed.
    #[instrument(skip(self))]
    pub async fn list_expired_backups(
        &self,
        parent_type: &str,
        now: i64,
    ) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM backups
            WHERE parent_type = ? AND expiry_date IS NOT NULL AND expiry_date <= ?
            "#,
        )
        .bind(parent_type)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_expired_backups"))?;

        rows.into_iter().map(|row| self.row_to_backup(row)).collect()
    }

    fn row_to_backup(&self, row: SqliteRow) -> Result<BackupRecord> {
        let parent_type: String = row.get("parent_type");
        let parent_id: i64 = row.get("parent_id");

        let parent = match parent_type.as_str() {
            "instance" => BackupParent::Instance(parent_id),
            "volume" => BackupParent::Volume(parent_id),
            "bucket" => BackupParent::Bucket(parent_id),
            other => {
                return Err(CaskError::DatabaseError(format!("Bad backup parent {:?}", other)))
            }
        };

        Ok(BackupRecord {
            id: row.get("id"),
            parent,
            name: row.get("name"),
            creation_date: row.get("creation_date"),
            expiry_date: row.get("expiry_date"),
            instance_only: row.get("instance_only"),
            optimized_storage: row.get("optimized_storage"),
            compression_algorithm: row.get("compression_algorithm"),
        })
    }

    // ========================
    // Network ACL Operations
    // ========================

    /// Insert a network ACL.
    #[instrument(skip(self, acl), fields(project = %acl.project, acl = %acl.name))]
    pub async fn insert_acl(&self, acl: &NetworkAcl) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO network_acls (project, name, description, config, ingress, egress)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&acl.project)
        .bind(&acl.name)
        .bind(&acl.description)
        .bind(to_json(&acl.config)?)
        .bind(to_json(&acl.ingress)?)
        .bind(to_json(&acl.egress)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return CaskError::Conflict(format!("ACL {:?} already exists", acl.name));
            }
            db_err("insert_acl")(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a network ACL by project and name.
    #[instrument(skip(self))]
    pub async fn get_acl(&self, project: &str, name: &str) -> Result<NetworkAcl> {
        let row = sqlx::query("SELECT * FROM network_acls WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_acl"))?
            .ok_or_else(|| CaskError::NotFound(format!("Network ACL {:?}", name)))?;

        self.row_to_acl(row)
    }

    /// Update an ACL's mutable fields.
    #[instrument(skip(self, description, config, ingress, egress))]
    pub async fn update_acl(
        &self,
        id: i64,
        description: &str,
        config: &HashMap<String, String>,
        ingress: &[AclRule],
        egress: &[AclRule],
    ) -> Result<()> {
        sqlx::query(
            "UPDATE network_acls SET description = ?, config = ?, ingress = ?, egress = ? WHERE id = ?",
        )
        .bind(description)
        .bind(to_json(config)?)
        .bind(to_json(&ingress)?)
        .bind(to_json(&egress)?)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err("update_acl"))?;

        Ok(())
    }

    /// Rename an ACL.
    #[instrument(skip(self))]
    pub async fn rename_acl(&self, id: i64, new_name: &str) -> Result<()> {
        sqlx::query("UPDATE network_acls SET name = ? WHERE id = ?")
            .bind(new_name)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return CaskError::Conflict(format!("ACL {:?} already exists", new_name));
                }
                db_err("rename_acl")(e)
            })?;

        Ok(())
    }

    /// Delete an ACL.
    #[instrument(skip(self))]
    pub async fn delete_acl(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM network_acls WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_acl"))?;

        Ok(())
    }

    /// Map of ACL names to row ids within a project.
    #[instrument(skip(self))]
    pub async fn get_acl_ids_by_names(&self, project: &str) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT id, name FROM network_acls WHERE project = ?")
            .bind(project)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("get_acl_ids_by_names"))?;

        Ok(rows.into_iter().map(|row| (row.get("name"), row.get("id"))).collect())
    }

    /// Whether an address set exists in a project.
    #[instrument(skip(self))]
    pub async fn address_set_exists(&self, project: &str, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT id FROM address_sets WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("address_set_exists"))?;

        Ok(row.is_some())
    }

    /// Insert an address set.
    #[instrument(skip(self, addresses))]
    pub async fn insert_address_set(
        &self,
        project: &str,
        name: &str,
        addresses: &[String],
    ) -> Result<i64> {
        let result =
            sqlx::query("INSERT INTO address_sets (project, name, addresses) VALUES (?, ?, ?)")
                .bind(project)
                .bind(name)
                .bind(to_json(&addresses)?)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        return CaskError::Conflict(format!(
                            "Address set {:?} already exists",
                            name
                        ));
                    }
                    db_err("insert_address_set")(e)
                })?;

        Ok(result.last_insert_rowid())
    }

    fn row_to_acl(&self, row: SqliteRow) -> Result<NetworkAcl> {
        let config_json: String = row.get("config");
        let ingress_json: String = row.get("ingress");
        let egress_json: String = row.get("egress");

        Ok(NetworkAcl {
            id: row.get("id"),
            project: row.get("project"),
            name: row.get("name"),
            description: row.get("description"),
            config: from_json(&config_json)?,
            ingress: from_json(&ingress_json)?,
            egress: from_json(&egress_json)?,
        })
    }

    // ========================
    // Network Operations
    // ========================

    /// Insert a network row.
    #[instrument(skip(self, config))]
    pub async fn insert_network(
        &self,
        project: &str,
        name: &str,
        net_type: &str,
        config: &HashMap<String, String>,
    ) -> Result<i64> {
        let result =
            sqlx::query("INSERT INTO networks (project, name, type, config) VALUES (?, ?, ?, ?)")
                .bind(project)
                .bind(name)
                .bind(net_type)
                .bind(to_json(config)?)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        return CaskError::Conflict(format!("Network {:?} already exists", name));
                    }
                    db_err("insert_network")(e)
                })?;

        Ok(result.last_insert_rowid())
    }

    /// List all networks in a project.
    #[instrument(skip(self))]
    pub async fn list_networks(&self, project: &str) -> Result<Vec<NetworkRecord>> {
        let rows = sqlx::query("SELECT * FROM networks WHERE project = ? ORDER BY name")
            .bind(project)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list_networks"))?;

        rows.into_iter()
            .map(|row| {
                let config_json: String = row.get("config");
                Ok(NetworkRecord {
                    id: row.get("id"),
                    project: row.get("project"),
                    name: row.get("name"),
                    net_type: row.get("type"),
                    config: from_json(&config_json)?,
                })
            })
            .collect()
    }

    // ========================
    // Cluster Member Operations
    // ========================

    /// Insert a cluster member.
    #[instrument(skip(self, member), fields(member = %member.name))]
    pub async fn insert_member(&self, member: &Member) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO members (name, address, architectures, groups_json, heartbeat, evacuated)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&member.name)
        .bind(&member.address)
        .bind(to_json(&member.architectures)?)
        .bind(to_json(&member.groups)?)
        .bind(member.heartbeat)
        .bind(member.evacuated)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return CaskError::Conflict(format!("Member {:?} already exists", member.name));
            }
            db_err("insert_member")(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    /// List all cluster members with their instance counts.
    #[instrument(skip(self))]
    pub async fn list_members(&self) -> Result<Vec<Member>> {
        let counts = self.count_instances_per_node().await?;

        let rows = sqlx::query("SELECT * FROM members ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list_members"))?;

        rows.into_iter()
            .map(|row| {
                let mut member = self.row_to_member(row)?;
                member.instance_count = counts.get(&member.name).copied().unwrap_or(0);
                Ok(member)
            })
            .collect()
    }

    /// Get a cluster member by name.
    #[instrument(skip(self))]
    pub async fn get_member(&self, name: &str) -> Result<Member> {
        let row = sqlx::query("SELECT * FROM members WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_member"))?
            .ok_or_else(|| CaskError::NotFound(format!("Cluster member {:?}", name)))?;

        self.row_to_member(row)
    }

    /// Record a member heartbeat.
    #[instrument(skip(self))]
    pub async fn update_member_heartbeat(&self, name: &str, timestamp: i64) -> Result<()> {
        sqlx::query("UPDATE members SET heartbeat = ? WHERE name = ?")
            .bind(timestamp)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("update_member_heartbeat"))?;

        Ok(())
    }

    /// Mark a member evacuated or restored.
    #[instrument(skip(self))]
    pub async fn set_member_evacuated(&self, name: &str, evacuated: bool) -> Result<()> {
        sqlx::query("UPDATE members SET evacuated = ? WHERE name = ?")
            .bind(evacuated)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("set_member_evacuated"))?;

        Ok(())
    }

    fn row_to_member(&self, row: SqliteRow) -> Result<Member> {
        let architectures_json: String = row.get("architectures");
        let groups_json: String = row.get("groups_json");

        Ok(Member {
            id: row.get("id"),
            name: row.get("name"),
            address: row.get("address"),
            architectures: from_json(&architectures_json)?,
            groups: from_json(&groups_json)?,
            heartbeat: row.get("heartbeat"),
            evacuated: row.get("evacuated"),
            instance_count: 0,
        })
    }

    // ========================
    // Warning Operations
    // ========================

    /// Attach a warning to an entity.
    #[instrument(skip(self, message))]
    pub async fn insert_warning(
        &self,
        entity_type: &str,
        entity_id: i64,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO warnings (entity_type, entity_id, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(message)
        .bind(crate::types::unix_now())
        .execute(&self.pool)
        .await
        .map_err(db_err("insert_warning"))?;

        Ok(())
    }

    /// Delete all warnings attached to an entity.
    #[instrument(skip(self))]
    pub async fn delete_warnings(&self, entity_type: &str, entity_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM warnings WHERE entity_type = ? AND entity_id = ?")
            .bind(entity_type)
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_warnings"))?;

        Ok(())
    }

    /// List warnings attached to an entity.
    #[instrument(skip(self))]
    pub async fn list_warnings(&self, entity_type: &str, entity_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT message FROM warnings WHERE entity_type = ? AND entity_id = ? ORDER BY id",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_warnings"))?;

        Ok(rows.into_iter().map(|row| row.get("message")).collect())
    }
}
