//! Backup subsystem.
//!
//! Backups are tar archives whose first entry is `backup/index.yaml`; the
//! storage driver appends the actual data. Compression is applied on the
//! way out and detected by magic bytes on the way in. An hourly pruner
//! deletes expired backups.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::context::State;
use crate::error::{CaskError, Result};
use crate::instance::Instance;
use crate::operations::Operation;
use crate::revert::Reverter;
use crate::storage::Pool;
use crate::types::{
    BackupConfig, BackupIndex, BackupParent, BackupRecord, BackupType, InstanceArgs,
    InstanceRecord, VolumeType, VOLUME_NODE_REMOTE,
};

#[cfg(test)]
mod tests;

/// Compression algorithm of a backup archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgo {
    None,
    Gzip,
    Xz,
    Zstd,
    Bzip2,
    Lzma,
    Squashfs,
}

impl CompressionAlgo {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::Bzip2 => "bzip2",
            Self::Lzma => "lzma",
            Self::Squashfs => "squashfs",
        }
    }

    /// Identify the algorithm from the file's leading bytes.
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else if header.starts_with(&[b'B', b'Z', b'h']) {
            Self::Bzip2
        } else if header.starts_with(&[0x5d, 0x00, 0x00]) {
            Self::Lzma
        } else if header.starts_with(b"hsqs") {
            Self::Squashfs
        } else {
            Self::None
        }
    }
}

/// Arguments for creating a backup.
#[derive(Debug, Clone, Default)]
pub struct BackupCreateArgs {
    pub name: String,
    /// Unix timestamp after which the backup is pruned.
    pub expiry_date: Option<i64>,
    /// Skip snapshots.
    pub instance_only: bool,
    /// Ask the driver for its own on-disk format.
    pub optimized_storage: bool,
    /// Explicit algorithm; empty uses project then global config.
    pub compression_algorithm: String,
}

/// Writer wrapper reporting progress (bytes and instantaneous rate) to a
/// callback, throttled to twice a second.
struct ProgressWriter<W: Write> {
    inner: W,
    written: u64,
    last_report: std::time::Instant,
    last_written: u64,
    handler: Box<dyn Fn(u64, u64) + Send>,
}

impl<W: Write> ProgressWriter<W> {
    fn new(inner: W, handler: Box<dyn Fn(u64, u64) + Send>) -> Self {
        Self {
            inner,
            written: 0,
            last_report: std::time::Instant::now(),
            last_written: 0,
            handler,
        }
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;

        let elapsed = self.last_report.elapsed();
        if elapsed >= std::time::Duration::from_millis(500) {
            let rate =
                ((self.written - self.last_written) as f64 / elapsed.as_secs_f64()) as u64;
            (self.handler)(self.written, rate);
            self.last_report = std::time::Instant::now();
            self.last_written = self.written;
        }

        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Render a byte count human-readable for progress metadata.
fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}

/// Resolve the effective compression algorithm: explicit argument, then the
/// project's `backups.compression_algorithm`, then the global default.
async fn resolve_compression(state: &State, project: &str, explicit: &str) -> Result<String> {
    if !explicit.is_empty() {
        return Ok(explicit.to_string());
    }

    let project_config = state.db.get_project_config(project).await.unwrap_or_default();
    if let Some(algo) = project_config.get("backups.compression_algorithm") {
        if !algo.is_empty() {
            return Ok(algo.clone());
        }
    }

    Ok(state.global.backups_compression_algorithm.clone())
}

/// Create a new instance backup.
#[instrument(skip(state, inst, op), fields(project = %inst.project(), instance = %inst.name(), name = %args.name))]
pub async fn backup_create(
    state: &Arc<State>,
    args: BackupCreateArgs,
    inst: &Instance,
    op: &Arc<Operation>,
) -> Result<()> {
    debug!("Instance backup started");

    let mut reverter = Reverter::new();
    let result = backup_create_inner(state, args, inst, op, &mut reverter).await;

    match result {
        Ok(()) => {
            reverter.success();
            debug!("Instance backup finished");
            Ok(())
        }
        Err(e) => {
            reverter.fail().await;
            Err(e)
        }
    }
}

async fn backup_create_inner(
    state: &Arc<State>,
    mut args: BackupCreateArgs,
    inst: &Instance,
    op: &Arc<Operation>,
    reverter: &mut Reverter,
) -> Result<()> {
    let record = inst.record();

    let pool = inst
        .pool()
        .await
        .map_err(|e| CaskError::Internal(format!("Failed loading instance storage pool: {}", e)))?;

    // Ignore requests for optimized backups when the driver doesn't
    // support them.
    if args.optimized_storage && !pool.driver().info().optimized_backups {
        args.optimized_storage = false;
    }

    let backup_row = BackupRecord {
        id: 0,
        parent: BackupParent::Instance(record.id),
        name: args.name.clone(),
        creation_date: crate::types::unix_now(),
        expiry_date: args.expiry_date,
        instance_only: args.instance_only,
        optimized_storage: args.optimized_storage,
        compression_algorithm: args.compression_algorithm.clone(),
    };

    let backup_id = state.db.insert_backup(&backup_row).await.map_err(|e| {
        if e.is_conflict() {
            return CaskError::Conflict(format!("Backup {:?} already exists", args.name));
        }

        CaskError::Internal(format!("Insert backup info into database: {}", e))
    })?;

    {
        let db = state.db.clone();
        reverter.add(move || {
            let db = db.clone();
            async move {
                let _ = db.delete_backup(backup_id).await;
            }
        });
    }

    let compress = resolve_compression(state, &record.project, &args.compression_algorithm).await?;

    // Create the target path if needed.
    let backups_path =
        crate::paths::instance_backups_dir(&state.data_dir, &record.project, &record.name);
    if !backups_path.exists() {
        tokio::fs::create_dir_all(&backups_path)
            .await
            .map_err(|e| crate::error::io_error(&backups_path, e))?;

        let dir = backups_path.clone();
        reverter.add(move || {
            let dir = dir.clone();
            async move {
                let _ = tokio::fs::remove_dir(dir).await;
            }
        });
    }

    let target = backups_path.join(&args.name);
    debug!(path = ?target, "Opening backup tarball for writing");

    {
        let target = target.clone();
        reverter.add(move || {
            let target = target.clone();
            async move {
                let _ = tokio::fs::remove_file(target).await;
            }
        });
    }

    // Assemble the index first so it lands as the archive's first entry.
    let snapshots = if args.instance_only {
        Vec::new()
    } else {
        inst.snapshots()
            .await?
            .iter()
            .filter_map(|s| {
                crate::types::parent_and_snapshot_name(&s.name).1.map(str::to_string)
            })
            .collect()
    };

    let config = pool.generate_instance_backup_config(&record, !args.instance_only).await?;

    let optimized_header = args.optimized_storage && pool.driver().info().optimized_backup_header;

    let index = BackupIndex {
        name: record.name.clone(),
        pool: pool.name().to_string(),
        backend: pool.driver().info().name.to_string(),
        backup_type: BackupType::for_instance(record.instance_type),
        optimized_storage: args.optimized_storage,
        optimized_header,
        snapshots: snapshots.clone(),
        config,
    };

    let index_data = serde_yaml::to_string(&index)
        .map_err(|e| CaskError::Internal(format!("Error writing backup index file: {}", e)))?;

    // The tar pipeline is synchronous; run it on the blocking pool with
    // progress reported into the operation metadata.
    let driver = pool.driver().clone();
    let pool_record = pool.record().clone();
    let vol = crate::storage::InstanceVolume::for_record(&record);
    let optimized = args.optimized_storage;
    let op_handle = op.clone();
    let write_target = target.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&write_target)
            .map_err(|e| {
                CaskError::Internal(format!(
                    "Error opening backup tarball for writing {:?}: {}",
                    write_target, e
                ))
            })?;

        let progress = ProgressWriter::new(
            file,
            Box::new(move |written, rate| {
                let text = format!("{} ({}/s)", human_bytes(written), human_bytes(rate));
                op_handle
                    .update_metadata("create_backup_progress", serde_json::json!(text));
            }),
        );

        let writer: Box<dyn Write + Send> = match compress.as_str() {
            "none" => Box::new(progress),
            "gzip" => Box::new(GzEncoder::new(progress, Compression::default())),
            other => {
                return Err(CaskError::BadRequest(format!(
                    "Unsupported compression algorithm {:?}",
                    other
                )))
            }
        };

        let mut tar = tar::Builder::new(writer);

        let index_bytes = index_data.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(index_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(crate::types::unix_now() as u64);
        header.set_cksum();
        tar.append_data(&mut header, "backup/index.yaml", index_bytes).map_err(|e| {
            CaskError::Internal(format!("Error writing backup index file: {}", e))
        })?;

        driver
            .backup_instance(&pool_record, &vol, &mut tar, optimized, &snapshots)
            .map_err(|e| CaskError::Internal(format!("Backup create: {}", e)))?;

        let mut inner = tar
            .into_inner()
            .map_err(|e| CaskError::Internal(format!("Error closing tarball writer: {}", e)))?;
        inner
            .flush()
            .map_err(|e| CaskError::Internal(format!("Error closing tar file: {}", e)))?;

        // Dropping the writer finalises the compression stream.
        Ok(())
    })
    .await
    .map_err(|e| CaskError::Internal(e.to_string()))??;

    info!(path = ?target, "Instance backup written");
    Ok(())
}

/// Shared tarball pipeline for custom volume and bucket backups.
async fn storage_backup_write(
    index: BackupIndex,
    target: PathBuf,
    compress: String,
    append: impl FnOnce(&mut crate::storage::TarBuilder) -> Result<()> + Send + 'static,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| crate::error::io_error(parent, e))?;
    }

    let index_data = serde_yaml::to_string(&index)
        .map_err(|e| CaskError::Internal(format!("Error writing backup index file: {}", e)))?;

    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&target)
            .map_err(|e| {
                CaskError::Internal(format!(
                    "Error opening backup tarball for writing {:?}: {}",
                    target, e
                ))
            })?;

        let writer: Box<dyn Write + Send> = match compress.as_str() {
            "none" => Box::new(file),
            "gzip" => Box::new(GzEncoder::new(file, Compression::default())),
            other => {
                return Err(CaskError::BadRequest(format!(
                    "Unsupported compression algorithm {:?}",
                    other
                )))
            }
        };

        let mut tar = tar::Builder::new(writer);

        let index_bytes = index_data.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(index_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(crate::types::unix_now() as u64);
        header.set_cksum();
        tar.append_data(&mut header, "backup/index.yaml", index_bytes).map_err(|e| {
            CaskError::Internal(format!("Error writing backup index file: {}", e))
        })?;

        append(&mut tar)?;

        let mut inner = tar
            .into_inner()
            .map_err(|e| CaskError::Internal(format!("Error closing tarball writer: {}", e)))?;
        inner
            .flush()
            .map_err(|e| CaskError::Internal(format!("Error closing tar file: {}", e)))?;

        Ok(())
    })
    .await
    .map_err(|e| CaskError::Internal(e.to_string()))?
}

/// Create a backup of a custom volume.
#[instrument(skip(state, args), fields(project = %project, volume = %volume_name, name = %args.name))]
pub async fn volume_backup_create(
    state: &Arc<State>,
    args: BackupCreateArgs,
    project: &str,
    pool_name: &str,
    volume_name: &str,
) -> Result<()> {
    debug!("Volume backup started");

    let pool = Pool::load(state.db.clone(), &state.drivers, pool_name)
        .await
        .map_err(|e| CaskError::Internal(format!("Failed loading storage pool {:?}: {}", pool_name, e)))?;

    let mut optimized = args.optimized_storage;
    if optimized && !pool.driver().info().optimized_backups {
        optimized = false;
    }

    let volume = state
        .db
        .get_volume(pool.record().id, project, volume_name, VolumeType::Custom)
        .await?;

    let backup_row = BackupRecord {
        id: 0,
        parent: BackupParent::Volume(volume.id),
        name: args.name.clone(),
        creation_date: crate::types::unix_now(),
        expiry_date: args.expiry_date,
        instance_only: args.instance_only,
        optimized_storage: optimized,
        compression_algorithm: args.compression_algorithm.clone(),
    };

    let mut reverter = Reverter::new();

    let backup_id = state.db.insert_backup(&backup_row).await.map_err(|e| {
        if e.is_conflict() {
            return CaskError::Conflict(format!("Backup {:?} already exists", args.name));
        }

        CaskError::Internal(format!("Failed creating backup record: {}", e))
    })?;

    {
        let db = state.db.clone();
        reverter.add(move || {
            let db = db.clone();
            async move {
                let _ = db.delete_backup(backup_id).await;
            }
        });
    }

    let compress = resolve_compression(state, project, &args.compression_algorithm).await?;

    let index = BackupIndex {
        name: volume_name.to_string(),
        pool: pool.name().to_string(),
        backend: pool.driver().info().name.to_string(),
        backup_type: BackupType::Custom,
        optimized_storage: optimized,
        optimized_header: optimized && pool.driver().info().optimized_backup_header,
        snapshots: Vec::new(),
        config: BackupConfig { volume: Some(volume), ..Default::default() },
    };

    let target = crate::paths::volume_backups_dir(&state.data_dir, pool.name(), project, volume_name)
        .join(&args.name);

    {
        let target = target.clone();
        reverter.add(move || {
            let target = target.clone();
            async move {
                let _ = tokio::fs::remove_file(target).await;
            }
        });
    }

    let driver = pool.driver().clone();
    let pool_record = pool.record().clone();
    let project = project.to_string();
    let volume_name = volume_name.to_string();

    let result = storage_backup_write(index, target, compress, move |tar| {
        driver
            .backup_custom_volume(&pool_record, &project, &volume_name, tar, &[])
            .map_err(|e| CaskError::Internal(format!("Backup create: {}", e)))
    })
    .await;

    match result {
        Ok(()) => {
            reverter.success();
            debug!("Volume backup finished");
            Ok(())
        }
        Err(e) => {
            reverter.fail().await;
            Err(e)
        }
    }
}

/// Create a backup of a bucket.
#[instrument(skip(state, args), fields(project = %project, bucket = %bucket_name, name = %args.name))]
pub async fn bucket_backup_create(
    state: &Arc<State>,
    args: BackupCreateArgs,
    project: &str,
    pool_name: &str,
    bucket_name: &str,
) -> Result<()> {
    debug!("Bucket backup started");

    let pool = Pool::load(state.db.clone(), &state.drivers, pool_name)
        .await
        .map_err(|e| CaskError::Internal(format!("Failed loading storage pool {:?}: {}", pool_name, e)))?;

    let bucket = state
        .db
        .get_volume(pool.record().id, project, bucket_name, VolumeType::Bucket)
        .await?;

    let backup_row = BackupRecord {
        id: 0,
        parent: BackupParent::Bucket(bucket.id),
        name: args.name.clone(),
        creation_date: crate::types::unix_now(),
        expiry_date: args.expiry_date,
        instance_only: false,
        optimized_storage: false,
        compression_algorithm: args.compression_algorithm.clone(),
    };

    let mut reverter = Reverter::new();

    let backup_id = state.db.insert_backup(&backup_row).await.map_err(|e| {
        if e.is_conflict() {
            return CaskError::Conflict(format!("Backup {:?} already exists", args.name));
        }

        CaskError::Internal(format!("Failed creating backup record: {}", e))
    })?;

    {
        let db = state.db.clone();
        reverter.add(move || {
            let db = db.clone();
            async move {
                let _ = db.delete_backup(backup_id).await;
            }
        });
    }

    let compress = resolve_compression(state, project, &args.compression_algorithm).await?;

    let index = BackupIndex {
        name: bucket_name.to_string(),
        pool: pool.name().to_string(),
        backend: pool.driver().info().name.to_string(),
        backup_type: BackupType::Bucket,
        optimized_storage: false,
        optimized_header: false,
        snapshots: Vec::new(),
        config: BackupConfig { bucket: Some(bucket_name.to_string()), ..Default::default() },
    };

    let target = crate::paths::bucket_backups_dir(&state.data_dir, pool.name(), project, bucket_name)
        .join(&args.name);

    {
        let target = target.clone();
        reverter.add(move || {
            let target = target.clone();
            async move {
                let _ = tokio::fs::remove_file(target).await;
            }
        });
    }

    let driver = pool.driver().clone();
    let pool_record = pool.record().clone();
    let project = project.to_string();
    let bucket_name = bucket_name.to_string();

    let result = storage_backup_write(index, target, compress, move |tar| {
        driver
            .backup_bucket(&pool_record, &project, &bucket_name, tar)
            .map_err(|e| CaskError::Internal(format!("Backup create: {}", e)))
    })
    .await;

    match result {
        Ok(()) => {
            reverter.success();
            debug!("Bucket backup finished");
            Ok(())
        }
        Err(e) => {
            reverter.fail().await;
            Err(e)
        }
    }
}

/// Probe a backup archive: detect compression, decompress to a scratch tar
/// when needed and parse `backup/index.yaml`.
///
/// Returns the index, the path of the plain tar to unpack and an optional
/// scratch file guard that must outlive the unpack.
pub async fn get_info(
    state: &State,
    path: &Path,
) -> Result<(BackupIndex, PathBuf, Option<tempfile::NamedTempFile>)> {
    let mut header = [0u8; 8];
    {
        let mut file = std::fs::File::open(path).map_err(|e| crate::error::io_error(path, e))?;
        let n = file.read(&mut header).map_err(|e| crate::error::io_error(path, e))?;
        if n < 4 {
            return Err(CaskError::BadRequest("Backup file is too short".to_string()));
        }
    }

    let algo = CompressionAlgo::detect(&header);

    let (tar_path, scratch) = match algo {
        CompressionAlgo::None => (path.to_path_buf(), None),
        CompressionAlgo::Gzip | CompressionAlgo::Squashfs => {
            // Compressed input (and squashfs in particular) is always
            // unpacked to a scratch tar before inspection.
            if algo == CompressionAlgo::Squashfs {
                return Err(CaskError::Unavailable(
                    "Squashfs backups require the squashfs tooling collaborator".to_string(),
                ));
            }

            let backups_dir = crate::paths::backups_dir(&state.data_dir);
            tokio::fs::create_dir_all(&backups_dir)
                .await
                .map_err(|e| crate::error::io_error(&backups_dir, e))?;

            let src = path.to_path_buf();
            let scratch = tokio::task::spawn_blocking(
                move || -> std::result::Result<tempfile::NamedTempFile, std::io::Error> {
                    let mut scratch = tempfile::Builder::new()
                        .prefix("cask_backup_")
                        .tempfile_in(&backups_dir)?;

                    let file = std::fs::File::open(&src)?;
                    let mut decoder = flate2::read::GzDecoder::new(file);
                    std::io::copy(&mut decoder, scratch.as_file_mut())?;
                    scratch.as_file_mut().flush()?;

                    Ok(scratch)
                },
            )
            .await
            .map_err(|e| CaskError::Internal(e.to_string()))?
            .map_err(|e| crate::error::io_error(path, e))?;

            (scratch.path().to_path_buf(), Some(scratch))
        }
        other => {
            return Err(CaskError::Unavailable(format!(
                "Backup compression {:?} requires external tooling",
                other.as_str()
            )))
        }
    };

    // Pull the index out of the (now plain) tar.
    let index_path = tar_path.clone();
    let index: BackupIndex = tokio::task::spawn_blocking(move || -> Result<BackupIndex> {
        let file =
            std::fs::File::open(&index_path).map_err(|e| crate::error::io_error(&index_path, e))?;
        let mut archive = tar::Archive::new(file);

        for entry in archive.entries().map_err(|e| crate::error::io_error(&index_path, e))? {
            let mut entry = entry.map_err(|e| crate::error::io_error(&index_path, e))?;
            let entry_path = entry.path().map_err(|e| crate::error::io_error(&index_path, e))?;

            if entry_path.as_ref() == Path::new("backup/index.yaml") {
                let mut data = String::new();
                entry
                    .read_to_string(&mut data)
                    .map_err(|e| crate::error::io_error(&index_path, e))?;

                return serde_yaml::from_str(&data).map_err(|e| {
                    CaskError::BadRequest(format!("Invalid backup index: {}", e))
                });
            }
        }

        Err(CaskError::BadRequest("Backup is missing index.yaml".to_string()))
    })
    .await
    .map_err(|e| CaskError::Internal(e.to_string()))??;

    Ok((index, tar_path, scratch))
}

/// Restore an instance from a backup tarball.
///
/// The storage layer unpacks the archive before any database rows exist;
/// its post hook finalises storage once the rows are in place and its
/// revert hook tears the unpacked data down again on failure.
#[instrument(skip(state, tarball), fields(project = %project))]
pub async fn restore_from_backup(
    state: &Arc<State>,
    project: &str,
    tarball: &Path,
    pool_override: Option<String>,
    name_override: Option<String>,
) -> Result<InstanceRecord> {
    let (mut index, tar_path, _scratch) = get_info(state, tarball).await?;

    let Some(container) = index.config.container.clone() else {
        return Err(CaskError::BadRequest(
            "Backup file is missing required information".to_string(),
        ));
    };

    if let Some(pool) = &pool_override {
        index.pool = pool.clone();
    }

    if let Some(name) = &name_override {
        if !name.is_empty() {
            index.name = name.clone();
        }
    }

    debug!(
        backup_type = %index.backup_type,
        name = %index.name,
        backend = %index.backend,
        pool = %index.pool,
        optimized = index.optimized_storage,
        snapshots = index.snapshots.len(),
        "Backup file info loaded"
    );

    // The index's pool may be gone: unless the archive is optimized (we
    // cannot rewrite it) or the user named a pool, fall back to the default
    // profile's root-disk pool.
    if state.db.get_pool(&index.pool).await.is_err() {
        if index.optimized_storage || pool_override.is_some() {
            return Err(CaskError::Internal(format!(
                "Storage pool not found: {:?}",
                index.pool
            )));
        }

        let profile = state.db.get_profile(project, "default").await.map_err(|e| {
            CaskError::Internal(format!("Failed to get default profile: {}", e))
        })?;

        let (_, root) = profile.devices.root_disk().ok_or_else(|| {
            CaskError::Internal("Failed to get root disk device".to_string())
        })?;

        index.pool = root.get("pool").cloned().unwrap_or_default();
    }

    let pool = Pool::load(state.db.clone(), &state.drivers, &index.pool).await?;

    if index.optimized_storage && pool.driver().info().name != index.backend {
        return Err(CaskError::BadRequest(format!(
            "Optimized backup storage driver {:?} differs from the target storage pool driver {:?}",
            index.backend,
            pool.driver().info().name
        )));
    }

    let mut reverter = Reverter::new();

    // Rewrite the embedded record for the target project/name.
    let mut restored_index = index.clone();
    if let Some(container) = &mut restored_index.config.container {
        container.project = project.to_string();
        container.name = index.name.clone();
    }

    let (post_hook, revert_hook) = pool
        .create_instance_from_backup(&restored_index, &tar_path)
        .await
        .map_err(|e| CaskError::Internal(format!("Create instance from backup: {}", e)))?;
    reverter.add_hook(revert_hook);

    let result: Result<InstanceRecord> = async {
        // Instance row.
        let args = InstanceArgs {
            project: project.to_string(),
            name: index.name.clone(),
            node: state.server_name.clone(),
            instance_type: container.instance_type,
            architecture: container.architecture.clone(),
            ephemeral: false,
            snapshot: false,
            stateful: container.stateful,
            description: container.description.clone(),
            expiry_date: None,
            config: container.config.clone(),
            devices: container.devices.clone(),
            profiles: container.profiles.clone(),
        };

        let record = state.db.insert_instance(&args).await?;

        // Volume row tying the instance to the pool.
        state
            .db
            .insert_volume(
                pool.record().id,
                project,
                &index.name,
                VolumeType::for_instance(container.instance_type),
                crate::types::ContentType::Fs,
                VOLUME_NODE_REMOTE,
                &HashMap::new(),
            )
            .await?;

        // Snapshot rows.
        for snapshot in &index.config.snapshots {
            let (_, snap_name) = crate::types::parent_and_snapshot_name(&snapshot.name);
            let Some(snap_name) = snap_name else { continue };

            let snap_args = InstanceArgs {
                project: project.to_string(),
                name: format!(
                    "{}{}{}",
                    index.name,
                    crate::types::SNAPSHOT_DELIMITER,
                    snap_name
                ),
                node: state.server_name.clone(),
                instance_type: snapshot.instance_type,
                architecture: snapshot.architecture.clone(),
                ephemeral: false,
                snapshot: true,
                stateful: snapshot.stateful,
                description: snapshot.description.clone(),
                expiry_date: snapshot.expiry_date,
                config: snapshot.config.clone(),
                devices: snapshot.devices.clone(),
                profiles: snapshot.profiles.clone(),
            };

            state.db.insert_instance(&snap_args).await?;
        }

        Ok(record)
    }
    .await;

    let record = match result {
        Ok(record) => record,
        Err(e) => {
            reverter.fail().await;
            return Err(CaskError::Internal(format!("Failed importing backup: {}", e)));
        }
    };

    {
        let db = state.db.clone();
        let project = project.to_string();
        let name = index.name.clone();
        reverter.add(move || {
            let db = db.clone();
            let project = project.clone();
            let name = name.clone();
            async move {
                let _ = db.delete_instance(&project, &name).await;
            }
        });
    }

    // Storage finalisation now that the rows exist.
    post_hook().await;

    reverter.success();
    info!(instance = %index.name, "Restored instance from backup");

    Ok(record)
}

/// Delete an instance backup: artifact first, then the row.
pub async fn backup_delete(state: &State, record: &InstanceRecord, backup: &BackupRecord) -> Result<()> {
    let path = crate::paths::instance_backups_dir(&state.data_dir, &record.project, &record.name)
        .join(&backup.name);

    if path.exists() {
        tokio::fs::remove_file(&path).await.map_err(|e| crate::error::io_error(&path, e))?;
    }

    state.db.delete_backup(backup.id).await
}

/// Prune expired instance, volume and bucket backups.
///
/// Volume and bucket locality: only backups whose volume lives on this
/// member (or on a remote pool, node id -1) are pruned here.
#[instrument(skip(state))]
pub async fn prune_expired_backups(state: &Arc<State>) -> Result<()> {
    let now = crate::types::unix_now();

    let local_node_id = match state.db.get_member(&state.server_name).await {
        Ok(member) => member.id,
        Err(_) => VOLUME_NODE_REMOTE,
    };

    // Expired instance backups.
    for backup in state.db.list_expired_backups("instance", now).await? {
        let BackupParent::Instance(instance_id) = backup.parent else { continue };

        let record = state.db.get_instance_by_id(instance_id).await.map_err(|e| {
            CaskError::Internal(format!(
                "Error loading instance for deleting backup {:?}: {}",
                backup.name, e
            ))
        })?;

        backup_delete(state, &record, &backup).await.map_err(|e| {
            CaskError::Internal(format!(
                "Error deleting instance backup {:?}: {}",
                backup.name, e
            ))
        })?;

        info!(backup = %backup.name, "Pruned expired instance backup");
    }

    // Expired volume and bucket backups, honoring locality. The deletions
    // run outside any transaction to keep IO out of the database lock.
    for parent_type in ["volume", "bucket"] {
        for backup in state.db.list_expired_backups(parent_type, now).await? {
            let volume_id = match backup.parent {
                BackupParent::Volume(id) | BackupParent::Bucket(id) => id,
                BackupParent::Instance(_) => continue,
            };

            let volume = match state.db.get_volume_by_id(volume_id).await {
                Ok(volume) => volume,
                Err(e) => {
                    warn!(backup = %backup.name, error = %e, "Failed getting storage pool of backup");
                    continue;
                }
            };

            if volume.node_id != VOLUME_NODE_REMOTE && volume.node_id != local_node_id {
                continue;
            }

            let pool = state.db.get_pool_by_id(volume.pool_id).await?;

            let dir = if parent_type == "volume" {
                crate::paths::volume_backups_dir(
                    &state.data_dir,
                    &pool.name,
                    &volume.project,
                    &volume.name,
                )
            } else {
                crate::paths::bucket_backups_dir(
                    &state.data_dir,
                    &pool.name,
                    &volume.project,
                    &volume.name,
                )
            };

            let path = dir.join(&backup.name);
            if path.exists() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| crate::error::io_error(&path, e))?;
            }

            state.db.delete_backup(backup.id).await?;
            info!(backup = %backup.name, "Pruned expired storage backup");
        }
    }

    Ok(())
}
