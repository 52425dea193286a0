// freightvault/src/backup/archive.rs
//! GZipped TAR archives of directory trees.
//!
//! Every archive written here starts with a `.backup-manifest.json` entry that
//! records its layout:
//! * `single` - entries are relative to one archived directory
//! * `keyed`  - each archived directory lives under its base name, and a full
//!   backup may also carry a SQL dump under `__database__/dump.sql`
//!
//! Extraction always reads the whole archive once before touching the target,
//! so a truncated or corrupt bundle is rejected without partial writes.

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::{Archive, Builder, EntryType, Header};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::utils::naming::artifact_file_name;

pub const MANIFEST_NAME: &str = ".backup-manifest.json";
pub const DATABASE_ENTRY_DIR: &str = "__database__";
pub const DATABASE_ENTRY_NAME: &str = "__database__/dump.sql";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveLayout {
    Single,
    Keyed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u32,
    pub layout: ArchiveLayout,
    /// Base names of the directories stored in a keyed archive.
    #[serde(default)]
    pub directories: Vec<String>,
    /// Requested directories that did not exist when the archive was written.
    #[serde(default)]
    pub missing_directories: Vec<String>,
    #[serde(default)]
    pub has_database_dump: bool,
    pub created_at: chrono::DateTime<Utc>,
}

impl ArchiveManifest {
    fn legacy() -> Self {
        Self {
            format_version: 0,
            layout: ArchiveLayout::Single,
            directories: Vec::new(),
            missing_directories: Vec::new(),
            has_database_dump: false,
            created_at: Utc::now(),
        }
    }

    /// Fails unless every target can be restored from this archive.
    pub fn ensure_covers(&self, targets: &[PathBuf]) -> Result<()> {
        if targets.is_empty() {
            return Err(AppError::Validation("No target directories given".to_string()));
        }
        match self.layout {
            ArchiveLayout::Single if targets.len() != 1 => Err(AppError::Validation(format!(
                "Archive holds a single directory but {} targets were given",
                targets.len()
            ))),
            ArchiveLayout::Single => Ok(()),
            ArchiveLayout::Keyed => {
                for target in targets {
                    let key = dir_key(target)?;
                    if !self.directories.contains(&key) && !self.missing_directories.contains(&key) {
                        return Err(AppError::Validation(format!(
                            "Archive has no entry for directory '{}'",
                            key
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// The subset of `dirs` this archive has an entry for, by base name.
    pub fn covered(&self, dirs: &[PathBuf]) -> Vec<PathBuf> {
        let covered = dirs.iter().filter(|dir| {
            dir_key(dir).is_ok_and(|key| {
                self.directories.contains(&key) || self.missing_directories.contains(&key)
            })
        });
        match self.layout {
            ArchiveLayout::Single => covered.take(1).cloned().collect(),
            ArchiveLayout::Keyed => covered.cloned().collect(),
        }
    }
}

pub struct FileBackupHandler {
    config: Arc<BackupConfig>,
}

impl FileBackupHandler {
    pub fn new(config: Arc<BackupConfig>) -> Self {
        Self { config }
    }

    /// Archives one directory tree; entries are relative to `source_dir`.
    pub fn backup_directory(&self, source_dir: &Path) -> Result<PathBuf> {
        if !source_dir.is_dir() {
            return Err(AppError::Validation(format!(
                "Source for archival is not a directory: {}",
                source_dir.display()
            )));
        }
        let name = dir_key(source_dir)?;
        let dest = self
            .config
            .artifact_dir("files")
            .join(artifact_file_name(&name, Utc::now(), "tar.gz"));

        let manifest = ArchiveManifest {
            format_version: FORMAT_VERSION,
            layout: ArchiveLayout::Single,
            directories: vec![name],
            missing_directories: Vec::new(),
            has_database_dump: false,
            created_at: Utc::now(),
        };
        write_archive(&dest, &manifest, |builder| {
            append_tree(builder, source_dir, Path::new(""))
        })?;
        Ok(dest)
    }

    /// Safety-net archive of the directories a restore is about to replace.
    pub fn create_pre_restore_backup(&self, dirs: &[PathBuf]) -> Result<PathBuf> {
        let dest = self
            .config
            .artifact_dir("pre-restore")
            .join(artifact_file_name("pre_restore_files", Utc::now(), "tar.gz"));
        self.create_bundle(dirs, None, &dest)?;
        tracing::info!(path = %dest.display(), directories = dirs.len(), "pre-restore file snapshot written");
        Ok(dest)
    }

    /// Writes a keyed archive of `dirs` (and optionally a SQL dump) to `dest`.
    ///
    /// Directories that do not exist are skipped and listed in the manifest.
    pub fn create_bundle(
        &self,
        dirs: &[PathBuf],
        database_dump: Option<&Path>,
        dest: &Path,
    ) -> Result<()> {
        let mut keys = Vec::new();
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for dir in dirs {
            let key = dir_key(dir)?;
            if key == DATABASE_ENTRY_DIR || keys.contains(&key) {
                return Err(AppError::Validation(format!(
                    "Directory name '{}' is used more than once or is reserved",
                    key
                )));
            }
            keys.push(key.clone());
            if dir.is_dir() {
                present.push((dir.clone(), key));
            } else {
                tracing::warn!(directory = %dir.display(), "directory missing, not included in archive");
                missing.push(key);
            }
        }

        let manifest = ArchiveManifest {
            format_version: FORMAT_VERSION,
            layout: ArchiveLayout::Keyed,
            directories: present.iter().map(|(_, k)| k.clone()).collect(),
            missing_directories: missing,
            has_database_dump: database_dump.is_some(),
            created_at: Utc::now(),
        };

        write_archive(dest, &manifest, |builder| {
            if let Some(dump) = database_dump {
                builder.append_path_with_name(dump, DATABASE_ENTRY_NAME)?;
            }
            for (dir, key) in &present {
                append_tree(builder, dir, Path::new(key))?;
            }
            Ok(())
        })
    }

    pub fn validate_archive(&self, archive_path: &Path) -> bool {
        match self.inspect_archive(archive_path) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(path = %archive_path.display(), error = %e, "archive failed validation");
                false
            }
        }
    }

    /// Reads the archive end to end and returns its manifest.
    pub fn inspect_archive(&self, archive_path: &Path) -> Result<ArchiveManifest> {
        inspect(archive_path)
    }

    /// Extracts an archive into `destination`, replacing same-named entries.
    ///
    /// The archive is validated first and unpacked into a staging directory
    /// beside the destination, so a corrupt archive never touches it.
    pub fn extract_archive(&self, archive_path: &Path, destination: &Path) -> Result<()> {
        inspect(archive_path)?;

        let parent = staging_parent(destination)?;
        let staging = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(&parent)?;
        unpack_subtree(archive_path, Path::new(""), staging.path())?;

        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(staging.path())? {
            let entry = entry?;
            let target = destination.join(entry.file_name());
            remove_existing(&target)?;
            fs::rename(entry.path(), &target)?;
        }

        tracing::info!(
            archive = %archive_path.display(),
            destination = %destination.display(),
            "archive extracted"
        );
        Ok(())
    }

    /// Replaces each target directory with its copy from the archive.
    ///
    /// A `single` archive restores into exactly one target; a `keyed` archive
    /// restores each target from the entry named after its base name. All
    /// targets are staged before any of them is swapped.
    pub fn restore_directories(&self, archive_path: &Path, targets: &[PathBuf]) -> Result<()> {
        let manifest = inspect(archive_path)?;
        manifest.ensure_covers(targets)?;

        // (target, prefix inside the archive); None when the directory was absent at snapshot time.
        let mut plan: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(targets.len());
        match manifest.layout {
            ArchiveLayout::Single => plan.push((targets[0].clone(), Some(PathBuf::new()))),
            ArchiveLayout::Keyed => {
                for target in targets {
                    let key = dir_key(target)?;
                    if manifest.directories.contains(&key) {
                        plan.push((target.clone(), Some(PathBuf::from(key))));
                    } else {
                        plan.push((target.clone(), None));
                    }
                }
            }
        }

        let mut staged: Vec<(PathBuf, Option<TempDir>)> = Vec::with_capacity(plan.len());
        for (target, prefix) in plan {
            let Some(prefix) = prefix else {
                staged.push((target, None));
                continue;
            };
            let parent = staging_parent(&target)?;
            let stage = tempfile::Builder::new()
                .prefix(".restore-")
                .tempdir_in(&parent)?;
            unpack_subtree(archive_path, &prefix, stage.path())?;
            staged.push((target, Some(stage)));
        }

        for (target, stage) in staged {
            swap_directory(&target, stage)?;
        }
        Ok(())
    }

    /// Copies the SQL dump embedded in a full backup to `dest`.
    pub fn extract_database_dump(&self, archive_path: &Path, dest: &Path) -> Result<()> {
        let manifest = inspect(archive_path)?;
        if !manifest.has_database_dump {
            return Err(AppError::Validation(format!(
                "Archive {} does not contain a database dump",
                archive_path.display()
            )));
        }

        let mut archive = open_archive(archive_path)?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_ref() == Path::new(DATABASE_ENTRY_NAME) {
                let mut out = File::create(dest)?;
                io::copy(&mut entry, &mut out)?;
                return Ok(());
            }
        }
        Err(AppError::corrupt_archive(archive_path, "database dump entry missing"))
    }
}

fn dir_key(dir: &Path) -> Result<String> {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::Validation(format!("Directory has no base name: {}", dir.display())))
}

fn staging_parent(target: &Path) -> Result<PathBuf> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    Ok(parent)
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Moves the current target aside, puts the staged copy in place and only then
/// deletes the old tree. The old tree is moved back if the swap fails.
fn swap_directory(target: &Path, stage: Option<TempDir>) -> Result<()> {
    let backup_aside = target.with_file_name(format!(
        ".{}.old-{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uuid::Uuid::new_v4().simple()
    ));
    let had_existing = target.exists();
    if had_existing {
        fs::rename(target, &backup_aside)?;
    }

    if let Some(stage) = stage {
        if let Err(e) = fs::rename(stage.path(), target) {
            if had_existing {
                let _ = fs::rename(&backup_aside, target);
            }
            return Err(e.into());
        }
        // Dropping `stage` now only tries to remove a path that no longer exists.
    }

    if had_existing {
        if let Err(e) = fs::remove_dir_all(&backup_aside) {
            tracing::warn!(path = %backup_aside.display(), error = %e, "could not remove replaced directory");
        }
    }
    tracing::debug!(target = %target.display(), "directory swapped in from archive");
    Ok(())
}

fn write_archive<F>(dest: &Path, manifest: &ArchiveManifest, fill: F) -> Result<()>
where
    F: FnOnce(&mut Builder<GzEncoder<File>>) -> io::Result<()>,
{
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = PathBuf::from(format!("{}.partial", dest.display()));

    let result = (|| -> Result<()> {
        let file = File::create(&partial)?;
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

        let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
        let mut header = Header::new_gnu();
        header.set_size(manifest_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())?;

        fill(&mut builder)?;

        let encoder = builder.into_inner()?;
        let file = encoder.finish()?;
        file.sync_all()?;
        fs::rename(&partial, dest)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    } else {
        tracing::debug!(archive = %dest.display(), layout = ?manifest.layout, "archive written");
    }
    result
}

fn append_tree<W: io::Write>(builder: &mut Builder<W>, source_dir: &Path, prefix: &Path) -> io::Result<()> {
    if !prefix.as_os_str().is_empty() {
        builder.append_dir(prefix, source_dir)?;
    }
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source_dir)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = prefix.join(relative);

        if entry.file_type().is_dir() {
            builder.append_dir(&name, path)?;
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(path, &name)?;
        } else {
            tracing::debug!(path = %path.display(), "skipping non-regular file");
        }
    }
    Ok(())
}

fn open_archive(archive_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(archive_path)
        .map_err(|e| AppError::corrupt_archive(archive_path, format!("cannot open: {}", e)))?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn is_safe_entry_path(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Only regular files and directories may be unpacked; a link entry could
/// redirect later entries outside the destination.
fn ensure_plain_entry(archive_path: &Path, path: &Path, kind: EntryType) -> Result<()> {
    if kind.is_file() || kind.is_dir() {
        return Ok(());
    }
    Err(AppError::corrupt_archive(
        archive_path,
        format!("unsupported {:?} entry {}", kind, path.display()),
    ))
}

fn inspect(archive_path: &Path) -> Result<ArchiveManifest> {
    if !archive_path.is_file() {
        return Err(AppError::Validation(format!(
            "Archive not found: {}",
            archive_path.display()
        )));
    }
    if fs::metadata(archive_path)?.len() == 0 {
        return Err(AppError::corrupt_archive(archive_path, "file is empty"));
    }

    let corrupt = |e: io::Error| AppError::corrupt_archive(archive_path, e);
    let mut archive = open_archive(archive_path)?;
    let mut manifest = None;
    let mut entry_count = 0usize;

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.into_owned();
        if !is_safe_entry_path(&path) {
            return Err(AppError::corrupt_archive(
                archive_path,
                format!("unsafe entry path {}", path.display()),
            ));
        }
        ensure_plain_entry(archive_path, &path, entry.header().entry_type())?;
        entry_count += 1;

        if path == Path::new(MANIFEST_NAME) {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw).map_err(corrupt)?;
            manifest = Some(
                serde_json::from_slice::<ArchiveManifest>(&raw)
                    .map_err(|e| AppError::corrupt_archive(archive_path, format!("bad manifest: {}", e)))?,
            );
        } else {
            io::copy(&mut entry, &mut io::sink()).map_err(corrupt)?;
        }
    }

    if entry_count == 0 {
        return Err(AppError::corrupt_archive(archive_path, "archive has no entries"));
    }
    Ok(manifest.unwrap_or_else(ArchiveManifest::legacy))
}

/// Unpacks entries below `prefix` into `dest`, with `prefix` stripped.
fn unpack_subtree(archive_path: &Path, prefix: &Path, dest: &Path) -> Result<()> {
    let corrupt = |e: io::Error| AppError::corrupt_archive(archive_path, e);
    let mut archive = open_archive(archive_path)?;
    archive.set_preserve_permissions(true);

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.into_owned();
        if path == Path::new(MANIFEST_NAME) || path.starts_with(DATABASE_ENTRY_DIR) {
            continue;
        }
        ensure_plain_entry(archive_path, &path, entry.header().entry_type())?;
        let Ok(relative) = path.strip_prefix(prefix) else {
            continue;
        };
        if relative.as_os_str().is_empty() || relative == Path::new(".") {
            continue;
        }
        let out = dest.join(relative);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&out).map_err(corrupt)?;
    }
    Ok(())
}
