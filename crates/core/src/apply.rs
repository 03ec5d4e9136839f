use crate::config::app_paths;
use crate::error::{CatalogError, Result};
use crate::matcher::STAGING_PREFIX;
use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMove {
    pub from: PathBuf,
    pub to: PathBuf,
}

impl FileMove {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UndoLog {
    recorded_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Option<PathBuf>,
    operations: Vec<FileMove>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoResult {
    pub restored: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct StagedRename {
    original_path: PathBuf,
    target_path: PathBuf,
    temp_path: PathBuf,
}

/// Moves every file of one group, or none of them.
///
/// Files are first moved to temporary names next to their origin, then to
/// their targets, so members of the group may swap names. A target that
/// exists and is not itself part of the group is never overwritten. Returns
/// the moves actually performed.
pub fn apply_group(moves: &[FileMove]) -> Result<Vec<FileMove>> {
    let moves: Vec<&FileMove> = moves.iter().filter(|m| !m.is_noop()).collect();
    if moves.is_empty() {
        return Ok(Vec::new());
    }

    validate_group(&moves)?;

    for m in &moves {
        if let Some(parent) = m.to.parent() {
            fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }
    }

    let mut staged = Vec::<StagedRename>::with_capacity(moves.len());
    for m in &moves {
        let entry = StagedRename {
            original_path: m.from.clone(),
            target_path: m.to.clone(),
            temp_path: temp_path_for(&m.from),
        };
        if let Err(err) = fs::rename(&entry.original_path, &entry.temp_path) {
            rollback_staged_to_original_paths(&staged);
            return Err(CatalogError::Rename {
                from: entry.original_path,
                to: entry.temp_path,
                source: err,
            });
        }
        staged.push(entry);
    }

    let mut performed = Vec::with_capacity(staged.len());
    for (finalized, entry) in staged.iter().enumerate() {
        let result = if entry.target_path.exists() {
            Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "target appeared while renaming",
            ))
        } else {
            fs::rename(&entry.temp_path, &entry.target_path)
        };
        if let Err(err) = result {
            rollback_after_final_rename_failure(&staged, finalized);
            return Err(CatalogError::Rename {
                from: entry.original_path.clone(),
                to: entry.target_path.clone(),
                source: err,
            });
        }
        debug!(
            "moved {} -> {}",
            entry.original_path.display(),
            entry.target_path.display()
        );
        performed.push(FileMove::new(&entry.original_path, &entry.target_path));
    }

    Ok(performed)
}

fn validate_group(moves: &[&FileMove]) -> Result<()> {
    let sources: HashSet<&Path> = moves.iter().map(|m| m.from.as_path()).collect();
    let mut seen_sources = HashSet::<&Path>::new();
    let mut seen_targets = HashSet::<&Path>::new();

    for m in moves {
        if !seen_sources.insert(m.from.as_path()) {
            return Err(rename_error(m, io::ErrorKind::InvalidInput, "source listed twice"));
        }
        if !seen_targets.insert(m.to.as_path()) {
            return Err(rename_error(m, io::ErrorKind::InvalidInput, "target listed twice"));
        }
        if !m.from.exists() {
            return Err(rename_error(m, io::ErrorKind::NotFound, "source does not exist"));
        }
        if m.to.exists() && !sources.contains(m.to.as_path()) {
            return Err(rename_error(m, io::ErrorKind::AlreadyExists, "target already exists"));
        }
    }
    Ok(())
}

fn rename_error(m: &FileMove, kind: io::ErrorKind, message: &str) -> CatalogError {
    CatalogError::Rename {
        from: m.from.clone(),
        to: m.to.clone(),
        source: io::Error::new(kind, message),
    }
}

fn rollback_staged_to_original_paths(staged: &[StagedRename]) {
    for entry in staged.iter().rev() {
        if !entry.temp_path.exists() {
            continue;
        }
        if let Err(err) = fs::rename(&entry.temp_path, &entry.original_path) {
            warn!(
                "rollback failed: {} -> {} ({err})",
                entry.temp_path.display(),
                entry.original_path.display()
            );
        }
    }
}

fn rollback_after_final_rename_failure(staged: &[StagedRename], finalized: usize) {
    for entry in staged[..finalized].iter().rev() {
        if !entry.target_path.exists() {
            continue;
        }
        if let Err(err) = fs::rename(&entry.target_path, &entry.temp_path) {
            warn!(
                "rollback failed: {} -> {} ({err})",
                entry.target_path.display(),
                entry.temp_path.display()
            );
        }
    }
    rollback_staged_to_original_paths(staged);
}

fn temp_path_for(original_path: &Path) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let parent = original_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = original_path
        .file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    parent.join(format!(
        "{STAGING_PREFIX}{}-{n}-{file_name}",
        std::process::id()
    ))
}

/// Records `moves` as the run that `undo` reverts. An empty run leaves the
/// previous journal in place.
pub fn write_journal(
    path: &Path,
    catalog: Option<&Path>,
    moves: &[FileMove],
) -> anyhow::Result<()> {
    if moves.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let log = UndoLog {
        recorded_at: Utc::now(),
        catalog: catalog.map(Path::to_path_buf),
        operations: moves.to_vec(),
    };
    let body = serde_json::to_string_pretty(&log).context("cannot serialize undo journal")?;
    fs::write(path, body).with_context(|| format!("cannot write {}", path.display()))?;
    info!("journaled {} moves in {}", moves.len(), path.display());
    Ok(())
}

pub fn persist_undo(catalog: Option<&Path>, moves: &[FileMove]) -> anyhow::Result<()> {
    let paths = app_paths()?;
    write_journal(&paths.undo_path, catalog, moves)
}

/// Reverts the journal at `path` and removes it.
pub fn undo_journal(path: &Path) -> anyhow::Result<UndoResult> {
    if !path.exists() {
        anyhow::bail!("nothing to undo");
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read undo journal {}", path.display()))?;
    let log = serde_json::from_str::<UndoLog>(&raw).context("undo journal is corrupt")?;

    let result = restore_operations(&log)?;

    fs::remove_file(path).with_context(|| format!("cannot remove {}", path.display()))?;
    Ok(result)
}

pub fn undo_last() -> anyhow::Result<UndoResult> {
    let paths = app_paths()?;
    undo_journal(&paths.undo_path)
}

fn restore_operations(log: &UndoLog) -> anyhow::Result<UndoResult> {
    let mut restored = 0usize;
    let mut skipped = 0usize;
    for op in log.operations.iter().rev() {
        if !op.to.exists() {
            skipped += 1;
            continue;
        }
        if op.from.exists() {
            warn!("not restoring {}: path is taken", op.from.display());
            skipped += 1;
            continue;
        }
        if let Some(parent) = op.from.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        fs::rename(&op.to, &op.from).with_context(|| {
            format!("cannot restore {} -> {}", op.to.display(), op.from.display())
        })?;
        restored += 1;
    }
    Ok(UndoResult { restored, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn no_staging_leftovers(dir: &Path) -> bool {
        !fs::read_dir(dir)
            .expect("read dir")
            .flatten()
            .any(|entry| entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
    }

    #[test]
    fn noop_group_moves_nothing() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a.jpg");
        fs::write(&a, b"A").expect("write");
        let performed = apply_group(&[FileMove::new(&a, &a)]).expect("apply");
        assert!(performed.is_empty());
        assert!(a.exists());
    }

    #[test]
    fn moves_group_into_new_directories() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let media = root.join("IMG_0001.JPG");
        let sidecar = root.join("IMG_0001.JPG.xmp");
        fs::write(&media, b"M").expect("write");
        fs::write(&sidecar, b"S").expect("write");

        let target = root.join("2024/01/240101_123001050.jpg");
        let target_sidecar = root.join("2024/01/240101_123001050.jpg.xmp");
        let performed = apply_group(&[
            FileMove::new(&media, &target),
            FileMove::new(&sidecar, &target_sidecar),
        ])
        .expect("apply");

        assert_eq!(performed.len(), 2);
        assert_eq!(fs::read(&target).expect("read"), b"M");
        assert_eq!(fs::read(&target_sidecar).expect("read"), b"S");
        assert!(!media.exists());
        assert!(no_staging_leftovers(root));
    }

    #[test]
    fn group_members_can_swap_names() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a.jpg");
        let b = temp.path().join("b.jpg");
        fs::write(&a, b"A").expect("write");
        fs::write(&b, b"B").expect("write");

        apply_group(&[FileMove::new(&a, &b), FileMove::new(&b, &a)]).expect("apply");
        assert_eq!(fs::read(&a).expect("read"), b"B");
        assert_eq!(fs::read(&b).expect("read"), b"A");
    }

    #[test]
    fn existing_foreign_target_is_never_overwritten() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a.jpg");
        let taken = temp.path().join("taken.jpg");
        fs::write(&a, b"A").expect("write");
        fs::write(&taken, b"T").expect("write");

        let err = apply_group(&[FileMove::new(&a, &taken)]).expect_err("must refuse");
        assert!(matches!(err, CatalogError::Rename { .. }));
        assert_eq!(fs::read(&taken).expect("read"), b"T");
        assert!(a.exists());
    }

    #[test]
    fn failed_final_rename_rolls_back_whole_group() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let a = root.join("IMG_A.JPG");
        let b = root.join("IMG_A.JPG.xmp");
        fs::write(&a, b"A").expect("write A");
        fs::write(&b, b"B").expect("write B");

        // Longer than any file system allows for one name component.
        let unreachable = root.join("dir").join(format!("{}.jpg", "x".repeat(300)));
        let renamed_a = root.join("RENAMED_A.JPG");
        let moves = [
            FileMove::new(&a, &renamed_a),
            FileMove::new(&b, &unreachable),
        ];

        let err = apply_group(&moves).expect_err("second final rename must fail");
        match err {
            CatalogError::Rename { from, to, .. } => {
                assert_eq!(from, b);
                assert_eq!(to, unreachable);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(&a).expect("A restored"), b"A");
        assert_eq!(fs::read(&b).expect("B restored"), b"B");
        assert!(!renamed_a.exists(), "renamed A should be rolled back");
        assert!(no_staging_leftovers(root));
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a.jpg");
        let b = temp.path().join("b.jpg");
        fs::write(&a, b"A").expect("write");
        fs::write(&b, b"B").expect("write");
        let same = temp.path().join("same.jpg");

        assert!(apply_group(&[FileMove::new(&a, &same), FileMove::new(&b, &same)]).is_err());
        assert!(a.exists());
        assert!(b.exists());
        assert!(!same.exists());
    }

    #[test]
    fn journal_round_trip_restores_in_reverse() {
        let temp = tempdir().expect("tempdir");
        let journal = temp.path().join("state/undo-last.json");
        let a = temp.path().join("a.jpg");
        let b = temp.path().join("2024/01/b.jpg");
        let c = temp.path().join("2024/01/c.jpg");
        fs::write(&a, b"A").expect("write");

        let first = apply_group(&[FileMove::new(&a, &b)]).expect("first");
        let second = apply_group(&[FileMove::new(&b, &c)]).expect("second");
        let moves: Vec<FileMove> = first.into_iter().chain(second).collect();
        write_journal(&journal, Some(temp.path()), &moves).expect("journal");

        let result = undo_journal(&journal).expect("undo");
        assert_eq!(result.restored, 2);
        assert!(a.exists());
        assert!(!c.exists());
        assert!(!journal.exists());
        assert!(undo_journal(&journal).is_err());
    }

    #[test]
    fn undo_skips_missing_and_taken_paths() {
        let temp = tempdir().expect("tempdir");
        let journal = temp.path().join("undo-last.json");
        let gone_from = temp.path().join("gone_from.jpg");
        let gone_to = temp.path().join("gone_to.jpg");
        let taken_from = temp.path().join("taken_from.jpg");
        let taken_to = temp.path().join("taken_to.jpg");
        fs::write(&taken_from, b"new").expect("write");
        fs::write(&taken_to, b"old").expect("write");

        write_journal(
            &journal,
            None,
            &[
                FileMove::new(&gone_from, &gone_to),
                FileMove::new(&taken_from, &taken_to),
            ],
        )
        .expect("journal");
        let result = undo_journal(&journal).expect("undo");
        assert_eq!(result.restored, 0);
        assert_eq!(result.skipped, 2);
        assert_eq!(fs::read(&taken_from).expect("read"), b"new");
    }
}
