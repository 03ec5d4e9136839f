//! Brings media from outside the catalog into it.

use crate::apply::FileMove;
use crate::catalog::{Catalog, EntryState, MediaItem};
use crate::error::{CatalogError, ImportFailure, ItemError, Result};
use crate::matcher::{scan_directory, sidecar_name, ScanOptions};
use crate::namer::{collision_suffix, NameIndex};
use crate::organizer::{naming_tags, OrgReport, Organizer};
use crate::reader::read_item;
use crate::tags::TagSet;
use crate::tool::TagTool;
use blake3::Hasher;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Leave the source files in place.
    pub copy: bool,
    pub scan: ScanOptions,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub dry_run: bool,
    pub imported: usize,
    /// Moves out of the source directory (empty when copying).
    pub moves: Vec<FileMove>,
    pub errors: Vec<ItemError>,
    pub organized: OrgReport,
}

impl ImportReport {
    /// Every move of the run in order, for the undo journal.
    pub fn all_moves(&self) -> Vec<FileMove> {
        self.moves
            .iter()
            .chain(self.organized.moves.iter())
            .cloned()
            .collect()
    }
}

/// Content hashes of media files, computed on first use.
#[derive(Debug, Default)]
struct DuplicateIndex {
    by_size: HashMap<u64, Vec<PathBuf>>,
    hashes: HashMap<PathBuf, blake3::Hash>,
}

impl DuplicateIndex {
    fn insert(&mut self, path: &Path) {
        if let Ok(meta) = fs::metadata(path) {
            self.by_size
                .entry(meta.len())
                .or_default()
                .push(path.to_path_buf());
        }
    }

    fn find(&mut self, path: &Path) -> Result<Option<PathBuf>> {
        let size = fs::metadata(path)
            .map_err(|e| CatalogError::io(path, e))?
            .len();
        let Some(candidates) = self.by_size.get(&size).cloned() else {
            return Ok(None);
        };
        let hash = self.hash(path)?;
        for candidate in candidates {
            if candidate != path && self.hash(&candidate)? == hash {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn hash(&mut self, path: &Path) -> Result<blake3::Hash> {
        if let Some(hash) = self.hashes.get(path) {
            return Ok(*hash);
        }
        let hash = hash_file(path)?;
        self.hashes.insert(path.to_path_buf(), hash);
        Ok(hash)
    }
}

fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let mut file = File::open(path).map_err(|e| CatalogError::io(path, e))?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| CatalogError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize())
}

pub struct Importer<'a> {
    tool: &'a dyn TagTool,
    organizer: &'a Organizer<'a>,
}

impl<'a> Importer<'a> {
    pub fn new(tool: &'a dyn TagTool, organizer: &'a Organizer<'a>) -> Self {
        Self { tool, organizer }
    }

    /// Validates and places every item under `source`, then organizes the
    /// placed entries. Only an unusable source fails the whole call. A
    /// dry-run organizer makes the whole import a dry run.
    pub fn import(
        &self,
        catalog: &mut Catalog,
        source: &Path,
        options: &ImportOptions,
    ) -> Result<ImportReport> {
        let source = fs::canonicalize(source).map_err(|e| CatalogError::io(source, e))?;
        if catalog.contains_path(&source) || catalog.root().starts_with(&source) {
            return Err(CatalogError::import(
                &source,
                ImportFailure::Invalid("cannot import a directory into its own catalog".into()),
            ));
        }

        let dry_run = self.organizer.options().dry_run;
        let scan = scan_directory(&source, &options.scan)?;
        info!(
            "importing {} items from {}{}",
            scan.items.len(),
            source.display(),
            if dry_run { " (dry run)" } else { "" }
        );

        let mut report = ImportReport {
            dry_run,
            ..ImportReport::default()
        };
        for path in scan.leftovers {
            warn!("{}: sidecar without media", path.display());
            report.errors.push(ItemError::new(
                &path,
                CatalogError::import(&path, ImportFailure::LeftoverSidecar),
            ));
        }
        for path in scan.ignored {
            warn!("{}: unsupported format", path.display());
            report.errors.push(ItemError::new(
                &path,
                CatalogError::import(&path, ImportFailure::Unsupported),
            ));
        }

        let mut duplicates = DuplicateIndex::default();
        for entry in catalog.entries() {
            duplicates.insert(&entry.item.path);
        }

        let first_new = catalog.len();
        for item in scan.items {
            let path = item.path.clone();
            match self.import_item(catalog, item, &mut duplicates, options) {
                Ok(moves) => {
                    report.imported += 1;
                    report.moves.extend(moves);
                }
                Err(error) => {
                    warn!("{error}");
                    report.errors.push(ItemError::new(path, error));
                }
            }
        }

        let root = catalog.root().to_path_buf();
        let (existing, placed) = catalog.entries_mut().split_at_mut(first_new);
        report.organized = self.organizer.organize_entries(&root, existing, placed);
        info!(
            "imported {} items, {} errors",
            report.imported,
            report.errors.len() + report.organized.errors.len()
        );
        Ok(report)
    }

    fn import_item(
        &self,
        catalog: &mut Catalog,
        mut item: MediaItem,
        duplicates: &mut DuplicateIndex,
        options: &ImportOptions,
    ) -> Result<Vec<FileMove>> {
        if !options.scan.is_media(&item.path) {
            return Err(CatalogError::import(&item.path, ImportFailure::Unsupported));
        }
        if let Some(original) = duplicates.find(&item.path)? {
            return Err(CatalogError::import(
                &item.path,
                ImportFailure::Duplicate(original),
            ));
        }

        let snapshots = read_item(self.tool, &item)?;
        let tags = naming_tags(TagSet::new(), &snapshots);
        if tags.capture_time().is_none() {
            return Err(CatalogError::import(
                &item.path,
                ImportFailure::MissingCaptureTime,
            ));
        }

        if self.organizer.options().dry_run {
            duplicates.insert(&item.path);
            catalog.add(item, EntryState::Imported);
            return Ok(Vec::new());
        }

        let id = catalog.len();
        let targets = reserve_placement(self.organizer.index(), catalog.root(), id, &item)?;
        let moves: Vec<FileMove> = item
            .files()
            .zip(&targets)
            .map(|(from, to)| FileMove::new(from, to))
            .collect();
        transfer_group(&moves, options.copy)?;
        debug!(
            "placed {} in {}",
            item.path.display(),
            catalog.root().display()
        );

        let mut targets = targets.into_iter();
        if let Some(media) = targets.next() {
            item.path = media;
        }
        for (sidecar, path) in item.sidecars.iter_mut().zip(targets) {
            sidecar.path = path;
        }
        duplicates.insert(&item.path);
        catalog.add(item, EntryState::Imported);

        Ok(if options.copy { Vec::new() } else { moves })
    }
}

/// Free names for `item` directly under `root`, keeping its file names.
fn reserve_placement(
    index: &NameIndex,
    root: &Path,
    id: usize,
    item: &MediaItem,
) -> Result<Vec<PathBuf>> {
    let stem = item.file_stem().to_string();
    let ext = item
        .path
        .extension()
        .map(|v| format!(".{}", v.to_string_lossy()))
        .unwrap_or_default();
    index
        .reserve_first(id, |attempt| {
            let media_name = format!("{stem}{}{ext}", collision_suffix(attempt));
            std::iter::once(root.join(&media_name))
                .chain(
                    item.sidecars
                        .iter()
                        .map(|s| root.join(sidecar_name(&media_name, s.style))),
                )
                .collect()
        })
        .ok_or_else(|| {
            CatalogError::import(
                &item.path,
                ImportFailure::Invalid("no free name in the catalog root".into()),
            )
        })
}

/// Moves (or copies) a group across directories, falling back to copy and
/// remove when a rename is not possible. Undone as a unit on failure.
fn transfer_group(moves: &[FileMove], copy: bool) -> Result<()> {
    let mut done: Vec<&FileMove> = Vec::with_capacity(moves.len());
    for m in moves {
        if let Err(source) = transfer(&m.from, &m.to, copy) {
            for undone in done.iter().rev() {
                let result = if copy {
                    fs::remove_file(&undone.to)
                } else {
                    transfer(&undone.to, &undone.from, false)
                };
                if let Err(err) = result {
                    warn!("cannot roll back {}: {err}", undone.to.display());
                }
            }
            return Err(CatalogError::Rename {
                from: m.from.clone(),
                to: m.to.clone(),
                source,
            });
        }
        done.push(m);
    }
    Ok(())
}

fn transfer(from: &Path, to: &Path, copy: bool) -> io::Result<()> {
    if to.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "target already exists",
        ));
    }
    if copy {
        return fs::copy(from, to).map(|_| ());
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    if let Err(err) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(err);
    }
    Ok(())
}
