use crate::error::{CatalogError, Result};
use crate::matcher::{scan_directory, ScanOptions, Sidecar};
use crate::tags::{TagSet, Timestamp};
use log::info;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub type EntryId = usize;

/// A media file and the sidecars that belong to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaItem {
    pub path: PathBuf,
    pub sidecars: Vec<Sidecar>,
    /// Filled in once the item has been synchronized.
    pub captured: Option<Timestamp>,
    pub tags: TagSet,
}

impl MediaItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn initial_sidecar(&self) -> Option<&Sidecar> {
        self.sidecars.iter().find(|s| s.style.is_initial())
    }

    /// Media path followed by every sidecar path.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.path.as_path())
            .chain(self.sidecars.iter().map(|s| s.path.as_path()))
    }

    pub fn file_stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryState {
    Unprocessed,
    Imported,
    Synchronized,
    Renamed,
    Stable,
    /// Moved into the catalog trash as a redundant Live Photo component.
    Trashed,
}

impl EntryState {
    pub fn can_advance_to(self, next: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, next),
            (Unprocessed | Imported, Synchronized | Trashed)
                | (Synchronized, Renamed)
                | (Renamed, Stable)
        )
    }

    /// Stable and trashed entries are never processed again.
    pub fn is_final(self) -> bool {
        matches!(self, EntryState::Stable | EntryState::Trashed)
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: EntryId,
    pub item: MediaItem,
    state: EntryState,
    origin: EntryState,
}

impl CatalogEntry {
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Returns an entry whose processing failed to the state it was added
    /// in, so the next run starts it over.
    pub fn reset(&mut self) {
        self.state = self.origin;
    }

    pub fn advance(&mut self, next: EntryState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(CatalogError::InvalidState {
                path: self.item.path.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Entries of one catalog directory. Entries are added by a scan or by the
/// importer and never removed.
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
    entries: Vec<CatalogEntry>,
    leftovers: Vec<PathBuf>,
}

impl Catalog {
    pub fn empty(root: &Path) -> Result<Self> {
        let root = fs::canonicalize(root).map_err(|e| CatalogError::io(root, e))?;
        Ok(Self {
            root,
            entries: Vec::new(),
            leftovers: Vec::new(),
        })
    }

    /// Scans `root` and creates one `Unprocessed` entry per media item.
    pub fn open(root: &Path, options: &ScanOptions) -> Result<Self> {
        let mut catalog = Self::empty(root)?;
        let scan = scan_directory(&catalog.root, options)?;
        for item in scan.items {
            catalog.add(item, EntryState::Unprocessed);
        }
        catalog.leftovers = scan.leftovers;
        info!(
            "catalog {}: {} items, {} leftover sidecars",
            catalog.root.display(),
            catalog.entries.len(),
            catalog.leftovers.len()
        );
        Ok(catalog)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [CatalogEntry] {
        &mut self.entries
    }

    pub fn leftovers(&self) -> &[PathBuf] {
        &self.leftovers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    /// Adds an entry in its initial state. Only `Unprocessed` and `Imported`
    /// are initial; anything else is recorded as `Unprocessed`.
    pub fn add(&mut self, item: MediaItem, state: EntryState) -> EntryId {
        let state = match state {
            EntryState::Imported => EntryState::Imported,
            _ => EntryState::Unprocessed,
        };
        let id = self.entries.len();
        self.entries.push(CatalogEntry {
            id,
            item,
            state,
            origin: state,
        });
        id
    }

    /// Whether `path` lies inside the catalog root.
    pub fn contains_path(&self, path: &Path) -> bool {
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        path.starts_with(&self.root)
    }
}

/// Media paths currently claimed by a worker.
#[derive(Debug, Default)]
pub struct EntryLocks {
    claimed: Mutex<HashSet<PathBuf>>,
}

impl EntryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` until the returned guard is dropped.
    pub fn claim(&self, path: &Path) -> Result<EntryGuard<'_>> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.to_path_buf()) {
            return Err(CatalogError::Busy {
                path: path.to_path_buf(),
            });
        }
        Ok(EntryGuard {
            locks: self,
            path: path.to_path_buf(),
        })
    }
}

pub struct EntryGuard<'a> {
    locks: &'a EntryLocks,
    path: PathBuf,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        let mut claimed = self
            .locks
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        claimed.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::touch;
    use tempfile::tempdir;

    fn entry(state: EntryState) -> CatalogEntry {
        CatalogEntry {
            id: 0,
            item: MediaItem::new("/c/a.jpg"),
            state,
            origin: state,
        }
    }

    #[test]
    fn state_machine_only_moves_forward() {
        let mut entry = entry(EntryState::Unprocessed);
        assert!(entry.advance(EntryState::Renamed).is_err());
        entry.advance(EntryState::Synchronized).expect("sync");
        entry.advance(EntryState::Renamed).expect("rename");
        entry.advance(EntryState::Stable).expect("stable");
        let err = entry
            .advance(EntryState::Synchronized)
            .expect_err("stable is final");
        assert!(matches!(err, CatalogError::InvalidState { .. }));
        assert!(entry.state().is_final());
    }

    #[test]
    fn reset_returns_to_the_initial_state() {
        let mut entry = entry(EntryState::Imported);
        entry.advance(EntryState::Synchronized).expect("sync");
        entry.advance(EntryState::Renamed).expect("rename");
        entry.reset();
        assert_eq!(entry.state(), EntryState::Imported);
        entry.advance(EntryState::Synchronized).expect("sync again");
    }

    #[test]
    fn only_unsynchronized_entries_can_be_trashed() {
        let mut entry = entry(EntryState::Unprocessed);
        entry.advance(EntryState::Trashed).expect("trash");
        assert!(entry.state().is_final());

        let mut synced = self::entry(EntryState::Unprocessed);
        synced.advance(EntryState::Synchronized).expect("sync");
        assert!(synced.advance(EntryState::Trashed).is_err());
    }

    #[test]
    fn imported_entries_start_imported() {
        let temp = tempdir().expect("tempdir");
        let mut catalog = Catalog::empty(temp.path()).expect("catalog");
        let id = catalog.add(
            MediaItem::new(temp.path().join("a.jpg")),
            EntryState::Imported,
        );
        let other = catalog.add(
            MediaItem::new(temp.path().join("b.jpg")),
            EntryState::Stable,
        );
        assert_eq!(
            catalog.get(id).map(CatalogEntry::state),
            Some(EntryState::Imported)
        );
        assert_eq!(
            catalog.get(other).map(CatalogEntry::state),
            Some(EntryState::Unprocessed)
        );
    }

    #[test]
    fn open_scans_items_and_leftovers() {
        let temp = tempdir().expect("tempdir");
        touch(&temp.path().join("2024/01/a.jpg"));
        touch(&temp.path().join("2024/01/a.jpg.xmp"));
        touch(&temp.path().join("2024/01/gone.cr3.xmp"));

        let catalog = Catalog::open(temp.path(), &ScanOptions::default()).expect("open");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.entries()[0].item.sidecars.len(), 1);
        assert_eq!(catalog.entries()[0].state(), EntryState::Unprocessed);
        assert_eq!(catalog.leftovers().len(), 1);
        assert!(catalog.contains_path(&temp.path().join("2024")));
        assert!(!catalog.contains_path(temp.path().parent().expect("parent")));
    }

    #[test]
    fn second_claim_is_busy_until_guard_drops() {
        let locks = EntryLocks::new();
        let path = Path::new("/c/a.jpg");
        let guard = locks.claim(path).expect("first claim");
        let err = locks.claim(path).err().expect("second claim must fail");
        assert!(matches!(err, CatalogError::Busy { .. }));
        drop(guard);
        assert!(locks.claim(path).is_ok());
    }
}
