//! Canonical names from capture time, with collision suffixes that stay
//! stable across runs.

use crate::catalog::{EntryId, MediaItem};
use crate::error::{CatalogError, Result};
use crate::matcher::sidecar_name;
use crate::sanitize::truncate_stem;
use crate::tags::TagSet;
use crate::template::{NamingContext, Template};
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Upper bound on collision suffixes tried for one name.
const MAX_SUFFIXES: usize = 26 * 27;

/// Longest sidecar decoration added to a media name (`_NN` + `.xmp`).
const SIDECAR_RESERVE: usize = 7;

/// Target names of one item, aligned with `MediaItem::sidecars`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemNames {
    pub media: PathBuf,
    pub sidecars: Vec<PathBuf>,
}

impl ItemNames {
    /// The names `item` carries now.
    pub fn current(item: &MediaItem) -> Self {
        Self {
            media: item.path.clone(),
            sidecars: item.sidecars.iter().map(|s| s.path.clone()).collect(),
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.media.as_path()).chain(self.sidecars.iter().map(PathBuf::as_path))
    }
}

/// Directory and base name a naming unit is placed under. A unit is one
/// item, or a Live Photo image followed by its video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePlan {
    pub dir: PathBuf,
    pub base: String,
    pub stem: String,
}

#[derive(Debug, Default)]
struct Reservations {
    by_path: HashMap<PathBuf, EntryId>,
    by_entry: HashMap<EntryId, Vec<PathBuf>>,
    /// Current paths of entries that are about to move away.
    vacating: HashSet<PathBuf>,
}

impl Reservations {
    fn release(&mut self, id: EntryId) {
        if let Some(previous) = self.by_entry.remove(&id) {
            for path in previous {
                if self.by_path.get(&path) == Some(&id) {
                    self.by_path.remove(&path);
                }
            }
        }
    }

    fn claim(&mut self, id: EntryId, paths: Vec<PathBuf>) {
        self.release(id);
        for path in &paths {
            self.vacating.remove(path);
            self.by_path.insert(path.clone(), id);
        }
        self.by_entry.insert(id, paths);
    }
}

/// Names handed out during one run, shared by every worker.
#[derive(Debug, Default)]
pub struct NameIndex {
    inner: Mutex<Reservations>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the first candidate group whose paths are all available to
    /// `id`. A path is available when `id` already holds it, or when no
    /// entry holds it and it is either absent on disk or being vacated.
    pub fn reserve_first<F>(&self, id: EntryId, mut candidate: F) -> Option<Vec<PathBuf>>
    where
        F: FnMut(usize) -> Vec<PathBuf>,
    {
        let mut inner = self.lock();
        for attempt in 0..MAX_SUFFIXES {
            let paths = candidate(attempt);
            let distinct = paths.iter().collect::<HashSet<_>>().len() == paths.len();
            let free = distinct
                && paths.iter().all(|path| match inner.by_path.get(path) {
                    Some(holder) => *holder == id,
                    None => inner.vacating.contains(path) || !path.exists(),
                });
            if free {
                inner.claim(id, paths.clone());
                return Some(paths);
            }
        }
        None
    }

    /// Keeps `paths` for `id`, replacing whatever it reserved before.
    pub fn hold(&self, id: EntryId, paths: Vec<PathBuf>) {
        self.lock().claim(id, paths);
    }

    /// Drops the reservations of `id` and offers its current `paths` to
    /// every entry reserving after this call.
    pub fn vacate(&self, id: EntryId, paths: Vec<PathBuf>) {
        let mut inner = self.lock();
        inner.release(id);
        inner.vacating.extend(paths);
    }

    /// Forgets vacated paths once their moves were applied or abandoned.
    pub fn settle(&self) {
        self.lock().vacating.clear();
    }

    pub fn holder(&self, path: &Path) -> Option<EntryId> {
        self.lock().by_path.get(path).copied()
    }

    fn lock(&self) -> MutexGuard<'_, Reservations> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `""`, `"_b"`, .., `"_z"`, `"_ba"`, `"_bb"`, ..
pub fn collision_suffix(attempt: usize) -> String {
    if attempt == 0 {
        return String::new();
    }
    let mut n = attempt;
    let mut letters = Vec::new();
    while n > 0 {
        letters.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    letters.reverse();
    format!("_{}", String::from_utf8_lossy(&letters))
}

/// Inverse of [`collision_suffix`] for suffixes it can produce.
fn decode_suffix(suffix: &str) -> Option<usize> {
    if suffix.is_empty() {
        return Some(0);
    }
    let mut attempt = 0usize;
    for b in suffix.strip_prefix('_')?.bytes() {
        if !b.is_ascii_lowercase() {
            return None;
        }
        attempt = attempt.checked_mul(26)?.checked_add(usize::from(b - b'a'))?;
    }
    (attempt < MAX_SUFFIXES && collision_suffix(attempt) == suffix).then_some(attempt)
}

fn lead_path(unit: &[&MediaItem]) -> PathBuf {
    unit.first().map(|item| item.path.clone()).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Namer {
    template: Template,
    utc: bool,
    aliases: BTreeMap<String, String>,
}

impl Namer {
    pub fn new(template: Template, utc: bool, aliases: BTreeMap<String, String>) -> Self {
        Self {
            template,
            utc,
            aliases,
        }
    }

    /// Lower-cased extension with aliases applied (`JPEG` → `jpg`).
    pub fn extension(&self, path: &Path) -> String {
        let ext = path
            .extension()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        self.aliases.get(&ext).cloned().unwrap_or(ext)
    }

    /// Rendered relative stem, before collision handling.
    pub fn stem(&self, item: &MediaItem, tags: &TagSet) -> Result<String> {
        let stamp = tags.capture_time().ok_or_else(|| CatalogError::Naming {
            path: item.path.clone(),
            reason: "no DateTimeOriginal or CreateDate".to_string(),
        })?;
        let ctx = NamingContext {
            time: stamp.naming_time(self.utc),
            subsec_digits: stamp.subsec_digits(),
            make: tags.text("Make"),
            model: tags.text("Model"),
            orig_name: item.file_stem(),
        };
        Ok(self.template.render(&ctx))
    }

    /// Where `unit` belongs, named after its first item.
    pub fn plan(&self, root: &Path, unit: &[&MediaItem], tags: &TagSet) -> Result<NamePlan> {
        let lead = unit.first().ok_or_else(|| CatalogError::Naming {
            path: root.to_path_buf(),
            reason: "empty naming unit".to_string(),
        })?;
        let stem = self.stem(lead, tags)?;
        let ext_len = unit
            .iter()
            .map(|item| self.extension(&item.path).len())
            .max()
            .unwrap_or_default();

        let (dir, base) = match stem.rsplit_once('/') {
            Some((dir, base)) => (root.join(dir), base.to_string()),
            None => (root.to_path_buf(), stem.clone()),
        };
        let base = truncate_stem(&base, ext_len + 1 + SIDECAR_RESERVE + 4);
        Ok(NamePlan { dir, base, stem })
    }

    /// Every target path of `unit` for one collision attempt, in the order
    /// of `MediaItem::files`.
    pub fn candidate(&self, plan: &NamePlan, attempt: usize, unit: &[&MediaItem]) -> Vec<PathBuf> {
        let suffix = collision_suffix(attempt);
        let mut paths = Vec::new();
        for item in unit {
            let media_name = format!("{}{suffix}.{}", plan.base, self.extension(&item.path));
            paths.push(plan.dir.join(&media_name));
            paths.extend(
                item.sidecars
                    .iter()
                    .map(|s| plan.dir.join(sidecar_name(&media_name, s.style))),
            );
        }
        paths
    }

    /// The attempt whose candidate equals the current files of `unit`, if
    /// the unit already carries a name of its plan.
    pub fn current_attempt(&self, plan: &NamePlan, unit: &[&MediaItem]) -> Option<usize> {
        let lead = unit.first()?;
        if lead.path.parent()? != plan.dir.as_path() {
            return None;
        }
        let ext = self.extension(&lead.path);
        let suffix = lead
            .path
            .file_name()?
            .to_str()?
            .strip_prefix(plan.base.as_str())?
            .strip_suffix(ext.as_str())?
            .strip_suffix('.')?;
        let attempt = decode_suffix(suffix)?;

        let current = unit.iter().flat_map(|item| item.files());
        let candidate = self.candidate(plan, attempt, unit);
        candidate
            .iter()
            .map(PathBuf::as_path)
            .eq(current)
            .then_some(attempt)
    }

    /// Reserves the first free candidate of `plan` for `unit`, returning the
    /// names of each item in unit order.
    pub fn reserve(
        &self,
        index: &NameIndex,
        id: EntryId,
        plan: &NamePlan,
        unit: &[&MediaItem],
    ) -> Result<Vec<ItemNames>> {
        let paths = index
            .reserve_first(id, |attempt| self.candidate(plan, attempt, unit))
            .ok_or_else(|| CatalogError::Naming {
                path: lead_path(unit),
                reason: format!("no free name for {}", plan.stem),
            })?;

        let mut paths = paths.into_iter();
        let mut names = Vec::with_capacity(unit.len());
        for item in unit {
            let media = paths.next().ok_or_else(|| CatalogError::Naming {
                path: item.path.clone(),
                reason: "empty name group".to_string(),
            })?;
            let sidecars = paths.by_ref().take(item.sidecars.len()).collect();
            debug!("{} -> {}", item.path.display(), media.display());
            names.push(ItemNames { media, sidecars });
        }
        Ok(names)
    }
}
