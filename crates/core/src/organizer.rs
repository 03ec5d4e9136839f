//! Brings every entry of a catalog to a synchronized, canonically named
//! state.
//!
//! A run reads and synchronizes entries on the worker pool, then plans the
//! names of all of them before anything moves. Entries whose moves depend
//! on each other (one takes a name another gives up) are applied as one
//! staged group, so a second run over the result finds nothing to do.

use crate::apply::{apply_group, FileMove};
use crate::catalog::{Catalog, CatalogEntry, EntryGuard, EntryLocks, EntryState, MediaItem};
use crate::cleanup::trash_path;
use crate::error::{CatalogError, ItemError, Result};
use crate::live::{LiveKind, LiveLinker};
use crate::matcher::{sidecar_name, Sidecar, SidecarStyle, TRASH_DIR};
use crate::namer::{ItemNames, NameIndex, NamePlan, Namer};
use crate::reader::{read_item, read_snapshot, SourceRole, TagSnapshot};
use crate::sync::{apply_writes, plan_writes, synchronize, PlannedWrite, SyncPolicy};
use crate::tags::TagSet;
use crate::tool::TagTool;
use crate::updates::apply_updates;
use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct OrganizeOptions {
    pub policy: SyncPolicy,
    pub create_sidecars: bool,
    /// Link Live Photo stills and clips, drop redundant copies and name
    /// each clip after its still.
    pub live_photos: bool,
    pub dry_run: bool,
    pub workers: usize,
}

impl Default for OrganizeOptions {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::default(),
            create_sidecars: true,
            live_photos: true,
            dry_run: false,
            workers: 1,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct OrgReport {
    pub dry_run: bool,
    pub processed: usize,
    /// Files whose tags were (or would be) written.
    pub writes: usize,
    pub sidecars_created: usize,
    /// Entries that were (or would be) moved to a new name.
    pub renamed: usize,
    pub stable: usize,
    /// Redundant Live Photo components moved to the trash.
    pub trashed: usize,
    pub moves: Vec<FileMove>,
    pub errors: Vec<ItemError>,
}

impl OrgReport {
    pub fn merge(&mut self, other: OrgReport) {
        self.processed += other.processed;
        self.writes += other.writes;
        self.sidecars_created += other.sidecars_created;
        self.renamed += other.renamed;
        self.stable += other.stable;
        self.trashed += other.trashed;
        self.moves.extend(other.moves);
        self.errors.extend(other.errors);
    }
}

/// A claimed entry and what the current run found out about it.
struct Slot<'s> {
    entry: &'s mut CatalogEntry,
    _guard: EntryGuard<'s>,
    snapshots: Vec<TagSnapshot>,
    canonical: TagSet,
    writes: usize,
    created: usize,
    trashed: bool,
    names: Option<ItemNames>,
    moves: Vec<FileMove>,
    error: Option<CatalogError>,
}

impl<'s> Slot<'s> {
    fn new(entry: &'s mut CatalogEntry, guard: EntryGuard<'s>) -> Self {
        Self {
            entry,
            _guard: guard,
            snapshots: Vec::new(),
            canonical: TagSet::new(),
            writes: 0,
            created: 0,
            trashed: false,
            names: None,
            moves: Vec::new(),
            error: None,
        }
    }

    fn active(&self) -> bool {
        self.error.is_none() && !self.trashed
    }

    fn path(&self) -> &Path {
        &self.entry.item.path
    }

    fn media(&self) -> Option<&TagSnapshot> {
        self.snapshots.iter().find(|s| s.role == SourceRole::Media)
    }

    /// Keeps the first error only.
    fn fail(&mut self, error: CatalogError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn step(&mut self, step: impl FnOnce(&mut Self) -> Result<()>) {
        if !self.active() {
            return;
        }
        if let Err(error) = step(self) {
            self.fail(error);
        }
    }

    fn rename(&mut self, names: ItemNames) -> Result<()> {
        self.moves = self
            .entry
            .item
            .files()
            .zip(names.files())
            .map(|(from, to)| FileMove::new(from, to))
            .filter(|m| !m.is_noop())
            .collect();
        self.names = Some(names);
        self.entry.advance(EntryState::Renamed)
    }

    /// Points the entry at the names its moves gave it.
    fn adopt_names(&mut self) {
        let Some(names) = self.names.take() else {
            return;
        };
        let item = &mut self.entry.item;
        item.path = names.media;
        for (sidecar, path) in item.sidecars.iter_mut().zip(names.sidecars) {
            sidecar.path = path;
        }
    }
}

/// Slots named together: a single entry, or a Live Photo still followed by
/// its clip.
type Unit = Vec<usize>;

fn named_after(path: &Path, lead: &Path) -> CatalogError {
    CatalogError::Naming {
        path: path.to_path_buf(),
        reason: format!("named after {}", lead.display()),
    }
}

fn fail_unit(slots: &mut [Slot<'_>], unit: &[usize], error: CatalogError) {
    let lead = slots[unit[0]].path().to_path_buf();
    for &i in &unit[1..] {
        let error = named_after(slots[i].path(), &lead);
        slots[i].fail(error);
    }
    slots[unit[0]].fail(error);
}

fn unit_items<'a>(slots: &'a [Slot<'_>], unit: &[usize]) -> Vec<&'a MediaItem> {
    unit.iter().map(|&i| &slots[i].entry.item).collect()
}

/// Trash location of `path`. Files outside `root` (sources of a dry-run
/// import) land at the top of the trash.
fn trash_target(root: &Path, path: &Path) -> Result<PathBuf> {
    if path.starts_with(root) {
        return trash_path(root, path);
    }
    let name = path.file_name().ok_or_else(|| {
        CatalogError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "no file name"),
        )
    })?;
    Ok(root.join(TRASH_DIR).join(name))
}

/// Index of the component `i` belongs to.
fn find(parents: &mut [usize], mut i: usize) -> usize {
    while parents[i] != i {
        parents[i] = parents[parents[i]];
        i = parents[i];
    }
    i
}

pub struct Organizer<'a> {
    tool: &'a dyn TagTool,
    namer: &'a Namer,
    index: &'a NameIndex,
    locks: EntryLocks,
    pool: Option<ThreadPool>,
    options: OrganizeOptions,
}

impl<'a> Organizer<'a> {
    pub fn new(
        tool: &'a dyn TagTool,
        namer: &'a Namer,
        index: &'a NameIndex,
        options: OrganizeOptions,
    ) -> Self {
        let pool = match ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!("cannot build worker pool ({err}); using the global pool");
                None
            }
        };
        Self {
            tool,
            namer,
            index,
            locks: EntryLocks::new(),
            pool,
            options,
        }
    }

    pub fn namer(&self) -> &Namer {
        self.namer
    }

    pub fn index(&self) -> &NameIndex {
        self.index
    }

    pub fn options(&self) -> &OrganizeOptions {
        &self.options
    }

    fn install<R: Send>(&self, job: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(job),
            None => job(),
        }
    }

    pub fn organize(&self, catalog: &mut Catalog) -> OrgReport {
        let root = catalog.root().to_path_buf();
        info!(
            "organizing {} entries in {}{}",
            catalog.len(),
            root.display(),
            if self.options.dry_run { " (dry run)" } else { "" }
        );
        self.organize_entries(&root, &[], catalog.entries_mut())
    }

    /// Processes `entries`. `known` are other entries of the same catalog
    /// that this run leaves alone. One entry's failure is recorded, returns
    /// the entry to its initial state and never stops the others.
    pub fn organize_entries(
        &self,
        root: &Path,
        known: &[CatalogEntry],
        entries: &mut [CatalogEntry],
    ) -> OrgReport {
        let mut report = OrgReport {
            dry_run: self.options.dry_run,
            ..OrgReport::default()
        };

        let mut settled: Vec<&CatalogEntry> = Vec::new();
        let mut slots: Vec<Slot<'_>> = Vec::new();
        for entry in entries.iter_mut() {
            match entry.state() {
                EntryState::Trashed => {}
                EntryState::Stable => {
                    report.stable += 1;
                    settled.push(entry);
                }
                _ => match self.locks.claim(&entry.item.path) {
                    Ok(guard) => slots.push(Slot::new(entry, guard)),
                    Err(error) => {
                        warn!("{error}");
                        report.errors.push(ItemError::new(&entry.item.path, error));
                    }
                },
            }
        }

        self.install(|| {
            slots.par_iter_mut().for_each(|slot| {
                slot.step(|s| {
                    s.snapshots = read_item(self.tool, &s.entry.item)?;
                    Ok(())
                })
            })
        });

        let pairs = if self.options.live_photos {
            let settled = known
                .iter()
                .filter(|entry| entry.state() != EntryState::Trashed)
                .chain(settled.iter().copied());
            self.link_live_photos(root, settled, &mut slots, &mut report)
        } else {
            Vec::new()
        };

        self.install(|| {
            slots
                .par_iter_mut()
                .for_each(|slot| slot.step(|s| self.synchronize(s)))
        });
        for &(image, video) in &pairs {
            if slots[image].active() {
                let canonical = slots[image].canonical.clone();
                slots[video].step(|s| self.follow_image(s, canonical));
            }
        }

        let units = self.name_units(root, &pairs, &mut slots);
        report.moves.extend(self.apply_units(&units, &mut slots));

        for slot in slots {
            let id = slot.entry.id;
            match slot.error {
                Some(error) => {
                    warn!("{error}");
                    slot.entry.reset();
                    self.index.vacate(id, Vec::new());
                    report.errors.push(ItemError::new(&slot.entry.item.path, error));
                }
                None if slot.trashed => {}
                None => {
                    report.processed += 1;
                    report.writes += slot.writes;
                    report.sidecars_created += slot.created;
                    if slot.moves.is_empty() {
                        report.stable += 1;
                    } else {
                        report.renamed += 1;
                    }
                }
            }
        }
        self.index.settle();

        info!(
            "{} processed, {} writes, {} sidecars created, {} renamed, {} trashed, {} errors",
            report.processed,
            report.writes,
            report.sidecars_created,
            report.renamed,
            report.trashed,
            report.errors.len()
        );
        report
    }

    /// Groups Live Photo components by content identifier, trashes the
    /// redundant ones and returns the `(image, video)` slot pairs.
    fn link_live_photos<'e>(
        &self,
        root: &Path,
        settled: impl Iterator<Item = &'e CatalogEntry>,
        slots: &mut [Slot<'_>],
        report: &mut OrgReport,
    ) -> Vec<(usize, usize)> {
        let mut linker = LiveLinker::new();
        let mut images_known = true;
        for entry in settled {
            let image = LiveKind::of(&entry.item.path) == Some(LiveKind::Image);
            if image && entry.item.tags.is_empty() {
                images_known = false;
            }
            linker.note_settled(&entry.item.path, &entry.item.tags);
        }
        for (i, slot) in slots.iter().enumerate() {
            match slot.media() {
                Some(media) if slot.active() => {
                    linker.insert(i, media);
                }
                _ => {
                    if LiveKind::of(slot.path()) == Some(LiveKind::Image) {
                        images_known = false;
                    }
                }
            }
        }

        let mut redundant = Vec::new();
        if images_known {
            redundant.extend(linker.remove_leftover_videos());
        } else {
            debug!("not every image of the catalog was read; keeping unpaired videos");
        }
        redundant.extend(linker.remove_duplicates());
        for i in redundant {
            self.trash(root, &mut slots[i], report);
        }
        linker.pairs()
    }

    fn trash(&self, root: &Path, slot: &mut Slot<'_>, report: &mut OrgReport) {
        let files: Vec<PathBuf> = slot.entry.item.files().map(Path::to_path_buf).collect();
        let result = slot.entry.advance(EntryState::Trashed).and_then(|()| {
            let moves = files
                .iter()
                .map(|f| trash_target(root, f).map(|to| FileMove::new(f, to)))
                .collect::<Result<Vec<_>>>()?;
            if self.options.dry_run {
                Ok(moves)
            } else {
                apply_group(&moves)
            }
        });
        match result {
            Ok(moves) => {
                info!("{}: redundant Live Photo component trashed", slot.path().display());
                self.index.vacate(slot.entry.id, files);
                slot.trashed = true;
                report.trashed += 1;
                report.moves.extend(moves);
            }
            Err(error) => slot.fail(error),
        }
    }

    /// Runs the update passes and synchronizes the files of one item.
    fn synchronize(&self, slot: &mut Slot<'_>) -> Result<()> {
        let dry_run = self.options.dry_run;
        let policy = &self.options.policy;

        if self.options.create_sidecars && slot.entry.item.initial_sidecar().is_none() {
            let item = &mut slot.entry.item;
            let media_name = item
                .path
                .file_name()
                .map(|v| v.to_string_lossy().to_string())
                .unwrap_or_default();
            let sidecar = item
                .path
                .with_file_name(sidecar_name(&media_name, SidecarStyle::Appended));
            if !dry_run {
                self.tool.create_sidecar(&item.path, &sidecar)?;
                item.sidecars.insert(
                    0,
                    Sidecar {
                        path: sidecar.clone(),
                        style: SidecarStyle::Appended,
                    },
                );
                let snapshot = read_snapshot(self.tool, &sidecar, SourceRole::Sidecar)?;
                slot.snapshots.insert(1, snapshot);
            }
            debug!("{}: created initial sidecar", item.path.display());
            slot.created = 1;
        }

        slot.writes += apply_updates(self.tool, &mut slot.snapshots, policy, dry_run)?;
        let sync = synchronize(&slot.snapshots, policy)?;
        slot.writes += self.write(&sync.plan)?;

        let tags = naming_tags(sync.canonical.clone(), &slot.snapshots);
        slot.canonical = sync.canonical;
        slot.entry.item.captured = tags.capture_time().copied();
        slot.entry.item.tags = tags;
        slot.entry.advance(EntryState::Synchronized)
    }

    /// Brings the target files of a Live Photo video in line with the
    /// canonical tags of its image.
    fn follow_image(&self, video: &mut Slot<'_>, canonical: TagSet) -> Result<()> {
        let policy = &self.options.policy;
        let targets = video.snapshots.iter().filter(|s| policy.is_target(s.role));
        let plan = plan_writes(targets, &canonical);
        video.writes += self.write(&plan)?;

        let tags = naming_tags(canonical, &video.snapshots);
        video.entry.item.captured = tags.capture_time().copied();
        video.entry.item.tags = tags;
        Ok(())
    }

    fn write(&self, plan: &[PlannedWrite]) -> Result<usize> {
        if self.options.dry_run {
            Ok(plan.len())
        } else {
            apply_writes(self.tool, plan)
        }
    }

    /// Plans a name for every unit. Units already carrying a name of their
    /// plan keep it; the others give their paths up before any unit
    /// reserves, so names can pass between entries of one run.
    fn name_units(
        &self,
        root: &Path,
        pairs: &[(usize, usize)],
        slots: &mut [Slot<'_>],
    ) -> Vec<Unit> {
        let mut paired = vec![false; slots.len()];
        let mut units: Vec<Unit> = Vec::new();
        for &(image, video) in pairs {
            paired[image] = true;
            paired[video] = true;
            match (slots[image].active(), slots[video].active()) {
                (true, true) => units.push(vec![image, video]),
                (true, false) => units.push(vec![image]),
                (false, true) => {
                    let error = named_after(slots[video].path(), slots[image].path());
                    slots[video].fail(error);
                }
                (false, false) => {}
            }
        }
        units.extend(
            (0..slots.len())
                .filter(|&i| !paired[i] && slots[i].active())
                .map(|i| vec![i]),
        );
        units.sort_by_key(|unit| unit[0]);

        let mut kept = Vec::new();
        let mut moving: Vec<(usize, NamePlan)> = Vec::new();
        let mut failed = Vec::new();
        for (u, unit) in units.iter().enumerate() {
            let items = unit_items(slots, unit);
            let lead = &slots[unit[0]].entry;
            for &i in &unit[1..] {
                self.index.vacate(slots[i].entry.id, Vec::new());
            }
            let current: Vec<PathBuf> = items
                .iter()
                .flat_map(|item| item.files())
                .map(Path::to_path_buf)
                .collect();
            match self.namer.plan(root, &items, &lead.item.tags) {
                Ok(plan) if self.namer.current_attempt(&plan, &items).is_some() => {
                    self.index.hold(lead.id, current);
                    kept.push(u);
                }
                Ok(plan) => {
                    self.index.vacate(lead.id, current);
                    moving.push((u, plan));
                }
                Err(error) => failed.push((u, error)),
            }
        }

        for (u, error) in failed {
            fail_unit(slots, &units[u], error);
        }
        for u in kept {
            for &i in &units[u] {
                let names = ItemNames::current(&slots[i].entry.item);
                slots[i].step(|s| s.rename(names));
            }
        }
        for (u, plan) in moving {
            let unit = &units[u];
            let id = slots[unit[0]].entry.id;
            let reserved = self
                .namer
                .reserve(self.index, id, &plan, &unit_items(slots, unit));
            match reserved {
                Ok(names) => {
                    for (&i, names) in unit.iter().zip(names) {
                        slots[i].step(|s| s.rename(names));
                    }
                }
                Err(error) => fail_unit(slots, unit, error),
            }
        }
        units
    }

    /// Applies the planned moves. Units whose targets are current paths of
    /// other units move together in one staged group; independent groups
    /// run on the worker pool. Returns the moves in the order performed.
    fn apply_units(&self, units: &[Unit], slots: &mut [Slot<'_>]) -> Vec<FileMove> {
        let units: Vec<&Unit> = units
            .iter()
            .filter(|unit| {
                if unit.iter().all(|&i| slots[i].active()) {
                    return true;
                }
                let lead = slots[unit[0]].path().to_path_buf();
                for &i in unit.iter() {
                    let error = named_after(slots[i].path(), &lead);
                    slots[i].fail(error);
                }
                false
            })
            .collect();

        let mut owners: HashMap<&Path, usize> = HashMap::new();
        for (u, unit) in units.iter().enumerate() {
            for &i in unit.iter() {
                for path in slots[i].entry.item.files() {
                    owners.insert(path, u);
                }
            }
        }
        let mut parents: Vec<usize> = (0..units.len()).collect();
        for (u, unit) in units.iter().enumerate() {
            for &i in unit.iter() {
                for m in &slots[i].moves {
                    if let Some(&v) = owners.get(m.to.as_path()) {
                        let (a, b) = (find(&mut parents, u), find(&mut parents, v));
                        parents[a] = b;
                    }
                }
            }
        }
        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (u, unit) in units.iter().enumerate() {
            let root = find(&mut parents, u);
            components.entry(root).or_default().extend(unit.iter().copied());
        }

        let mut taken: Vec<Option<&mut Slot<'_>>> = slots.iter_mut().map(Some).collect();
        let groups: Vec<Vec<&mut Slot<'_>>> = components
            .into_values()
            .map(|members| members.into_iter().filter_map(|i| taken[i].take()).collect())
            .collect();

        let performed: Vec<Vec<FileMove>> = self.install(|| {
            groups
                .into_par_iter()
                .map(|mut group| self.apply_component(&mut group))
                .collect()
        });
        performed.into_iter().flatten().collect()
    }

    fn apply_component(&self, group: &mut [&mut Slot<'_>]) -> Vec<FileMove> {
        let moves: Vec<FileMove> = group
            .iter()
            .flat_map(|slot| slot.moves.iter().cloned())
            .collect();
        let result = if self.options.dry_run {
            Ok(moves)
        } else {
            apply_group(&moves)
        };

        match result {
            Ok(performed) => {
                for slot in group.iter_mut() {
                    if !self.options.dry_run {
                        slot.adopt_names();
                    }
                    slot.step(|s| s.entry.advance(EntryState::Stable));
                }
                performed
            }
            Err(error) => {
                let culprit = match &error {
                    CatalogError::Rename { from, .. } => group
                        .iter()
                        .position(|slot| slot.moves.iter().any(|m| m.from == *from))
                        .unwrap_or_default(),
                    _ => 0,
                };
                let message = format!("group move failed: {error}");
                for (n, slot) in group.iter_mut().enumerate() {
                    if n == culprit {
                        continue;
                    }
                    let (from, to) = slot
                        .moves
                        .first()
                        .map(|m| (m.from.clone(), m.to.clone()))
                        .unwrap_or_else(|| (slot.path().to_path_buf(), slot.path().to_path_buf()));
                    slot.fail(CatalogError::Rename {
                        from,
                        to,
                        source: io::Error::other(message.clone()),
                    });
                }
                if let Some(slot) = group.get_mut(culprit) {
                    slot.fail(error);
                }
                Vec::new()
            }
        }
    }
}

/// Canonical tags completed with every other tag, highest-ranked source
/// first, so naming works even when the policy does not synchronize the
/// capture time.
pub(crate) fn naming_tags(canonical: TagSet, snapshots: &[TagSnapshot]) -> TagSet {
    let mut ranked: Vec<&TagSnapshot> = snapshots.iter().collect();
    ranked.sort_by(|a, b| (b.modified, b.role).cmp(&(a.modified, a.role)));
    let mut tags = canonical;
    for snapshot in ranked {
        tags.merge_missing_from(&snapshot.tags);
    }
    tags
}
