use crate::catalog::MediaItem;
use crate::error::{CatalogError, Result};
use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::{DirEntry, WalkDir};

/// Directory under the catalog root that receives leftover sidecars.
pub const TRASH_DIR: &str = ".trash";

/// Prefix of the temporary names used while a rename group is staged.
pub(crate) const STAGING_PREFIX: &str = ".imlib-tmp-";

pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &[
    "arw", "cr2", "cr3", "dng", "heic", "jpeg", "jpg", "mov", "mp4", "nef", "orf", "png", "raf",
    "rw2", "tif", "tiff",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SidecarStyle {
    /// `IMG_0001.JPG.xmp`
    Appended,
    /// `IMG_0001.xmp`
    Replaced,
    /// `IMG_0001_01.JPG.xmp`
    Duplicate(u8),
}

impl SidecarStyle {
    fn rank(self) -> (u8, u8) {
        match self {
            SidecarStyle::Appended => (0, 0),
            SidecarStyle::Replaced => (1, 0),
            SidecarStyle::Duplicate(n) => (2, n),
        }
    }

    pub fn is_initial(self) -> bool {
        !matches!(self, SidecarStyle::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sidecar {
    pub path: PathBuf,
    pub style: SidecarStyle,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include_hidden: bool,
    /// Lower-case extensions without the dot.
    pub media_extensions: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl ScanOptions {
    pub fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|v| v.to_str())
            .map(|ext| {
                self.media_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub items: Vec<MediaItem>,
    /// Sidecars whose media file does not exist.
    pub leftovers: Vec<PathBuf>,
    /// Files that are neither media nor sidecars.
    pub ignored: Vec<PathBuf>,
}

pub fn is_sidecar_path(path: &Path) -> bool {
    path.extension()
        .and_then(|v| v.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("xmp"))
        .unwrap_or(false)
}

/// File name of the sidecar of `media_name` in the given style.
pub fn sidecar_name(media_name: &str, style: SidecarStyle) -> String {
    let (stem, ext) = match media_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (media_name, None),
    };
    match (style, ext) {
        (SidecarStyle::Appended, _) => format!("{media_name}.xmp"),
        (SidecarStyle::Replaced, _) => format!("{stem}.xmp"),
        (SidecarStyle::Duplicate(n), Some(ext)) => format!("{stem}_{n:02}.{ext}.xmp"),
        (SidecarStyle::Duplicate(n), None) => format!("{stem}_{n:02}.xmp"),
    }
}

/// Walks `root` and groups every media file with its sidecars. The trash
/// directory and staging leftovers are never entered.
pub fn scan_directory(root: &Path, options: &ScanOptions) -> Result<ScanResult> {
    if !root.is_dir() {
        return Err(CatalogError::io(
            root,
            io::Error::new(io::ErrorKind::NotFound, "not a directory"),
        ));
    }

    let mut files_by_dir = BTreeMap::<PathBuf, Vec<PathBuf>>::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry, options));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        let dir = path.parent().map(PathBuf::from).unwrap_or_default();
        files_by_dir.entry(dir).or_default().push(path);
    }

    let mut result = ScanResult::default();
    for files in files_by_dir.into_values() {
        group_directory(files, options, &mut result);
    }
    debug!(
        "{}: {} items, {} leftover sidecars, {} ignored files",
        root.display(),
        result.items.len(),
        result.leftovers.len(),
        result.ignored.len()
    );
    Ok(result)
}

fn is_skipped(entry: &DirEntry, options: &ScanOptions) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() && name == TRASH_DIR {
        return true;
    }
    if name.starts_with(STAGING_PREFIX) {
        return true;
    }
    !options.include_hidden && name.starts_with('.')
}

/// Groups the files of one directory.
fn group_directory(files: Vec<PathBuf>, options: &ScanOptions, result: &mut ScanResult) {
    let mut items = Vec::<MediaItem>::new();
    let mut by_name = HashMap::<String, usize>::new();
    let mut by_stem = HashMap::<String, Vec<usize>>::new();
    let mut sidecars = Vec::new();

    for path in files {
        if is_sidecar_path(&path) {
            sidecars.push(path);
            continue;
        }
        if !options.is_media(&path) {
            result.ignored.push(path);
            continue;
        }
        let index = items.len();
        if let Some(name) = path.file_name().and_then(|v| v.to_str()) {
            by_name.insert(name.to_ascii_lowercase(), index);
        }
        if let Some(stem) = path.file_stem().and_then(|v| v.to_str()) {
            by_stem
                .entry(stem.to_ascii_lowercase())
                .or_default()
                .push(index);
        }
        items.push(MediaItem::new(path));
    }

    for path in sidecars {
        match classify_sidecar(&path, &by_name, &by_stem) {
            Some((index, style)) => items[index].sidecars.push(Sidecar { path, style }),
            None => result.leftovers.push(path),
        }
    }

    for item in &mut items {
        item.sidecars.sort_by(|a, b| {
            a.style
                .rank()
                .cmp(&b.style.rank())
                .then(a.path.cmp(&b.path))
        });
    }
    result.items.extend(items);
}

static DUPLICATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_(\d{2})\.([^.]+)$").unwrap());

/// Exact `Appended` matches win over reading `_NN` as a duplicate number, so
/// `IMG_01.jpg.xmp` next to `IMG_01.jpg` belongs to that file.
fn classify_sidecar(
    path: &Path,
    by_name: &HashMap<String, usize>,
    by_stem: &HashMap<String, Vec<usize>>,
) -> Option<(usize, SidecarStyle)> {
    let name = path.file_name()?.to_str()?;
    let inner = name.get(..name.len().checked_sub(4)?)?;
    let inner_key = inner.to_ascii_lowercase();

    if let Some(&index) = by_name.get(&inner_key) {
        return Some((index, SidecarStyle::Appended));
    }

    if let Some(caps) = DUPLICATE_PATTERN.captures(&inner_key) {
        let base = format!("{}.{}", &caps[1], &caps[3]);
        if let (Some(&index), Ok(n)) = (by_name.get(&base), caps[2].parse::<u8>()) {
            return Some((index, SidecarStyle::Duplicate(n)));
        }
    }

    by_stem
        .get(&inner_key)
        .and_then(|indices| indices.first())
        .map(|&index| (index, SidecarStyle::Replaced))
}
