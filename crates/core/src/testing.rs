//! In-process stand-in for exiftool. Tags live as a JSON object inside the
//! files themselves, so moving a file moves its metadata too.

use crate::error::{CatalogError, Result};
use crate::reader::tags_from_json;
use crate::tags::TagSet;
use crate::tool::TagTool;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

#[derive(Default)]
pub struct FakeTool {
    writes: AtomicUsize,
    created: AtomicUsize,
    written: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl FakeTool {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Tag names written per file, in call order.
    pub fn written(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    fn record(&self, path: &Path, names: Vec<String>) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut written) = self.written.lock() {
            written.push((path.to_path_buf(), names));
        }
    }

    pub fn reset(&self) {
        self.writes.store(0, Ordering::SeqCst);
        self.created.store(0, Ordering::SeqCst);
        if let Ok(mut written) = self.written.lock() {
            written.clear();
        }
    }
}

/// MWG composite families, authoritative location first.
const MWG_FAMILIES: &[&[&str]] = &[
    &["Artist", "By-line", "Creator"],
    &["Copyright", "CopyrightNotice", "Rights"],
    &["ImageDescription", "Caption-Abstract", "Description"],
];

fn load(path: &Path) -> Result<Map<String, Value>> {
    let raw = fs::read(path).map_err(|e| CatalogError::read(path, e.to_string()))?;
    if raw.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(CatalogError::read(path, "file format error")),
    }
}

impl TagTool for FakeTool {
    fn read_tags(&self, path: &Path) -> Result<TagSet> {
        Ok(tags_from_json(&load(path)?))
    }

    fn write_tags(&self, path: &Path, tags: &TagSet) -> Result<()> {
        let mut object = load(path)?;
        for (name, value) in tags {
            object.insert(name.clone(), value.to_json());
        }
        let raw = serde_json::to_vec(&Value::Object(object))
            .map_err(|e| CatalogError::ExternalTool(e.to_string()))?;
        fs::write(path, raw).map_err(|e| CatalogError::io(path, e))?;

        self.record(path, tags.names().map(str::to_string).collect());
        Ok(())
    }

    fn create_sidecar(&self, media: &Path, sidecar: &Path) -> Result<()> {
        if sidecar.exists() {
            return Err(CatalogError::io(
                sidecar,
                io::Error::new(io::ErrorKind::AlreadyExists, "sidecar already exists"),
            ));
        }
        let object = load(media)?;
        let raw = serde_json::to_vec(&Value::Object(object))
            .map_err(|e| CatalogError::ExternalTool(e.to_string()))?;
        fs::write(sidecar, raw).map_err(|e| CatalogError::io(sidecar, e))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn align_mwg(&self, path: &Path) -> Result<bool> {
        let mut object = load(path)?;
        let mut changed = Vec::new();
        for family in MWG_FAMILIES {
            let Some(value) = family.iter().find_map(|name| object.get(*name).cloned()) else {
                continue;
            };
            for name in *family {
                if object.get(*name) != Some(&value) {
                    object.insert(name.to_string(), value.clone());
                    changed.push(name.to_string());
                }
            }
        }
        if changed.is_empty() {
            return Ok(false);
        }
        let raw = serde_json::to_vec(&Value::Object(object))
            .map_err(|e| CatalogError::ExternalTool(e.to_string()))?;
        fs::write(path, raw).map_err(|e| CatalogError::io(path, e))?;
        self.record(path, changed);
        Ok(true)
    }

    fn version(&self) -> Result<String> {
        Ok("13.00".to_string())
    }
}

/// Writes a fake media or sidecar file holding string tags.
pub fn write_fake(path: &Path, tags: &[(&str, &str)]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dirs must be creatable");
    }
    let object: Map<String, Value> = tags
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect();
    let raw = serde_json::to_vec(&Value::Object(object)).expect("json");
    fs::write(path, raw).expect("fake file must be writable");
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dirs must be creatable");
    }
    File::create(path).expect("file must be creatable");
}

/// Sets the modification time to `secs` after the epoch.
pub fn set_mtime(path: &Path, secs: u64) {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("file must be openable");
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .expect("mtime must be settable");
}

pub fn read_fake(path: &Path) -> TagSet {
    tags_from_json(&load(path).expect("fake file must parse"))
}
