use crate::catalog::MediaItem;
use crate::error::{CatalogError, Result};
use crate::matcher::SidecarStyle;
use crate::tags::{parse_offset, TagSet, TagValue, Timestamp};
use crate::tool::TagTool;
use log::trace;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Where a snapshot came from. Ordered by precedence on equal modification
/// times: a sidecar beats the media file, which beats a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SourceRole {
    Duplicate,
    Media,
    Sidecar,
}

#[derive(Debug, Clone)]
pub struct TagSnapshot {
    pub path: PathBuf,
    pub role: SourceRole,
    pub modified: SystemTime,
    pub tags: TagSet,
}

/// Tags that describe the file on disk or the tool itself, not the photo.
const BOOKKEEPING_TAGS: &[&str] = &[
    "SourceFile",
    "ExifToolVersion",
    "Directory",
    "MIMEType",
    "Warning",
    "Error",
];

struct SubSecFamily {
    base: &'static str,
    composite: &'static str,
    fraction: &'static str,
    offset: &'static str,
}

const SUBSEC_FAMILIES: &[SubSecFamily] = &[
    SubSecFamily {
        base: "DateTimeOriginal",
        composite: "SubSecDateTimeOriginal",
        fraction: "SubSecTimeOriginal",
        offset: "OffsetTimeOriginal",
    },
    SubSecFamily {
        base: "CreateDate",
        composite: "SubSecCreateDate",
        fraction: "SubSecTimeDigitized",
        offset: "OffsetTimeDigitized",
    },
    SubSecFamily {
        base: "ModifyDate",
        composite: "SubSecModifyDate",
        fraction: "SubSecTime",
        offset: "OffsetTime",
    },
];

pub fn read_snapshot(tool: &dyn TagTool, path: &Path, role: SourceRole) -> Result<TagSnapshot> {
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| CatalogError::read(path, e.to_string()))?;
    let tags = tool.read_tags(path)?;
    trace!("{}: {} tags ({role:?})", path.display(), tags.len());
    Ok(TagSnapshot {
        path: path.to_path_buf(),
        role,
        modified,
        tags,
    })
}

/// Snapshots of the media file followed by each of its sidecars.
pub fn read_item(tool: &dyn TagTool, item: &MediaItem) -> Result<Vec<TagSnapshot>> {
    let mut snapshots = Vec::with_capacity(item.sidecars.len() + 1);
    snapshots.push(read_snapshot(tool, &item.path, SourceRole::Media)?);
    for sidecar in &item.sidecars {
        let role = match sidecar.style {
            SidecarStyle::Duplicate(_) => SourceRole::Duplicate,
            SidecarStyle::Appended | SidecarStyle::Replaced => SourceRole::Sidecar,
        };
        snapshots.push(read_snapshot(tool, &sidecar.path, role)?);
    }
    Ok(snapshots)
}

/// Converts one object of `exiftool -json -n` output into a tag set.
pub fn tags_from_json(object: &Map<String, Value>) -> TagSet {
    let mut tags = TagSet::new();
    for (name, value) in object {
        if is_bookkeeping(name) {
            continue;
        }
        match convert_value(name, value) {
            Some(value) => {
                tags.insert(name.clone(), value);
            }
            None => trace!("skipping structured tag {name}"),
        }
    }
    fold_subseconds(&mut tags);
    tags
}

fn is_bookkeeping(name: &str) -> bool {
    name.starts_with("File") || BOOKKEEPING_TAGS.contains(&name)
}

fn is_date_tag(name: &str) -> bool {
    (name.contains("Date") || name.ends_with("Time"))
        && !name.starts_with("SubSecTime")
        && !name.starts_with("OffsetTime")
}

fn convert_value(name: &str, value: &Value) -> Option<TagValue> {
    match value {
        Value::String(text) => Some(
            is_date_tag(name)
                .then(|| Timestamp::parse(text))
                .flatten()
                .map(TagValue::Timestamp)
                .unwrap_or_else(|| TagValue::Text(text.clone())),
        ),
        Value::Number(number) => number.as_f64().map(TagValue::Number),
        Value::Bool(flag) => Some(TagValue::Text(flag.to_string())),
        Value::Array(items) => Some(TagValue::List(
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect(),
        )),
        Value::Null | Value::Object(_) => None,
    }
}

fn scalar_text(value: &TagValue) -> Option<String> {
    match value {
        TagValue::Text(text) => Some(text.trim().to_string()),
        TagValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 => Some(format!("{n}")),
        _ => None,
    }
}

fn fold_subseconds(tags: &mut TagSet) {
    for family in SUBSEC_FAMILIES {
        let composite = tags.remove(family.composite);
        let fraction = tags.remove(family.fraction);
        let offset = tags.remove(family.offset);

        let Some(base) = tags.timestamp(family.base).copied() else {
            continue;
        };

        let folded = match composite.as_ref().and_then(TagValue::as_timestamp) {
            Some(stamp) => *stamp,
            None => {
                let mut stamp = base;
                if stamp.subsec_digits() == 0 {
                    if let Some(digits) = fraction.as_ref().and_then(scalar_text) {
                        stamp = stamp.with_fraction(&digits).unwrap_or(stamp);
                    }
                }
                if stamp.offset().is_none() {
                    if let Some(parsed) = offset
                        .as_ref()
                        .and_then(scalar_text)
                        .and_then(|text| parse_offset(&text))
                        .flatten()
                    {
                        stamp = stamp.with_offset(Some(parsed));
                    }
                }
                stamp
            }
        };
        tags.insert(family.base, TagValue::Timestamp(folded));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_fake, FakeTool};
    use serde_json::json;
    use tempfile::tempdir;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn drops_bookkeeping_and_structured_tags() {
        let tags = tags_from_json(&object(json!({
            "SourceFile": "/c/a.jpg",
            "ExifToolVersion": 12.76,
            "FileName": "a.jpg",
            "FileModifyDate": "2024:01:01 00:00:00+00:00",
            "Directory": "/c",
            "Artist": "Alice",
            "Rating": 4,
            "RegionInfo": { "RegionList": [] },
            "Subject": ["beach", "family"],
        })));

        assert_eq!(
            tags.names().collect::<Vec<_>>(),
            vec!["Artist", "Rating", "Subject"]
        );
        assert_eq!(tags.get("Rating"), Some(&TagValue::Number(4.0)));
        assert_eq!(
            tags.get("Subject"),
            Some(&TagValue::List(vec!["beach".to_string(), "family".to_string()]))
        );
    }

    #[test]
    fn folds_subsec_composite_into_base_tag() {
        let tags = tags_from_json(&object(json!({
            "DateTimeOriginal": "2024:01:01 12:30:01",
            "SubSecTimeOriginal": "050",
            "OffsetTimeOriginal": "+02:00",
            "SubSecDateTimeOriginal": "2024:01:01 12:30:01.050+02:00",
        })));

        assert_eq!(tags.len(), 1);
        assert_eq!(
            tags.timestamp("DateTimeOriginal").map(ToString::to_string).as_deref(),
            Some("2024:01:01 12:30:01.050+02:00")
        );
    }

    #[test]
    fn folds_companions_without_composite() {
        let tags = tags_from_json(&object(json!({
            "CreateDate": "2024:01:01 12:30:01",
            "SubSecTimeDigitized": 5,
            "OffsetTimeDigitized": "-05:00",
        })));

        assert_eq!(
            tags.timestamp("CreateDate").map(ToString::to_string).as_deref(),
            Some("2024:01:01 12:30:01.5-05:00")
        );
        assert!(!tags.contains("SubSecTimeDigitized"));
        assert!(!tags.contains("OffsetTimeDigitized"));
    }

    #[test]
    fn unparseable_dates_stay_text() {
        let tags = tags_from_json(&object(json!({
            "DateTimeOriginal": "0000:00:00 00:00:00",
            "GPSDateStamp": "2024:01:01",
        })));
        assert_eq!(tags.text("DateTimeOriginal"), Some("0000:00:00 00:00:00"));
        assert!(tags.capture_time().is_none());
        assert_eq!(tags.text("GPSDateStamp"), Some("2024:01:01"));
    }

    #[test]
    fn snapshot_carries_role_and_modification_time() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a.jpg");
        write_fake(&path, &[("Artist", "Alice")]);

        let tool = FakeTool::default();
        let snapshot = read_snapshot(&tool, &path, SourceRole::Media).expect("snapshot");
        assert_eq!(snapshot.role, SourceRole::Media);
        assert_eq!(snapshot.tags.text("Artist"), Some("Alice"));
        assert_eq!(
            snapshot.modified,
            fs::metadata(&path).and_then(|m| m.modified()).expect("mtime")
        );
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let temp = tempdir().expect("tempdir");
        let tool = FakeTool::default();
        let err = read_snapshot(&tool, &temp.path().join("gone.jpg"), SourceRole::Media)
            .expect_err("must fail");
        assert!(matches!(err, CatalogError::Read { .. }));
    }

    #[test]
    fn role_precedence_order() {
        assert!(SourceRole::Sidecar > SourceRole::Media);
        assert!(SourceRole::Media > SourceRole::Duplicate);
    }
}
