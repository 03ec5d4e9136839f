//! Tag synchronization between the files of one media item.

use crate::error::{CatalogError, Result};
use crate::reader::{SourceRole, TagSnapshot};
use crate::tags::{TagSet, TagValue};
use crate::tool::TagTool;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_ALLOW: &[&str] = &[
    "Artist",
    "Creator",
    "Copyright",
    "CreateDate",
    "DateTimeOriginal",
    "GPSAltitude",
    "GPSAltitudeRef",
    "GPSLatitude",
    "GPSLatitudeRef",
    "GPSLongitude",
    "GPSLongitudeRef",
    "Make",
    "Model",
    "Rating",
    "Subject",
];

/// Never synchronized in all-tags mode: image structure, derived values and
/// per-duplicate editing state.
const PROTECTED_TAGS: &[&str] = &[
    "Aperture",
    "BitsPerSample",
    "CircleOfConfusion",
    "ColorComponents",
    "Compression",
    "DerivedFrom",
    "Duration",
    "EncodingProcess",
    "ExifByteOrder",
    "ExifImageHeight",
    "ExifImageWidth",
    "FOV",
    "FocalLength35efl",
    "GPSPosition",
    "HyperfocalDistance",
    "ImageHeight",
    "ImageSize",
    "ImageWidth",
    "JpgFromRaw",
    "LightValue",
    "Megapixels",
    "Orientation",
    "PreviewImage",
    "RawParams",
    "ScaleFactor35efl",
    "ShutterSpeed",
    "ThumbnailImage",
    "ThumbnailLength",
    "ThumbnailOffset",
    "XMPToolkit",
    "XmpVersion",
    "YCbCrSubSampling",
];

const PROTECTED_PREFIXES: &[&str] = &["AutoPresets", "History", "Mask", "SubSec", "OffsetTime"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Synchronize every tag found in any file instead of only `allow`.
    pub all_tags: bool,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Also write the media file, not only its sidecars.
    pub write_media: bool,
    /// Derive a missing `Copyright` from `Creator` before synchronizing.
    pub copyright_from_creator: bool,
    /// Align the EXIF, IPTC and XMP copies of each MWG tag in the media file.
    pub align_mwg: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            all_tags: false,
            allow: DEFAULT_ALLOW.iter().map(|tag| tag.to_string()).collect(),
            deny: Vec::new(),
            write_media: false,
            copyright_from_creator: false,
            align_mwg: false,
        }
    }
}

impl SyncPolicy {
    pub fn is_eligible(&self, tag: &str) -> bool {
        if self.deny.iter().any(|denied| denied == tag) {
            return false;
        }
        if self.all_tags {
            !is_protected(tag)
        } else {
            self.allow.iter().any(|allowed| allowed == tag)
        }
    }

    pub(crate) fn is_target(&self, role: SourceRole) -> bool {
        role != SourceRole::Media || self.write_media
    }
}

fn is_protected(tag: &str) -> bool {
    PROTECTED_TAGS.contains(&tag) || PROTECTED_PREFIXES.iter().any(|p| tag.starts_with(p))
}

/// Tags to write into one file.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub path: PathBuf,
    pub tags: TagSet,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Merged value of every eligible tag.
    pub canonical: TagSet,
    /// Only files with at least one differing eligible tag.
    pub plan: Vec<PlannedWrite>,
}

/// Merges the eligible tags of `snapshots` and plans the writes that bring
/// every target file in line with the merged values.
pub fn synchronize(snapshots: &[TagSnapshot], policy: &SyncPolicy) -> Result<SyncOutcome> {
    let item_path = snapshots
        .iter()
        .find(|s| s.role == SourceRole::Media)
        .or_else(|| snapshots.first())
        .map(|s| s.path.clone())
        .unwrap_or_default();

    let eligible: BTreeSet<&str> = snapshots
        .iter()
        .flat_map(|s| s.tags.names())
        .filter(|tag| policy.is_eligible(tag))
        .collect();

    let mut canonical = TagSet::new();
    for tag in eligible {
        canonical.insert(tag, merge_tag(&item_path, tag, snapshots)?);
    }

    let targets = snapshots.iter().filter(|s| policy.is_target(s.role));
    let plan = plan_writes(targets, &canonical);

    debug!(
        "{}: {} canonical tags, {} files to write",
        item_path.display(),
        canonical.len(),
        plan.len()
    );
    Ok(SyncOutcome { canonical, plan })
}

/// Writes that bring each of `targets` in line with `canonical`. Files that
/// already agree are left out.
pub(crate) fn plan_writes<'a>(
    targets: impl Iterator<Item = &'a TagSnapshot>,
    canonical: &TagSet,
) -> Vec<PlannedWrite> {
    targets
        .filter_map(|target| {
            let tags: TagSet = canonical
                .iter()
                .filter(|(tag, value)| target.tags.get(tag) != Some(*value))
                .map(|(tag, value)| (tag.to_string(), value.clone()))
                .collect();
            (!tags.is_empty()).then(|| PlannedWrite {
                path: target.path.clone(),
                tags,
            })
        })
        .collect()
}

/// Executes a write plan and returns the number of files written.
pub fn apply_writes(tool: &dyn TagTool, plan: &[PlannedWrite]) -> Result<usize> {
    for write in plan {
        debug!(
            "writing {} tags to {}",
            write.tags.len(),
            write.path.display()
        );
        tool.write_tags(&write.path, &write.tags)?;
    }
    Ok(plan.len())
}

fn merge_tag(item_path: &Path, tag: &str, snapshots: &[TagSnapshot]) -> Result<TagValue> {
    let mut ranked: Vec<(&TagSnapshot, &TagValue)> = snapshots
        .iter()
        .filter_map(|s| s.tags.get(tag).map(|value| (s, value)))
        .collect();
    ranked.sort_by(|(a, _), (b, _)| (b.modified, b.role).cmp(&(a.modified, a.role)));

    let Some(&(top, _)) = ranked.first() else {
        return Err(CatalogError::read(
            item_path,
            format!("no source holds {tag}"),
        ));
    };
    let leaders: Vec<&TagValue> = ranked
        .iter()
        .take_while(|(s, _)| (s.modified, s.role) == (top.modified, top.role))
        .map(|(_, value)| *value)
        .collect();

    let winner = pick_leader(&leaders).ok_or_else(|| CatalogError::SyncConflict {
        path: item_path.to_path_buf(),
        tag: tag.to_string(),
        values: leaders.iter().map(ToString::to_string).collect(),
    })?;

    Ok(refined(winner, ranked.iter().map(|(_, value)| *value)).clone())
}

/// The value all leaders agree on, or the one that refines every other.
fn pick_leader<'a>(leaders: &[&'a TagValue]) -> Option<&'a TagValue> {
    let first = *leaders.first()?;
    if leaders.iter().all(|value| *value == first) {
        return Some(first);
    }
    leaders.iter().copied().find(|candidate| {
        leaders
            .iter()
            .all(|other| other == candidate || is_refinement(candidate, other))
    })
}

fn is_refinement(fine: &TagValue, coarse: &TagValue) -> bool {
    match (fine.as_timestamp(), coarse.as_timestamp()) {
        (Some(fine), Some(coarse)) => fine.refines(coarse),
        _ => false,
    }
}

/// Most precise value among `values` that refines `winner`, in rank order.
fn refined<'a>(
    winner: &'a TagValue,
    values: impl Iterator<Item = &'a TagValue>,
) -> &'a TagValue {
    let mut best = winner;
    for value in values {
        if is_refinement(value, best) {
            best = value;
        }
    }
    best
}
