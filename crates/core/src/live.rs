//! Live Photos: a still image and a short video recorded together, linked
//! by the `ContentIdentifier` of their media files. Sidecars cannot hold
//! that tag, so only media snapshots are consulted.

use crate::reader::TagSnapshot;
use crate::tags::TagSet;
use log::debug;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

pub const CONTENT_ID_TAG: &str = "ContentIdentifier";

const IMAGE_EXTENSIONS: &[&str] = &["heic", "jpeg", "jpg"];
const VIDEO_EXTENSIONS: &[&str] = &["mov"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveKind {
    Image,
    Video,
}

impl LiveKind {
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(LiveKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(LiveKind::Video)
        } else {
            None
        }
    }
}

fn content_id(tags: &TagSet) -> Option<String> {
    let id = tags.get(CONTENT_ID_TAG)?.to_string();
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn is_heic(path: &Path) -> bool {
    path.extension()
        .and_then(|v| v.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("heic"))
        .unwrap_or(false)
}

/// One media file of a Live Photo, identified by its position in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveMember {
    pub slot: usize,
    pub kind: LiveKind,
    pub heic: bool,
    pub modified: SystemTime,
}

#[derive(Debug, Default)]
struct Group {
    images: Vec<LiveMember>,
    videos: Vec<LiveMember>,
    /// An image outside the run carries this identifier.
    settled_image: bool,
}

#[derive(Debug, Default)]
pub struct LiveLinker {
    groups: BTreeMap<String, Group>,
}

impl LiveLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the item in `slot` when its media file is a Live Photo
    /// component. Returns whether it was one.
    pub fn insert(&mut self, slot: usize, media: &TagSnapshot) -> bool {
        let Some(kind) = LiveKind::of(&media.path) else {
            return false;
        };
        let Some(id) = content_id(&media.tags) else {
            return false;
        };
        debug!("{}: Live Photo {kind:?} {id}", media.path.display());
        let member = LiveMember {
            slot,
            kind,
            heic: is_heic(&media.path),
            modified: media.modified,
        };
        let group = self.groups.entry(id).or_default();
        match kind {
            LiveKind::Image => group.images.push(member),
            LiveKind::Video => group.videos.push(member),
        }
        true
    }

    /// Records an image that is not part of the run, so its video is not
    /// taken for a leftover.
    pub fn note_settled(&mut self, path: &Path, tags: &TagSet) {
        if LiveKind::of(path) != Some(LiveKind::Image) {
            return;
        }
        if let Some(id) = content_id(tags) {
            self.groups.entry(id).or_default().settled_image = true;
        }
    }

    /// Drops videos whose image no longer exists and returns their slots.
    pub fn remove_leftover_videos(&mut self) -> Vec<usize> {
        let mut removed = Vec::new();
        self.groups.retain(|id, group| {
            if !group.images.is_empty() || group.settled_image {
                return true;
            }
            debug!("Live Photo {id}: {} videos without image", group.videos.len());
            removed.extend(group.videos.iter().map(|m| m.slot));
            false
        });
        removed
    }

    /// Keeps one image and one video per identifier and returns the slots of
    /// the others. HEIC beats other image formats, then the newest file
    /// wins. Ties go to the earlier slot.
    pub fn remove_duplicates(&mut self) -> Vec<usize> {
        let mut removed = Vec::new();
        for group in self.groups.values_mut() {
            removed.extend(keep_best(&mut group.images));
            removed.extend(keep_best(&mut group.videos));
        }
        removed.sort_unstable();
        removed
    }

    /// `(image, video)` slots of every complete pair.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        self.groups
            .values()
            .filter_map(|g| match (g.images.as_slice(), g.videos.as_slice()) {
                ([image], [video]) => Some((image.slot, video.slot)),
                _ => None,
            })
            .collect()
    }
}

fn keep_best(members: &mut Vec<LiveMember>) -> Vec<usize> {
    let mut best: Option<LiveMember> = None;
    for member in members.iter() {
        match best {
            Some(b) if (member.heic, member.modified) <= (b.heic, b.modified) => {}
            _ => best = Some(*member),
        }
    }
    let Some(best) = best else {
        return Vec::new();
    };
    let removed = members
        .iter()
        .filter(|m| m.slot != best.slot)
        .map(|m| m.slot)
        .collect();
    *members = vec![best];
    removed
}
