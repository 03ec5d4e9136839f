//! Metadata update passes that run on an item before its files are
//! synchronized.

use crate::error::Result;
use crate::reader::{read_snapshot, SourceRole, TagSnapshot};
use crate::sync::SyncPolicy;
use crate::tags::{TagSet, TagValue};
use crate::tool::TagTool;
use log::debug;
use std::time::SystemTime;

pub const CREATOR_TAG: &str = "Creator";
pub const COPYRIGHT_TAG: &str = "Copyright";

/// Runs the passes enabled in `policy`. A snapshot is refreshed after each
/// write so synchronization ranks the updated file as the newest source.
/// Returns the number of files written, or that would be in a dry run.
pub fn apply_updates(
    tool: &dyn TagTool,
    snapshots: &mut [TagSnapshot],
    policy: &SyncPolicy,
    dry_run: bool,
) -> Result<usize> {
    let mut writes = 0;
    if policy.copyright_from_creator {
        writes += copyright_from_creator(tool, snapshots, dry_run)?;
    }
    if policy.align_mwg {
        writes += align_mwg(tool, snapshots, dry_run)?;
    }
    Ok(writes)
}

fn position(snapshots: &[TagSnapshot], role: SourceRole) -> Option<usize> {
    snapshots.iter().position(|s| s.role == role)
}

/// Sets `Copyright` from `Creator` in the initial sidecar, or in the media
/// file when there is none, unless a copyright is already present.
fn copyright_from_creator(
    tool: &dyn TagTool,
    snapshots: &mut [TagSnapshot],
    dry_run: bool,
) -> Result<usize> {
    let index = position(snapshots, SourceRole::Sidecar)
        .or_else(|| position(snapshots, SourceRole::Media));
    let Some(index) = index else {
        return Ok(0);
    };
    let source = &snapshots[index];
    if source.tags.contains(COPYRIGHT_TAG) {
        return Ok(0);
    }
    let Some(creator) = source.tags.get(CREATOR_TAG).map(ToString::to_string) else {
        return Ok(0);
    };
    if creator.trim().is_empty() {
        return Ok(0);
    }

    let mut tags = TagSet::new();
    tags.insert(
        COPYRIGHT_TAG,
        TagValue::Text(format!("Copyright {}", creator.trim())),
    );
    let (path, role) = (source.path.clone(), source.role);
    debug!("{}: copyright from creator {creator}", path.display());

    if dry_run {
        let snapshot = &mut snapshots[index];
        snapshot.tags.merge_missing_from(&tags);
        snapshot.modified = SystemTime::now();
    } else {
        tool.write_tags(&path, &tags)?;
        snapshots[index] = read_snapshot(tool, &path, role)?;
    }
    Ok(1)
}

/// Aligns the MWG tag locations of the media file.
fn align_mwg(tool: &dyn TagTool, snapshots: &mut [TagSnapshot], dry_run: bool) -> Result<usize> {
    let Some(index) = position(snapshots, SourceRole::Media) else {
        return Ok(0);
    };
    let path = snapshots[index].path.clone();
    if dry_run {
        debug!("{}: would align MWG tags", path.display());
        return Ok(0);
    }
    if !tool.align_mwg(&path)? {
        return Ok(0);
    }
    debug!("{}: aligned MWG tags", path.display());
    snapshots[index] = read_snapshot(tool, &path, SourceRole::Media)?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaItem;
    use crate::matcher::{Sidecar, SidecarStyle};
    use crate::reader::read_item;
    use crate::testing::{read_fake, write_fake, FakeTool};
    use std::path::Path;
    use tempfile::tempdir;

    fn item(media: &Path, sidecar: Option<&Path>) -> MediaItem {
        let mut item = MediaItem::new(media);
        if let Some(path) = sidecar {
            item.sidecars = vec![Sidecar {
                path: path.to_path_buf(),
                style: SidecarStyle::Appended,
            }];
        }
        item
    }

    fn copyright_policy() -> SyncPolicy {
        SyncPolicy {
            copyright_from_creator: true,
            ..SyncPolicy::default()
        }
    }

    #[test]
    fn copyright_is_derived_from_creator_in_the_initial_sidecar() {
        let temp = tempdir().expect("tempdir");
        let media = temp.path().join("a.jpg");
        let sidecar = temp.path().join("a.jpg.xmp");
        write_fake(&media, &[]);
        write_fake(&sidecar, &[("Creator", "Alice")]);

        let tool = FakeTool::default();
        let item = item(&media, Some(&sidecar));
        let mut snapshots = read_item(&tool, &item).expect("read");
        let writes =
            apply_updates(&tool, &mut snapshots, &copyright_policy(), false).expect("updates");

        assert_eq!(writes, 1);
        assert_eq!(read_fake(&sidecar).text("Copyright"), Some("Copyright Alice"));
        assert_eq!(read_fake(&media).text("Copyright"), None);
        assert_eq!(snapshots[1].tags.text("Copyright"), Some("Copyright Alice"));
    }

    #[test]
    fn media_is_the_source_without_a_sidecar() {
        let temp = tempdir().expect("tempdir");
        let media = temp.path().join("a.jpg");
        write_fake(&media, &[("Creator", "Bob")]);

        let tool = FakeTool::default();
        let mut snapshots = read_item(&tool, &item(&media, None)).expect("read");
        apply_updates(&tool, &mut snapshots, &copyright_policy(), false).expect("updates");
        assert_eq!(read_fake(&media).text("Copyright"), Some("Copyright Bob"));
    }

    #[test]
    fn existing_copyright_is_kept() {
        let temp = tempdir().expect("tempdir");
        let media = temp.path().join("a.jpg");
        write_fake(&media, &[("Creator", "Alice"), ("Copyright", "Studio")]);

        let tool = FakeTool::default();
        let mut snapshots = read_item(&tool, &item(&media, None)).expect("read");
        let writes =
            apply_updates(&tool, &mut snapshots, &copyright_policy(), false).expect("updates");
        assert_eq!(writes, 0);
        assert_eq!(tool.writes(), 0);
        assert_eq!(read_fake(&media).text("Copyright"), Some("Studio"));
    }

    #[test]
    fn dry_run_updates_only_the_snapshot() {
        let temp = tempdir().expect("tempdir");
        let media = temp.path().join("a.jpg");
        write_fake(&media, &[("Creator", "Alice")]);

        let tool = FakeTool::default();
        let mut snapshots = read_item(&tool, &item(&media, None)).expect("read");
        let writes =
            apply_updates(&tool, &mut snapshots, &copyright_policy(), true).expect("updates");
        assert_eq!(writes, 1);
        assert_eq!(tool.writes(), 0);
        assert_eq!(read_fake(&media).text("Copyright"), None);
        assert_eq!(snapshots[0].tags.text("Copyright"), Some("Copyright Alice"));
    }

    #[test]
    fn mwg_alignment_fills_every_location_once() {
        let temp = tempdir().expect("tempdir");
        let media = temp.path().join("a.jpg");
        write_fake(&media, &[("By-line", "Alice")]);
        let policy = SyncPolicy {
            align_mwg: true,
            ..SyncPolicy::default()
        };

        let tool = FakeTool::default();
        let mut snapshots = read_item(&tool, &item(&media, None)).expect("read");
        assert_eq!(
            apply_updates(&tool, &mut snapshots, &policy, false).expect("updates"),
            1
        );
        let tags = read_fake(&media);
        assert_eq!(tags.text("Artist"), Some("Alice"));
        assert_eq!(tags.text("Creator"), Some("Alice"));
        assert_eq!(snapshots[0].tags.text("Artist"), Some("Alice"));

        let mut snapshots = read_item(&tool, &item(&media, None)).expect("reread");
        assert_eq!(
            apply_updates(&tool, &mut snapshots, &policy, false).expect("updates"),
            0
        );
    }

    #[test]
    fn passes_are_off_by_default() {
        let temp = tempdir().expect("tempdir");
        let media = temp.path().join("a.jpg");
        write_fake(&media, &[("Creator", "Alice"), ("By-line", "Bob")]);

        let tool = FakeTool::default();
        let mut snapshots = read_item(&tool, &item(&media, None)).expect("read");
        let writes = apply_updates(&tool, &mut snapshots, &SyncPolicy::default(), false)
            .expect("updates");
        assert_eq!(writes, 0);
        assert_eq!(tool.writes(), 0);
    }
}
