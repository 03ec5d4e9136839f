mod apply;
mod catalog;
mod cleanup;
mod config;
mod error;
mod importer;
mod live;
mod matcher;
mod namer;
mod organizer;
mod reader;
mod sanitize;
mod sync;
mod tags;
mod template;
mod tool;
mod updates;

#[cfg(test)]
mod testing;

pub use apply::{apply_group, persist_undo, undo_journal, undo_last, FileMove, UndoResult};
pub use catalog::{Catalog, CatalogEntry, EntryGuard, EntryId, EntryLocks, EntryState, MediaItem};
pub use cleanup::{clean_leftovers, trash_path, CleanReport};
pub use config::{
    app_paths, load_config, load_config_from, save_config, save_config_to, AppConfig, AppPaths,
};
pub use error::{CatalogError, ImportFailure, ItemError, Result};
pub use importer::{ImportOptions, ImportReport, Importer};
pub use live::{LiveKind, LiveLinker, LiveMember, CONTENT_ID_TAG};
pub use matcher::{
    scan_directory, ScanOptions, ScanResult, Sidecar, SidecarStyle, DEFAULT_MEDIA_EXTENSIONS,
    TRASH_DIR,
};
pub use namer::{collision_suffix, ItemNames, NameIndex, NamePlan, Namer};
pub use organizer::{OrgReport, OrganizeOptions, Organizer};
pub use reader::{read_item, read_snapshot, tags_from_json, SourceRole, TagSnapshot};
pub use sync::{apply_writes, synchronize, PlannedWrite, SyncOutcome, SyncPolicy, DEFAULT_ALLOW};
pub use tags::{TagSet, TagValue, Timestamp};
pub use template::{validate_template, Template, TemplateError, DEFAULT_TEMPLATE};
pub use tool::{
    check_version, ExifTool, ProcessRunner, RunError, Runner, SessionRunner, TagTool, MIN_VERSION,
};
pub use updates::{apply_updates, COPYRIGHT_TAG, CREATOR_TAG};
