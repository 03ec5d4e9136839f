use crate::catalog::EntryState;
use crate::template::TemplateError;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{}: cannot read metadata ({reason})", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("{}: conflicting values for {tag}: {}", .path.display(), .values.join(" / "))]
    SyncConflict {
        path: PathBuf,
        tag: String,
        values: Vec<String>,
    },

    #[error("{}: cannot derive a name ({reason})", .path.display())]
    Naming { path: PathBuf, reason: String },

    #[error("{}: not imported ({reason})", .path.display())]
    Import { path: PathBuf, reason: ImportFailure },

    #[error("exiftool: {0}")]
    ExternalTool(String),

    #[error("{}: cannot go from {from:?} to {to:?}", .path.display())]
    InvalidState {
        path: PathBuf,
        from: EntryState,
        to: EntryState,
    },

    #[error("{}: already being processed", .path.display())]
    Busy { path: PathBuf },

    #[error("{} -> {}: move failed ({source})", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl CatalogError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn read(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Read {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn import(path: impl Into<PathBuf>, reason: ImportFailure) -> Self {
        Self::Import {
            path: path.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImportFailure {
    #[error("unsupported format")]
    Unsupported,
    #[error("duplicate of {}", .0.display())]
    Duplicate(PathBuf),
    #[error("sidecar without media")]
    LeftoverSidecar,
    #[error("no capture time in any file of the item")]
    MissingCaptureTime,
    #[error("{0}")]
    Invalid(String),
}

/// A failure tied to one catalog item. Batches collect these instead of
/// aborting.
#[derive(Debug, Serialize)]
pub struct ItemError {
    pub path: PathBuf,
    #[serde(serialize_with = "serialize_display")]
    pub error: CatalogError,
}

impl ItemError {
    pub fn new(path: impl Into<PathBuf>, error: CatalogError) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}

fn serialize_display<S: serde::Serializer>(
    error: &CatalogError,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}
