use crate::apply::{apply_group, FileMove};
use crate::catalog::Catalog;
use crate::error::{CatalogError, ItemError, Result};
use crate::matcher::TRASH_DIR;
use log::{info, warn};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize)]
pub struct CleanReport {
    pub dry_run: bool,
    pub moves: Vec<FileMove>,
    pub errors: Vec<ItemError>,
}

/// Where `path` goes inside the trash of `root`.
pub fn trash_path(root: &Path, path: &Path) -> Result<PathBuf> {
    let relative = path.strip_prefix(root).map_err(|_| {
        CatalogError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "not inside the catalog"),
        )
    })?;
    Ok(root.join(TRASH_DIR).join(relative))
}

/// Moves every leftover sidecar of `catalog` into its trash directory.
/// Nothing already in the trash is overwritten.
pub fn clean_leftovers(catalog: &Catalog, dry_run: bool) -> CleanReport {
    let mut report = CleanReport {
        dry_run,
        ..CleanReport::default()
    };

    for leftover in catalog.leftovers() {
        let result = trash_path(catalog.root(), leftover).and_then(|target| {
            let m = FileMove::new(leftover, target);
            if dry_run {
                if m.to.exists() {
                    return Err(CatalogError::io(
                        &m.to,
                        io::Error::new(io::ErrorKind::AlreadyExists, "already in trash"),
                    ));
                }
                Ok(vec![m])
            } else {
                apply_group(&[m])
            }
        });
        match result {
            Ok(moves) => report.moves.extend(moves),
            Err(error) => {
                warn!("{error}");
                report.errors.push(ItemError::new(leftover, error));
            }
        }
    }

    info!(
        "{} leftover sidecars moved to {}, {} errors",
        report.moves.len(),
        TRASH_DIR,
        report.errors.len()
    );
    report
}
