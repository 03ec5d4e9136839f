use crate::matcher::{ScanOptions, DEFAULT_MEDIA_EXTENSIONS};
use crate::namer::Namer;
use crate::organizer::OrganizeOptions;
use crate::sync::SyncPolicy;
use crate::template::{Template, TemplateError, DEFAULT_TEMPLATE};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const MAX_DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Catalog used when no `-c`/`-l` is given.
    pub catalog: Option<PathBuf>,
    pub template: String,
    /// Name files after UTC capture time when the offset is known.
    pub utc_names: bool,
    /// Worker threads; 0 picks the available parallelism, capped at 8.
    pub workers: usize,
    /// Per-invocation exiftool timeout. Persistent sessions are not bounded.
    pub timeout_secs: u64,
    pub exiftool: PathBuf,
    /// Keep `-stay_open` exiftool sessions instead of one process per call.
    pub persistent: bool,
    /// Create `<media>.xmp` for items that have no initial sidecar.
    pub create_sidecars: bool,
    /// Link HEIC/JPEG stills to their MOV clips and name them together.
    pub live_photos: bool,
    pub include_hidden: bool,
    pub media_extensions: Vec<String>,
    pub extension_aliases: BTreeMap<String, String>,
    pub sync: SyncPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            catalog: None,
            template: DEFAULT_TEMPLATE.to_string(),
            utc_names: true,
            workers: 0,
            timeout_secs: 30,
            exiftool: PathBuf::from("exiftool"),
            persistent: false,
            create_sidecars: true,
            live_photos: true,
            include_hidden: false,
            media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            extension_aliases: [("jpeg", "jpg"), ("tiff", "tif")]
                .into_iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            sync: SyncPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
            .min(MAX_DEFAULT_WORKERS)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            include_hidden: self.include_hidden,
            media_extensions: self
                .media_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn namer(&self) -> std::result::Result<Namer, TemplateError> {
        let aliases = self
            .extension_aliases
            .iter()
            .map(|(from, to)| (from.to_ascii_lowercase(), to.to_ascii_lowercase()))
            .collect();
        Ok(Namer::new(
            Template::parse(&self.template)?,
            self.utc_names,
            aliases,
        ))
    }

    pub fn organize_options(&self, dry_run: bool) -> OrganizeOptions {
        OrganizeOptions {
            policy: self.sync.clone(),
            create_sidecars: self.create_sidecars,
            live_photos: self.live_photos,
            dry_run,
            workers: self.effective_workers(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub undo_path: PathBuf,
}

pub fn app_paths() -> Result<AppPaths> {
    let proj = ProjectDirs::from("com", "imlib", "imlib")
        .context("cannot determine the OS configuration directory")?;
    let config_dir = proj.config_dir().to_path_buf();
    Ok(AppPaths {
        config_path: config_dir.join("config.toml"),
        undo_path: config_dir.join("undo-last.json"),
        config_dir,
    })
}

pub fn load_config() -> Result<AppConfig> {
    load_config_from(&app_paths()?.config_path)
}

pub fn save_config(config: &AppConfig) -> Result<()> {
    save_config_to(&app_paths()?.config_path, config)
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;

    let config = toml::from_str::<AppConfig>(&raw)
        .with_context(|| format!("cannot parse config file {}", path.display()))?;
    Ok(config)
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create config directory {}", dir.display()))?;
    }
    let body = toml::to_string_pretty(config).context("cannot serialize config")?;
    fs::write(path, body)
        .with_context(|| format!("cannot write config file {}", path.display()))?;
    Ok(())
}
