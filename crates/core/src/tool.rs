//! Boundary to the external tag tool.
//!
//! Everything the catalog knows about embedded metadata goes through
//! [`TagTool`]. The production implementation drives exiftool, either one
//! process per call with a timeout, or a pool of `-stay_open` sessions.

use crate::error::{CatalogError, Result};
use crate::matcher::is_sidecar_path;
use crate::reader::tags_from_json;
use crate::tags::{TagSet, TagValue};
use log::trace;
use serde_json::{Map, Value};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Oldest exiftool release the read/write arguments are known to work with.
pub const MIN_VERSION: (u32, u32) = (12, 0);

pub trait TagTool: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<TagSet>;

    /// Writes exactly the tags in `tags`; every other tag in the file is left
    /// as it is.
    fn write_tags(&self, path: &Path, tags: &TagSet) -> Result<()>;

    /// Creates an XMP sidecar at `sidecar` holding the metadata of `media`.
    fn create_sidecar(&self, media: &Path, sidecar: &Path) -> Result<()>;

    /// Copies the authoritative value of each MWG composite tag into its
    /// EXIF, IPTC and XMP locations. Returns whether the file changed.
    fn align_mwg(&self, path: &Path) -> Result<bool>;

    fn version(&self) -> Result<String>;
}

/// Fails unless the tool runs and is at least [`MIN_VERSION`].
pub fn check_version(tool: &dyn TagTool) -> Result<String> {
    let version = tool.version()?;
    version_at_least(&version, MIN_VERSION)?;
    Ok(version)
}

fn version_at_least(version: &str, min: (u32, u32)) -> Result<()> {
    let version = version.trim();
    let Some((major, minor)) = version.split_once('.') else {
        return Err(CatalogError::ExternalTool(format!(
            "unexpected version string \"{version}\""
        )));
    };
    let (Ok(major), Ok(minor)) = (major.parse::<u32>(), minor.parse::<u32>()) else {
        return Err(CatalogError::ExternalTool(format!(
            "unexpected version \"{version}\""
        )));
    };
    if (major, minor) >= min {
        Ok(())
    } else {
        Err(CatalogError::ExternalTool(format!(
            "version {version} is older than the required {}.{:02}",
            min.0, min.1
        )))
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot start {0}")]
    Spawn(String),
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<RunError> for CatalogError {
    fn from(err: RunError) -> Self {
        CatalogError::ExternalTool(err.to_string())
    }
}

/// Executes one exiftool command line and returns its stdout.
pub trait Runner: Send + Sync {
    fn run(&self, args: &[String]) -> std::result::Result<Vec<u8>, RunError>;

    /// Whether arguments travel one per line (`-stay_open`), which rules out
    /// values containing newlines.
    fn line_based(&self) -> bool {
        false
    }
}

pub struct ExifTool<R> {
    runner: R,
}

impl ExifTool<ProcessRunner> {
    pub fn process(executable: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner: ProcessRunner {
                executable: executable.into(),
                timeout,
            },
        }
    }
}

impl ExifTool<SessionRunner> {
    pub fn persistent(executable: &Path, sessions: usize) -> Result<Self> {
        Ok(Self {
            runner: SessionRunner::start(executable, sessions)?,
        })
    }
}

impl<R: Runner> ExifTool<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: Runner> TagTool for ExifTool<R> {
    fn read_tags(&self, path: &Path) -> Result<TagSet> {
        let stdout = self.runner.run(&read_args(path)?).map_err(|err| match err {
            RunError::Spawn(_) => CatalogError::from(err),
            other => CatalogError::read(path, other.to_string()),
        })?;
        let objects: Vec<Map<String, Value>> = serde_json::from_slice(&stdout)
            .map_err(|e| CatalogError::read(path, format!("unexpected exiftool output ({e})")))?;
        let first = objects
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::read(path, "exiftool returned no metadata"))?;
        Ok(tags_from_json(&first))
    }

    fn write_tags(&self, path: &Path, tags: &TagSet) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let args = write_args(path, tags, self.runner.line_based())?;
        self.runner.run(&args)?;
        Ok(())
    }

    fn create_sidecar(&self, media: &Path, sidecar: &Path) -> Result<()> {
        if sidecar.exists() {
            return Err(CatalogError::io(
                sidecar,
                io::Error::new(io::ErrorKind::AlreadyExists, "sidecar already exists"),
            ));
        }
        let args = vec!["-o".to_string(), path_arg(sidecar)?, path_arg(media)?];
        self.runner.run(&args)?;
        Ok(())
    }

    fn align_mwg(&self, path: &Path) -> Result<bool> {
        let args = vec![
            "-overwrite_original".to_string(),
            "-MWG:all<MWG:all".to_string(),
            path_arg(path)?,
        ];
        let stdout = self.runner.run(&args)?;
        Ok(updated_files(&stdout) > 0)
    }

    fn version(&self) -> Result<String> {
        let stdout = self.runner.run(&["-ver".to_string()])?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| CatalogError::read(path, "path is not valid UTF-8"))
}

fn read_args(path: &Path) -> Result<Vec<String>> {
    Ok(vec!["-json".to_string(), "-n".to_string(), path_arg(path)?])
}

/// Composite tag that writes a timestamp together with its EXIF sub-second
/// and offset companions.
fn subsec_composite(tag: &str) -> Option<&'static str> {
    match tag {
        "DateTimeOriginal" => Some("SubSecDateTimeOriginal"),
        "CreateDate" => Some("SubSecCreateDate"),
        "ModifyDate" => Some("SubSecModifyDate"),
        _ => None,
    }
}

/// Count from exiftool's `N image files updated` summary line.
fn updated_files(stdout: &[u8]) -> usize {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| line.trim().strip_suffix("image files updated"))
        .filter_map(|count| count.trim().parse::<usize>().ok())
        .sum()
}

fn write_args(path: &Path, tags: &TagSet, line_based: bool) -> Result<Vec<String>> {
    let sidecar = is_sidecar_path(path);
    let mut args = vec!["-overwrite_original".to_string(), "-n".to_string()];

    for (name, value) in tags {
        let target = match value {
            TagValue::Timestamp(_) if !sidecar => subsec_composite(name).unwrap_or(name.as_str()),
            _ => name.as_str(),
        };
        let values = value.assignments();
        if values.is_empty() {
            args.push(format!("-{target}="));
        }
        for value in values {
            if line_based && value.contains('\n') {
                return Err(CatalogError::ExternalTool(format!(
                    "{}: {name} contains a line break, which a persistent session cannot pass",
                    path.display()
                )));
            }
            args.push(format!("-{target}={value}"));
        }
    }

    args.push(path_arg(path)?);
    Ok(args)
}

/// One exiftool process per call, killed after `timeout`.
pub struct ProcessRunner {
    executable: PathBuf,
    timeout: Duration,
}

impl Runner for ProcessRunner {
    fn run(&self, args: &[String]) -> std::result::Result<Vec<u8>, RunError> {
        trace!("{} {}", self.executable.display(), args.join(" "));

        let mut child = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunError::Spawn(format!("{} ({e})", self.executable.display())))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let mut delay = Duration::from_millis(2);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(RunError::Failed(format!("cannot wait for process ({e})"))),
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunError::Timeout(self.timeout));
            }
            thread::sleep(delay);
            delay = (delay * 2).min(Duration::from_millis(50));
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        trace!("exiftool stdout:\n{}", String::from_utf8_lossy(&stdout));

        if !status.success() {
            return Err(RunError::Failed(format!(
                "{status}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(stdout)
    }
}

fn drain<P: Read + Send + 'static>(pipe: Option<P>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Pool of `-stay_open` exiftool sessions, one per worker.
pub struct SessionRunner {
    sessions: Vec<Mutex<exiftool::ExifTool>>,
    next: AtomicUsize,
}

impl SessionRunner {
    pub fn start(executable: &Path, count: usize) -> std::result::Result<Self, RunError> {
        let sessions = (0..count.max(1))
            .map(|_| {
                exiftool::ExifTool::with_executable(executable)
                    .map(Mutex::new)
                    .map_err(|e| RunError::Spawn(format!("{} ({e})", executable.display())))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            sessions,
            next: AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> std::result::Result<MutexGuard<'_, exiftool::ExifTool>, RunError> {
        for session in &self.sessions {
            if let Ok(guard) = session.try_lock() {
                return Ok(guard);
            }
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        self.sessions[index]
            .lock()
            .map_err(|_| RunError::Failed("exiftool session poisoned".to_string()))
    }
}

impl Runner for SessionRunner {
    fn run(&self, args: &[String]) -> std::result::Result<Vec<u8>, RunError> {
        trace!("exiftool (session) {}", args.join(" "));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let session = self.acquire()?;
        session
            .execute_raw(&args)
            .map_err(|e| RunError::Failed(e.to_string()))
    }

    fn line_based(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::Timestamp;

    fn stamp(input: &str) -> TagValue {
        TagValue::Timestamp(Timestamp::parse(input).expect("timestamp"))
    }

    #[test]
    fn version_check_compares_major_then_minor() {
        assert!(version_at_least("12.40", (12, 0)).is_ok());
        assert!(version_at_least("13.29\n", (13, 29)).is_ok());
        assert!(version_at_least("13.30", (13, 29)).is_ok());
        assert!(version_at_least("13.28", (13, 29)).is_err());
        assert!(version_at_least("11.99", (12, 0)).is_err());
        assert!(version_at_least("garbage", (12, 0)).is_err());
    }

    #[test]
    fn timestamps_go_through_subsec_composite_for_media() {
        let mut tags = TagSet::new();
        tags.insert("DateTimeOriginal", stamp("2024:01:01 12:30:01.050+02:00"));
        tags.insert("Artist", TagValue::Text("Alice".to_string()));

        let args = write_args(Path::new("/c/IMG_0001.jpg"), &tags, false).expect("args");
        assert_eq!(
            args,
            vec![
                "-overwrite_original",
                "-n",
                "-Artist=Alice",
                "-SubSecDateTimeOriginal=2024:01:01 12:30:01.050+02:00",
                "/c/IMG_0001.jpg",
            ]
        );
    }

    #[test]
    fn sidecar_timestamps_are_written_directly() {
        let mut tags = TagSet::new();
        tags.insert("CreateDate", stamp("2024:01:01 12:30:01.5"));
        let args = write_args(Path::new("/c/IMG_0001.jpg.xmp"), &tags, false).expect("args");
        assert!(args.contains(&"-CreateDate=2024:01:01 12:30:01.5".to_string()));
    }

    #[test]
    fn lists_repeat_the_assignment() {
        let mut tags = TagSet::new();
        tags.insert(
            "Subject",
            TagValue::List(vec!["beach".to_string(), "family".to_string()]),
        );
        let args = write_args(Path::new("/c/a.xmp"), &tags, false).expect("args");
        assert!(args.contains(&"-Subject=beach".to_string()));
        assert!(args.contains(&"-Subject=family".to_string()));

        tags.insert("Subject", TagValue::List(Vec::new()));
        let args = write_args(Path::new("/c/a.xmp"), &tags, false).expect("args");
        assert!(args.contains(&"-Subject=".to_string()));
    }

    #[test]
    fn update_summary_counts_only_updated_files() {
        assert_eq!(updated_files(b"    1 image files updated\n"), 1);
        assert_eq!(
            updated_files(b"    0 image files updated\n    1 image files unchanged\n"),
            0
        );
        assert_eq!(updated_files(b""), 0);
    }

    #[test]
    fn line_based_runner_rejects_multiline_values() {
        let mut tags = TagSet::new();
        tags.insert("Description", TagValue::Text("one\ntwo".to_string()));
        assert!(write_args(Path::new("/c/a.xmp"), &tags, true).is_err());
        assert!(write_args(Path::new("/c/a.xmp"), &tags, false).is_ok());
    }

    #[test]
    fn missing_executable_is_a_tool_error() {
        let tool = ExifTool::process("/nonexistent/exiftool", Duration::from_secs(1));
        let err = tool.version().expect_err("must fail");
        assert!(matches!(err, CatalogError::ExternalTool(_)));

        let err = tool
            .read_tags(Path::new("/tmp/a.jpg"))
            .expect_err("must fail");
        assert!(matches!(err, CatalogError::ExternalTool(_)));
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_kills_after_timeout() {
        let runner = ProcessRunner {
            executable: PathBuf::from("sleep"),
            timeout: Duration::from_millis(50),
        };
        let started = Instant::now();
        let err = runner.run(&["5".to_string()]).expect_err("must time out");
        assert!(matches!(err, RunError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_reports_nonzero_exit() {
        let runner = ProcessRunner {
            executable: PathBuf::from("false"),
            timeout: Duration::from_secs(5),
        };
        let err = runner.run(&[]).expect_err("must fail");
        assert!(matches!(err, RunError::Failed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_failure_while_reading_is_a_read_error() {
        let tool = ExifTool::process("false", Duration::from_secs(5));
        let err = tool
            .read_tags(Path::new("/tmp/a.jpg"))
            .expect_err("must fail");
        assert!(matches!(err, CatalogError::Read { .. }));
    }
}
