//! Provenance records for reproducibility audits.
//!
//! A [`Provenance`] log holds a stack of running activities and the list of
//! finished ones. Tools start one activity per run, attach the resolved
//! configuration, input and output file records, and failure counters, then
//! finish it with a status. The finished list is what gets stored in every
//! output's metadata.
//!
//! # Activity Flow
//!
//! ```text
//! start_activity("process")
//!    │
//!    ├── add_config(resolved tree)
//!    ├── add_input_file(path)   (size + SHA-256)
//!    ├── set_counter("n_events", ..)
//!    ├── add_output_file(path)
//!    │
//! finish_activity(Completed | CompletedWithWarnings | Interrupted | Failed)
//! ```
//!
//! There is no global instance; the log lives in the run context of one run.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

/// Final status of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Still running.
    Running,
    /// Finished without per-event failures.
    Completed,
    /// Finished with some per-event failures.
    CompletedWithWarnings,
    /// Stopped early on request; outputs are valid but partial.
    Interrupted,
    /// Aborted by a fatal error.
    Failed,
}

/// Identity of one file read or written by an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path as given.
    pub path: String,
    /// Total size in bytes (summed over all files for a directory).
    pub size_bytes: Option<u64>,
    /// SHA-256 of the content. For a directory, one digest over every file
    /// below it in sorted relative-path order, each preceded by its path.
    pub sha256: Option<String>,
}

impl FileRecord {
    /// Describe a path, hashing its content when it is a file or directory.
    pub fn describe(path: &Path) -> Self {
        let display_path = path.display().to_string();
        let hashed = if path.is_file() {
            Some(hash_file(path))
        } else if path.is_dir() {
            Some(hash_dir(path))
        } else {
            None
        };
        match hashed {
            Some(Ok((size, digest))) => Self {
                path: display_path,
                size_bytes: Some(size),
                sha256: Some(digest),
            },
            Some(Err(e)) => {
                warn!(path = %display_path, error = %e, "Cannot hash file for provenance");
                Self {
                    path: display_path,
                    size_bytes: None,
                    sha256: None,
                }
            }
            None => Self {
                path: display_path,
                size_bytes: None,
                sha256: None,
            },
        }
    }
}

fn hex(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Feed the content of `path` into `hasher`, returning the byte count.
fn update_from_file(hasher: &mut Sha256, path: &Path) -> std::io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok(size)
}

fn hash_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let size = update_from_file(&mut hasher, path)?;
    Ok((size, hex(hasher)))
}

fn hash_dir(root: &Path) -> std::io::Result<(u64, String)> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    let mut relative: Vec<(String, PathBuf)> = files
        .into_iter()
        .map(|file| {
            let name = file
                .strip_prefix(root)
                .unwrap_or(&file)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            (name, file)
        })
        .collect();
    relative.sort();

    let mut hasher = Sha256::new();
    let mut total = 0;
    for (name, file) in &relative {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        let size = update_from_file(&mut hasher, file)?;
        hasher.update(size.to_le_bytes());
        total += size;
    }
    Ok((total, hex(hasher)))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Machine and software the activity ran on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Software package name.
    pub software: String,
    /// Software version.
    pub version: String,
    /// Host name, if available.
    pub hostname: Option<String>,
    /// Operating system.
    pub os: String,
    /// CPU architecture.
    pub arch: String,
    /// Command line of the process.
    pub command_line: Vec<String>,
}

impl SystemInfo {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self {
            software: "cta-pipe".into(),
            version: crate::SOFTWARE_VERSION.into(),
            hostname: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().into_owned()),
            os: std::env::consts::OS.into(),
            arch: std::env::consts::ARCH.into(),
            command_line: std::env::args().collect(),
        }
    }
}

/// One unit of work (a tool run, a merge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Activity name, e.g. `"process"`.
    pub activity_name: String,
    /// Unique id.
    pub activity_uuid: Uuid,
    /// Start time.
    pub start: DateTime<Utc>,
    /// Stop time, once finished.
    pub stop: Option<DateTime<Utc>>,
    /// Status.
    pub status: ActivityStatus,
    /// Environment.
    pub system: SystemInfo,
    /// Fully resolved configuration.
    pub config: Option<Value>,
    /// Files read.
    pub input: Vec<FileRecord>,
    /// Files written.
    pub output: Vec<FileRecord>,
    /// Run counters (events processed, failures per stage and kind, ...).
    pub counters: BTreeMap<String, Value>,
}

impl Activity {
    fn start(name: &str) -> Self {
        Self {
            activity_name: name.to_string(),
            activity_uuid: Uuid::new_v4(),
            start: Utc::now(),
            stop: None,
            status: ActivityStatus::Running,
            system: SystemInfo::capture(),
            config: None,
            input: Vec::new(),
            output: Vec::new(),
            counters: BTreeMap::new(),
        }
    }
}

/// Activity log of one run.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    running: Vec<Activity>,
    finished: Vec<Activity>,
}

impl Provenance {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a nested activity and return its id.
    pub fn start_activity(&mut self, name: &str) -> Uuid {
        let activity = Activity::start(name);
        let id = activity.activity_uuid;
        debug!(activity = name, uuid = %id, "Provenance activity started");
        self.running.push(activity);
        id
    }

    /// Innermost running activity.
    pub fn current(&self) -> Option<&Activity> {
        self.running.last()
    }

    fn current_mut(&mut self) -> Option<&mut Activity> {
        let current = self.running.last_mut();
        if current.is_none() {
            warn!("Provenance update without a running activity is ignored");
        }
        current
    }

    /// Record the resolved configuration of the current activity.
    pub fn add_config(&mut self, config: Value) {
        if let Some(a) = self.current_mut() {
            a.config = Some(config);
        }
    }

    /// Record an input file.
    pub fn add_input_file(&mut self, path: &Path) {
        let record = FileRecord::describe(path);
        if let Some(a) = self.current_mut() {
            a.input.push(record);
        }
    }

    /// Record an output file. Outputs are described when the activity
    /// finishes, once their content is final.
    pub fn add_output_file(&mut self, path: &Path) {
        let record = FileRecord {
            path: path.display().to_string(),
            size_bytes: None,
            sha256: None,
        };
        if let Some(a) = self.current_mut() {
            a.output.push(record);
        }
    }

    /// Set a counter of the current activity.
    pub fn set_counter(&mut self, key: &str, value: impl Into<Value>) {
        if let Some(a) = self.current_mut() {
            a.counters.insert(key.to_string(), value.into());
        }
    }

    /// Finish the innermost activity. Output records are refreshed with
    /// their final size.
    pub fn finish_activity(&mut self, status: ActivityStatus) -> Option<&Activity> {
        let mut activity = self.running.pop()?;
        activity.stop = Some(Utc::now());
        activity.status = status;
        for record in &mut activity.output {
            let described = FileRecord::describe(Path::new(&record.path));
            record.size_bytes = described.size_bytes;
            record.sha256 = described.sha256;
        }
        debug!(
            activity = %activity.activity_name,
            status = ?status,
            "Provenance activity finished"
        );
        self.finished.push(activity);
        self.finished.last()
    }

    /// Run `f` inside a named activity, finishing it as completed or failed
    /// depending on the result.
    pub fn activity<T, E>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        self.start_activity(name);
        let result = f(self);
        let status = if result.is_ok() {
            ActivityStatus::Completed
        } else {
            ActivityStatus::Failed
        };
        self.finish_activity(status);
        result
    }

    /// Finished activities, oldest first.
    pub fn finished(&self) -> &[Activity] {
        &self.finished
    }

    /// Finished activities as JSON.
    pub fn as_json(&self) -> Value {
        serde_json::to_value(&self.finished).unwrap_or(Value::Null)
    }
}
