//! Per-allocation directories and their snapshot archives.
//!
//! Layout under the client's alloc root:
//!
//! ```text
//! <alloc_id>/
//!   alloc/{data,logs,tmp}     shared by every task
//!   <task>/{local,secrets,tmp}
//! ```
//!
//! A snapshot carries `alloc/data` and each task's `local` directory as a
//! gzipped tar archive, with paths relative to the allocation directory.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, info};
use walkdir::WalkDir;
use warpgrid_alloc::{AllocFs, SinkWriter, SnapshotSink};

/// Shared directory name inside an allocation directory.
pub const SHARED_ALLOC_DIR: &str = "alloc";

const SHARED_SUBDIRS: &[&str] = &["data", "logs", "tmp"];
const TASK_SUBDIRS: &[&str] = &["local", "secrets", "tmp"];

type OpenCounts = Arc<Mutex<HashMap<String, usize>>>;

/// Root of every allocation directory on this node.
#[derive(Clone)]
pub struct AllocDirs {
    root: PathBuf,
    open: OpenCounts,
}

impl AllocDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Arc::default(),
        }
    }

    pub fn path(&self, alloc_id: &str) -> PathBuf {
        self.root.join(alloc_id)
    }

    /// Create the directory tree for an allocation and its tasks.
    pub fn build(&self, alloc_id: &str, tasks: &[String]) -> io::Result<PathBuf> {
        let dir = self.path(alloc_id);
        for sub in SHARED_SUBDIRS {
            std::fs::create_dir_all(dir.join(SHARED_ALLOC_DIR).join(sub))?;
        }
        for task in tasks {
            for sub in TASK_SUBDIRS {
                std::fs::create_dir_all(dir.join(task).join(sub))?;
            }
        }
        debug!(%alloc_id, path = %dir.display(), "built allocation directory");
        Ok(dir)
    }

    /// Open a handle on an existing allocation directory.
    pub fn open(&self, alloc_id: &str) -> io::Result<AllocDir> {
        let path = self.path(alloc_id);
        if !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("allocation directory {} does not exist", path.display()),
            ));
        }

        *self
            .lock_open()
            .entry(alloc_id.to_string())
            .or_default() += 1;

        Ok(AllocDir {
            alloc_id: alloc_id.to_string(),
            path,
            open: self.open.clone(),
        })
    }

    /// Remove an allocation directory. Missing directories are ignored.
    ///
    /// Fails with `ResourceBusy` while any handle on the directory is open.
    pub fn destroy(&self, alloc_id: &str) -> io::Result<()> {
        // Held across the removal so no handle opens mid-way.
        let open = self.lock_open();
        if open.get(alloc_id).is_some_and(|count| *count > 0) {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("allocation directory {alloc_id} has open handles"),
            ));
        }

        let path = self.path(alloc_id);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(%alloc_id, "destroyed allocation directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Number of live handles on an allocation directory.
    pub fn open_handles(&self, alloc_id: &str) -> usize {
        self.lock_open().get(alloc_id).copied().unwrap_or_default()
    }

    fn lock_open(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An open allocation directory. The handle is released on drop.
pub struct AllocDir {
    alloc_id: String,
    path: PathBuf,
    open: OpenCounts,
}

impl AllocDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Files carried by a snapshot, as (archive path, disk path), sorted.
    fn snapshot_files(&self) -> io::Result<Vec<(String, PathBuf)>> {
        let mut roots = vec![self.path.join(SHARED_ALLOC_DIR).join("data")];
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.file_name() != SHARED_ALLOC_DIR {
                roots.push(entry.path().join("local"));
            }
        }

        let mut files = Vec::new();
        for root in roots.into_iter().filter(|r| r.is_dir()) {
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(io::Error::other)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&self.path)
                    .map_err(io::Error::other)?;
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((name, entry.path().to_path_buf()));
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Drop for AllocDir {
    fn drop(&mut self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = open.get_mut(&self.alloc_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                open.remove(&self.alloc_id);
            }
        }
    }
}

#[async_trait]
impl AllocFs for AllocDir {
    async fn snapshot(&self, sink: &SnapshotSink) -> io::Result<()> {
        let files = self.snapshot_files()?;
        debug!(alloc_id = %self.alloc_id, files = files.len(), "snapshotting allocation");

        let writer = sink.writer();
        tokio::task::spawn_blocking(move || write_archive(writer, &files))
            .await
            .map_err(io::Error::other)?
    }
}

fn write_archive(writer: SinkWriter, files: &[(String, PathBuf)]) -> io::Result<()> {
    let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
    builder.mode(tar::HeaderMode::Deterministic);
    for (name, path) in files {
        builder.append_path_with_name(path, name)?;
    }
    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()
}

/// Decode a snapshot archive into (path, contents) entries.
pub fn read_snapshot(archive: &[u8]) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        entries.push((name, contents));
    }
    Ok(entries)
}
