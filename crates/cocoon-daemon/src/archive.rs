//! Release source archiving.
//!
//! The archiver owns one outbound stream per object. Writers stage
//! into a temporary file and claim the final name only at commit;
//! concurrent attempts for the same object race on that claim and the
//! loser fails without leaving a partial object behind.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use cocoon_core::error::{ApiError, ErrorCode};
use thiserror::Error;
use uuid::Uuid;

/// Archive object name for a release of a cocoon.
#[must_use]
pub fn archive_object_name(cocoon_id: &str, version_id: &str) -> String {
    format!("{cocoon_id}_{version_id}.tar.gz")
}

/// Errors from archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// I/O failure against the backing blob store.
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The object name is already committed.
    #[error("archive object '{name}' already exists")]
    AlreadyExists {
        /// The contested object name.
        name: String,
    },

    /// Commit was called before any write opened the stream.
    #[error("archive writer was never initialized")]
    WriterNotInitialized,
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        Self::new(ErrorCode::ArchiveFailed, err.to_string())
    }
}

/// A single-object write stream.
pub trait ObjectWriter: Send {
    /// Appends a chunk to the staged object.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk cannot be staged.
    fn write(&mut self, chunk: &[u8]) -> Result<(), ArchiveError>;

    /// Seals the object under its final name.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::AlreadyExists`] when another writer
    /// committed the name first.
    fn commit(self: Box<Self>) -> Result<(), ArchiveError>;

    /// Discards the staged object.
    fn abort(self: Box<Self>);
}

/// A blob store addressed by object name.
pub trait ObjectStore: Send + Sync {
    /// Opens a write stream for an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    fn open(&self, name: &str) -> Result<Box<dyn ObjectWriter>, ArchiveError>;
}

/// Filesystem-backed blob store.
///
/// Objects are directory entries; staging files carry a random suffix
/// so concurrent writers never collide before commit.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    dir: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `dir`, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of a committed object, if it exists.
    #[must_use]
    pub fn object_path(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        path.exists().then_some(path)
    }
}

impl ObjectStore for FsObjectStore {
    fn open(&self, name: &str) -> Result<Box<dyn ObjectWriter>, ArchiveError> {
        let staging = self.dir.join(format!(".{name}.{}.partial", Uuid::new_v4()));
        let file = File::create(&staging)?;
        Ok(Box::new(FsObjectWriter {
            file,
            staging,
            target: self.dir.join(name),
            name: name.to_string(),
        }))
    }
}

struct FsObjectWriter {
    file: File,
    staging: PathBuf,
    target: PathBuf,
    name: String,
}

impl ObjectWriter for FsObjectWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), ArchiveError> {
        self.file.write_all(chunk)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), ArchiveError> {
        self.file.flush()?;
        self.file.sync_all()?;
        // hard_link claims the final name and publishes the content in
        // one step, so the name never exists without its bytes; the
        // loser of a concurrent race fails here.
        match std::fs::hard_link(&self.staging, &self.target) {
            Ok(()) => {
                let _ = std::fs::remove_file(&self.staging);
                Ok(())
            },
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = std::fs::remove_file(&self.staging);
                Err(ArchiveError::AlreadyExists {
                    name: self.name.clone(),
                })
            },
            Err(err) => Err(err.into()),
        }
    }

    fn abort(self: Box<Self>) {
        let _ = std::fs::remove_file(&self.staging);
    }
}

/// Lazily opened write stream for one archive object.
///
/// The underlying writer is opened on the first chunk; committing a
/// sink that never received a chunk is an error, which distinguishes
/// "empty archive" from "forgot to archive".
pub struct ArchiveSink<'a> {
    store: &'a dyn ObjectStore,
    name: String,
    writer: Option<Box<dyn ObjectWriter>>,
}

impl<'a> ArchiveSink<'a> {
    /// Creates a sink for the named object.
    #[must_use]
    pub fn new(store: &'a dyn ObjectStore, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            writer: None,
        }
    }

    /// Appends a chunk, opening the stream on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if opening or staging fails.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), ArchiveError> {
        if self.writer.is_none() {
            self.writer = Some(self.store.open(&self.name)?);
        }
        self.writer
            .as_mut()
            .expect("writer opened above")
            .write(chunk)
    }

    /// Seals the object.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::WriterNotInitialized`] if no chunk was
    /// ever written.
    pub fn commit(self) -> Result<(), ArchiveError> {
        self.writer
            .ok_or(ArchiveError::WriterNotInitialized)?
            .commit()
    }

    /// Discards the staged object, if any.
    pub fn abort(self) {
        if let Some(writer) = self.writer {
            writer.abort();
        }
    }
}

/// Stages and seals a whole payload in one call.
///
/// # Errors
///
/// Propagates staging and commit errors; on failure nothing is left
/// under the final object name.
pub fn archive_payload(
    store: &dyn ObjectStore,
    name: &str,
    payload: &[u8],
) -> Result<(), ArchiveError> {
    let mut sink = ArchiveSink::new(store, name);
    if let Err(err) = sink.write(payload) {
        sink.abort();
        return Err(err);
    }
    sink.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("archives")).unwrap();
        (dir, store)
    }

    #[test]
    fn object_names_embed_cocoon_and_version() {
        assert_eq!(archive_object_name("C1", "V1"), "C1_V1.tar.gz");
    }

    #[test]
    fn write_then_commit_produces_the_object() {
        let (_dir, store) = store();
        let name = archive_object_name("c1", "v1");
        archive_payload(&store, &name, b"tarball bytes").unwrap();
        let path = store.object_path(&name).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"tarball bytes");
    }

    #[test]
    fn commit_leaves_only_the_final_object() {
        let (_dir, store) = store();
        let name = archive_object_name("c1", "v1");
        archive_payload(&store, &name, b"tarball bytes").unwrap();
        let entries: Vec<_> = std::fs::read_dir(store.dir.as_path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(name)]);
    }

    #[test]
    fn commit_before_write_is_rejected() {
        let (_dir, store) = store();
        let sink = ArchiveSink::new(&store, "c1_v1.tar.gz");
        assert!(matches!(
            sink.commit(),
            Err(ArchiveError::WriterNotInitialized)
        ));
    }

    #[test]
    fn second_commit_for_same_name_loses() {
        let (_dir, store) = store();
        let name = archive_object_name("c1", "v1");
        archive_payload(&store, &name, b"first").unwrap();
        let err = archive_payload(&store, &name, b"second").unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyExists { .. }));
        // The winner's content survives untouched.
        let path = store.object_path(&name).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"first");
    }

    #[test]
    fn abort_leaves_no_partial_object() {
        let (_dir, store) = store();
        let mut sink = ArchiveSink::new(&store, "c1_v1.tar.gz");
        sink.write(b"partial").unwrap();
        sink.abort();
        assert!(store.object_path("c1_v1.tar.gz").is_none());
        // Staging leftovers are cleaned up too.
        let entries: Vec<_> = std::fs::read_dir(store.dir.as_path())
            .unwrap()
            .collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn concurrent_writers_leave_exactly_one_object() {
        let (_dir, store) = store();
        let name = archive_object_name("c1", "v1");
        let results: Vec<_> = std::thread::scope(|scope| {
            (0..4)
                .map(|i| {
                    let store = &store;
                    let name = name.clone();
                    scope.spawn(move || archive_payload(store, &name, format!("w{i}").as_bytes()))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ArchiveError::AlreadyExists { .. })))
                .count(),
            3
        );
        assert!(store.object_path(&name).is_some());
    }
}
