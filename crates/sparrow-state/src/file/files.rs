use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use error_stack::{IntoReport, ResultExt};

use crate::{Error, Row, StoreDelta, StorePath};

/// The full state of one version.
pub(super) type StateMap = BTreeMap<Row, Row>;

const DELTA_EXTENSION: &str = "delta";
const SNAPSHOT_EXTENSION: &str = "snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum FileKind {
    /// The changes made by the batch which produced the version.
    Delta,
    /// The full state at the version.
    Snapshot,
}

/// A file within the directory of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct StoreFile {
    pub version: i64,
    pub kind: FileKind,
}

impl StoreFile {
    pub fn delta(version: i64) -> Self {
        Self {
            version,
            kind: FileKind::Delta,
        }
    }

    pub fn snapshot(version: i64) -> Self {
        Self {
            version,
            kind: FileKind::Snapshot,
        }
    }

    fn file_name(&self) -> String {
        match self.kind {
            FileKind::Delta => format!("{}.{DELTA_EXTENSION}", self.version),
            FileKind::Snapshot => format!("{}.{SNAPSHOT_EXTENSION}", self.version),
        }
    }

    /// Parse the name of a store file, returning `None` for other files.
    fn parse(file_name: &str) -> Option<Self> {
        let (version, extension) = file_name.split_once('.')?;
        let version = version.parse().ok().filter(|version: &i64| *version >= 0)?;
        match extension {
            DELTA_EXTENSION => Some(Self::delta(version)),
            SNAPSHOT_EXTENSION => Some(Self::snapshot(version)),
            _ => None,
        }
    }
}

/// The delta and snapshot files of one store.
#[derive(Debug)]
pub(super) struct StoreFiles {
    dir: PathBuf,
}

impl StoreFiles {
    pub fn create(dir: PathBuf) -> error_stack::Result<Self, Error> {
        std::fs::create_dir_all(&dir)
            .into_report()
            .change_context(Error::CreateBackend)
            .attach_printable_lazy(|| StorePath::new(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: StoreFile) -> PathBuf {
        self.dir.join(file.file_name())
    }

    pub fn exists(&self, file: StoreFile) -> bool {
        self.path(file).exists()
    }

    /// List the store files, ordered by version.
    pub fn list(&self) -> error_stack::Result<Vec<StoreFile>, Error> {
        let entries = std::fs::read_dir(&self.dir)
            .into_report()
            .change_context(Error::Backend("list"))
            .attach_printable_lazy(|| StorePath::new(&self.dir))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.into_report().change_context(Error::Backend("list"))?;
            if let Some(file) = entry.file_name().to_str().and_then(StoreFile::parse) {
                files.push(file);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Write the delta producing `version`.
    ///
    /// Returns false if the delta file already existed, in which case it is
    /// left unchanged.
    pub fn write_delta(&self, version: i64, delta: &StoreDelta) -> error_stack::Result<bool, Error> {
        let changes: Vec<(&Row, Option<&Row>)> = delta.changes().collect();
        let bytes = bincode::serialize(&changes)
            .into_report()
            .change_context(Error::Serialize)?;
        self.write(StoreFile::delta(version), &bytes)
    }

    /// Read the delta producing `version` as a sequence of puts and removes.
    pub fn read_delta(&self, version: i64) -> error_stack::Result<Vec<(Row, Option<Row>)>, Error> {
        let bytes = self.read(StoreFile::delta(version))?;
        bincode::deserialize(&bytes)
            .into_report()
            .change_context(Error::Deserialize)
            .attach_printable_lazy(|| StorePath::new(&self.path(StoreFile::delta(version))))
    }

    /// Write the full state at `version`.
    pub fn write_snapshot(&self, version: i64, state: &StateMap) -> error_stack::Result<bool, Error> {
        let bytes = bincode::serialize(state)
            .into_report()
            .change_context(Error::Serialize)?;
        self.write(StoreFile::snapshot(version), &bytes)
    }

    pub fn read_snapshot(&self, version: i64) -> error_stack::Result<StateMap, Error> {
        let bytes = self.read(StoreFile::snapshot(version))?;
        bincode::deserialize(&bytes)
            .into_report()
            .change_context(Error::Deserialize)
            .attach_printable_lazy(|| StorePath::new(&self.path(StoreFile::snapshot(version))))
    }

    pub fn delete(&self, file: StoreFile) -> error_stack::Result<(), Error> {
        let path = self.path(file);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .into_report()
                .change_context(Error::Backend("delete"))
                .attach_printable_lazy(|| StorePath::new(&path)),
        }
    }

    fn read(&self, file: StoreFile) -> error_stack::Result<Vec<u8>, Error> {
        let path = self.path(file);
        std::fs::read(&path)
            .into_report()
            .change_context(Error::Backend("read"))
            .attach_printable_lazy(|| StorePath::new(&path))
    }

    /// Write the file through a temporary file, so readers never observe
    /// a partially written file.
    fn write(&self, file: StoreFile, bytes: &[u8]) -> error_stack::Result<bool, Error> {
        let path = self.path(file);

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .into_report()
            .change_context(Error::Backend("write"))
            .attach_printable_lazy(|| StorePath::new(&self.dir))?;
        temp.write_all(bytes)
            .and_then(|_| temp.as_file().sync_all())
            .into_report()
            .change_context(Error::Backend("write"))
            .attach_printable_lazy(|| StorePath::new(temp.path()))?;

        match temp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error)
                .into_report()
                .change_context(Error::Backend("write"))
                .attach_printable_lazy(|| StorePath::new(&path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn test_parse_file_names() {
        assert_eq!(StoreFile::parse("17.delta"), Some(StoreFile::delta(17)));
        assert_eq!(StoreFile::parse("3.snapshot"), Some(StoreFile::snapshot(3)));
        assert_eq!(StoreFile::parse("3.snapshot.tmp"), None);
        assert_eq!(StoreFile::parse(".tmpA8x2"), None);
        assert_eq!(StoreFile::parse("-1.delta"), None);
        assert_eq!(StoreFile::parse("other.delta"), None);
    }

    #[test]
    fn test_existing_delta_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::create(dir.path().join("store")).unwrap();

        let mut first = StoreDelta::default();
        first.put(row![1i64], row!["first"]);
        assert!(files.write_delta(1, &first).unwrap());

        let mut second = StoreDelta::default();
        second.put(row![1i64], row!["second"]);
        second.remove(row![2i64]);
        assert!(!files.write_delta(1, &second).unwrap());

        assert_eq!(
            files.read_delta(1).unwrap(),
            vec![(row![1i64], Some(row!["first"]))]
        );
        // The temporary file of the second write is cleaned up.
        assert_eq!(files.list().unwrap(), vec![StoreFile::delta(1)]);
    }

    #[test]
    fn test_list_orders_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::create(dir.path().to_owned()).unwrap();

        let state: StateMap = [(row![1i64], row!["one"])].into_iter().collect();
        files.write_snapshot(10, &state).unwrap();
        files.write_delta(2, &StoreDelta::default()).unwrap();
        files.write_delta(10, &StoreDelta::default()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(
            files.list().unwrap(),
            vec![
                StoreFile::delta(2),
                StoreFile::delta(10),
                StoreFile::snapshot(10)
            ]
        );
        assert_eq!(files.read_snapshot(10).unwrap(), state);

        files.delete(StoreFile::delta(2)).unwrap();
        files.delete(StoreFile::delta(2)).unwrap();
        assert!(!files.exists(StoreFile::delta(2)));
    }
}
