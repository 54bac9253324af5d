use std::path::Path;

use error_stack::{IntoReport, ResultExt};

/// A temporary checkpoint location, deleted when dropped.
pub struct TempCheckpoint {
    dir: tempfile::TempDir,
}

impl TempCheckpoint {
    pub fn try_new() -> crate::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("test_checkpoint")
            .tempdir()
            .into_report()
            .change_context(crate::Error)?;
        Ok(Self { dir })
    }

    /// The path to the checkpoint.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The path to the checkpoint as a string.
    pub fn path_str(&self) -> &str {
        self.dir
            .path()
            .as_os_str()
            .to_str()
            .expect("invalid path")
    }

    /// The names of the files directly within `dir`, in sorted order.
    ///
    /// Hidden files, such as in-progress temporary files, are omitted.
    pub fn file_names(dir: &Path) -> crate::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)
            .into_report()
            .change_context(crate::Error)?
        {
            let entry = entry.into_report().change_context(crate::Error)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
