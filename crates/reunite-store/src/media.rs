//! Reference images on disk, addressed by content digest.

use reunite_core::ImageUpload;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

pub struct MediaDir {
    root: PathBuf,
}

impl MediaDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write an upload under its store-relative location.
    ///
    /// The file is written to a temporary sibling and renamed into place, so a
    /// reader never sees a partial image. Identical content is written once.
    pub fn put(&self, upload: &ImageUpload) -> io::Result<String> {
        let location = upload.location();
        let path = self.resolve(&location)?;
        if path.exists() {
            return Ok(location);
        }
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "image path has no parent"))?;
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&upload.bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(location)
    }

    pub fn read(&self, location: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(location)?)
    }

    /// Delete a stored image. Missing files are not an error.
    pub fn remove(&self, location: &str) -> io::Result<()> {
        match std::fs::remove_file(self.resolve(location)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Join a stored location onto the root, refusing anything that could
    /// escape it.
    fn resolve(&self, location: &str) -> io::Result<PathBuf> {
        let relative = Path::new(location);
        let safe = relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe || location.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("image location escapes media root: {location}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}
