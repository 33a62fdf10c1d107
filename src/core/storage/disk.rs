//! Bundles stored as files under a root directory

use super::Storage;
use crate::block::BlockAllocator;
use crate::error::{BundleError, Result};
use crate::name::ResourceName;
use crate::reader::{BundleReader, ChunkSource, Handlers, ReadOutcome};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// `prefix$path/to/bundle$chunk` → `<root>/path/to/bundle<extension>`
#[derive(Debug, Clone)]
pub struct DiskStorage {
    prefix: String,
    root: PathBuf,
    extension: Option<String>,
    mmap: bool,
}

impl DiskStorage {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        DiskStorage {
            prefix: prefix.into(),
            root: root.into(),
            extension: None,
            mmap: false,
        }
    }

    /// Append `extension` (with or without the dot) to every bundle path
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        let extension = extension.trim_start_matches('.');
        self.extension = (!extension.is_empty()).then(|| extension.to_string());
        self
    }

    pub fn with_mmap(mut self, mmap: bool) -> Self {
        self.mmap = mmap;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing the bundle part of `name`
    pub fn path_for(&self, name: &ResourceName<'_>) -> Result<PathBuf> {
        let relative = Path::new(name.name());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(BundleError::InvalidName(name.to_string()));
        }

        let mut path = self.root.join(relative);
        if let Some(extension) = &self.extension {
            let mut file_name = path.file_name().unwrap_or_default().to_os_string();
            file_name.push(".");
            file_name.push(extension);
            path.set_file_name(file_name);
        }
        Ok(path)
    }
}

impl Storage for DiskStorage {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn read(
        &self,
        name: &ResourceName<'_>,
        handlers: &Handlers<'_>,
        allocator: Arc<dyn BlockAllocator>,
    ) -> Result<ReadOutcome> {
        let path = self.path_for(name)?;
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BundleError::NotFound,
            _ => BundleError::Io(e),
        })?;
        debug!("Reading {} from {}", name, path.display());

        if self.mmap {
            // SAFETY: the mapping is read-only and bundles are not rewritten in place
            let map = unsafe { Mmap::map(&file)? };
            BundleReader::new(Cursor::new(map))?
                .with_allocator(allocator)
                .read(name.subobject(), handlers)
        } else {
            BundleReader::new(BufReader::new(file))?
                .with_allocator(allocator)
                .read(name.subobject(), handlers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_mapping() {
        let storage = DiskStorage::new("disk", "/data").with_extension(".rbdl");
        let path = storage.path_for(&ResourceName::new("disk$levels/one$mesh")).unwrap();
        assert_eq!(path, PathBuf::from("/data/levels/one.rbdl"));

        let plain = DiskStorage::new("disk", "/data");
        assert_eq!(
            plain.path_for(&ResourceName::new("bob")).unwrap(),
            PathBuf::from("/data/bob")
        );
    }

    #[test]
    fn test_path_escape_rejected() {
        let storage = DiskStorage::new("disk", "/data");
        assert!(storage.path_for(&ResourceName::new("disk$../etc/passwd")).is_err());
        assert!(storage.path_for(&ResourceName::new("disk$/etc/passwd")).is_err());
    }
}
