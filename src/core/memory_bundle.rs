//! Single resident chunk presented as a bundle
//!
//! The memory is already relocated, so it is handed to the handlers as a
//! shared block without copying, decompressing or fixing anything up.
//! Dropping the delivered block never frees the caller's memory beyond the
//! reference it holds on the [`Bytes`].

use crate::block::ResourceBlock;
use crate::error::{BundleError, Result};
use crate::header::AddressWidth;
use crate::reader::{ChunkInfo, ChunkSource, Handlers, LoadedChunk, ReadOutcome};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct InMemoryBundle {
    type_id: u32,
    version_major: u16,
    version_minor: u16,
    name: String,
    data: Bytes,
    width: AddressWidth,
    user_data: u64,
}

impl InMemoryBundle {
    pub fn new(
        type_id: u32,
        version_major: u16,
        version_minor: u16,
        name: impl Into<String>,
        data: Bytes,
    ) -> Self {
        InMemoryBundle {
            type_id,
            version_major,
            version_minor,
            name: name.into(),
            data,
            width: AddressWidth::host(),
            user_data: 0,
        }
    }

    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ChunkSource for InMemoryBundle {
    fn directory_count(&mut self) -> Result<usize> {
        Ok(1)
    }

    fn read(&mut self, name: &str, handlers: &Handlers<'_>) -> Result<ReadOutcome> {
        if !name.is_empty() && name != self.name {
            return Err(BundleError::NotFound);
        }
        let Some(stages) = handlers.stages(self.type_id) else {
            return Err(BundleError::NotFound);
        };

        let mut block = ResourceBlock::from_shared(self.data.clone(), self.width);
        for (stage, slot) in stages.iter().enumerate() {
            let Some(handler) = slot else { continue };
            if handler.extra_memory() > 0 {
                warn!(
                    "Stage {} of type {} asks for extra memory, resident chunks have none",
                    stage, self.type_id
                );
            }
            block.enter_stage(stage);
            let info = ChunkInfo {
                name: &self.name,
                type_id: self.type_id,
                stage,
                version_major: self.version_major,
                version_minor: self.version_minor,
            };
            if !handler.process(&info, &mut block) {
                return Err(BundleError::Rejected(format!(
                    "Stage {} rejected resident chunk '{}'",
                    stage, self.name
                )));
            }
        }

        debug!("Delivered resident chunk '{}' ({} bytes)", self.name, self.data.len());
        Ok(ReadOutcome {
            user_data: self.user_data,
            chunks: vec![LoadedChunk {
                name: self.name.clone(),
                type_id: self.type_id,
                version_major: self.version_major,
                version_minor: self.version_minor,
                block: Arc::new(block),
            }],
            skipped: 0,
            rejected: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(_: &ChunkInfo<'_>, _: &mut ResourceBlock) -> bool {
        true
    }

    #[test]
    fn test_single_entry() {
        let data = Bytes::from_static(b"resident\0");
        let mut bundle = InMemoryBundle::new(5, 2, 1, "shader", data.clone());
        assert_eq!(bundle.directory_count().unwrap(), 1);

        let handlers = Handlers::new().with(5, accept);
        let outcome = bundle.read("", &handlers).unwrap();
        let chunk = &outcome.chunks[0];
        assert_eq!(chunk.name, "shader");
        assert_eq!((chunk.version_major, chunk.version_minor), (2, 1));
        assert!(chunk.block.is_shared());
        assert_eq!(chunk.block.data().as_ptr(), data.as_ptr());

        assert!(bundle.read("shader", &handlers).is_ok());
    }

    #[test]
    fn test_mismatch_is_not_found() {
        let mut bundle = InMemoryBundle::new(5, 1, 0, "shader", Bytes::from_static(b"x"));
        let handlers = Handlers::new().with(5, accept);
        assert!(matches!(bundle.read("other", &handlers), Err(BundleError::NotFound)));

        let wrong_type = Handlers::new().with(6, accept);
        assert!(matches!(bundle.read("", &wrong_type), Err(BundleError::NotFound)));
    }
}
