#![no_main]
use libfuzzer_sys::fuzz_target;
use resbundle::{BundleReader, ChunkInfo, ChunkSource, Handlers, ResourceBlock, ResourceHandle};
use std::io::Cursor;

// Any byte string must load or fail with an error, never panic
fuzz_target!(|data: &[u8]| {
    let Ok(mut reader) = BundleReader::new(Cursor::new(data)) else {
        return;
    };
    let _ = reader.directory();

    let inspect = |_: &ChunkInfo<'_>, block: &mut ResourceBlock| {
        for offset in (0..block.data().len()).step_by(8) {
            let _ = block.follow_str(offset);
            let _ = ResourceHandle::read_link(block, offset);
        }
        true
    };
    let handlers = (0..16).fold(Handlers::new(), |handlers, type_id| handlers.with(type_id, &inspect));
    let _ = reader.read("", &handlers);
});
