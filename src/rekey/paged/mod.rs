//! Per-chunk paged metadata: on-disk format, store, scanner and the
//! reconstruction state machine.

mod entry;
mod scanner;
mod store;

pub use entry::{PagedBlock, PagedEntry, ENTRY_SIZE, MAX_CHUNKS_PER_BLOCK};
pub use scanner::{
    probe_chunk, reconstruct_block, scan, PagedReconstructor, ReconstructContext, ReconstructPhase, RecoveryOutcome,
    ScanReport,
};
pub use store::PagedStore;
