//! Online rekey of a raid group: checkpoint tracking, on-disk progress
//! metadata, incomplete-write recovery, quiesce and the per-raid-group
//! monitor that drives them.

pub mod checkpoint;
pub mod chunk;
pub mod degraded;
pub mod hook;
pub mod iw;
pub mod monitor;
pub mod nonpaged;
pub mod notify;
pub mod paged;
pub mod peer;
pub mod quiesce;
mod shared;

/// First block of the nonpaged record slots on the metadata device.
pub const NONPAGED_BASE_LBA: u64 = 0;
/// First paged metadata block, right after the nonpaged slots.
pub const PAGED_BASE_LBA: u64 = NONPAGED_BASE_LBA + nonpaged::NONPAGED_SLOTS;

pub use checkpoint::{Checkpoint, CheckpointTracker, ChunkRekeyState, FailReason, PauseReason, Region, RekeySubstate};
pub use degraded::{DegradedDecision, DegradedPolicy};
pub use hook::{HookDecision, LogHook, NoopHook, ObservabilityHook, PauseHook, RecordingHook, Transition};
pub use monitor::{Action, LifecycleState, MonitorParams, MonitorPhase, RekeyMonitor, RekeyStatus, RgEvent, Role};
pub use notify::{wait_for_notification, Notification, NotificationService};
pub use peer::{peer_link_pair, PeerCoordinator, PeerEvent, PeerLink, PeerMessage, PeerRekeyView};
pub use quiesce::{QuiesceCoordinator, QuiesceToken};
pub use shared::RekeySharedState;

/// Sectors the metadata device needs for a raid group of `chunk_count`
/// chunks with `chunks_per_paged_block` entries per paged block.
pub fn metadata_sectors(chunk_count: u64, chunks_per_paged_block: u64) -> u64 {
    PAGED_BASE_LBA + chunk_count.div_ceil(chunks_per_paged_block.max(1))
}
