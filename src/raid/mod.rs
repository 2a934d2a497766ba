//! Stripe geometry, redundancy math and per-position I/O of a raid group.

pub mod block_format;
mod geometry;
pub mod gf;
mod health;
pub mod parity;
mod rebuild;
pub mod row;
mod stripe_io;

pub use geometry::{Positions, RaidGeometry, RaidType, RowLayout, MAX_WIDTH};
pub use health::{PositionHealth, PositionState};
pub use rebuild::rebuild_position;
pub use row::{ChunkRow, KeySel, PositionEpoch, RowKeys};
pub use stripe_io::{PendingWrite, ReadOutcome, StripeIo, WriteBatch, WriteState};
