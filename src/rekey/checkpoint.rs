use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::nonpaged::NonpagedStore;
use super::shared::RekeySharedState;
use crate::raid::RaidGeometry;
use crate::{rekey_error, Result};

/// Boundary between rekeyed and not yet rekeyed data, in per-position LBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// No rekey in progress.
    Invalid,
    At(u64),
}

impl Checkpoint {
    pub fn lba(self) -> Option<u64> {
        match self {
            Checkpoint::Invalid => None,
            Checkpoint::At(lba) => Some(lba),
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkpoint::Invalid => f.write_str("invalid"),
            Checkpoint::At(lba) => write!(f, "lba {lba}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Admin,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    RedundancyExceeded,
    UnresolvableChunk,
    QuiesceTimeout,
    PagedIo,
    RebuildTimeout,
    CheckpointRegression,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RekeySubstate {
    NotStarted,
    Running,
    Paused(PauseReason),
    Completing,
    Complete,
    Failed(FailReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRekeyState {
    Rekeyed,
    NotRekeyed,
    /// Paged metadata for the chunk is unreadable.
    Ambiguous,
}

/// Side of the checkpoint a per-position LBA falls on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Rekeyed,
    NotRekeyed,
}

/// Owner of a raid group's checkpoint. Every committed value is published
/// to the client channels through the shared state.
#[derive(Debug)]
pub struct CheckpointTracker {
    checkpoint: Checkpoint,
    substate: RekeySubstate,
    chunk_sectors: u64,
    chunk_count: u64,
    persist_interval: u64,
    unpersisted: u64,
    shared: RekeySharedState,
}

impl CheckpointTracker {
    pub fn new(geometry: &RaidGeometry, persist_interval: u64, shared: RekeySharedState) -> Self {
        CheckpointTracker {
            checkpoint: Checkpoint::Invalid,
            substate: RekeySubstate::NotStarted,
            chunk_sectors: geometry.chunk_sectors,
            chunk_count: geometry.chunk_count,
            persist_interval,
            unpersisted: 0,
            shared,
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn substate(&self) -> RekeySubstate {
        self.substate
    }

    pub fn set_substate(&mut self, substate: RekeySubstate) {
        if self.substate != substate {
            info!("Rekey substate {:?} -> {:?}", self.substate, substate);
            self.substate = substate;
        }
    }

    /// Index of the first chunk not yet rekeyed.
    pub fn chunk(&self) -> Option<u64> {
        self.checkpoint.lba().map(|lba| lba / self.chunk_sectors)
    }

    pub fn chunk_lba(&self, chunk: u64) -> u64 {
        chunk * self.chunk_sectors
    }

    pub fn is_complete(&self) -> bool {
        self.chunk() == Some(self.chunk_count)
    }

    fn publish(&mut self, checkpoint: Checkpoint) {
        self.checkpoint = checkpoint;
        self.shared.set_checkpoint(checkpoint);
    }

    /// Places the checkpoint at the start of the raid group.
    pub fn start(&mut self) {
        self.publish(Checkpoint::At(0));
        self.unpersisted = 0;
        self.set_substate(RekeySubstate::Running);
    }

    /// Commits `lba`. Returns whether a persist is due.
    pub fn advance(&mut self, lba: u64) -> Result<bool> {
        let current = self.checkpoint.lba().unwrap_or(0);
        if lba < current {
            return Err(rekey_error!(CheckpointRegression {
                current,
                requested: lba,
            }));
        }
        let moved = (lba - current) / self.chunk_sectors;
        self.publish(Checkpoint::At(lba));
        self.unpersisted += moved;
        debug!("Checkpoint advanced to lba {lba}");
        Ok(self.unpersisted >= self.persist_interval)
    }

    pub fn is_rekeyed(&self, chunk: u64) -> bool {
        self.chunk().is_some_and(|c| chunk < c)
    }

    pub fn chunk_state(&self, chunk: u64) -> ChunkRekeyState {
        if self.is_rekeyed(chunk) {
            ChunkRekeyState::Rekeyed
        } else {
            ChunkRekeyState::NotRekeyed
        }
    }

    /// Restores the checkpoint after a restart. Progress derived from paged
    /// metadata moves it forward past the persisted value, never backward.
    pub fn recover(&mut self, persisted: Checkpoint, derived_lba: u64) -> Checkpoint {
        let checkpoint = match persisted {
            Checkpoint::Invalid => Checkpoint::Invalid,
            Checkpoint::At(lba) if derived_lba > lba => {
                info!("Checkpoint recovered forward from lba {lba} to lba {derived_lba}");
                Checkpoint::At(derived_lba)
            }
            at => at,
        };
        self.publish(checkpoint);
        self.unpersisted = 0;
        checkpoint
    }

    /// Drops the checkpoint once every chunk is on the new key.
    pub fn finish(&mut self) {
        self.publish(Checkpoint::Invalid);
        self.set_substate(RekeySubstate::Complete);
    }

    pub fn persist(&mut self, store: &mut NonpagedStore) -> Result<()> {
        store.record_mut().rekey_checkpoint = self.checkpoint;
        store.write()?;
        self.unpersisted = 0;
        debug!("Persisted checkpoint {}", self.checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raid::RaidType;

    fn tracker(interval: u64) -> (CheckpointTracker, RekeySharedState) {
        let geometry = RaidGeometry::new(RaidType::Raid5, 4, 8, 16).unwrap();
        let shared = RekeySharedState::new(16, 8);
        (CheckpointTracker::new(&geometry, interval, shared.clone()), shared)
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let (mut tracker, shared) = tracker(100);
        tracker.start();
        let mut last = 0;
        for lba in [8, 8, 24, 40, 40, 128] {
            tracker.advance(lba).unwrap();
            assert!(tracker.checkpoint().lba().unwrap() >= last);
            last = lba;
        }
        let err = tracker.advance(32).unwrap_err();
        assert!(matches!(
            err,
            crate::RekeyError::CheckpointRegression {
                current: 128,
                requested: 32,
                ..
            }
        ));
        assert_eq!(tracker.checkpoint(), Checkpoint::At(128));
        assert_eq!(shared.checkpoint(), Checkpoint::At(128));
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_persist_becomes_due_every_interval() {
        let (mut tracker, _) = tracker(3);
        tracker.start();
        assert!(!tracker.advance(8).unwrap());
        assert!(!tracker.advance(16).unwrap());
        assert!(tracker.advance(24).unwrap());
    }

    #[test]
    fn test_chunk_states_follow_checkpoint() {
        let (mut tracker, _) = tracker(1);
        assert_eq!(tracker.chunk_state(0), ChunkRekeyState::NotRekeyed);
        tracker.start();
        tracker.advance(16).unwrap();
        assert_eq!(tracker.chunk_state(2), ChunkRekeyState::NotRekeyed);
        assert_eq!(tracker.chunk_state(1), ChunkRekeyState::Rekeyed);
        assert_eq!(tracker.chunk(), Some(2));
    }

    #[test]
    fn test_recover_never_moves_backward() {
        let (mut tracker, shared) = tracker(1);
        assert_eq!(tracker.recover(Checkpoint::At(32), 16), Checkpoint::At(32));
        assert_eq!(tracker.recover(Checkpoint::At(32), 48), Checkpoint::At(48));
        assert_eq!(shared.checkpoint(), Checkpoint::At(48));
        assert_eq!(tracker.recover(Checkpoint::Invalid, 48), Checkpoint::Invalid);
    }

    #[test]
    fn test_finish_invalidates_checkpoint() {
        let (mut tracker, shared) = tracker(1);
        tracker.start();
        tracker.advance(128).unwrap();
        tracker.finish();
        assert_eq!(tracker.checkpoint(), Checkpoint::Invalid);
        assert_eq!(tracker.substate(), RekeySubstate::Complete);
        assert!(!shared.is_rekeyed(0));
    }
}
