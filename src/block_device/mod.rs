use crate::utils::SectorBuf;
use crate::Result;
use std::{cell::RefCell, rc::Rc};

/// On-disk block size of every device the engine talks to: 512 bytes of
/// payload followed by 16 bytes of integrity metadata.
pub const BLOCK_SIZE: usize = 528;

/// Logical sector size exposed to clients of a raid group.
pub const SECTOR_SIZE: usize = 512;

pub type SharedBuffer = Rc<RefCell<SectorBuf>>;

pub fn shared_buffer(block_size: usize, block_count: usize) -> SharedBuffer {
    Rc::new(RefCell::new(SectorBuf::new(block_size, block_count)))
}

/// Completion status of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    /// Transient failure; the same request may succeed if reissued.
    Retryable,
    /// The device will not complete this request; the position is suspect.
    NonRetryable,
    /// The data read back carries the invalidated pattern.
    Invalidated,
}

impl IoStatus {
    pub fn is_success(self) -> bool {
        self == IoStatus::Success
    }
}

pub trait IoChannel {
    fn add_read(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize);
    fn add_write(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize);
    fn add_flush(&mut self, id: usize);
    fn submit(&mut self) -> Result<()>;

    fn poll(&mut self) -> Vec<(usize, IoStatus)>;
    fn busy(&self) -> bool;
}

pub trait BlockDevice: Send + Sync {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>>;
    fn sector_count(&self) -> u64;
    fn clone(&self) -> Box<dyn BlockDevice>;

    fn sector_size(&self) -> usize {
        BLOCK_SIZE
    }
}

impl Clone for Box<dyn BlockDevice> {
    fn clone(&self) -> Box<dyn BlockDevice> {
        self.as_ref().clone()
    }
}

mod bdev_faulty;
mod bdev_mem;
mod bdev_raid;
mod wait_for_completion;

pub use bdev_faulty::{FaultErrorType, FaultOpcode, FaultRecord, FaultyBlockDevice};
pub use bdev_mem::{MemBlockDevice, MemDeviceMetrics};
pub use bdev_raid::RaidGroupDevice;
pub use wait_for_completion::{wait_for_completion, wait_for_status};
