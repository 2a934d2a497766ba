use std::sync::{Arc, RwLock};

use log::error;

use super::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemDeviceMetrics {
    pub reads: usize,
    pub writes: usize,
    pub flushes: usize,
}

struct MemIoChannel {
    mem: Arc<RwLock<Vec<u8>>>,
    block_size: usize,
    finished_requests: Vec<(usize, IoStatus)>,
    metrics: Arc<RwLock<MemDeviceMetrics>>,
}

impl MemIoChannel {
    fn range(&self, sector_offset: u64, sector_count: u32, mem_len: usize) -> Option<(usize, usize)> {
        let start = sector_offset as usize * self.block_size;
        let end = start + sector_count as usize * self.block_size;
        (end <= mem_len).then_some((start, end))
    }

    fn bump(&self, update: impl FnOnce(&mut MemDeviceMetrics)) {
        match self.metrics.write() {
            Ok(mut metrics) => update(&mut metrics),
            Err(e) => error!("Failed to lock device metrics: {e}"),
        }
    }
}

impl IoChannel for MemIoChannel {
    fn add_read(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize) {
        let status = match self.mem.read() {
            Ok(mem) => match self.range(sector_offset, sector_count, mem.len()) {
                Some((start, end)) => {
                    buf.borrow_mut().as_mut_slice()[..end - start].copy_from_slice(&mem[start..end]);
                    IoStatus::Success
                }
                None => IoStatus::NonRetryable,
            },
            Err(e) => {
                error!("Failed to lock device memory: {e}");
                IoStatus::NonRetryable
            }
        };
        if status.is_success() {
            self.bump(|m| m.reads += 1);
        }
        self.finished_requests.push((id, status));
    }

    fn add_write(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize) {
        let status = match self.mem.write() {
            Ok(mut mem) => match self.range(sector_offset, sector_count, mem.len()) {
                Some((start, end)) => {
                    mem[start..end].copy_from_slice(&buf.borrow().as_slice()[..end - start]);
                    IoStatus::Success
                }
                None => IoStatus::NonRetryable,
            },
            Err(e) => {
                error!("Failed to lock device memory: {e}");
                IoStatus::NonRetryable
            }
        };
        if status.is_success() {
            self.bump(|m| m.writes += 1);
        }
        self.finished_requests.push((id, status));
    }

    fn add_flush(&mut self, id: usize) {
        self.bump(|m| m.flushes += 1);
        self.finished_requests.push((id, IoStatus::Success));
    }

    fn submit(&mut self) -> Result<()> {
        Ok(())
    }

    fn poll(&mut self) -> Vec<(usize, IoStatus)> {
        std::mem::take(&mut self.finished_requests)
    }

    fn busy(&self) -> bool {
        false
    }
}

/// RAM-backed device. Clones share the same backing memory, so a device
/// handed to a crashed controller's engine and to its peer sees one disk.
pub struct MemBlockDevice {
    sector_count: u64,
    block_size: usize,
    pub mem: Arc<RwLock<Vec<u8>>>,
    pub metrics: Arc<RwLock<MemDeviceMetrics>>,
}

impl MemBlockDevice {
    pub fn new(sector_count: u64) -> Self {
        Self::with_block_size(sector_count, BLOCK_SIZE)
    }

    pub fn with_block_size(sector_count: u64, block_size: usize) -> Self {
        MemBlockDevice {
            sector_count,
            block_size,
            mem: Arc::new(RwLock::new(vec![0u8; sector_count as usize * block_size])),
            metrics: Arc::new(RwLock::new(MemDeviceMetrics::default())),
        }
    }

    /// Copies raw bytes out of the backing memory, bypassing any channel.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        if let Ok(mem) = self.mem.read() {
            buf.copy_from_slice(&mem[offset..offset + buf.len()]);
        }
    }

    /// Overwrites raw bytes of the backing memory, bypassing any channel.
    pub fn write(&self, offset: usize, buf: &[u8]) {
        if let Ok(mut mem) = self.mem.write() {
            mem[offset..offset + buf.len()].copy_from_slice(buf);
        }
    }

    pub fn metrics(&self) -> MemDeviceMetrics {
        self.metrics.read().map(|m| *m).unwrap_or_default()
    }
}

impl BlockDevice for MemBlockDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        Ok(Box::new(MemIoChannel {
            mem: self.mem.clone(),
            block_size: self.block_size,
            finished_requests: Vec::new(),
            metrics: self.metrics.clone(),
        }))
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn sector_size(&self) -> usize {
        self.block_size
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        Box::new(MemBlockDevice {
            sector_count: self.sector_count,
            block_size: self.block_size,
            mem: self.mem.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_and_flush_metrics() {
        let device = MemBlockDevice::new(2);
        let mut channel = device.create_channel().unwrap();

        let write_buf = shared_buffer(BLOCK_SIZE, 1);
        write_buf.borrow_mut().as_mut_slice().fill(0x55);
        channel.add_write(1, 1, write_buf, 1);
        channel.add_flush(2);
        channel.submit().unwrap();
        let mut results = channel.poll();
        results.sort_by_key(|(id, _)| *id);
        assert_eq!(results, vec![(1, IoStatus::Success), (2, IoStatus::Success)]);

        let read_buf = shared_buffer(BLOCK_SIZE, 1);
        channel.add_read(1, 1, read_buf.clone(), 3);
        assert_eq!(channel.poll(), vec![(3, IoStatus::Success)]);
        assert!(read_buf.borrow().as_slice().iter().all(|b| *b == 0x55));

        assert_eq!(
            device.metrics(),
            MemDeviceMetrics {
                reads: 1,
                writes: 1,
                flushes: 1,
            }
        );
    }

    #[test]
    fn test_out_of_range_request_fails() {
        let device = MemBlockDevice::new(4);
        let mut channel = device.create_channel().unwrap();
        channel.add_read(3, 2, shared_buffer(BLOCK_SIZE, 2), 9);
        assert_eq!(channel.poll(), vec![(9, IoStatus::NonRetryable)]);
    }

    #[test]
    fn test_clones_share_memory() {
        let device = MemBlockDevice::with_block_size(4, 16);
        let clone = BlockDevice::clone(&device);
        let mut channel = clone.create_channel().unwrap();
        let buf = shared_buffer(16, 1);
        buf.borrow_mut().as_mut_slice().fill(7);
        channel.add_write(2, 1, buf, 0);
        channel.poll();

        let mut raw = [0u8; 16];
        device.read(32, &mut raw);
        assert_eq!(raw, [7u8; 16]);
        assert_eq!(clone.sector_size(), 16);
    }
}
