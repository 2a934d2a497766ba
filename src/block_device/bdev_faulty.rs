use std::ops::Range;
use std::sync::{Arc, Mutex};

use log::{debug, error};

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOpcode {
    Read,
    Write,
    Flush,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultErrorType {
    Retryable,
    NonRetryable,
    /// The request is held without completing until the record is disabled.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub opcode: FaultOpcode,
    pub lba: Range<u64>,
    pub error_type: FaultErrorType,
    /// `None` keeps injecting until the record is disabled.
    pub times_to_insert: Option<u32>,
    pub hits: u32,
    pub enabled: bool,
}

impl FaultRecord {
    pub fn new(opcode: FaultOpcode, lba: Range<u64>, error_type: FaultErrorType, times: u32) -> Self {
        FaultRecord {
            opcode,
            lba,
            error_type,
            times_to_insert: Some(times),
            hits: 0,
            enabled: true,
        }
    }

    pub fn always(opcode: FaultOpcode, lba: Range<u64>, error_type: FaultErrorType) -> Self {
        FaultRecord {
            times_to_insert: None,
            ..Self::new(opcode, lba, error_type, 0)
        }
    }

    fn matches(&self, opcode: FaultOpcode, lba: &Range<u64>) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(limit) = self.times_to_insert {
            if self.hits >= limit {
                return false;
            }
        }
        let opcode_matches = self.opcode == FaultOpcode::Any || self.opcode == opcode;
        let overlaps = if opcode == FaultOpcode::Flush {
            true
        } else {
            lba.start < self.lba.end && self.lba.start < lba.end
        };
        opcode_matches && overlaps
    }
}

#[derive(Default)]
struct FaultState {
    records: Vec<FaultRecord>,
    dead: bool,
}

impl FaultState {
    fn evaluate(&mut self, opcode: FaultOpcode, lba: &Range<u64>) -> Option<FaultErrorType> {
        if self.dead {
            return Some(FaultErrorType::NonRetryable);
        }
        let record = self.records.iter_mut().find(|r| r.matches(opcode, lba))?;
        record.hits += 1;
        Some(record.error_type)
    }

    fn still_dropping(&self, opcode: FaultOpcode, lba: &Range<u64>) -> bool {
        self.records.iter().any(|r| {
            r.enabled
                && r.error_type == FaultErrorType::Dropped
                && (r.opcode == FaultOpcode::Any || r.opcode == opcode)
                && lba.start < r.lba.end
                && r.lba.start < lba.end
        })
    }
}

enum HeldRequest {
    Read(u64, u32, SharedBuffer, usize),
    Write(u64, u32, SharedBuffer, usize),
    Flush(usize),
}

impl HeldRequest {
    fn opcode(&self) -> FaultOpcode {
        match self {
            HeldRequest::Read(..) => FaultOpcode::Read,
            HeldRequest::Write(..) => FaultOpcode::Write,
            HeldRequest::Flush(_) => FaultOpcode::Flush,
        }
    }

    fn lba(&self) -> Range<u64> {
        match self {
            HeldRequest::Read(offset, count, ..) | HeldRequest::Write(offset, count, ..) => {
                *offset..*offset + *count as u64
            }
            HeldRequest::Flush(_) => 0..u64::MAX,
        }
    }

    fn issue(self, inner: &mut dyn IoChannel) {
        match self {
            HeldRequest::Read(offset, count, buf, id) => inner.add_read(offset, count, buf, id),
            HeldRequest::Write(offset, count, buf, id) => inner.add_write(offset, count, buf, id),
            HeldRequest::Flush(id) => inner.add_flush(id),
        }
    }

    fn id(&self) -> usize {
        match self {
            HeldRequest::Read(.., id) | HeldRequest::Write(.., id) | HeldRequest::Flush(id) => *id,
        }
    }
}

pub struct FaultyIoChannel {
    inner: Box<dyn IoChannel>,
    state: Arc<Mutex<FaultState>>,
    pending: Vec<(usize, IoStatus)>,
    held: Vec<HeldRequest>,
}

impl FaultyIoChannel {
    fn dispatch(&mut self, request: HeldRequest) {
        let decision = match self.state.lock() {
            Ok(mut state) => state.evaluate(request.opcode(), &request.lba()),
            Err(e) => {
                error!("Failed to lock fault state: {e}");
                Some(FaultErrorType::NonRetryable)
            }
        };
        match decision {
            None => request.issue(self.inner.as_mut()),
            Some(FaultErrorType::Retryable) => self.pending.push((request.id(), IoStatus::Retryable)),
            Some(FaultErrorType::NonRetryable) => {
                self.pending.push((request.id(), IoStatus::NonRetryable))
            }
            Some(FaultErrorType::Dropped) => {
                debug!("Dropping request {}", request.id());
                self.held.push(request);
            }
        }
    }

    fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let Ok(state) = self.state.lock() else {
            return;
        };
        let (still_held, released): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|r| state.still_dropping(r.opcode(), &r.lba()));
        drop(state);
        self.held = still_held;
        for request in released {
            request.issue(self.inner.as_mut());
        }
    }
}

impl IoChannel for FaultyIoChannel {
    fn add_read(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize) {
        self.dispatch(HeldRequest::Read(sector_offset, sector_count, buf, id));
    }

    fn add_write(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize) {
        self.dispatch(HeldRequest::Write(sector_offset, sector_count, buf, id));
    }

    fn add_flush(&mut self, id: usize) {
        self.dispatch(HeldRequest::Flush(id));
    }

    fn submit(&mut self) -> Result<()> {
        self.inner.submit()
    }

    fn poll(&mut self) -> Vec<(usize, IoStatus)> {
        self.release_held();
        let mut results = std::mem::take(&mut self.pending);
        results.extend(self.inner.poll());
        results
    }

    fn busy(&self) -> bool {
        self.inner.busy()
    }
}

/// Wraps another device and turns matching requests into retryable,
/// non-retryable or dropped completions.
pub struct FaultyBlockDevice {
    inner: Box<dyn BlockDevice>,
    state: Arc<Mutex<FaultState>>,
}

impl FaultyBlockDevice {
    pub fn new(inner: Box<dyn BlockDevice>) -> Self {
        FaultyBlockDevice {
            inner,
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Registers a record and returns its handle for later inspection.
    pub fn inject(&self, record: FaultRecord) -> usize {
        match self.state.lock() {
            Ok(mut state) => {
                state.records.push(record);
                state.records.len() - 1
            }
            Err(e) => {
                error!("Failed to lock fault state: {e}");
                usize::MAX
            }
        }
    }

    /// Disables every record; dropped requests complete on their channel's
    /// next poll.
    pub fn disable_all(&self) {
        if let Ok(mut state) = self.state.lock() {
            for record in state.records.iter_mut() {
                record.enabled = false;
            }
        }
    }

    pub fn hits(&self, handle: usize) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.records.get(handle).map(|r| r.hits))
            .unwrap_or(0)
    }

    /// Fails every future request, as a pulled drive would.
    pub fn kill(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.dead = true;
        }
    }

    pub fn revive(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.dead = false;
        }
    }
}

impl BlockDevice for FaultyBlockDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        Ok(Box::new(FaultyIoChannel {
            inner: self.inner.create_channel()?,
            state: self.state.clone(),
            pending: Vec::new(),
            held: Vec::new(),
        }))
    }

    fn sector_count(&self) -> u64 {
        self.inner.sector_count()
    }

    fn sector_size(&self) -> usize {
        self.inner.sector_size()
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        Box::new(FaultyBlockDevice {
            inner: self.inner.clone(),
            state: self.state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_block(channel: &mut dyn IoChannel, lba: u64, fill: u8, id: usize) {
        let buf = shared_buffer(BLOCK_SIZE, 1);
        buf.borrow_mut().as_mut_slice().fill(fill);
        channel.add_write(lba, 1, buf, id);
    }

    #[test]
    fn test_times_to_insert_is_honored() {
        let device = FaultyBlockDevice::new(Box::new(MemBlockDevice::new(8)));
        let handle = device.inject(FaultRecord::new(
            FaultOpcode::Write,
            2..4,
            FaultErrorType::Retryable,
            2,
        ));
        let mut channel = device.create_channel().unwrap();
        write_block(channel.as_mut(), 3, 1, 1);
        write_block(channel.as_mut(), 3, 1, 2);
        write_block(channel.as_mut(), 3, 1, 3);
        write_block(channel.as_mut(), 5, 1, 4);
        let mut results = channel.poll();
        results.sort_by_key(|(id, _)| *id);
        assert_eq!(
            results,
            vec![
                (1, IoStatus::Retryable),
                (2, IoStatus::Retryable),
                (3, IoStatus::Success),
                (4, IoStatus::Success),
            ]
        );
        assert_eq!(device.hits(handle), 2);
    }

    #[test]
    fn test_dropped_write_completes_after_disable() {
        let mem = MemBlockDevice::new(8);
        let device = FaultyBlockDevice::new(BlockDevice::clone(&mem));
        device.inject(FaultRecord::always(
            FaultOpcode::Write,
            0..8,
            FaultErrorType::Dropped,
        ));
        let mut channel = device.create_channel().unwrap();
        write_block(channel.as_mut(), 1, 0xEE, 5);
        assert!(channel.poll().is_empty());
        assert!(channel.poll().is_empty());

        let mut raw = [0u8; 4];
        mem.read(BLOCK_SIZE, &mut raw);
        assert_eq!(raw, [0u8; 4]);

        device.disable_all();
        assert_eq!(channel.poll(), vec![(5, IoStatus::Success)]);
        mem.read(BLOCK_SIZE, &mut raw);
        assert_eq!(raw, [0xEE; 4]);
    }

    #[test]
    fn test_dropped_write_is_lost_with_channel() {
        let mem = MemBlockDevice::new(8);
        let device = FaultyBlockDevice::new(BlockDevice::clone(&mem));
        device.inject(FaultRecord::always(
            FaultOpcode::Write,
            0..8,
            FaultErrorType::Dropped,
        ));
        let mut channel = device.create_channel().unwrap();
        write_block(channel.as_mut(), 0, 0xEE, 1);
        drop(channel);
        device.disable_all();

        let mut raw = [0u8; 4];
        mem.read(0, &mut raw);
        assert_eq!(raw, [0u8; 4]);
    }

    #[test]
    fn test_killed_device_fails_everything() {
        let device = FaultyBlockDevice::new(Box::new(MemBlockDevice::new(8)));
        device.kill();
        let mut channel = device.create_channel().unwrap();
        channel.add_read(0, 1, shared_buffer(BLOCK_SIZE, 1), 1);
        channel.add_flush(2);
        assert_eq!(
            channel.poll(),
            vec![(1, IoStatus::NonRetryable), (2, IoStatus::NonRetryable)]
        );
        device.revive();
        channel.add_flush(3);
        assert_eq!(channel.poll(), vec![(3, IoStatus::Success)]);
    }
}
