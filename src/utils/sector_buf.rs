/// A zeroed byte buffer addressed in fixed-size blocks.
///
/// Every device in this crate transfers whole blocks, so buffers carry their
/// block size and hand out per-block slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorBuf {
    data: Vec<u8>,
    block_size: usize,
}

impl SectorBuf {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        assert!(block_size != 0, "Block size must be non-zero");
        SectorBuf {
            data: vec![0u8; block_size * block_count],
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.data.len() / self.block_size
    }

    pub fn block(&self, index: usize) -> &[u8] {
        let start = index * self.block_size;
        &self.data[start..start + self.block_size]
    }

    pub fn block_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.block_size;
        &mut self.data[start..start + self.block_size]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
