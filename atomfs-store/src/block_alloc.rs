//! Recycling block allocator.
//!
//! Hands out fixed-size byte buffers and keeps released buffers around
//! (zeroed) up to a watermark proportional to the peak number of
//! outstanding blocks, to avoid constant allocator round trips on the
//! hot obtain/commit path.

pub struct BlockAllocator {
    bytes_per_block: usize,
    max_avail_percent: usize,
    blocks_used: usize,
    max_blocks_used: usize,
    nr_cache_hits: u64,
    nr_cache_misses: u64,
    avail_blocks: Vec<Vec<u8>>,
}

const MIN_BLOCKS_TO_CACHE: usize = 100;

impl BlockAllocator {
    pub fn new(bytes_per_block: usize) -> BlockAllocator {
        assert!(bytes_per_block != 0);
        BlockAllocator {
            bytes_per_block,
            max_avail_percent: 25,
            blocks_used: 0,
            max_blocks_used: 0,
            nr_cache_hits: 0,
            nr_cache_misses: 0,
            avail_blocks: Vec::new(),
        }
    }

    pub fn bytes_per_block(&self) -> usize {
        self.bytes_per_block
    }

    /// May be called to change the block size, but only with no blocks
    /// outstanding. Cached blocks of the previous size are dropped.
    pub fn set_bytes_per_block(&mut self, bytes_per_block: usize) {
        assert!(bytes_per_block != 0);
        assert!(self.blocks_used == 0, "blocks outstanding");
        if bytes_per_block != self.bytes_per_block {
            self.avail_blocks.clear();
            self.bytes_per_block = bytes_per_block;
        }
    }

    /// Proportion of the peak outstanding count kept cached after
    /// release.
    pub fn set_max_avail_percent(&mut self, max_avail_percent: usize) {
        self.max_avail_percent = max_avail_percent.min(100);
        while self.have_superfluous_blocks() {
            self.avail_blocks.pop();
        }
    }

    pub fn nr_blocks_for_bytes(&self, nr_bytes: usize) -> usize {
        nr_bytes.div_ceil(self.bytes_per_block)
    }

    /// A zero-filled block-sized buffer.
    pub fn get_block(&mut self) -> Vec<u8> {
        self.blocks_used += 1;
        if self.max_blocks_used < self.blocks_used {
            self.max_blocks_used = self.blocks_used;
        }
        match self.avail_blocks.pop() {
            Some(block) => {
                self.nr_cache_hits += 1;
                block
            }
            None => {
                self.nr_cache_misses += 1;
                vec![0u8; self.bytes_per_block]
            }
        }
    }

    /// Return a block to the cache. Infallible; superfluous blocks are
    /// dropped rather than cached.
    pub fn release_block(&mut self, mut block: Vec<u8>) {
        assert!(self.blocks_used > 0);
        assert_eq!(block.len(), self.bytes_per_block);
        self.blocks_used -= 1;
        if !self.have_superfluous_blocks() {
            block.fill(0);
            self.avail_blocks.push(block);
        }
    }

    /// A contiguous multi-block buffer covering `nr_bytes`, zero-filled.
    /// Not drawn from the cache; the caller drops it when done.
    pub fn alloc_memory(&self, nr_bytes: usize) -> Vec<u8> {
        vec![0u8; self.nr_blocks_for_bytes(nr_bytes) * self.bytes_per_block]
    }

    pub fn nr_cache_hits(&self) -> u64 {
        self.nr_cache_hits
    }

    pub fn nr_cache_misses(&self) -> u64 {
        self.nr_cache_misses
    }

    fn have_superfluous_blocks(&self) -> bool {
        if self.avail_blocks.len() <= MIN_BLOCKS_TO_CACHE {
            return false;
        }
        100 * self.avail_blocks.len() >= self.max_blocks_used * self.max_avail_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_released_blocks() {
        let mut alloc = BlockAllocator::new(512);
        let mut a = alloc.get_block();
        a[0] = 0xFF;
        alloc.release_block(a);
        let b = alloc.get_block();
        assert_eq!(b[0], 0, "released blocks are zeroed");
        assert_eq!(alloc.nr_cache_hits(), 1);
        alloc.release_block(b);
    }

    #[test]
    fn watermark_bounds_the_cache() {
        let mut alloc = BlockAllocator::new(64);
        let blocks: Vec<_> = (0..400).map(|_| alloc.get_block()).collect();
        for b in blocks {
            alloc.release_block(b);
        }
        // peak 400, 25% watermark, minimum 100 always allowed
        assert!(alloc.avail_blocks.len() <= 101);
    }

    #[test]
    fn multi_block_memory_is_rounded_up() {
        let alloc = BlockAllocator::new(128);
        assert_eq!(alloc.alloc_memory(1).len(), 128);
        assert_eq!(alloc.alloc_memory(129).len(), 256);
        assert_eq!(alloc.nr_blocks_for_bytes(256), 2);
    }
}
