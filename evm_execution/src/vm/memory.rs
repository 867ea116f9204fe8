//! Linear byte-addressable VM memory with active-word accounting.
//!
//! Memory reads as zero beyond anything ever written. Touching byte `i`
//! raises `active_words` to at least `⌈(i + 1) / 32⌉`; the gas layer prices
//! the *increase*, so the counter is monotone by construction.

use ethereum_types::U256;

/// Expandable zero-initialized memory for one frame.
#[derive(Clone, Debug, Default)]
pub struct Memory {
    data: Vec<u8>,
    active_words: u64,
}

impl Memory {
    /// Fresh, empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest 32-byte word ever touched.
    pub fn active_words(&self) -> u64 {
        self.active_words
    }

    /// Memory size in bytes as reported by `MSIZE`.
    pub fn size(&self) -> u64 {
        self.active_words * 32
    }

    /// Records an access to `[offset, offset + len)` and backs it with
    /// zeroed bytes. Zero-length accesses touch nothing.
    fn touch(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let end = offset + len;
        self.active_words = self.active_words.max(end.div_ceil(32) as u64);
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
    }

    /// Reads a 32-byte big-endian word.
    pub fn load_word(&mut self, offset: usize) -> U256 {
        self.touch(offset, 32);
        U256::from_big_endian(&self.data[offset..offset + 32])
    }

    /// Writes a 32-byte big-endian word.
    pub fn store_word(&mut self, offset: usize, value: U256) {
        self.touch(offset, 32);
        value.to_big_endian(&mut self.data[offset..offset + 32]);
    }

    /// Writes a single byte.
    pub fn store_byte(&mut self, offset: usize, byte: u8) {
        self.touch(offset, 1);
        self.data[offset] = byte;
    }

    /// Copies `len` bytes out of memory, zero-extending past the written
    /// region. Zero-length reads touch nothing, whatever the offset.
    pub fn read(&mut self, offset: usize, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        self.touch(offset, len);
        self.data[offset..offset + len].to_vec()
    }

    /// Writes a byte slice into memory.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.touch(offset, bytes.len());
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Fills `[offset, offset + len)` from `src`, zero-padding once the
    /// source runs out. This is the copy primitive behind `CALLDATACOPY`,
    /// `CODECOPY`, and `EXTCODECOPY`.
    pub fn write_zero_padded(&mut self, offset: usize, len: usize, src: &[u8]) {
        if len == 0 {
            return;
        }
        self.touch(offset, len);
        let copied = len.min(src.len());
        self.data[offset..offset + copied].copy_from_slice(&src[..copied]);
        self.data[offset + copied..offset + len].fill(0);
    }
}
