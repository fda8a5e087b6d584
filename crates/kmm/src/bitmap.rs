//! A bitset over 32-bit words.
//!
//! Used by the frame allocator (storage borrowed from memory carved out at boot) and by the
//! region pools (storage on the kernel heap). A set bit means "in use". Bits past `len` in the
//! last word are never reported as free.

use alloc::boxed::Box;
use alloc::vec;

const WORD_BITS: usize = u32::BITS as usize;

pub struct Bitmap<S> {
    words: S,
    len: usize,
}

impl<S: AsRef<[u32]> + AsMut<[u32]>> Bitmap<S> {
    /// Wraps `words` as a bitmap of `len` bits. The existing contents are kept.
    ///
    /// Returns `None` if `words` is too short to hold `len` bits.
    pub fn from_words(words: S, len: usize) -> Option<Self> {
        if words.as_ref().len() < Self::words_for(len) {
            return None;
        }
        Some(Self { words, len })
    }

    /// Number of `u32` words needed to hold `bits` bits.
    pub const fn words_for(bits: usize) -> usize {
        bits.div_ceil(WORD_BITS)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.words.as_ref()[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words.as_mut()[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words.as_mut()[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }

    /// Sets or clears every bit.
    pub fn fill(&mut self, used: bool) {
        let value = if used { u32::MAX } else { 0 };
        for word in self.words.as_mut() {
            *word = value;
        }
    }

    /// Number of set bits among the first `len` bits.
    pub fn count_set(&self) -> usize {
        (0..self.len).filter(|&bit| self.test(bit)).count()
    }

    /// Index of the lowest clear bit.
    pub fn first_clear(&self) -> Option<usize> {
        for (word_index, &word) in self.words.as_ref().iter().enumerate() {
            if word == u32::MAX {
                continue;
            }
            let bit = word_index * WORD_BITS + (!word).trailing_zeros() as usize;
            return (bit < self.len).then_some(bit);
        }
        None
    }

    /// Index of the first bit of the lowest run of `count` clear bits.
    pub fn first_clear_run(&self, count: usize) -> Option<usize> {
        match count {
            0 => None,
            1 => self.first_clear(),
            _ => {
                let mut run_start = 0;
                let mut run_len = 0;
                let mut bit = 0;
                while bit < self.len {
                    if bit % WORD_BITS == 0 && self.words.as_ref()[bit / WORD_BITS] == u32::MAX {
                        bit += WORD_BITS;
                        run_len = 0;
                        continue;
                    }
                    if self.test(bit) {
                        run_len = 0;
                    } else {
                        if run_len == 0 {
                            run_start = bit;
                        }
                        run_len += 1;
                        if run_len == count {
                            return Some(run_start);
                        }
                    }
                    bit += 1;
                }
                None
            }
        }
    }
}

impl Bitmap<Box<[u32]>> {
    /// Allocates a bitmap of `len` clear bits on the heap.
    pub fn new_boxed(len: usize) -> Self {
        Self {
            words: vec![0u32; Self::words_for(len)].into_boxed_slice(),
            len,
        }
    }
}
