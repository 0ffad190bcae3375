use alloc::boxed::Box;
use alloc::collections::TryReserveError;
use alloc::vec::Vec;

/// A fixed-size bitmap over `u64` words, backed by owned storage.
///
/// One bit per tree node records whether that node is part of an in-use
/// region: set while the block is allocated to a caller or has been split
/// into tracked children, clear while it is free.
#[derive(Debug)]
pub(crate) struct Bitmap {
    num_bits: usize,
    map: Box<[u64]>,
}

impl Bitmap {
    /// Constructs a new bitmap of `num_bits` bits, all clear.
    ///
    /// Fails instead of aborting if the backing words cannot be allocated.
    pub fn try_new(num_bits: usize) -> Result<Bitmap, TryReserveError> {
        assert!(num_bits > 0);

        let num_words = Self::num_words(num_bits);

        let mut words = Vec::new();
        words.try_reserve_exact(num_words)?;
        words.resize(num_words, 0u64);

        Ok(Bitmap {
            num_bits,
            map: words.into_boxed_slice(),
        })
    }

    #[inline]
    fn num_words(num_bits: usize) -> usize {
        (num_bits + u64::BITS as usize - 1) / u64::BITS as usize
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        self.map[word_idx] & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        match value {
            true => self.map[word_idx] |= mask,
            false => self.map[word_idx] &= !mask,
        }
    }
}
