use crate::error::Result;

/// Reads least-significant-bit-first codes off a fallible byte iterator, pulling bytes only
/// as the next code needs them.
pub struct BitReader<I> {
    bytes: I,
    buffer: u32,
    // bits of `buffer` not yet handed out
    available: u32,
}

impl<I> BitReader<I>
where
    I: Iterator<Item = Result<u8>>,
{
    pub fn new(bytes: I) -> Self {
        Self {
            bytes,
            buffer: 0,
            available: 0,
        }
    }

    /// Next `count`-bit code (`count <= 16`). `Ok(None)` when input runs out mid-code; the
    /// partial code is dropped.
    pub fn next(&mut self, count: u32) -> Result<Option<u16>> {
        debug_assert!(count <= 16);

        while self.available < count {
            match self.bytes.next() {
                Some(byte) => {
                    self.buffer |= (byte? as u32) << self.available;
                    self.available += 8;
                }
                None => return Ok(None),
            }
        }

        let value = self.buffer & ((1 << count) - 1);
        self.buffer >>= count;
        self.available -= count;
        Ok(Some(value as u16))
    }

    /// Consumes and discards whatever input is left.
    pub fn drain(&mut self) -> Result<()> {
        self.buffer = 0;
        self.available = 0;
        for byte in self.bytes.by_ref() {
            byte?;
        }
        Ok(())
    }
}
