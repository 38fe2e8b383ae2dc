use crate::error::{DecodeError, Result};
use crate::source::ByteSource;

/// Flattens a run of size-prefixed data sub-blocks into a byte sequence, stopping at the
/// zero-length terminator. Holds at most one sub-block in memory.
pub struct BlockReader<'a, S: ?Sized> {
    source: &'a mut S,
    block: [u8; 255],
    index: usize,
    size: usize,
    done: bool,
}

impl<'a, S: ByteSource + ?Sized> BlockReader<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Self {
            source,
            block: [0; 255],
            index: 0,
            size: 0,
            done: false,
        }
    }

    /// Loads the next sub-block. `Ok(false)` at the terminator.
    fn fill_block(&mut self) -> Result<bool> {
        let size = self.source.read_byte("sub-block size")? as usize;
        if size == 0 {
            return Ok(false);
        }
        self.source
            .read_exact(&mut self.block[..size], "sub-block data")?;
        self.index = 0;
        self.size = size;
        Ok(true)
    }

    /// Consumes the remaining sub-blocks up to and including the terminator.
    pub fn skip(mut self) -> Result<()> {
        while !self.done {
            self.index = self.size;
            match self.fill_block() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(error) => {
                    self.done = true;
                    return Err(error);
                }
            }
        }
        Ok(())
    }
}

impl<S: ByteSource + ?Sized> Iterator for BlockReader<'_, S> {
    type Item = std::result::Result<u8, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.index >= self.size {
            match self.fill_block() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
        let byte = self.block[self.index];
        self.index += 1;
        Some(Ok(byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Buffered;

    #[test]
    fn flattens_sub_blocks() {
        let mut source = Buffered::new(vec![2, 1, 2, 1, 3, 0, 0xaa]);
        let bytes: Result<Vec<u8>> = BlockReader::new(&mut source).collect();
        assert_eq!(bytes.unwrap(), vec![1, 2, 3]);
        assert_eq!(source.read_byte("trailing").unwrap(), 0xaa);
    }

    #[test]
    fn empty_stream() {
        let mut source = Buffered::new(vec![0]);
        assert_eq!(BlockReader::new(&mut source).count(), 0);
        assert_eq!(source.position(), 1);
    }

    #[test]
    fn short_sub_block_is_an_error() {
        let mut source = Buffered::new(vec![4, 1, 2]);
        let bytes: Result<Vec<u8>> = BlockReader::new(&mut source).collect();
        assert!(matches!(bytes, Err(DecodeError::IncompleteData { .. })));
    }

    #[test]
    fn missing_terminator_is_an_error() {
        let mut source = Buffered::new(vec![1, 7]);
        let bytes: Result<Vec<u8>> = BlockReader::new(&mut source).collect();
        assert!(bytes.is_err());
    }

    #[test]
    fn skip_leaves_source_after_terminator() {
        let mut source = Buffered::new(vec![3, 1, 2, 3, 1, 4, 0, 0x3b]);
        let mut reader = BlockReader::new(&mut source);
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        reader.skip().unwrap();
        assert_eq!(source.read_byte("trailer").unwrap(), 0x3b);
    }
}
