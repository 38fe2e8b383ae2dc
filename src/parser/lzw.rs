use log::debug;

use super::bit_reader::BitReader;
use crate::error::Result;

/// Upper bound on stored dictionary strings.
pub const MAX_ENTRIES: usize = 4096;
const MAX_CODE_LEN: u32 = 12;

/// What a single code resolved to.
#[derive(Debug, PartialEq, Eq)]
pub enum Code {
    Clear,
    End,
    Run(Vec<u8>),
}

/// The string table. Entries past the literal range and the two sentinels are stored in
/// `codes`, so code `end_code + 1 + i` is `codes[i]`.
#[derive(Debug)]
pub struct Dictionary {
    code_size: u32,
    clear_code: u16,
    end_code: u16,
    codes: Vec<Vec<u8>>,
    last: Vec<u8>,
    code_len: u32,
}

impl Dictionary {
    pub fn new(code_size: u8) -> Self {
        debug_assert!(code_size < MAX_CODE_LEN as u8);
        let clear_code = 1 << code_size;
        Self {
            code_size: code_size.into(),
            clear_code,
            end_code: clear_code + 1,
            codes: Vec::new(),
            last: Vec::new(),
            code_len: code_size as u32 + 1,
        }
    }

    pub fn clear(&mut self) {
        self.codes.clear();
        self.last.clear();
        self.code_len = self.code_size + 1;
    }

    /// Current width of a code in bits.
    pub fn code_len(&self) -> u32 {
        self.code_len
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn decode(&mut self, code: u16) -> Code {
        if code == self.clear_code {
            self.clear();
            return Code::Clear;
        }
        if code == self.end_code {
            return Code::End;
        }

        let value = if code < self.clear_code {
            vec![code as u8]
        } else if code as usize <= self.codes.len() + self.end_code as usize {
            self.codes[(code - self.end_code - 1) as usize].clone()
        } else {
            // Not in the table yet: the encoder's `last + last[0]` shorthand. Assets in the
            // wild rely on this resolving even when the code jumps further ahead.
            let mut value = self.last.clone();
            value.extend(self.last.first().copied());
            value
        };

        if !self.last.is_empty() && self.codes.len() < MAX_ENTRIES {
            let mut entry = Vec::with_capacity(self.last.len() + 1);
            entry.extend_from_slice(&self.last);
            entry.extend(value.first().copied());
            self.codes.push(entry);
        }

        if self.codes.len() + self.end_code as usize + 1 >= 1 << self.code_len
            && self.code_len < MAX_CODE_LEN
        {
            self.code_len += 1;
        }

        self.last.clone_from(&value);
        Code::Run(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Decoding,
    /// Saw the end code; the rest of the input is consumed and ignored.
    Draining,
    Exhausted,
}

/// Streams decoded index runs out of LZW-compressed image data.
pub struct LzwDecoder<I> {
    bits: BitReader<I>,
    dictionary: Dictionary,
    state: State,
}

impl<I> LzwDecoder<I>
where
    I: Iterator<Item = Result<u8>>,
{
    pub fn new(bytes: I, code_size: u8) -> Self {
        Self {
            bits: BitReader::new(bytes),
            dictionary: Dictionary::new(code_size),
            state: State::Decoding,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == State::Exhausted
    }
}

impl<I> Iterator for LzwDecoder<I>
where
    I: Iterator<Item = Result<u8>>,
{
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                State::Exhausted => return None,
                State::Draining => {
                    self.state = State::Exhausted;
                    return self.bits.drain().err().map(Err);
                }
                State::Decoding => {
                    let code = match self.bits.next(self.dictionary.code_len()) {
                        Ok(Some(code)) => code,
                        Ok(None) => {
                            debug!("lzw data ended without an end code");
                            self.state = State::Exhausted;
                            return None;
                        }
                        Err(error) => {
                            self.state = State::Exhausted;
                            return Some(Err(error));
                        }
                    };

                    match self.dictionary.decode(code) {
                        Code::Clear => continue,
                        Code::End => self.state = State::Draining,
                        Code::Run(run) => return Some(Ok(run)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    fn encode(data: &[u8], code_size: u8) -> Vec<u8> {
        weezl::encode::Encoder::new(weezl::BitOrder::Lsb, code_size)
            .encode(data)
            .unwrap()
    }

    fn decode(compressed: &[u8], code_size: u8) -> Vec<u8> {
        LzwDecoder::new(compressed.iter().map(|byte| Ok(*byte)), code_size)
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .concat()
    }

    // xorshift, deterministic noise that defeats the dictionary
    fn noise(len: usize, modulus: u8) -> Vec<u8> {
        let mut state: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state % modulus as u32) as u8
            })
            .collect()
    }

    #[test]
    fn decodes_repetitive_data() {
        let data: Vec<u8> = (0..600).map(|i| (i / 7 % 4) as u8).collect();
        assert_eq!(decode(&encode(&data, 2), 2), data);
    }

    #[test]
    fn decodes_through_dictionary_resets() {
        let data = noise(40_000, 255);
        assert_eq!(decode(&encode(&data, 8), 8), data);
    }

    #[test]
    fn dictionary_bounds_and_width_discipline() {
        let compressed = encode(&noise(40_000, 16), 4);
        let mut bits = BitReader::new(compressed.iter().map(|byte| Ok(*byte)));
        let mut dictionary = Dictionary::new(4);
        let mut previous_len = dictionary.code_len();
        let mut clears = 0;

        while let Some(code) = bits.next(dictionary.code_len()).unwrap() {
            match dictionary.decode(code) {
                Code::Clear => {
                    clears += 1;
                    assert_eq!(dictionary.code_len(), 5);
                    assert!(dictionary.is_empty());
                }
                Code::End => break,
                Code::Run(_) => assert!(dictionary.code_len() >= previous_len),
            }
            assert!(dictionary.len() <= MAX_ENTRIES);
            assert!(dictionary.code_len() <= 12);
            previous_len = dictionary.code_len();
        }
        assert!(clears >= 1);
    }

    #[test]
    fn out_of_table_code_repeats_last() {
        let mut dictionary = Dictionary::new(2);
        assert_eq!(dictionary.decode(1), Code::Run(vec![1]));
        // next free slot is 6, 9 is well past it
        assert_eq!(dictionary.decode(9), Code::Run(vec![1, 1]));
        assert_eq!(dictionary.decode(6), Code::Run(vec![1, 1]));
    }

    #[test]
    fn end_code_drains_remaining_input() {
        // clear(4), 1, end(5) packed at 3 bits, then junk bytes that must be swallowed
        let mut compressed = vec![0b0100_1100, 0b0000_0001];
        compressed.extend_from_slice(&[0xde, 0xad]);
        let mut input = compressed.iter().map(|byte| Ok(*byte));
        let mut decoder = LzwDecoder::new(input.by_ref(), 2);
        assert_eq!(decoder.next().unwrap().unwrap(), vec![1]);
        assert!(decoder.next().is_none());
        assert!(decoder.is_exhausted());
        drop(decoder);
        assert!(input.next().is_none());
    }

    #[test]
    fn input_error_stops_decoding() {
        let input = vec![Ok(0b0100_1100), Err(DecodeError::incomplete("sub-block data"))];
        let mut decoder = LzwDecoder::new(input.into_iter(), 2);
        assert_eq!(decoder.next().unwrap().unwrap(), vec![1]);
        assert!(decoder.next().unwrap().is_err());
        assert!(decoder.next().is_none());
    }
}
