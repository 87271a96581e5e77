//! COBS codec for the KBI serial framing, following the PPP variant of
//! draft-ietf-pppext-cobs-00.
//!
//! Encoded frames contain no zero bytes; a single `0x00` delimits frames on
//! the wire. The encoder treats its input as carrying one implicit trailing
//! zero so every frame terminates cleanly. The decoder works byte for byte
//! and derives the expected frame length from the first two decoded bytes
//! (the big-endian KBI payload length) plus the KBI header overhead.

use crate::constants::KBI_HEADER_SIZE;

/// Longest run of literal bytes a plain `0x01..=0xCF` code can carry.
const LONG_DATA: usize = 0xCF;
/// Largest data block that fits the `0xE0 + n` double-zero code.
const DOUBLE_ZERO_MAX_DATA: usize = 0x1E;

/// Result of feeding one byte to the [`Decoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CobsStatus {
    /// Frame not complete yet.
    Pending,
    /// A full frame of the given length has been decoded.
    Complete(usize),
    /// Framing error; decoder state has been reset. Callers must
    /// resynchronise on the next delimiter zero.
    Invalid,
}

/// COBS encoder. Accumulates encoded output across `encode` calls.
#[derive(Debug, Default)]
pub struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `data` and append it to the output buffer.
    pub fn encode(&mut self, data: &[u8]) {
        let mut input = Vec::with_capacity(data.len() + 1);
        input.extend_from_slice(data);
        input.push(0);

        let mut i = 0;
        let mut block: &[u8] = &[];
        while i < input.len() {
            if input[i] != 0 {
                let start = i;
                while i < input.len() && input[i] != 0 {
                    i += 1;
                }
                block = &input[start..i];
            } else {
                let start = i;
                while i < input.len() && input[i] == 0 {
                    i += 1;
                }
                let zeros = i - start;
                self.emit(block, zeros);
                block = &[];
            }
        }
    }

    /// Emit the codes for one data block and the zero block that follows it.
    fn emit(&mut self, mut data: &[u8], mut zeros: usize) {
        // Long data blocks, no implicit trailing zero
        while data.len() >= LONG_DATA {
            self.out.push(0xD0);
            self.out.extend_from_slice(&data[..LONG_DATA]);
            data = &data[LONG_DATA..];
        }
        // The data bytes plus two trailing zeros
        if zeros > 1 && data.len() <= DOUBLE_ZERO_MAX_DATA {
            self.out.push(0xE0 + data.len() as u8);
            self.out.extend_from_slice(data);
            data = &[];
            zeros -= 2;
        }
        // Runs of 15 zeros
        while zeros > 15 && data.is_empty() {
            self.out.push(0xDF);
            zeros -= 15;
        }
        // A run of 3..=15 zeros
        if zeros > 2 && data.is_empty() {
            self.out.push(0xD0 + zeros as u8);
            zeros = 0;
        }
        // The data bytes plus one implicit trailing zero
        while zeros > 0 {
            self.out.push(data.len() as u8 + 1);
            self.out.extend_from_slice(data);
            data = &[];
            zeros -= 1;
        }
    }

    /// Return the encoded frame, preceded by the framing zero.
    pub fn encoded(&self) -> Vec<u8> {
        let mut framed = Vec::with_capacity(self.out.len() + 1);
        framed.push(0);
        framed.extend_from_slice(&self.out);
        framed
    }
}

/// Convenience one-shot encode of a single frame.
pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode(data);
    enc.encoded()
}

/// Byte-for-byte COBS decoder.
#[derive(Debug, Default)]
pub struct Decoder {
    out: Vec<u8>,
    remaining: usize,
    zeros: usize,
    length: Option<usize>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all decoder state for the next frame.
    pub fn reset(&mut self) {
        self.out.clear();
        self.remaining = 0;
        self.zeros = 0;
        self.length = None;
    }

    /// Feed one byte. [`CobsStatus::Complete`] carries the decoded frame
    /// length; the frame bytes are available through [`Decoder::data`].
    pub fn feed(&mut self, byte: u8) -> CobsStatus {
        if self.remaining == 0 {
            match byte {
                0xFF => {
                    self.reset();
                    return CobsStatus::Invalid;
                }
                0xE0..=0xFE => {
                    self.remaining = (byte - 0xE0) as usize;
                    self.zeros = 2;
                }
                0xD3..=0xDF => self.zeros = (byte - 0xD0) as usize,
                0xD1 | 0xD2 => {
                    self.reset();
                    return CobsStatus::Invalid;
                }
                0xD0 => self.remaining = LONG_DATA,
                0x01..=0xCF => {
                    self.remaining = (byte - 1) as usize;
                    self.zeros = 1;
                }
                0x00 => {
                    // Frame delimiter: restart reception
                    self.reset();
                    return CobsStatus::Pending;
                }
            }
        } else {
            self.out.push(byte);
            self.remaining -= 1;
        }

        // Append the trailing zeros once the code group's literals are in
        if self.remaining == 0 && self.zeros > 0 {
            self.out.resize(self.out.len() + self.zeros, 0);
            self.zeros = 0;
        }

        // The first two decoded bytes carry the KBI payload length
        if self.length.is_none() && self.out.len() >= 2 {
            let payload_len = u16::from_be_bytes([self.out[0], self.out[1]]) as usize;
            self.length = Some(payload_len + KBI_HEADER_SIZE);
        }

        // The implicit trailing zero pushes the output past the expected
        // length; that marks frame completion.
        if let Some(length) = self.length
            && self.out.len() > length
        {
            self.out.truncate(length);
            return CobsStatus::Complete(length);
        }

        CobsStatus::Pending
    }

    /// The decoded bytes accumulated so far.
    pub fn data(&self) -> &[u8] {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_encodes_to_single_code() {
        assert_eq!(encode_frame(&[]), vec![0x00, 0x01]);
    }

    #[test]
    fn single_zero_uses_double_zero_code() {
        // [0x00] plus the implicit trailing zero is a zero block of two
        assert_eq!(encode_frame(&[0x00]), vec![0x00, 0xE0]);
    }

    #[test]
    fn zero_runs_use_run_codes() {
        // 15 zeros (+1 implicit): two consumed by E0, the rest by a run code
        assert_eq!(encode_frame(&[0u8; 15]), vec![0x00, 0xE0, 0xDE]);
        // 16 zeros (+1 implicit): E0 then a full 15-run
        assert_eq!(encode_frame(&[0u8; 16]), vec![0x00, 0xE0, 0xDF]);
        // 18 zeros (+1 implicit): E0, 15-run, then one lone zero
        assert_eq!(encode_frame(&[0u8; 18]), vec![0x00, 0xE0, 0xDF, 0x01, 0x01]);
    }

    #[test]
    fn long_data_block_continues() {
        let data = vec![0xAA; LONG_DATA];
        let mut expected = vec![0x00, 0xD0];
        expected.extend_from_slice(&data);
        expected.push(0x01);
        assert_eq!(encode_frame(&data), expected);
    }

    #[test]
    fn decoder_rejects_reserved_codes() {
        for code in [0xD1, 0xD2, 0xFF] {
            let mut dec = Decoder::new();
            assert_eq!(dec.feed(code), CobsStatus::Invalid);
            assert!(dec.data().is_empty());
        }
    }

    #[test]
    fn delimiter_resets_state() {
        let mut dec = Decoder::new();
        dec.feed(0x03);
        dec.feed(0x12);
        assert_eq!(dec.feed(0x00), CobsStatus::Pending);
        assert!(dec.data().is_empty());
    }
}
