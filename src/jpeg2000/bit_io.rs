use crate::error::J2kError;

/// Bit reader for packet headers (ISO/IEC 15444-1 B.10.1).
///
/// A byte following 0xFF carries only seven bits; its most significant bit is a stuffed zero.
pub struct J2kBitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit_buffer: u8,
    bits_left: u8,
    last_byte: u8,
}

impl<'a> J2kBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bit_buffer: 0,
            bits_left: 0,
            last_byte: 0,
        }
    }

    pub fn read_bit(&mut self) -> Result<u8, J2kError> {
        if self.bits_left == 0 {
            let b = *self
                .data
                .get(self.pos)
                .ok_or(J2kError::MalformedInput("packet header ended early"))?;
            self.pos += 1;
            self.bits_left = if self.last_byte == 0xFF { 7 } else { 8 };
            self.bit_buffer = b;
            self.last_byte = b;
        }

        self.bits_left -= 1;
        Ok((self.bit_buffer >> self.bits_left) & 1)
    }

    pub fn read_bits(&mut self, mut count: u8) -> Result<u32, J2kError> {
        let mut bits = 0u32;
        while count > 0 {
            let bit = self.read_bit()?;
            bits = (bits << 1) | (bit as u32);
            count -= 1;
        }
        Ok(bits)
    }

    /// Skips to the next byte boundary, consuming the stuffed byte after a trailing 0xFF.
    pub fn align(&mut self) {
        self.bits_left = 0;
        if self.last_byte == 0xFF {
            if self.pos < self.data.len() {
                self.pos += 1;
            }
            self.last_byte = 0;
        }
    }

    pub fn has_data(&self) -> bool {
        self.pos < self.data.len() || self.bits_left > 0
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Packet header bit writer, used to build test streams.
#[cfg(test)]
pub(crate) struct J2kBitWriter {
    data: Vec<u8>,
    bit_buffer: u8,
    bits_count: u8,
    capacity: u8,
}

#[cfg(test)]
impl J2kBitWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_buffer: 0,
            bits_count: 0,
            capacity: 8,
        }
    }

    pub fn write_bit(&mut self, bit: u8) {
        self.bit_buffer = (self.bit_buffer << 1) | (bit & 1);
        self.bits_count += 1;
        if self.bits_count == self.capacity {
            self.flush_byte();
        }
    }

    pub fn write_bits(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.write_bit(((value >> i) & 1) as u8);
        }
    }

    fn flush_byte(&mut self) {
        let b = self.bit_buffer;
        self.data.push(b);
        self.capacity = if b == 0xFF { 7 } else { 8 };
        self.bit_buffer = 0;
        self.bits_count = 0;
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.bits_count > 0 {
            self.bit_buffer <<= self.capacity - self.bits_count;
            self.flush_byte();
        }
        if self.data.last() == Some(&0xFF) {
            self.data.push(0x00);
        }
        self.data
    }
}
