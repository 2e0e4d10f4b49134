use crate::{error::XmitError, Result};

/// A positioned read over an in-memory buffer. Every read is bounds-checked
/// and fails with `Truncated` carrying the offset at which the read started.
#[derive(Debug)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    /// Absolute seek. Seeking to the end of the buffer is allowed, past it is not.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(XmitError::Truncated {
                offset: pos,
                needed: 0,
                remaining: 0,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(XmitError::Truncated {
                offset: self.pos,
                needed: n,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.need(1)?;
        Ok(self.data[self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let raw = self.read_slice(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let raw = self.read_slice(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    /// 3-byte big-endian quantity, e.g. a TTR.
    pub fn read_u24_be(&mut self) -> Result<u32> {
        let raw = self.read_slice(3)?;
        Ok(u32::from_be_bytes([0, raw[0], raw[1], raw[2]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let raw = self.read_slice(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let raw = self.read_slice(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_positions() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let mut cur = ByteCursor::new(&data);

        assert_eq!(cur.peek_u8().unwrap(), 0x01);
        assert_eq!(cur.read_u16_be().unwrap(), 0x0102);
        assert_eq!(cur.read_u16_le().unwrap(), 0x0403);
        assert_eq!(cur.pos(), 4);
        assert_eq!(cur.remaining(), 2);

        cur.seek(0).unwrap();
        assert_eq!(cur.read_u32_be().unwrap(), 0x0102_0304);
        assert_eq!(cur.read_slice(2).unwrap(), &[0x05, 0x06]);
        assert!(cur.is_at_end());
    }

    #[test]
    fn read_past_end_is_truncated() {
        let data = [0xAA, 0xBB];
        let mut cur = ByteCursor::new(&data);
        cur.read_u8().unwrap();

        match cur.read_u32_be() {
            Err(XmitError::Truncated {
                offset,
                needed,
                remaining,
            }) => {
                assert_eq!(offset, 1);
                assert_eq!(needed, 4);
                assert_eq!(remaining, 1);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn ttr_is_three_bytes() {
        let data = [0x00, 0x01, 0x0E];
        let mut cur = ByteCursor::new(&data);
        assert_eq!(cur.read_u24_be().unwrap(), 0x00010E);
    }

    #[test]
    fn seek_past_end_fails() {
        let data = [0u8; 4];
        let mut cur = ByteCursor::new(&data);
        assert!(cur.seek(4).is_ok());
        assert!(cur.seek(5).is_err());
    }
}
