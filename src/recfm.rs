//! The record-format engine. Given `RECFM` + `LRECL`, it deblocks a stream of
//! physical blocks into logical records and blocks records back up again.
//!
//! Variable-length blocks open with a 4-byte BDW (2-byte big-endian length
//! that covers the BDW itself, 2 reserved bytes). Every record within opens
//! with a 4-byte RDW of the same layout, except that the third byte carries
//! the segment indicator for spanned formats: 0 complete, 1 first, 2 last,
//! 3 middle.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::{cursor::ByteCursor, error::XmitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Fixed,
    Variable,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarriageControl {
    Ansi,
    Machine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFormat {
    pub format: Format,
    pub blocked: bool,
    pub spanned: bool,
    pub carriage: Option<CarriageControl>,
}

impl RecordFormat {
    pub const U: RecordFormat = RecordFormat {
        format: Format::Undefined,
        blocked: false,
        spanned: false,
        carriage: None,
    };

    /// Translate the IBM DS1RECFM byte: bits 7-6 select the format
    /// (10 F, 01 V, 11 U), bit 4 blocked, bit 3 spanned, bits 2-1 the
    /// ANSI/machine carriage control.
    pub fn from_ds1_byte(byte: u8) -> Self {
        let format = match byte & 0xC0 {
            0x80 => Format::Fixed,
            0x40 => Format::Variable,
            _ => Format::Undefined,
        };
        let carriage = if byte & 0x04 != 0 {
            Some(CarriageControl::Ansi)
        } else if byte & 0x02 != 0 {
            Some(CarriageControl::Machine)
        } else {
            None
        };
        RecordFormat {
            format,
            blocked: byte & 0x10 != 0,
            spanned: byte & 0x08 != 0,
            carriage,
        }
    }

    /// Deblock a stream of physical blocks into logical records.
    pub fn deblock(
        &self,
        blocks: &[Vec<u8>],
        lrecl: usize,
        max_record_bytes: usize,
    ) -> Result<Vec<Vec<u8>>> {
        match self.format {
            Format::Undefined => Ok(blocks.to_vec()),
            Format::Fixed => self.deblock_fixed(blocks, lrecl),
            Format::Variable => self.deblock_variable(blocks, max_record_bytes),
        }
    }

    fn deblock_fixed(&self, blocks: &[Vec<u8>], lrecl: usize) -> Result<Vec<Vec<u8>>> {
        let mut offset = 0;
        if lrecl == 0 {
            return Err(XmitError::malformed(offset, "fixed format with LRECL 0"));
        }
        let mut records = Vec::new();
        for block in blocks {
            if block.is_empty() {
                continue;
            }
            if !self.blocked && block.len() != lrecl {
                return Err(XmitError::malformed(
                    offset,
                    format!("unblocked F block of {} bytes, LRECL {}", block.len(), lrecl),
                ));
            }
            if block.len() % lrecl != 0 {
                return Err(XmitError::malformed(
                    offset,
                    format!("F block of {} bytes is not a multiple of LRECL {}", block.len(), lrecl),
                ));
            }
            records.extend(block.chunks(lrecl).map(|c| c.to_vec()));
            offset += block.len();
        }
        Ok(records)
    }

    fn deblock_variable(&self, blocks: &[Vec<u8>], max_record_bytes: usize) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        let mut pending: Option<Vec<u8>> = None;
        let mut offset = 0;

        for block in blocks {
            let mut cur = ByteCursor::new(block);
            let bdw_len = cur.read_u16_be()? as usize;
            let _reserved = cur.read_u16_be()?;
            if bdw_len != block.len() || bdw_len < 4 {
                return Err(XmitError::malformed(
                    offset,
                    format!("BDW length {} does not match block length {}", bdw_len, block.len()),
                ));
            }

            let mut first_in_block = true;
            while !cur.is_at_end() {
                if !self.blocked && !first_in_block {
                    return Err(XmitError::malformed(
                        offset + cur.pos(),
                        "multiple RDWs in an unblocked V block",
                    ));
                }
                first_in_block = false;

                let rdw_offset = offset + cur.pos();
                let rdw_len = cur.read_u16_be()? as usize;
                let segment = cur.read_u8()? & 0x03;
                let _reserved = cur.read_u8()?;
                if rdw_len < 4 {
                    return Err(XmitError::malformed(rdw_offset, "RDW length below 4"));
                }
                let payload = cur.read_slice(rdw_len - 4)?;

                if segment != 0 && !self.spanned {
                    return Err(XmitError::malformed(
                        rdw_offset,
                        format!("segment indicator {} in an unspanned format", segment),
                    ));
                }

                match segment {
                    0 => {
                        if pending.is_some() {
                            return Err(XmitError::malformed(
                                rdw_offset,
                                "complete record while a spanned record is open",
                            ));
                        }
                        records.push(payload.to_vec());
                    }
                    1 => {
                        if pending.is_some() {
                            return Err(XmitError::malformed(
                                rdw_offset,
                                "first segment while a spanned record is open",
                            ));
                        }
                        pending = Some(payload.to_vec());
                    }
                    2 | 3 => {
                        let buf = pending.as_mut().ok_or_else(|| {
                            XmitError::malformed(
                                rdw_offset,
                                format!("segment indicator {} with no open record", segment),
                            )
                        })?;
                        buf.extend_from_slice(payload);
                        if buf.len() > max_record_bytes {
                            return Err(XmitError::PolicyViolation {
                                size: buf.len(),
                                limit: max_record_bytes,
                            });
                        }
                        if segment == 2 {
                            records.push(pending.take().unwrap());
                        }
                    }
                    _ => unreachable!(),
                }
            }
            offset += block.len();
        }

        if pending.is_some() {
            return Err(XmitError::malformed(offset, "spanned record left open at end of data"));
        }
        Ok(records)
    }

    /// Block logical records back into a physical block stream. The inverse
    /// of `deblock` for canonically-packed streams.
    pub fn reblock(&self, records: &[Vec<u8>], lrecl: usize, blksize: usize) -> Result<Vec<Vec<u8>>> {
        match self.format {
            Format::Undefined => Ok(records.to_vec()),
            Format::Fixed => self.reblock_fixed(records, lrecl, blksize),
            Format::Variable => self.reblock_variable(records, blksize),
        }
    }

    fn reblock_fixed(&self, records: &[Vec<u8>], lrecl: usize, blksize: usize) -> Result<Vec<Vec<u8>>> {
        if lrecl == 0 {
            return Err(XmitError::malformed(0, "fixed format with LRECL 0"));
        }
        for record in records {
            if record.len() != lrecl {
                return Err(XmitError::malformed(
                    0,
                    format!("fixed record of {} bytes, LRECL {}", record.len(), lrecl),
                ));
            }
        }
        let per_block = if self.blocked && blksize >= lrecl {
            (blksize / lrecl).max(1)
        } else {
            1
        };
        Ok(records
            .chunks(per_block)
            .map(|group| group.concat())
            .collect())
    }

    fn reblock_variable(&self, records: &[Vec<u8>], blksize: usize) -> Result<Vec<Vec<u8>>> {
        // Split a record into (segment indicator, payload) pairs.
        let max_payload = if self.spanned && blksize > 8 {
            blksize - 8
        } else {
            usize::MAX
        };

        let mut segments: Vec<(u8, &[u8])> = Vec::new();
        for record in records {
            if record.len() <= max_payload {
                segments.push((0, record));
            } else {
                let mut chunks = record.chunks(max_payload).peekable();
                let mut first = true;
                while let Some(chunk) = chunks.next() {
                    let indicator = match (first, chunks.peek().is_some()) {
                        (true, _) => 1,
                        (false, true) => 3,
                        (false, false) => 2,
                    };
                    segments.push((indicator, chunk));
                    first = false;
                }
            }
        }

        let mut blocks = Vec::new();
        let mut body: Vec<u8> = Vec::new();
        let flush = |body: &mut Vec<u8>, blocks: &mut Vec<Vec<u8>>| {
            if !body.is_empty() {
                let mut block = Vec::with_capacity(body.len() + 4);
                block.extend_from_slice(&((body.len() as u16 + 4).to_be_bytes()));
                block.extend_from_slice(&[0, 0]);
                block.extend_from_slice(body);
                blocks.push(block);
                body.clear();
            }
        };

        for (indicator, payload) in segments {
            let entry_len = payload.len() + 4;
            let fits = self.blocked && blksize > 4 && body.len() + entry_len + 4 <= blksize;
            if !body.is_empty() && !fits {
                flush(&mut body, &mut blocks);
            }
            body.extend_from_slice(&((entry_len as u16).to_be_bytes()));
            body.push(indicator);
            body.push(0);
            body.extend_from_slice(payload);
            if !self.blocked {
                flush(&mut body, &mut blocks);
            }
        }
        flush(&mut body, &mut blocks);
        Ok(blocks)
    }
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            Format::Fixed => write!(f, "F")?,
            Format::Variable => write!(f, "V")?,
            Format::Undefined => write!(f, "U")?,
        }
        if self.blocked {
            write!(f, "B")?;
        }
        if self.spanned {
            write!(f, "S")?;
        }
        match self.carriage {
            Some(CarriageControl::Ansi) => write!(f, "A")?,
            Some(CarriageControl::Machine) => write!(f, "M")?,
            None => {}
        }
        Ok(())
    }
}

impl FromStr for RecordFormat {
    type Err = XmitError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let format = match chars.next() {
            Some('F') => Format::Fixed,
            Some('V') => Format::Variable,
            Some('U') => Format::Undefined,
            _ => {
                return Err(XmitError::Decoding(format!("invalid record format {:?}", s)));
            }
        };
        let mut out = RecordFormat {
            format,
            blocked: false,
            spanned: false,
            carriage: None,
        };
        for ch in chars {
            match ch {
                'B' => out.blocked = true,
                'S' => out.spanned = true,
                'A' => out.carriage = Some(CarriageControl::Ansi),
                'M' => out.carriage = Some(CarriageControl::Machine),
                // Track overflow has no bearing on deblocking.
                'T' => {}
                _ => {
                    return Err(XmitError::Decoding(format!("invalid record format {:?}", s)));
                }
            }
        }
        Ok(out)
    }
}

impl Serialize for RecordFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 64 << 20;

    fn fmt(s: &str) -> RecordFormat {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_round_trip() {
        for s in &["F", "FB", "FBA", "V", "VB", "VBS", "VS", "U", "FM"] {
            assert_eq!(fmt(s).to_string(), *s);
        }
        assert!("Q".parse::<RecordFormat>().is_err());
    }

    #[test]
    fn ds1_byte_translation() {
        assert_eq!(RecordFormat::from_ds1_byte(0x80).to_string(), "F");
        assert_eq!(RecordFormat::from_ds1_byte(0x90).to_string(), "FB");
        assert_eq!(RecordFormat::from_ds1_byte(0x94).to_string(), "FBA");
        assert_eq!(RecordFormat::from_ds1_byte(0x40).to_string(), "V");
        assert_eq!(RecordFormat::from_ds1_byte(0x58).to_string(), "VBS");
        assert_eq!(RecordFormat::from_ds1_byte(0xC0).to_string(), "U");
        assert_eq!(RecordFormat::from_ds1_byte(0x42).to_string(), "VM");
    }

    #[test]
    fn fixed_blocked_round_trip() {
        let records: Vec<Vec<u8>> = (0u8..7).map(|i| vec![i; 10]).collect();
        let recfm = fmt("FB");
        let blocks = recfm.reblock(&records, 10, 30).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].len(), 30);
        assert_eq!(blocks[2].len(), 10);
        assert_eq!(recfm.deblock(&blocks, 10, LIMIT).unwrap(), records);
    }

    #[test]
    fn unblocked_fixed_rejects_oversized_block() {
        let recfm = fmt("F");
        let blocks = vec![vec![0u8; 20]];
        assert!(matches!(
            recfm.deblock(&blocks, 10, LIMIT),
            Err(XmitError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn variable_blocked_round_trip() {
        let records: Vec<Vec<u8>> = vec![b"alpha".to_vec(), b"be".to_vec(), b"gammagamma".to_vec()];
        let recfm = fmt("VB");
        let blocks = recfm.reblock(&records, 0, 32).unwrap();
        for block in &blocks {
            let bdw = u16::from_be_bytes([block[0], block[1]]) as usize;
            assert_eq!(bdw, block.len());
        }
        assert_eq!(recfm.deblock(&blocks, 0, LIMIT).unwrap(), records);
    }

    #[test]
    fn spanned_records_cross_blocks() {
        let records: Vec<Vec<u8>> = vec![vec![7u8; 100], vec![9u8; 3]];
        let recfm = fmt("VBS");
        let blocks = recfm.reblock(&records, 0, 40).unwrap();
        assert!(blocks.len() > 2, "the 100-byte record must span blocks");
        assert_eq!(recfm.deblock(&blocks, 0, LIMIT).unwrap(), records);
    }

    #[test]
    fn misordered_segments_are_malformed() {
        // A lone "middle" segment with no open record.
        let mut block = Vec::new();
        block.extend_from_slice(&10u16.to_be_bytes());
        block.extend_from_slice(&[0, 0]);
        block.extend_from_slice(&6u16.to_be_bytes());
        block.extend_from_slice(&[3, 0]);
        block.extend_from_slice(b"xx");
        let recfm = fmt("VBS");
        assert!(matches!(
            recfm.deblock(&[block], 0, LIMIT),
            Err(XmitError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn segment_in_unspanned_format_is_malformed() {
        let mut block = Vec::new();
        block.extend_from_slice(&10u16.to_be_bytes());
        block.extend_from_slice(&[0, 0]);
        block.extend_from_slice(&6u16.to_be_bytes());
        block.extend_from_slice(&[1, 0]);
        block.extend_from_slice(b"xx");
        let recfm = fmt("VB");
        assert!(matches!(
            recfm.deblock(&[block], 0, LIMIT),
            Err(XmitError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn open_spanned_record_at_end_is_malformed() {
        let records: Vec<Vec<u8>> = vec![vec![1u8; 50]];
        let recfm = fmt("VBS");
        let mut blocks = recfm.reblock(&records, 0, 30).unwrap();
        blocks.pop();
        assert!(matches!(
            recfm.deblock(&blocks, 0, LIMIT),
            Err(XmitError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn spanned_record_over_limit_is_policy_violation() {
        let records: Vec<Vec<u8>> = vec![vec![0u8; 300]];
        let recfm = fmt("VBS");
        let blocks = recfm.reblock(&records, 0, 50).unwrap();
        assert!(matches!(
            recfm.deblock(&blocks, 0, 100),
            Err(XmitError::PolicyViolation { .. })
        ));
    }

    #[test]
    fn undefined_passes_blocks_through() {
        let blocks: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![4]];
        let recfm = RecordFormat::U;
        assert_eq!(recfm.deblock(&blocks, 0, LIMIT).unwrap(), blocks);
        assert_eq!(recfm.reblock(&blocks, 0, 0).unwrap(), blocks);
    }
}
