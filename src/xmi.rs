//! The NETDATA / XMI framer.
//!
//! A transmission is a stream of segments: a 1-byte length (which covers the
//! 2-byte segment header), a 1-byte flag and the segment data. A logical
//! record runs from a first-flagged segment through the next last-flagged
//! one. Control records carry the control flag and open with the 6-byte
//! EBCDIC tag `INMRxx`; everything else is payload for the current INMCOPY
//! data stream.

use crate::{
    config::Config,
    cursor::ByteCursor,
    ebcdic::EbcdicCodec,
    error::XmitError,
    text_unit::{self, keys, TextUnit},
    Result,
};

pub const SEG_FIRST: u8 = 0x80;
pub const SEG_LAST: u8 = 0x40;
pub const SEG_CONTROL: u8 = 0x20;

/// One transmitted file: the correlated INMR02 descriptors, the INMR03 data
/// descriptors and the assembled payload records.
#[derive(Debug, Default)]
pub struct FileDescriptor {
    pub number: u32,
    pub utilities: Vec<String>,
    pub inmr02: Vec<Vec<TextUnit>>,
    pub inmr03: Vec<Vec<TextUnit>>,
    pub records: Vec<Vec<u8>>,
}

impl FileDescriptor {
    /// First hit for a key across the INMR02 descriptors, then the INMR03s.
    pub fn unit(&self, key: u16) -> Option<&crate::text_unit::TextUnitValue> {
        self.inmr02
            .iter()
            .chain(self.inmr03.iter())
            .find_map(|units| text_unit::find(units, key))
    }

    pub fn payload_len(&self) -> u64 {
        self.records.iter().map(|r| r.len() as u64).sum()
    }
}

/// A fully framed transmission. `error` carries the abort cause when decoding
/// stopped early; everything decoded up to that point is retained.
#[derive(Debug, Default)]
pub struct Transmission {
    pub inmr01: Vec<TextUnit>,
    pub files: Vec<FileDescriptor>,
    pub exits: Vec<Vec<u8>>,
    pub warnings: Vec<String>,
    pub error: Option<XmitError>,
}

pub fn decode(data: &[u8], codec: &EbcdicCodec, config: &Config) -> Transmission {
    let mut tx = Transmission::default();
    if let Err(e) = decode_inner(data, codec, config, &mut tx) {
        tx.error = Some(e);
    }
    tx
}

fn decode_inner(
    data: &[u8],
    codec: &EbcdicCodec,
    config: &Config,
    tx: &mut Transmission,
) -> Result<()> {
    let mut cur = ByteCursor::new(data);
    let mut seen_inmr01 = false;
    let mut terminated = false;
    // Data records belong to the stream opened by the most recent INMR03.
    let mut streams_seen = 0usize;

    while !terminated && cur.remaining() > 0 {
        // Trailing card-image padding.
        if cur.peek_u8()? == 0 {
            log::debug!(target: "xmi", "stopping at zero padding, offset {}", cur.pos());
            break;
        }

        let offset = cur.pos();
        let (flags, record) = next_record(&mut cur, config)?;

        if flags & SEG_CONTROL == 0 {
            match tx.files.get_mut(streams_seen.wrapping_sub(1)) {
                Some(file) => file.records.push(record),
                None => tx
                    .warnings
                    .push(format!("data record at offset {} precedes any data stream", offset)),
            }
            continue;
        }

        if record.len() < 6 {
            return Err(XmitError::malformed(offset, "control record shorter than its tag"));
        }
        let tag = codec.decode(&record[..6]);
        log::debug!(target: "xmi", "control record {} at offset {}", tag, offset);

        match tag.as_str() {
            "INMR01" => {
                if seen_inmr01 {
                    return Err(XmitError::malformed(offset, "INMR01 encountered twice"));
                }
                seen_inmr01 = true;
                tx.inmr01 = text_unit::decode_units(&record[6..], codec)?;
            }
            "INMR02" => {
                if record.len() < 10 {
                    return Err(XmitError::malformed(offset, "INMR02 without a file number"));
                }
                let number = u32::from_be_bytes([record[6], record[7], record[8], record[9]]);
                let units = text_unit::decode_units(&record[10..], codec)?;
                let utility = text_unit::find_str(&units, keys::INMUTILN)
                    .unwrap_or_default()
                    .to_string();
                if utility == "AMSCIPHR" {
                    return Err(XmitError::UnsupportedUtility(utility));
                }

                match tx.files.iter_mut().find(|f| f.number == number) {
                    Some(file) => {
                        file.utilities.push(utility);
                        file.inmr02.push(units);
                    }
                    None => {
                        let mut file = FileDescriptor::default();
                        file.number = number;
                        file.utilities.push(utility);
                        file.inmr02.push(units);
                        tx.files.push(file);
                    }
                }
            }
            "INMR03" => {
                let units = text_unit::decode_units(&record[6..], codec)?;
                match tx.files.get_mut(streams_seen) {
                    Some(file) => file.inmr03.push(units),
                    None => tx.warnings.push(format!(
                        "INMR03 at offset {} has no matching file descriptor",
                        offset
                    )),
                }
                streams_seen += 1;
            }
            "INMR04" => {
                tx.exits.push(record[6..].to_vec());
            }
            "INMR06" => {
                terminated = true;
            }
            "INMR07" => {}
            _ => {
                return Err(XmitError::malformed(
                    offset,
                    format!("unknown control record tag {:?}", tag),
                ));
            }
        }
    }

    if !seen_inmr01 {
        return Err(XmitError::malformed(0, "transmission carries no INMR01"));
    }
    if !terminated {
        tx.warnings
            .push("transmission is missing its INMR06 terminator".to_string());
    }
    if streams_seen != tx.files.len() {
        tx.warnings.push(format!(
            "{} INMR03 records for {} file descriptors",
            streams_seen,
            tx.files.len()
        ));
    }
    if let Some(numf) = text_unit::find_int(&tx.inmr01, keys::INMNUMF) {
        if numf as usize != tx.files.len() {
            tx.warnings.push(format!(
                "INMNUMF declares {} files, found {}",
                numf,
                tx.files.len()
            ));
        }
    }
    Ok(())
}

/// Assemble the next logical record from its segments. Returns the first
/// segment's flags along with the record bytes.
fn next_record(cur: &mut ByteCursor<'_>, config: &Config) -> Result<(u8, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut first_flags = None;

    loop {
        let offset = cur.pos();
        let length = cur.read_u8()? as usize;
        let flags = cur.read_u8()?;
        if length < 2 {
            return Err(XmitError::malformed(offset, "segment length below 2"));
        }
        buf.extend_from_slice(cur.read_slice(length - 2)?);
        if buf.len() > config.max_record_bytes {
            return Err(XmitError::PolicyViolation {
                size: buf.len(),
                limit: config.max_record_bytes,
            });
        }

        match first_flags {
            None => {
                if flags & SEG_FIRST == 0 {
                    return Err(XmitError::malformed(offset, "record does not start with a first segment"));
                }
                first_flags = Some(flags);
            }
            Some(first) => {
                if (flags ^ first) & SEG_CONTROL != 0 {
                    return Err(XmitError::malformed(
                        offset,
                        "control flag flips between segments of one record",
                    ));
                }
            }
        }

        if flags & SEG_LAST != 0 {
            return Ok((first_flags.unwrap_or_default(), buf));
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::text_unit::fixtures::unit;

    /// Chop `record` into segments of at most `chunk` bytes and frame them.
    pub fn segments(record: &[u8], flags: u8, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let pieces: Vec<&[u8]> = if record.is_empty() {
            vec![&[]]
        } else {
            record.chunks(chunk).collect()
        };
        let n = pieces.len();
        for (i, piece) in pieces.into_iter().enumerate() {
            let mut f = flags;
            if i == 0 {
                f |= SEG_FIRST;
            }
            if i + 1 == n {
                f |= SEG_LAST;
            }
            out.push(piece.len() as u8 + 2);
            out.push(f);
            out.extend_from_slice(piece);
        }
        out
    }

    pub fn control(codec: &EbcdicCodec, tag: &str, body: &[u8]) -> Vec<u8> {
        let mut record = codec.encode(tag).unwrap();
        record.extend_from_slice(body);
        segments(&record, SEG_CONTROL, 60)
    }

    pub fn inmr02(codec: &EbcdicCodec, number: u32, units: &[Vec<u8>]) -> Vec<u8> {
        let mut body = number.to_be_bytes().to_vec();
        for u in units {
            body.extend_from_slice(u);
        }
        control(codec, "INMR02", &body)
    }

    pub fn str_unit(codec: &EbcdicCodec, key: u16, value: &str) -> Vec<u8> {
        unit(key, &[&codec.encode(value).unwrap()])
    }

    pub fn int_unit(key: u16, value: u32) -> Vec<u8> {
        unit(key, &[&value.to_be_bytes()])
    }
}
