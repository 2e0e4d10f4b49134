//! The AWSTAPE / HET framer.
//!
//! Every physical block carries a 6-byte header: current block size and
//! previous block size as little-endian halfwords, then two flag bytes. The
//! high flag byte marks record assembly (0x80 new record, 0x20 end of record,
//! 0x40 tape mark); the low flag byte selects the HET per-block compression
//! (0x01 ZLIB, 0x02 BZIP2). AWS images must leave the low byte clear.
//!
//! A logical record is the concatenation of block bodies from a NEWREC block
//! through the next ENDREC block. A tape mark ends the current file; two in a
//! row end the tape.

use std::io::Read;

use chrono::NaiveDate;

use crate::{
    config::Config,
    cursor::ByteCursor,
    dates,
    ebcdic::EbcdicCodec,
    error::XmitError,
    recfm::RecordFormat,
    FlexString, Result,
};

pub const FLAG_NEWREC: u8 = 0x80;
pub const FLAG_EOF: u8 = 0x40;
pub const FLAG_ENDREC: u8 = 0x20;

pub const COMPRESS_ZLIB: u8 = 0x01;
pub const COMPRESS_BZIP2: u8 = 0x02;

/// Which container variant is being decoded. AWS refuses compressed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeKind {
    Aws,
    Het,
}

/// The VOL1 label.
#[derive(Debug, Clone)]
pub struct Volume {
    pub serial: FlexString,
    pub owner: String,
}

/// Fields gathered from one HDR1+HDR2 label pair (plus user labels).
#[derive(Debug, Clone)]
pub struct DatasetLabels {
    pub name: String,
    pub serial: FlexString,
    pub volume_seq: Option<u32>,
    pub dataset_seq: Option<u32>,
    pub generation: Option<u32>,
    pub version: Option<u32>,
    pub created: Option<NaiveDate>,
    pub expires: Option<NaiveDate>,
    pub recfm: RecordFormat,
    pub blksize: u32,
    pub lrecl: u32,
    pub user_labels: Vec<String>,
    /// Block count from the EOF1 trailer, when one was present.
    pub block_count: Option<u32>,
}

/// One file on the tape: its labels (absent on unlabeled tapes) and its
/// logical records, which are the original dataset's physical blocks.
#[derive(Debug)]
pub struct TapeFile {
    pub name: String,
    pub labels: Option<DatasetLabels>,
    pub blocks: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct TapeImage {
    pub volume: Option<Volume>,
    pub files: Vec<TapeFile>,
    pub warnings: Vec<String>,
    pub error: Option<XmitError>,
}

pub fn decode(data: &[u8], kind: TapeKind, codec: &EbcdicCodec, config: &Config) -> TapeImage {
    let mut image = TapeImage::default();
    if let Err(e) = decode_inner(data, kind, codec, config, &mut image) {
        image.error = Some(e);
    }
    image
}

fn decode_inner(
    data: &[u8],
    kind: TapeKind,
    codec: &EbcdicCodec,
    config: &Config,
    image: &mut TapeImage,
) -> Result<()> {
    let chunks = split_at_tape_marks(data, kind, config)?;

    let mut synthetic = 0usize;
    let mut i = 0;
    while i < chunks.len() {
        let chunk = &chunks[i];
        if chunk.is_empty() {
            i += 1;
            continue;
        }

        if label_kind(&chunk[0], codec).map_or(false, |k| k == "VOL1" || k == "HDR1") {
            let labels = parse_label_group(chunk, codec, image)?;
            let blocks = chunks.get(i + 1).cloned().unwrap_or_default();
            i += 2;

            let mut labels = labels;
            if let Some(trailer) = chunks.get(i) {
                if trailer
                    .first()
                    .and_then(|r| label_kind(r, codec))
                    .map_or(false, |k| k == "EOF1")
                {
                    parse_trailer_group(trailer, codec, &mut labels, blocks.len(), image);
                    i += 1;
                }
            }

            image.files.push(TapeFile {
                name: labels.name.clone(),
                labels: Some(labels),
                blocks,
            });
        } else {
            synthetic += 1;
            image.files.push(TapeFile {
                name: format!("FILE{:04}", synthetic),
                labels: None,
                blocks: chunk.clone(),
            });
            i += 1;
        }
    }
    Ok(())
}

/// Read blocks off the image, assembling logical records and splitting the
/// stream at tape marks. Stops after two consecutive marks or at end of data.
fn split_at_tape_marks(
    data: &[u8],
    kind: TapeKind,
    config: &Config,
) -> Result<Vec<Vec<Vec<u8>>>> {
    let mut cur = ByteCursor::new(data);
    let mut chunks: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
    let mut pending: Option<Vec<u8>> = None;
    let mut marks = 0u8;

    while !cur.is_at_end() {
        let offset = cur.pos();
        let size = cur.read_u16_le()? as usize;
        let _prev_size = cur.read_u16_le()?;
        let flags = cur.read_u8()?;
        let compression = cur.read_u8()?;

        if flags & FLAG_EOF != 0 {
            if pending.is_some() {
                return Err(XmitError::malformed(offset, "tape mark inside a logical record"));
            }
            marks += 1;
            if marks == 2 {
                break;
            }
            chunks.push(Vec::new());
            continue;
        }
        marks = 0;

        let body = cur.read_slice(size)?;
        let body = match (kind, compression) {
            (TapeKind::Aws, 0) => body.to_vec(),
            (TapeKind::Aws, _) => {
                return Err(XmitError::UnsupportedFeature(format!(
                    "compression flag 0x{:02x} in an AWS image",
                    compression
                )));
            }
            (TapeKind::Het, 0) => body.to_vec(),
            (TapeKind::Het, COMPRESS_ZLIB) => {
                inflate(flate2::read::ZlibDecoder::new(body), config, offset)?
            }
            (TapeKind::Het, COMPRESS_BZIP2) => {
                inflate(bzip2::read::BzDecoder::new(body), config, offset)?
            }
            (TapeKind::Het, other) => {
                return Err(XmitError::malformed(
                    offset,
                    format!("unknown compression flag 0x{:02x}", other),
                ));
            }
        };

        if flags & FLAG_NEWREC != 0 {
            if pending.is_some() {
                return Err(XmitError::malformed(offset, "new record opens inside a logical record"));
            }
            pending = Some(body);
        } else {
            match pending.as_mut() {
                Some(buf) => buf.extend_from_slice(&body),
                None => {
                    return Err(XmitError::malformed(offset, "continuation block with no open record"));
                }
            }
        }

        let open_len = pending.as_ref().map_or(0, Vec::len);
        if open_len > config.max_record_bytes {
            return Err(XmitError::PolicyViolation {
                size: open_len,
                limit: config.max_record_bytes,
            });
        }

        if flags & FLAG_ENDREC != 0 {
            let record = pending.take().unwrap_or_default();
            chunks.last_mut().unwrap().push(record);
        }
    }

    if pending.is_some() {
        return Err(XmitError::Truncated {
            offset: cur.pos(),
            needed: 6,
            remaining: cur.remaining(),
        });
    }
    Ok(chunks)
}

fn inflate(mut decoder: impl Read, config: &Config, offset: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let limit = config.max_record_bytes as u64;
    let read = decoder
        .by_ref()
        .take(limit + 1)
        .read_to_end(&mut out)
        .map_err(|e| XmitError::malformed(offset, format!("failed to inflate block: {}", e)))?;
    if read as u64 > limit {
        return Err(XmitError::PolicyViolation {
            size: out.len(),
            limit: config.max_record_bytes,
        });
    }
    Ok(out)
}

/// The 4-character label kind, when the record looks like a standard label.
fn label_kind(record: &[u8], codec: &EbcdicCodec) -> Option<String> {
    if record.len() != 80 {
        return None;
    }
    let kind = codec.decode(&record[..4]);
    match kind.as_str() {
        "VOL1" | "HDR1" | "HDR2" | "EOF1" | "EOF2" => Some(kind),
        _ if kind.starts_with("UHL") || kind.starts_with("UTL") => Some(kind),
        _ => None,
    }
}

fn zoned(field: &str) -> Option<u32> {
    let t = field.trim();
    if t.is_empty() {
        return None;
    }
    t.parse().ok()
}

fn parse_label_group(
    chunk: &[Vec<u8>],
    codec: &EbcdicCodec,
    image: &mut TapeImage,
) -> Result<DatasetLabels> {
    let mut labels = DatasetLabels {
        name: String::new(),
        serial: FlexString::new(),
        volume_seq: None,
        dataset_seq: None,
        generation: None,
        version: None,
        created: None,
        expires: None,
        recfm: RecordFormat::U,
        blksize: 0,
        lrecl: 0,
        user_labels: Vec::new(),
        block_count: None,
    };
    let mut seen_hdr1 = false;

    for record in chunk {
        let kind = match label_kind(record, codec) {
            Some(kind) => kind,
            None => {
                image
                    .warnings
                    .push(format!("unrecognized {}-byte record in a label group", record.len()));
                continue;
            }
        };
        let field = |range: std::ops::Range<usize>| codec.decode(&record[range]);
        match kind.as_str() {
            "VOL1" => {
                image.volume = Some(Volume {
                    serial: FlexString::from(field(4..10).trim_end()),
                    owner: field(41..51).trim().to_string(),
                });
            }
            "HDR1" => {
                seen_hdr1 = true;
                labels.name = field(4..21).trim().to_string();
                labels.serial = FlexString::from(field(21..27).trim_end());
                labels.volume_seq = zoned(&field(27..31));
                labels.dataset_seq = zoned(&field(31..35));
                labels.generation = zoned(&field(35..39));
                labels.version = zoned(&field(39..41));
                labels.created = dates::julian_date(&field(41..47));
                labels.expires = dates::julian_date(&field(47..53));
            }
            "HDR2" => {
                labels.recfm = hdr2_recfm(record, codec);
                labels.blksize = zoned(&field(5..10)).unwrap_or(0);
                labels.lrecl = zoned(&field(10..15)).unwrap_or(0);
            }
            _ if kind.starts_with("UHL") => {
                labels.user_labels.push(field(4..80).trim_end().to_string());
            }
            other => {
                image
                    .warnings
                    .push(format!("{} label outside its expected position", other));
            }
        }
    }

    if !seen_hdr1 {
        return Err(XmitError::malformed(0, "label group without an HDR1"));
    }
    Ok(labels)
}

/// RECFM character at offset 4, block attribute (B/S/R) at offset 38.
fn hdr2_recfm(record: &[u8], codec: &EbcdicCodec) -> RecordFormat {
    let mut recfm = match codec.decode(&record[4..5]).as_str() {
        "F" => "F".parse().unwrap(),
        "V" => "V".parse().unwrap(),
        _ => RecordFormat::U,
    };
    match codec.decode(&record[38..39]).as_str() {
        "B" => recfm.blocked = true,
        "S" => recfm.spanned = true,
        "R" => {
            recfm.blocked = true;
            recfm.spanned = true;
        }
        _ => {}
    }
    recfm
}

fn parse_trailer_group(
    chunk: &[Vec<u8>],
    codec: &EbcdicCodec,
    labels: &mut DatasetLabels,
    data_blocks: usize,
    image: &mut TapeImage,
) {
    for record in chunk {
        let kind = match label_kind(record, codec) {
            Some(kind) => kind,
            None => continue,
        };
        if kind == "EOF1" {
            labels.block_count = zoned(&codec.decode(&record[54..60]));
            if let Some(count) = labels.block_count {
                if count as usize != data_blocks {
                    image.warnings.push(format!(
                        "EOF1 for {} declares {} blocks, found {}",
                        labels.name, count, data_blocks
                    ));
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use fixtures::*;

    fn codec() -> EbcdicCodec {
        EbcdicCodec::default()
    }

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn assembles_split_records_on_an_unlabeled_tape() {
        let mut data = record(&[0x11; 100], 40, 0);
        data.extend(record(&[0x22; 10], 40, 0));
        data.extend(tape_mark());
        data.extend(tape_mark());

        let image = decode(&data, TapeKind::Aws, &codec(), &config());
        assert!(image.error.is_none(), "{:?}", image.error);
        assert_eq!(image.files.len(), 1);
        assert_eq!(image.files[0].name, "FILE0001");
        assert!(image.files[0].labels.is_none());
        assert_eq!(image.files[0].blocks.len(), 2);
        assert_eq!(image.files[0].blocks[0], vec![0x11; 100]);
    }

    #[test]
    fn two_unlabeled_files_get_sequential_names() {
        let mut data = record(b"one", 64, 0);
        data.extend(tape_mark());
        data.extend(record(b"two", 64, 0));
        data.extend(tape_mark());
        data.extend(tape_mark());

        let image = decode(&data, TapeKind::Aws, &codec(), &config());
        assert_eq!(image.files.len(), 2);
        assert_eq!(image.files[0].name, "FILE0001");
        assert_eq!(image.files[1].name, "FILE0002");
    }

    #[test]
    fn labeled_tape_parses_the_header_group() {
        let codec = codec();
        let mut data = Vec::new();
        for l in [
            vol1(&codec, "XMILIB", "OWNER"),
            hdr1(&codec, "PYTHON.XMI.SEQ", "XMILIB", " 21067"),
            hdr2(&codec, 'F', 3200, 80, 'B'),
        ]
        .iter()
        {
            data.extend(record(l, 80, 0));
        }
        data.extend(tape_mark());
        let body: Vec<u8> = (0..160).map(|i| i as u8).collect();
        data.extend(record(&body, 200, 0));
        data.extend(tape_mark());
        data.extend(tape_mark());

        let image = decode(&data, TapeKind::Aws, &codec, &config());
        assert!(image.error.is_none(), "{:?}", image.error);
        let volume = image.volume.as_ref().unwrap();
        assert_eq!(volume.serial.as_str(), "XMILIB");

        assert_eq!(image.files.len(), 1);
        let file = &image.files[0];
        assert_eq!(file.name, "PYTHON.XMI.SEQ");
        let labels = file.labels.as_ref().unwrap();
        assert_eq!(labels.recfm.to_string(), "FB");
        assert_eq!(labels.blksize, 3200);
        assert_eq!(labels.lrecl, 80);
        assert_eq!(dates::iso_date(&labels.created.unwrap()), "2021-03-08");
        assert_eq!(file.blocks, vec![body]);
    }

    #[test]
    fn compressed_blocks_fail_as_aws_and_inflate_as_het() {
        let body = vec![0x5A; 300];
        let packed = deflate_zlib(&body);
        let mut data = record(&packed, 1024, COMPRESS_ZLIB);
        data.extend(tape_mark());
        data.extend(tape_mark());

        let image = decode(&data, TapeKind::Aws, &codec(), &config());
        assert!(matches!(
            image.error,
            Some(XmitError::UnsupportedFeature(_))
        ));

        let image = decode(&data, TapeKind::Het, &codec(), &config());
        assert!(image.error.is_none(), "{:?}", image.error);
        assert_eq!(image.files[0].blocks, vec![body]);
    }

    #[test]
    fn bzip2_blocks_inflate() {
        let body = vec![0x33; 256];
        let packed = deflate_bzip2(&body);
        let mut data = record(&packed, 1024, COMPRESS_BZIP2);
        data.extend(tape_mark());
        data.extend(tape_mark());

        let image = decode(&data, TapeKind::Het, &codec(), &config());
        assert!(image.error.is_none(), "{:?}", image.error);
        assert_eq!(image.files[0].blocks, vec![body]);
    }

    #[test]
    fn tape_mark_inside_a_record_is_malformed() {
        let mut data = fixtures::block(&[1, 2, 3], 0, FLAG_NEWREC, 0);
        data.extend(tape_mark());

        let image = decode(&data, TapeKind::Aws, &codec(), &config());
        assert!(matches!(image.error, Some(XmitError::MalformedRecord { .. })));
    }

    #[test]
    fn unterminated_record_is_truncated() {
        let data = fixtures::block(&[1, 2, 3], 0, FLAG_NEWREC, 0);
        let image = decode(&data, TapeKind::Aws, &codec(), &config());
        assert!(matches!(image.error, Some(XmitError::Truncated { .. })));
    }
}
