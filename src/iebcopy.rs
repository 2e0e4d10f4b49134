//! The IEBCOPY unload decoder.
//!
//! An unloaded partitioned dataset is a stream of logical records, each
//! opening with an 8-byte internal header. The first record is COPYR1,
//! recognized by the `0xCA6D0F` eye-catcher at offset 8; the second is COPYR2
//! with the DEB header and sixteen extent descriptors. Directory records
//! follow until the 8 x 0xFF end-of-directory name, then member data records
//! whose 8-byte control headers carry the owning TTR.

use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    config::Config,
    cursor::ByteCursor,
    dates,
    ebcdic::EbcdicCodec,
    error::XmitError,
    recfm::RecordFormat,
    FlexString, Result,
};

const EYE_CATCHER: [u8; 3] = [0xCA, 0x6D, 0x0F];
const DIRECTORY_END_NAME: [u8; 8] = [0xFF; 8];

pub const DSORG_PO: u16 = 0x0200;
pub const DSORG_POE: u16 = 0x0208;

/// Device geometry carried by COPYR1, retained for dumps.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub ucb_type: [u8; 4],
    pub max_record: u32,
    pub cylinders: u16,
    pub tracks_per_cylinder: u16,
    pub track_length: u16,
    pub block_overhead: u16,
}

/// The COPYR1 control record: the unloaded dataset's DSCB-derived attributes.
#[derive(Debug, Clone)]
pub struct Copyr1 {
    pub dsorg: u16,
    pub blksize: u16,
    pub lrecl: u16,
    pub recfm_byte: u8,
    pub recfm: RecordFormat,
    pub key_length: u8,
    pub option_codes: u8,
    pub sms_flags: u8,
    pub container_blksize: u16,
    pub device: DeviceInfo,
    pub last_referenced: Option<NaiveDate>,
    pub secondary_space_extension: [u8; 3],
    pub secondary_allocation: [u8; 4],
    pub last_used_ttr: [u8; 3],
    pub track_balance: [u8; 2],
}

impl Copyr1 {
    pub fn is_pdse(&self) -> bool {
        self.dsorg == DSORG_POE
    }
}

/// The COPYR2 control record: DEB header plus sixteen raw extent descriptors.
#[derive(Debug, Clone)]
pub struct Copyr2 {
    pub deb: Vec<u8>,
    pub extents: Vec<Vec<u8>>,
}

/// ISPF statistics decoded from a directory entry's 30-byte parms.
#[derive(Debug, Clone)]
pub struct IspfStats {
    pub version: String,
    pub flags: u8,
    pub created: Option<NaiveDate>,
    pub modified: Option<NaiveDateTime>,
    pub lines: u16,
    pub newlines: u16,
    pub modlines: u16,
    pub owner: FlexString,
}

/// A member reconstructed from the directory and its data groups.
#[derive(Debug)]
pub struct Member {
    pub name: FlexString,
    pub ttr: u32,
    pub alias: bool,
    pub halfwords: u8,
    pub notes: u8,
    pub parms: Vec<u8>,
    pub ispf: Option<IspfStats>,
    pub records: Vec<Vec<u8>>,
}

impl Member {
    pub fn bytes(&self) -> Vec<u8> {
        self.records.concat()
    }

    pub fn byte_len(&self) -> u64 {
        self.records.iter().map(|r| r.len() as u64).sum()
    }
}

/// The decoded unload stream. Partially populated when `error` is set.
#[derive(Debug, Default)]
pub struct UnloadedPds {
    pub copyr1: Option<Copyr1>,
    pub copyr2: Option<Copyr2>,
    pub members: Vec<Member>,
    pub warnings: Vec<String>,
    pub error: Option<XmitError>,
}

/// True when the record stream opens with a COPYR1 eye-catcher.
pub fn looks_unloaded(records: &[Vec<u8>]) -> bool {
    records
        .first()
        .map_or(false, |r| r.len() >= 11 && r[8..11] == EYE_CATCHER)
}

pub fn decode(records: &[Vec<u8>], codec: &EbcdicCodec, config: &Config) -> UnloadedPds {
    let mut pds = UnloadedPds::default();
    if let Err(e) = decode_inner(records, codec, config, &mut pds) {
        pds.error = Some(e);
    }
    pds
}

fn decode_inner(
    records: &[Vec<u8>],
    codec: &EbcdicCodec,
    config: &Config,
    pds: &mut UnloadedPds,
) -> Result<()> {
    let mut stream = records.iter();
    let mut consumed = 0usize;
    let mut next_record = |expect: &str| {
        let record = stream.next().ok_or(XmitError::Truncated {
            offset: consumed,
            needed: 1,
            remaining: 0,
        });
        if let Ok(r) = &record {
            consumed += r.len();
        }
        record.map_err(|e| {
            log::debug!(target: "iebcopy", "stream ends before {}", expect);
            e
        })
    };

    // Phase 1: control records.
    let copyr1 = parse_copyr1(next_record("COPYR1")?)?;
    let recfm = copyr1.recfm;
    let lrecl = config.lrecl_override.unwrap_or(copyr1.lrecl as usize);
    let pdse = copyr1.is_pdse();
    pds.copyr1 = Some(copyr1);
    if pdse {
        pds.warnings
            .push("PDSE unload: member extraction is best-effort".to_string());
    }

    pds.copyr2 = Some(parse_copyr2(next_record("COPYR2")?)?);

    // Phase 2: directory blocks.
    let mut entries: Vec<DirectoryEntry> = Vec::new();
    loop {
        let record = next_record("directory block")?;
        if parse_directory_record(record, codec, &mut entries, pds)? {
            break;
        }
    }

    // Phase 3: member data groups keyed by TTR, in stream order.
    let mut groups: Vec<(u32, Vec<Vec<u8>>)> = Vec::new();
    'data: for record in stream {
        let mut cur = ByteCursor::new(record);
        while cur.remaining() >= 8 {
            let _flag = cur.read_u8()?;
            let _extent = cur.read_u8()?;
            let _record_count = cur.read_u16_be()?;
            let ttr = cur.read_u24_be()?;
            let length = cur.read_u16_be()? as usize;
            if ttr == 0 && length == 0 {
                break 'data;
            }
            let payload = cur.read_slice(length)?.to_vec();
            match groups.iter_mut().find(|(t, _)| *t == ttr) {
                Some((_, blocks)) => blocks.push(payload),
                None => groups.push((ttr, vec![payload])),
            }
        }
    }

    // Attach data to directory entries; the first non-alias entry per TTR
    // owns the blocks.
    let mut claimed = vec![false; groups.len()];
    for entry in entries {
        let blocks = if entry.alias {
            None
        } else {
            groups
                .iter()
                .position(|(t, _)| *t == entry.ttr)
                .map(|i| {
                    claimed[i] = true;
                    groups[i].1.clone()
                })
        };
        let records = match blocks {
            Some(blocks) => recfm.deblock(&blocks, lrecl, config.max_record_bytes)?,
            None => {
                if !entry.alias {
                    pds.warnings
                        .push(format!("member {} has no data groups", entry.name));
                }
                Vec::new()
            }
        };
        pds.members.push(Member {
            name: entry.name,
            ttr: entry.ttr,
            alias: entry.alias,
            halfwords: entry.halfwords,
            notes: entry.notes,
            parms: entry.parms,
            ispf: entry.ispf,
            records,
        });
    }

    for (i, (ttr, blocks)) in groups.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        pds.warnings.push(format!(
            "data groups for TTR {:06x} match no directory entry",
            ttr
        ));
        pds.members.push(Member {
            name: FlexString::from(format!("__ORPHAN_{:06x}__", ttr).as_str()),
            ttr: *ttr,
            alias: false,
            halfwords: 0,
            notes: 0,
            parms: Vec::new(),
            ispf: None,
            records: recfm.deblock(blocks, lrecl, config.max_record_bytes)?,
        });
    }

    Ok(())
}

fn parse_copyr1(record: &[u8]) -> Result<Copyr1> {
    let mut cur = ByteCursor::new(record);
    cur.read_slice(8)?;
    if cur.read_slice(3)? != &EYE_CATCHER[..] {
        return Err(XmitError::malformed(8, "COPYR1 eye-catcher missing"));
    }

    let dsorg = cur.read_u16_be()?;
    let blksize = cur.read_u16_be()?;
    let lrecl = cur.read_u16_be()?;
    let recfm_byte = cur.read_u8()?;
    let key_length = cur.read_u8()?;
    let option_codes = cur.read_u8()?;
    let sms_flags = cur.read_u8()?;
    let container_blksize = cur.read_u16_be()?;

    let mut ucb_type = [0u8; 4];
    ucb_type.copy_from_slice(cur.read_slice(4)?);
    let device = DeviceInfo {
        ucb_type,
        max_record: cur.read_u32_be()?,
        cylinders: cur.read_u16_be()?,
        tracks_per_cylinder: cur.read_u16_be()?,
        track_length: cur.read_u16_be()?,
        block_overhead: cur.read_u16_be()?,
    };

    let last_referenced = dates::packed_date(cur.read_slice(3)?);
    let mut secondary_space_extension = [0u8; 3];
    secondary_space_extension.copy_from_slice(cur.read_slice(3)?);
    let mut secondary_allocation = [0u8; 4];
    secondary_allocation.copy_from_slice(cur.read_slice(4)?);
    let mut last_used_ttr = [0u8; 3];
    last_used_ttr.copy_from_slice(cur.read_slice(3)?);
    let mut track_balance = [0u8; 2];
    track_balance.copy_from_slice(cur.read_slice(2)?);

    if dsorg != DSORG_PO && dsorg != DSORG_POE {
        return Err(XmitError::malformed(
            11,
            format!("COPYR1 DSORG 0x{:04x} is not partitioned", dsorg),
        ));
    }

    Ok(Copyr1 {
        dsorg,
        blksize,
        lrecl,
        recfm_byte,
        recfm: RecordFormat::from_ds1_byte(recfm_byte),
        key_length,
        option_codes,
        sms_flags,
        container_blksize,
        device,
        last_referenced,
        secondary_space_extension,
        secondary_allocation,
        last_used_ttr,
        track_balance,
    })
}

fn parse_copyr2(record: &[u8]) -> Result<Copyr2> {
    let mut cur = ByteCursor::new(record);
    let deb = cur.read_slice(16)?.to_vec();
    let mut extents = Vec::with_capacity(16);
    for _ in 0..16 {
        extents.push(cur.read_slice(16)?.to_vec());
    }
    Ok(Copyr2 { deb, extents })
}

struct DirectoryEntry {
    name: FlexString,
    ttr: u32,
    alias: bool,
    halfwords: u8,
    notes: u8,
    parms: Vec<u8>,
    ispf: Option<IspfStats>,
}

/// Parse one directory record into `entries`. Returns true once the
/// end-of-directory name was seen.
fn parse_directory_record(
    record: &[u8],
    codec: &EbcdicCodec,
    entries: &mut Vec<DirectoryEntry>,
    pds: &mut UnloadedPds,
) -> Result<bool> {
    let mut cur = ByteCursor::new(record);
    let marker = cur.read_slice(8)?;
    if marker[1..].iter().any(|&b| b != 0) || (marker[0] != 0 && marker[0] != 0x08) {
        return Err(XmitError::malformed(0, "directory record marker is invalid"));
    }
    let _key_length = cur.read_u16_be()?;
    let used = cur.read_u16_be()? as usize;
    let _last_name = cur.read_slice(8)?;

    let area = if used > 0 && used <= cur.remaining() {
        cur.read_slice(used)?
    } else {
        cur.read_slice(cur.remaining())?
    };

    let mut cur = ByteCursor::new(area);
    while cur.remaining() >= 8 {
        let name_bytes = cur.read_slice(8)?;
        if name_bytes == &DIRECTORY_END_NAME[..] {
            return Ok(true);
        }
        if name_bytes.iter().all(|&b| b == 0) {
            // Block padding.
            break;
        }
        let name = codec.decode_name(name_bytes);
        let ttr = cur.read_u24_be()?;
        let c = cur.read_u8()?;
        let alias = c & 0x80 != 0;
        let halfwords = c & 0x1F;
        let notes = cur.read_u8()?;
        let parms = cur.read_slice(halfwords as usize * 2)?.to_vec();

        let ispf = if halfwords == 15 {
            let stats = ispf_stats(&parms, codec);
            if stats.is_none() {
                pds.warnings
                    .push(format!("member {} carries undecodable ISPF statistics", name));
            }
            stats
        } else {
            None
        };

        entries.push(DirectoryEntry {
            name,
            ttr,
            alias,
            halfwords,
            notes,
            parms,
            ispf,
        });
    }
    Ok(false)
}

/// Decode the 30-byte ISPF statistics area of a directory entry.
fn ispf_stats(parms: &[u8], codec: &EbcdicCodec) -> Option<IspfStats> {
    if parms.len() < 28 {
        return None;
    }
    let version = format!("{:02}.{:02}", dates::bcd(parms[0])?, dates::bcd(parms[1])?);
    let created = dates::packed_date(&parms[3..6]);
    let modified = dates::packed_date(&parms[6..9]).and_then(|date| {
        let hour = dates::bcd(parms[9])? as u32;
        let minute = dates::bcd(parms[10])? as u32;
        let second = dates::bcd(parms[18])? as u32;
        let hundredths = dates::bcd(parms[19])? as u32;
        date.and_hms_micro_opt(hour, minute, second, hundredths * 10_000)
    });

    Some(IspfStats {
        version,
        flags: parms[2],
        created,
        modified,
        lines: u16::from_be_bytes([parms[11], parms[12]]),
        newlines: u16::from_be_bytes([parms[13], parms[14]]),
        modlines: u16::from_be_bytes([parms[15], parms[16]]),
        owner: codec.decode_name(&parms[20..28]),
    })
}
