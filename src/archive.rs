//! The archive model and the orchestrator that peels nested containers.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::{
    config::Config,
    ebcdic::EbcdicCodec,
    error::XmitError,
    iebcopy::{self, Copyr1, Copyr2, Member},
    recfm::RecordFormat,
    tape::{self, DatasetLabels, TapeKind, Volume},
    text::{self, Classification},
    text_unit::{self, keys, TextUnit},
    xmi, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerKind {
    #[serde(rename = "XMI")]
    Xmi,
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "HET")]
    Het,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Xmi => write!(f, "XMI"),
            ContainerKind::Aws => write!(f, "AWS"),
            ContainerKind::Het => write!(f, "HET"),
        }
    }
}

/// Dataset organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DsOrg {
    #[serde(rename = "PS")]
    Ps,
    #[serde(rename = "PO")]
    Po,
    #[serde(rename = "PO-E")]
    PoE,
}

impl fmt::Display for DsOrg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsOrg::Ps => write!(f, "PS"),
            DsOrg::Po => write!(f, "PO"),
            DsOrg::PoE => write!(f, "PO-E"),
        }
    }
}

/// One reconstructed dataset: a single byte stream for PS, members for PO.
#[derive(Debug)]
pub struct Dataset {
    /// Absent for messages and for sequential files from unlabeled sources.
    pub name: Option<String>,
    pub org: DsOrg,
    pub recfm: RecordFormat,
    pub lrecl: usize,
    pub blksize: usize,
    /// Total payload bytes as found in the container.
    pub unloaded_bytes: u64,
    pub created: Option<NaiveDateTime>,
    pub members: Vec<Member>,
    /// Logical records of the byte stream; empty for PO datasets.
    pub records: Vec<Vec<u8>>,
    pub copyr1: Option<Copyr1>,
    pub copyr2: Option<Copyr2>,
    /// Standard-label fields, for tape sources.
    pub labels: Option<DatasetLabels>,
    /// Control-record metadata preserved for dumps (XMI sources).
    pub inmr02: Vec<Vec<TextUnit>>,
    pub inmr03: Vec<Vec<TextUnit>>,
}

impl Dataset {
    fn empty(org: DsOrg) -> Self {
        Dataset {
            name: None,
            org,
            recfm: RecordFormat::U,
            lrecl: 0,
            blksize: 0,
            unloaded_bytes: 0,
            created: None,
            members: Vec::new(),
            records: Vec::new(),
            copyr1: None,
            copyr2: None,
            labels: None,
            inmr02: Vec::new(),
            inmr03: Vec::new(),
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.records.concat()
    }

    pub fn byte_len(&self) -> u64 {
        self.records.iter().map(|r| r.len() as u64).sum()
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name.as_str() == name)
    }

    pub fn classify(&self, codec: &EbcdicCodec, config: &Config) -> Classification {
        text::classify(&self.bytes(), &self.recfm, self.lrecl, codec, config)
    }

    /// Render the PS byte stream as text, honoring the unnum policy.
    pub fn text(&self, codec: &EbcdicCodec, config: &Config) -> String {
        text::rendered(&self.records, &self.recfm, self.lrecl, codec, config)
    }

    pub fn classify_member(
        &self,
        member: &Member,
        codec: &EbcdicCodec,
        config: &Config,
    ) -> Classification {
        text::classify(&member.bytes(), &self.recfm, self.lrecl, codec, config)
    }

    pub fn member_text(&self, member: &Member, codec: &EbcdicCodec, config: &Config) -> String {
        text::rendered(&member.records, &self.recfm, self.lrecl, codec, config)
    }
}

/// The root of the decoded tree, one per input file.
#[derive(Debug)]
pub struct Archive {
    pub kind: ContainerKind,
    pub datasets: Vec<Dataset>,
    /// At most one message, stored as a nameless PS dataset.
    pub message: Option<Dataset>,
    pub timestamp: Option<NaiveDateTime>,
    pub from_node: Option<String>,
    pub from_user: Option<String>,
    pub to_node: Option<String>,
    pub to_user: Option<String>,
    /// VOL1 fields, for tape sources.
    pub volume: Option<Volume>,
    /// INMR01 metadata preserved for dumps (XMI sources).
    pub inmr01: Vec<TextUnit>,
    /// Raw INMR04 installation-exit payloads, in order of appearance.
    pub inmr04: Vec<Vec<u8>>,
    pub warnings: Vec<String>,
    /// The abort cause, when decoding stopped early. The archive holds
    /// everything decoded up to the error site.
    pub error: Option<XmitError>,
}

impl Archive {
    fn empty(kind: ContainerKind) -> Self {
        Archive {
            kind,
            datasets: Vec::new(),
            message: None,
            timestamp: None,
            from_node: None,
            from_user: None,
            to_node: None,
            to_user: None,
            volume: None,
            inmr01: Vec::new(),
            inmr04: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn open_file<P: AsRef<Path>>(path: P, config: &Config) -> Result<Archive> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        Archive::decode_as(&data, kind_from_extension(path), config)
    }

    pub fn decode(data: &[u8], config: &Config) -> Result<Archive> {
        Archive::decode_as(data, None, config)
    }

    /// Decode with an optional expected container kind; sniffed otherwise.
    pub fn decode_as(
        data: &[u8],
        kind: Option<ContainerKind>,
        config: &Config,
    ) -> Result<Archive> {
        let codec = EbcdicCodec::new(&config.encoding)?;
        let kind = match kind {
            Some(kind) => kind,
            None => sniff(data).ok_or(XmitError::UnknownContainer)?,
        };
        let archive = match kind {
            ContainerKind::Xmi => decode_xmi(data, &codec, config, 0),
            ContainerKind::Aws => decode_tape(data, TapeKind::Aws, &codec, config),
            ContainerKind::Het => decode_tape(data, TapeKind::Het, &codec, config),
        };
        for warning in &archive.warnings {
            log::warn!(target: "archive", "{}", warning);
        }
        Ok(archive)
    }

    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets
            .iter()
            .find(|d| d.name.as_deref() == Some(name))
    }

    /// Fold the stored abort cause into a `Result`.
    pub fn ok(self) -> Result<Archive> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

fn kind_from_extension(path: &Path) -> Option<ContainerKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "xmi" | "xmit" => Some(ContainerKind::Xmi),
        "aws" => Some(ContainerKind::Aws),
        "het" => Some(ContainerKind::Het),
        _ => None,
    }
}

const INMR01_EBCDIC: [u8; 6] = [0xC9, 0xD5, 0xD4, 0xD9, 0xF0, 0xF1];

/// Detect the container kind from the first 8 bytes.
pub fn sniff(data: &[u8]) -> Option<ContainerKind> {
    if data.len() < 8 {
        return None;
    }
    // INMR01, bare or behind the first segment header.
    if data[..6] == INMR01_EBCDIC || &data[..6] == b"INMR01" || data[2..8] == INMR01_EBCDIC {
        return Some(ContainerKind::Xmi);
    }
    // A plausible tape block header: a tape mark, or a record start with data.
    let size = u16::from_le_bytes([data[0], data[1]]);
    let flags = data[4];
    let compression = data[5];
    let plausible = (flags & tape::FLAG_EOF != 0 && size == 0)
        || (flags & tape::FLAG_NEWREC != 0 && size > 0);
    if !plausible {
        return None;
    }
    match compression {
        0 => Some(ContainerKind::Aws),
        tape::COMPRESS_ZLIB | tape::COMPRESS_BZIP2 => Some(ContainerKind::Het),
        _ => None,
    }
}

fn decode_xmi(data: &[u8], codec: &EbcdicCodec, config: &Config, depth: usize) -> Archive {
    let mut archive = Archive::empty(ContainerKind::Xmi);
    let mut tx = xmi::decode(data, codec, config);
    archive.warnings.append(&mut tx.warnings);
    let framing_error = tx.error.take();

    archive.timestamp = text_unit::find_timestamp(&tx.inmr01, keys::INMFTIME);
    archive.from_node = text_unit::find_str(&tx.inmr01, keys::INMFNODE).map(str::to_string);
    archive.from_user = text_unit::find_str(&tx.inmr01, keys::INMFUID).map(str::to_string);
    archive.to_node = text_unit::find_str(&tx.inmr01, keys::INMTNODE).map(str::to_string);
    archive.to_user = text_unit::find_str(&tx.inmr01, keys::INMTUID).map(str::to_string);
    archive.inmr01 = tx.inmr01;
    archive.inmr04 = std::mem::take(&mut tx.exits);

    // Files framed before the error site are still attached.
    for file in tx.files {
        if archive.error.is_some() {
            break;
        }
        attach_xmi_file(&mut archive, file, codec, config, depth);
    }
    if archive.error.is_none() {
        archive.error = framing_error;
    }
    archive
}

/// Build a dataset from one transmitted file and attach it to the archive,
/// recursing into nested containers.
fn attach_xmi_file(
    archive: &mut Archive,
    mut file: xmi::FileDescriptor,
    codec: &EbcdicCodec,
    config: &Config,
    depth: usize,
) {
    let name = file
        .unit(keys::INMDSNAM)
        .and_then(|v| match v {
            text_unit::TextUnitValue::Str(s) => Some(s.clone()),
            _ => None,
        });
    let is_message = archive.message.is_none()
        && name.is_none()
        && !file.utilities.is_empty()
        && file.utilities.iter().all(|u| u == "INMCOPY");

    let declared_size = match file.unit(keys::INMSIZE) {
        Some(text_unit::TextUnitValue::Int(n)) => Some(*n),
        _ => None,
    };
    let is_unloaded = file.utilities.iter().any(|u| u == "IEBCOPY");

    let mut ds = Dataset::empty(DsOrg::Ps);
    ds.name = name;
    if let Some(text_unit::TextUnitValue::Int(recfm)) = file.unit(keys::INMRECFM) {
        let byte = if recfm & 0xFF != 0 {
            (recfm & 0xFF) as u8
        } else {
            (recfm >> 8) as u8
        };
        ds.recfm = RecordFormat::from_ds1_byte(byte);
    }
    if let Some(text_unit::TextUnitValue::Int(n)) = file.unit(keys::INMLRECL) {
        ds.lrecl = *n as usize;
    }
    if let Some(text_unit::TextUnitValue::Int(n)) = file.unit(keys::INMBLKSZ) {
        ds.blksize = *n as usize;
    }
    if let Some(text_unit::TextUnitValue::Int(n)) = file.unit(keys::INMDSORG) {
        ds.org = match *n as u16 {
            iebcopy::DSORG_PO => DsOrg::Po,
            iebcopy::DSORG_POE => DsOrg::PoE,
            _ => DsOrg::Ps,
        };
    }
    if let Some(ts) = file
        .unit(keys::INMCREAT)
        .and_then(|v| match v {
            text_unit::TextUnitValue::Timestamp(ts) => Some(*ts),
            _ => None,
        })
    {
        ds.created = Some(ts);
    }
    ds.unloaded_bytes = file.payload_len();
    if let Some(size) = declared_size {
        if size != ds.unloaded_bytes {
            archive.warnings.push(format!(
                "INMSIZE declares {} bytes, found {}",
                size, ds.unloaded_bytes
            ));
        }
    }

    let records = std::mem::take(&mut file.records);
    ds.inmr02 = std::mem::take(&mut file.inmr02);
    ds.inmr03 = std::mem::take(&mut file.inmr03);

    if is_unloaded || ds.org != DsOrg::Ps {
        let mut pds = iebcopy::decode(&records, codec, config);
        archive.warnings.append(&mut pds.warnings);
        if let Some(copyr1) = &pds.copyr1 {
            ds.org = if copyr1.is_pdse() { DsOrg::PoE } else { DsOrg::Po };
            ds.recfm = copyr1.recfm;
            ds.lrecl = copyr1.lrecl as usize;
            ds.blksize = copyr1.blksize as usize;
        }
        ds.copyr1 = pds.copyr1;
        ds.copyr2 = pds.copyr2;
        ds.members = pds.members;
        archive.error = pds.error;
        archive.datasets.push(ds);
        return;
    }

    // A sequential payload may itself be a transmission.
    let bytes = records.concat();
    if sniff(&bytes) == Some(ContainerKind::Xmi) {
        if depth + 1 >= config.max_nested {
            archive.warnings.push(format!(
                "nested transmission ignored at depth {} (limit {})",
                depth + 1,
                config.max_nested
            ));
        } else {
            let nested = decode_xmi(&bytes, codec, config, depth + 1);
            splice(archive, nested);
            return;
        }
    }

    ds.records = records;
    if is_message {
        archive.message = Some(ds);
    } else {
        archive.datasets.push(ds);
    }
}

/// Merge a nested archive's contents into the parent, in order.
fn splice(archive: &mut Archive, nested: Archive) {
    let Archive {
        datasets,
        message,
        mut warnings,
        error,
        ..
    } = nested;
    archive.datasets.extend(datasets);
    if let Some(message) = message {
        if archive.message.is_none() {
            archive.message = Some(message);
        } else {
            archive.datasets.push(message);
        }
    }
    archive.warnings.append(&mut warnings);
    if archive.error.is_none() {
        archive.error = error;
    }
}

fn decode_tape(data: &[u8], kind: TapeKind, codec: &EbcdicCodec, config: &Config) -> Archive {
    let container = match kind {
        TapeKind::Aws => ContainerKind::Aws,
        TapeKind::Het => ContainerKind::Het,
    };
    let mut archive = Archive::empty(container);
    let mut image = tape::decode(data, kind, codec, config);
    archive.warnings.append(&mut image.warnings);
    let framing_error = image.error.take();
    archive.volume = image.volume.take();

    for file in image.files {
        if archive.error.is_some() {
            break;
        }
        attach_tape_file(&mut archive, file, codec, config);
    }
    if archive.error.is_none() {
        archive.error = framing_error;
    }
    archive
}

fn attach_tape_file(
    archive: &mut Archive,
    file: tape::TapeFile,
    codec: &EbcdicCodec,
    config: &Config,
) {
    let mut ds = Dataset::empty(DsOrg::Ps);
    ds.name = Some(file.name.clone());
    if let Some(labels) = &file.labels {
        ds.recfm = labels.recfm;
        ds.lrecl = labels.lrecl as usize;
        ds.blksize = labels.blksize as usize;
        ds.created = labels.created.and_then(|d| d.and_hms_opt(0, 0, 0));
    }
    let lrecl = config.lrecl_override.unwrap_or(ds.lrecl);

    let records = match ds.recfm.deblock(&file.blocks, lrecl, config.max_record_bytes) {
        Ok(records) => records,
        Err(e) => {
            archive.error = Some(e);
            ds.labels = file.labels;
            archive.datasets.push(ds);
            return;
        }
    };
    ds.unloaded_bytes = records.iter().map(|r| r.len() as u64).sum();
    ds.labels = file.labels;

    if iebcopy::looks_unloaded(&records) {
        let mut pds = iebcopy::decode(&records, codec, config);
        archive.warnings.append(&mut pds.warnings);
        if let Some(copyr1) = &pds.copyr1 {
            ds.org = if copyr1.is_pdse() { DsOrg::PoE } else { DsOrg::Po };
        }
        ds.copyr1 = pds.copyr1;
        ds.copyr2 = pds.copyr2;
        ds.members = pds.members;
        archive.error = pds.error;
        archive.datasets.push(ds);
        return;
    }

    let bytes = records.concat();
    if sniff(&bytes) == Some(ContainerKind::Xmi) {
        if config.max_nested > 1 {
            let nested = decode_xmi(&bytes, codec, config, 1);
            splice(archive, nested);
            return;
        }
        archive
            .warnings
            .push("nested transmission ignored at depth 1 (limit 1)".to_string());
    }

    ds.records = records;
    archive.datasets.push(ds);
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::iebcopy::fixtures as pds_fix;
    use crate::text_unit::fixtures::unit;
    use crate::xmi::fixtures as xmi_fix;

    /// A transmission resembling the shipped `test_seq.xmi` sample.
    pub(crate) fn seq_xmi(codec: &EbcdicCodec) -> Vec<u8> {
        let mut inmr01 = Vec::new();
        inmr01.extend(xmi_fix::str_unit(codec, keys::INMFTIME, "20210309045318"));
        inmr01.extend(xmi_fix::str_unit(codec, keys::INMFNODE, "ORIGNODE"));
        inmr01.extend(xmi_fix::str_unit(codec, keys::INMFUID, "ORIGUID"));
        inmr01.extend(xmi_fix::str_unit(codec, keys::INMTNODE, "DESTNODE"));
        inmr01.extend(xmi_fix::str_unit(codec, keys::INMTUID, "DESTUID"));
        inmr01.extend(unit(keys::INMNUMF, &[&[0x00, 0x01]]));

        let mut data = xmi_fix::control(codec, "INMR01", &inmr01);
        data.extend(xmi_fix::inmr02(
            codec,
            1,
            &[
                xmi_fix::str_unit(codec, keys::INMUTILN, "INMCOPY"),
                xmi_fix::str_unit(codec, keys::INMDSNAM, "PYTHON.XMI.SEQ"),
                unit(keys::INMDSORG, &[&0x4000u16.to_be_bytes()]),
                unit(keys::INMRECFM, &[&0x0090u16.to_be_bytes()]),
                unit(keys::INMLRECL, &[&80u16.to_be_bytes()]),
                unit(keys::INMSIZE, &[&160u32.to_be_bytes()]),
            ],
        ));
        data.extend(xmi_fix::control(codec, "INMR03", &[]));
        for line in &["HELLO FROM THE HOST", "SECOND LINE"] {
            let record = codec.encode(&format!("{:<80}", line)).unwrap();
            data.extend(xmi_fix::segments(&record, 0, 60));
        }
        data.extend(xmi_fix::control(codec, "INMR06", &[]));
        data
    }

    /// A transmission resembling `test_pds_msg.xmi`: a message plus a PDS.
    pub(crate) fn pds_msg_xmi(codec: &EbcdicCodec) -> Vec<u8> {
        let mut data = xmi_fix::control(
            codec,
            "INMR01",
            &unit(keys::INMNUMF, &[&[0x00, 0x02]]),
        );
        // The message: INMCOPY, no INMDSNAM.
        data.extend(xmi_fix::inmr02(
            codec,
            1,
            &[
                xmi_fix::str_unit(codec, keys::INMUTILN, "INMCOPY"),
                unit(keys::INMRECFM, &[&0x0090u16.to_be_bytes()]),
                unit(keys::INMLRECL, &[&80u16.to_be_bytes()]),
            ],
        ));
        // The dataset: an IEBCOPY/INMCOPY descriptor pair.
        data.extend(xmi_fix::inmr02(
            codec,
            2,
            &[
                xmi_fix::str_unit(codec, keys::INMUTILN, "IEBCOPY"),
                xmi_fix::str_unit(codec, keys::INMDSNAM, "PYTHON.XMI.PDS"),
                unit(keys::INMDSORG, &[&0x0200u16.to_be_bytes()]),
            ],
        ));
        data.extend(xmi_fix::inmr02(
            codec,
            2,
            &[xmi_fix::str_unit(codec, keys::INMUTILN, "INMCOPY")],
        ));

        data.extend(xmi_fix::control(codec, "INMR03", &[]));
        let note = codec.encode(&format!("{:<80}", "A MESSAGE FOR YOU")).unwrap();
        data.extend(xmi_fix::segments(&note, 0, 60));

        data.extend(xmi_fix::control(codec, "INMR03", &[]));
        for record in unload_records(codec) {
            data.extend(xmi_fix::segments(&record, 0, 120));
        }
        data.extend(xmi_fix::control(codec, "INMR06", &[]));
        data
    }

    /// IEBCOPY unload records for a PDS with members TESTING and Z15IMG.
    pub(crate) fn unload_records(codec: &EbcdicCodec) -> Vec<Vec<u8>> {
        let mut records = vec![
            pds_fix::copyr1(iebcopy::DSORG_PO, 0x90, 80, 3200),
            pds_fix::copyr2(),
        ];
        records.push(pds_fix::directory(
            codec,
            &[
                pds_fix::Entry {
                    name: "TESTING",
                    ttr: 0x00000E,
                    alias: false,
                    parms: pds_fix::ispf_parms(codec),
                },
                pds_fix::Entry {
                    name: "Z15IMG",
                    ttr: 0x000010,
                    alias: false,
                    parms: Vec::new(),
                },
            ],
            false,
        ));
        let line = codec.encode(&format!("{:<80}", "MEMBER CONTENT")).unwrap();
        records.push(pds_fix::data_group(0x00000E, &line));
        records.push(pds_fix::data_group(0x000010, &[0x07; 80]));
        records.push(pds_fix::end_of_data());
        records
    }
}
