//! Text-vs-binary classification and the sequence-number strip.

use itertools::Itertools;

use crate::{config::Config, ebcdic::EbcdicCodec, recfm::{Format, RecordFormat}};

const SAMPLE_BYTES: usize = 4096;
const PRINTABLE_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Text,
    Binary,
}

impl Classification {
    pub fn is_text(self) -> bool {
        self == Classification::Text
    }
}

fn printable_ratio(text: &str) -> f64 {
    if text.is_empty() {
        return 1.0;
    }
    let printable = text
        .chars()
        .filter(|&c| matches!(c, ' '..='~' | '\t' | '\n' | '\r'))
        .count();
    printable as f64 / text.chars().count() as f64
}

/// Decide whether a terminal byte stream is text, per the configured policy:
/// forced flags first, then the fixed-format printability heuristic over the
/// first 4 KB, then the MIME sniff over the EBCDIC-decoded bytes.
pub fn classify(
    bytes: &[u8],
    recfm: &RecordFormat,
    lrecl: usize,
    codec: &EbcdicCodec,
    config: &Config,
) -> Classification {
    if config.binary_only {
        return Classification::Binary;
    }
    if config.force_text {
        return Classification::Text;
    }

    let sample = &bytes[..bytes.len().min(SAMPLE_BYTES)];
    let decoded = codec.decode(sample);

    if recfm.format == Format::Fixed
        && lrecl > 0
        && lrecl <= 255
        && printable_ratio(&decoded) >= PRINTABLE_THRESHOLD
    {
        return Classification::Text;
    }

    if sniff_mime(sample, &decoded).starts_with("text/") {
        Classification::Text
    } else {
        Classification::Binary
    }
}

/// A content-sniffing MIME guess: well-known magic numbers on the raw bytes,
/// then JCL and plain-text checks on the decoded form.
pub fn sniff_mime(raw: &[u8], decoded: &str) -> &'static str {
    match raw {
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] => "application/zip",
        [0x1F, 0x8B, ..] => "application/gzip",
        [b'B', b'Z', b'h', ..] => "application/x-bzip2",
        [b'%', b'P', b'D', b'F', ..] => "application/pdf",
        _ => {
            if decoded.starts_with("//") && (decoded.contains(" JOB ") || decoded.contains(" EXEC "))
            {
                "text/x-jcl"
            } else if printable_ratio(decoded) >= PRINTABLE_THRESHOLD {
                "text/plain"
            } else {
                "application/octet-stream"
            }
        }
    }
}

/// File extension suggested by a MIME guess.
pub fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        "application/zip" => Some("zip"),
        "application/gzip" => Some("gz"),
        "application/x-bzip2" => Some("bz2"),
        "application/pdf" => Some("pdf"),
        "text/x-jcl" => Some("jcl"),
        m if m.starts_with("text/") => Some("txt"),
        _ => None,
    }
}

/// Strip the rightmost 8-column sequence number from fixed-80 records. A
/// record qualifies when its last 8 bytes are all EBCDIC digits or spaces;
/// already-stripped records are left alone.
pub fn unnum(records: &mut Vec<Vec<u8>>, recfm: &RecordFormat, lrecl: usize) {
    if recfm.format != Format::Fixed || lrecl != 80 {
        return;
    }
    for record in records.iter_mut() {
        if record.len() != 80 {
            continue;
        }
        let tail = &record[72..];
        if tail
            .iter()
            .all(|&b| b == 0x40 || (0xF0..=0xF9).contains(&b))
        {
            record.truncate(72);
        }
    }
}

/// Render a stream as text under the configured unnum policy.
pub fn rendered(
    records: &[Vec<u8>],
    recfm: &RecordFormat,
    lrecl: usize,
    codec: &EbcdicCodec,
    config: &Config,
) -> String {
    let mut records = records.to_vec();
    if config.unnum {
        unnum(&mut records, recfm, lrecl);
    }
    render(&records, codec)
}

/// Render a text-classified stream: decode each record and join with
/// newlines, dropping trailing record padding.
pub fn render(records: &[Vec<u8>], codec: &EbcdicCodec) -> String {
    let mut out = records
        .iter()
        .map(|record| codec.decode(record).trim_end().to_string())
        .join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EbcdicCodec {
        EbcdicCodec::default()
    }

    fn fb80() -> RecordFormat {
        "FB".parse().unwrap()
    }

    #[test]
    fn fixed_printable_streams_are_text() {
        let codec = codec();
        let line = format!("{:<80}", "//MYJOB   JOB (ACCT),CLASS=A");
        let bytes = codec.encode(&line).unwrap();
        let config = Config::default();
        assert!(classify(&bytes, &fb80(), 80, &codec, &config).is_text());
    }

    #[test]
    fn control_heavy_streams_are_binary() {
        let bytes: Vec<u8> = (0u8..=255).cycle().take(512).collect();
        let config = Config::default();
        let classification = classify(&bytes, &RecordFormat::U, 0, &codec(), &config);
        assert_eq!(classification, Classification::Binary);
    }

    #[test]
    fn flags_override_content() {
        let codec = codec();
        let bytes = vec![0x00, 0x01, 0x02, 0x03];

        let mut config = Config::default();
        config.force_text = true;
        assert!(classify(&bytes, &RecordFormat::U, 0, &codec, &config).is_text());

        config.binary_only = true;
        assert!(!classify(&bytes, &RecordFormat::U, 0, &codec, &config).is_text());
    }

    #[test]
    fn zip_magic_wins_over_printability() {
        let raw = b"PK\x03\x04rest-of-archive";
        assert_eq!(sniff_mime(raw, "whatever"), "application/zip");
        assert_eq!(extension_for("application/zip"), Some("zip"));
    }

    #[test]
    fn jcl_is_recognized_after_decoding() {
        let codec = codec();
        let line = "//STEP1    EXEC PGM=IEFBR14";
        let raw = codec.encode(line).unwrap();
        let decoded = codec.decode(&raw);
        assert_eq!(sniff_mime(&raw, &decoded), "text/x-jcl");
        assert_eq!(extension_for("text/x-jcl"), Some("jcl"));
    }

    #[test]
    fn unnum_strips_qualifying_records_once() {
        let codec = codec();
        let body = format!("{:<72}", "       SOME COBOL");
        let numbered = codec.encode(&format!("{}00010203", body)).unwrap();
        let mut records = vec![numbered.clone(), numbered];

        unnum(&mut records, &fb80(), 80);
        assert!(records.iter().all(|r| r.len() == 72));

        // Idempotent on already-stripped text.
        let before = records.clone();
        unnum(&mut records, &fb80(), 80);
        assert_eq!(records, before);
    }

    #[test]
    fn unnum_leaves_non_numeric_columns_alone() {
        let codec = codec();
        let mut records = vec![codec.encode(&format!("{:<72}CODETAIL", "X")).unwrap()];

        let before = records.clone();
        unnum(&mut records, &fb80(), 80);
        assert_eq!(records, before);
    }

    #[test]
    fn render_trims_record_padding() {
        let codec = codec();
        let records = vec![
            codec.encode(&format!("{:<80}", "HELLO")).unwrap(),
            codec.encode(&format!("{:<80}", "WORLD")).unwrap(),
        ];
        assert_eq!(render(&records, &codec), "HELLO\nWORLD\n");
    }
}
