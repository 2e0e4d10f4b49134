//! EBCDIC transcoding.
//!
//! The tables are total: every one of the 256 byte values maps to a distinct
//! Unicode scalar, so decode followed by encode is the identity on the full
//! alphabet. cp1140 is cp037 with the currency sign at 0x9F replaced by the
//! euro sign.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{error::XmitError, FlexString, Result};

#[rustfmt::skip]
const CP037: [char; 256] = [
    '\u{00}', '\u{01}', '\u{02}', '\u{03}', '\u{9C}', '\u{09}', '\u{86}', '\u{7F}',
    '\u{97}', '\u{8D}', '\u{8E}', '\u{0B}', '\u{0C}', '\u{0D}', '\u{0E}', '\u{0F}',
    '\u{10}', '\u{11}', '\u{12}', '\u{13}', '\u{9D}', '\u{85}', '\u{08}', '\u{87}',
    '\u{18}', '\u{19}', '\u{92}', '\u{8F}', '\u{1C}', '\u{1D}', '\u{1E}', '\u{1F}',
    '\u{80}', '\u{81}', '\u{82}', '\u{83}', '\u{84}', '\u{0A}', '\u{17}', '\u{1B}',
    '\u{88}', '\u{89}', '\u{8A}', '\u{8B}', '\u{8C}', '\u{05}', '\u{06}', '\u{07}',
    '\u{90}', '\u{91}', '\u{16}', '\u{93}', '\u{94}', '\u{95}', '\u{96}', '\u{04}',
    '\u{98}', '\u{99}', '\u{9A}', '\u{9B}', '\u{14}', '\u{15}', '\u{9E}', '\u{1A}',
    ' ', '\u{A0}', '\u{E2}', '\u{E4}', '\u{E0}', '\u{E1}', '\u{E3}', '\u{E5}',
    '\u{E7}', '\u{F1}', '\u{A2}', '.', '<', '(', '+', '|',
    '&', '\u{E9}', '\u{EA}', '\u{EB}', '\u{E8}', '\u{ED}', '\u{EE}', '\u{EF}',
    '\u{EC}', '\u{DF}', '!', '$', '*', ')', ';', '\u{AC}',
    '-', '/', '\u{C2}', '\u{C4}', '\u{C0}', '\u{C1}', '\u{C3}', '\u{C5}',
    '\u{C7}', '\u{D1}', '\u{A6}', ',', '%', '_', '>', '?',
    '\u{F8}', '\u{C9}', '\u{CA}', '\u{CB}', '\u{C8}', '\u{CD}', '\u{CE}', '\u{CF}',
    '\u{CC}', '`', ':', '#', '@', '\'', '=', '"',
    '\u{D8}', 'a', 'b', 'c', 'd', 'e', 'f', 'g',
    'h', 'i', '\u{AB}', '\u{BB}', '\u{F0}', '\u{FD}', '\u{FE}', '\u{B1}',
    '\u{B0}', 'j', 'k', 'l', 'm', 'n', 'o', 'p',
    'q', 'r', '\u{AA}', '\u{BA}', '\u{E6}', '\u{B8}', '\u{C6}', '\u{A4}',
    '\u{B5}', '~', 's', 't', 'u', 'v', 'w', 'x',
    'y', 'z', '\u{A1}', '\u{BF}', '\u{D0}', '\u{DD}', '\u{DE}', '\u{AE}',
    '^', '\u{A3}', '\u{A5}', '\u{B7}', '\u{A9}', '\u{A7}', '\u{B6}', '\u{BC}',
    '\u{BD}', '\u{BE}', '[', ']', '\u{AF}', '\u{A8}', '\u{B4}', '\u{D7}',
    '{', 'A', 'B', 'C', 'D', 'E', 'F', 'G',
    'H', 'I', '\u{AD}', '\u{F4}', '\u{F6}', '\u{F2}', '\u{F3}', '\u{F5}',
    '}', 'J', 'K', 'L', 'M', 'N', 'O', 'P',
    'Q', 'R', '\u{B9}', '\u{FB}', '\u{FC}', '\u{F9}', '\u{FA}', '\u{FF}',
    '\\', '\u{F7}', 'S', 'T', 'U', 'V', 'W', 'X',
    'Y', 'Z', '\u{B2}', '\u{D4}', '\u{D6}', '\u{D2}', '\u{D3}', '\u{D5}',
    '0', '1', '2', '3', '4', '5', '6', '7',
    '8', '9', '\u{B3}', '\u{DB}', '\u{DC}', '\u{D9}', '\u{DA}', '\u{9F}',
];

static CP1140: Lazy<[char; 256]> = Lazy::new(|| {
    let mut table = CP037;
    table[0x9F] = '\u{20AC}';
    table
});

static REVERSE_CP037: Lazy<HashMap<char, u8>> = Lazy::new(|| reverse(&CP037));
static REVERSE_CP1140: Lazy<HashMap<char, u8>> = Lazy::new(|| reverse(&CP1140));

fn reverse(table: &[char; 256]) -> HashMap<char, u8> {
    table
        .iter()
        .enumerate()
        .map(|(byte, &ch)| (ch, byte as u8))
        .collect()
}

/// Table-driven EBCDIC to Unicode codec. Total in the decode direction;
/// the encode direction fails on scalars outside the code page.
#[derive(Debug, Clone, Copy)]
pub struct EbcdicCodec {
    name: &'static str,
    table: &'static [char; 256],
    rev: &'static HashMap<char, u8>,
}

impl EbcdicCodec {
    pub fn new(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cp1140" | "ibm1140" | "ibm-1140" | "1140" => Ok(Self {
                name: "cp1140",
                table: &*CP1140,
                rev: &*REVERSE_CP1140,
            }),
            "cp037" | "ibm037" | "ibm-037" | "037" => Ok(Self {
                name: "cp037",
                table: &CP037,
                rev: &*REVERSE_CP037,
            }),
            other => Err(XmitError::Decoding(format!(
                "unknown EBCDIC code page {:?}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.table[b as usize]).collect()
    }

    /// Decode a fixed-width field and drop the trailing space padding.
    pub fn decode_trimmed(&self, bytes: &[u8]) -> String {
        self.decode(bytes).trim_end().to_string()
    }

    /// Decode an 8-byte space-padded name field (member names, user IDs).
    pub fn decode_name(&self, bytes: &[u8]) -> FlexString {
        let decoded = self.decode(bytes);
        FlexString::from(decoded.trim_end_matches(' '))
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        text.chars()
            .map(|ch| {
                self.rev.get(&ch).copied().ok_or_else(|| {
                    XmitError::Decoding(format!("{:?} is not representable in {}", ch, self.name))
                })
            })
            .collect()
    }
}

impl Default for EbcdicCodec {
    fn default() -> Self {
        EbcdicCodec::new("cp1140").unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_common_text() {
        let codec = EbcdicCodec::default();
        let raw = [0xC9, 0xD5, 0xD4, 0xD9, 0xF0, 0xF1];
        assert_eq!(codec.decode(&raw), "INMR01");

        let padded = [0xD7, 0xC8, 0xC9, 0xD3, 0x40, 0x40, 0x40, 0x40];
        assert_eq!(codec.decode_name(&padded).as_str(), "PHIL");
    }

    #[test]
    fn decode_then_encode_is_identity_on_the_full_alphabet() {
        for name in &["cp037", "cp1140"] {
            let codec = EbcdicCodec::new(name).unwrap();
            let all: Vec<u8> = (0u8..=255).collect();
            let text = codec.decode(&all);
            assert_eq!(codec.encode(&text).unwrap(), all, "code page {}", name);
        }
    }

    #[test]
    fn tables_are_surjective_to_distinct_scalars() {
        for name in &["cp037", "cp1140"] {
            let codec = EbcdicCodec::new(name).unwrap();
            let mut seen = std::collections::HashSet::new();
            for b in 0u8..=255 {
                assert!(seen.insert(codec.decode(&[b])), "duplicate in {}", name);
            }
            assert_eq!(seen.len(), 256);
        }
    }

    #[test]
    fn cp1140_has_the_euro_sign() {
        let codec = EbcdicCodec::new("cp1140").unwrap();
        assert_eq!(codec.decode(&[0x9F]), "\u{20AC}");
        let codec = EbcdicCodec::new("cp037").unwrap();
        assert_eq!(codec.decode(&[0x9F]), "\u{A4}");
    }

    #[test]
    fn unknown_code_page_is_rejected() {
        assert!(EbcdicCodec::new("cp500").is_err());
    }
}
