//! IBM text units, the tagged values carried by the INMR## control records.
//!
//! A unit is a 2-byte big-endian key, a 2-byte count and `count` repetitions
//! of (2-byte length, value bytes). Interpretation is keyed by a registry of
//! the known INM* keys; unknown keys are preserved as raw bytes so dumps stay
//! faithful.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;

use crate::{cursor::ByteCursor, dates, ebcdic::EbcdicCodec, Result};

pub mod keys {
    pub const INMDDNAM: u16 = 0x0001;
    pub const INMDSNAM: u16 = 0x0002;
    pub const INMMEMBR: u16 = 0x0003;
    pub const INMSECND: u16 = 0x000B;
    pub const INMDIR: u16 = 0x000C;
    pub const INMEXPDT: u16 = 0x0022;
    pub const INMTERM: u16 = 0x0028;
    pub const INMBLKSZ: u16 = 0x0030;
    pub const INMDSORG: u16 = 0x003C;
    pub const INMLRECL: u16 = 0x0042;
    pub const INMRECFM: u16 = 0x0049;
    pub const INMTNODE: u16 = 0x1001;
    pub const INMTUID: u16 = 0x1002;
    pub const INMFNODE: u16 = 0x1011;
    pub const INMFUID: u16 = 0x1012;
    pub const INMLREF: u16 = 0x1020;
    pub const INMLCHG: u16 = 0x1021;
    pub const INMCREAT: u16 = 0x1022;
    pub const INMFVERS: u16 = 0x1023;
    pub const INMFTIME: u16 = 0x1024;
    pub const INMTTIME: u16 = 0x1025;
    pub const INMFACK: u16 = 0x1026;
    pub const INMERRCD: u16 = 0x1027;
    pub const INMUTILN: u16 = 0x1028;
    pub const INMUSERP: u16 = 0x1029;
    pub const INMRECCT: u16 = 0x102A;
    pub const INMSIZE: u16 = 0x102C;
    pub const INMFFM: u16 = 0x102D;
    pub const INMNUMF: u16 = 0x102F;
    pub const INMTYPE: u16 = 0x8012;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Str,
    Int,
    Timestamp,
    Bytes,
}

struct UnitSpec {
    name: &'static str,
    kind: UnitKind,
}

static REGISTRY: Lazy<HashMap<u16, UnitSpec>> = Lazy::new(|| {
    use keys::*;
    use UnitKind::*;

    let mut m = HashMap::new();
    let mut add = |key, name, kind| m.insert(key, UnitSpec { name, kind });
    add(INMDDNAM, "INMDDNAM", Str);
    add(INMDSNAM, "INMDSNAM", Str);
    add(INMMEMBR, "INMMEMBR", Str);
    add(INMSECND, "INMSECND", Int);
    add(INMDIR, "INMDIR", Int);
    add(INMEXPDT, "INMEXPDT", Timestamp);
    add(INMTERM, "INMTERM", Bytes);
    add(INMBLKSZ, "INMBLKSZ", Int);
    add(INMDSORG, "INMDSORG", Int);
    add(INMLRECL, "INMLRECL", Int);
    add(INMRECFM, "INMRECFM", Int);
    add(INMTNODE, "INMTNODE", Str);
    add(INMTUID, "INMTUID", Str);
    add(INMFNODE, "INMFNODE", Str);
    add(INMFUID, "INMFUID", Str);
    add(INMLREF, "INMLREF", Timestamp);
    add(INMLCHG, "INMLCHG", Timestamp);
    add(INMCREAT, "INMCREAT", Timestamp);
    add(INMFVERS, "INMFVERS", Int);
    add(INMFTIME, "INMFTIME", Timestamp);
    add(INMTTIME, "INMTTIME", Timestamp);
    add(INMFACK, "INMFACK", Str);
    add(INMERRCD, "INMERRCD", Str);
    add(INMUTILN, "INMUTILN", Str);
    add(INMUSERP, "INMUSERP", Bytes);
    add(INMRECCT, "INMRECCT", Int);
    add(INMSIZE, "INMSIZE", Int);
    add(INMFFM, "INMFFM", Bytes);
    add(INMNUMF, "INMNUMF", Int);
    add(INMTYPE, "INMTYPE", Bytes);
    m
});

pub fn key_name(key: u16) -> Option<&'static str> {
    REGISTRY.get(&key).map(|spec| spec.name)
}

/// A decoded text-unit value.
#[derive(Debug, Clone, PartialEq)]
pub enum TextUnitValue {
    Str(String),
    Int(u64),
    Timestamp(NaiveDateTime),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextUnit {
    pub key: u16,
    pub value: TextUnitValue,
}

impl TextUnit {
    pub fn name(&self) -> Option<&'static str> {
        key_name(self.key)
    }
}

fn interpret(key: u16, values: Vec<&[u8]>, codec: &EbcdicCodec) -> TextUnitValue {
    let kind = REGISTRY
        .get(&key)
        .map(|spec| spec.kind)
        .unwrap_or(UnitKind::Bytes);

    match kind {
        UnitKind::Str => {
            // Multi-value string units carry dataset name qualifiers.
            let parts: Vec<String> = values
                .iter()
                .map(|v| codec.decode_trimmed(v))
                .collect();
            TextUnitValue::Str(parts.join("."))
        }
        UnitKind::Int => {
            let first = values.first().copied().unwrap_or(&[]);
            if first.is_empty() || first.len() > 8 {
                TextUnitValue::Bytes(values.concat())
            } else {
                let n = first.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
                TextUnitValue::Int(n)
            }
        }
        UnitKind::Timestamp => {
            let first = values.first().copied().unwrap_or(&[]);
            match dates::character_timestamp(&codec.decode(first)) {
                Some(ts) => TextUnitValue::Timestamp(ts),
                None => TextUnitValue::Bytes(values.concat()),
            }
        }
        UnitKind::Bytes => TextUnitValue::Bytes(values.concat()),
    }
}

/// Decode a run of text units covering the whole input slice.
pub fn decode_units(input: &[u8], codec: &EbcdicCodec) -> Result<Vec<TextUnit>> {
    let mut cur = ByteCursor::new(input);
    let mut units = Vec::new();

    // Control records are often padded out with zero bytes.
    while cur.remaining() >= 4 {
        if cur.peek_u8()? == 0 && input[cur.pos()..].iter().all(|&b| b == 0) {
            break;
        }
        let key = cur.read_u16_be()?;
        let count = cur.read_u16_be()?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = cur.read_u16_be()? as usize;
            values.push(cur.read_slice(len)?);
        }
        units.push(TextUnit {
            key,
            value: interpret(key, values, codec),
        });
    }
    Ok(units)
}

/// Look a unit up by key in a decoded list.
pub fn find(units: &[TextUnit], key: u16) -> Option<&TextUnitValue> {
    units.iter().find(|u| u.key == key).map(|u| &u.value)
}

pub fn find_str(units: &[TextUnit], key: u16) -> Option<&str> {
    match find(units, key) {
        Some(TextUnitValue::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

pub fn find_int(units: &[TextUnit], key: u16) -> Option<u64> {
    match find(units, key) {
        Some(TextUnitValue::Int(n)) => Some(*n),
        _ => None,
    }
}

pub fn find_timestamp(units: &[TextUnit], key: u16) -> Option<NaiveDateTime> {
    match find(units, key) {
        Some(TextUnitValue::Timestamp(ts)) => Some(*ts),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EbcdicCodec {
        EbcdicCodec::default()
    }

    #[test]
    fn decodes_string_and_integer_units() {
        let codec = codec();
        let dsnam: Vec<Vec<u8>> = ["PYTHON", "XMI", "PDS"]
            .iter()
            .map(|q| codec.encode(q).unwrap())
            .collect();
        let mut input = fixtures::unit(
            keys::INMDSNAM,
            &dsnam.iter().map(|q| q.as_slice()).collect::<Vec<_>>(),
        );
        input.extend(fixtures::unit(keys::INMLRECL, &[&[0x00, 0x50]]));
        input.extend(fixtures::unit(
            keys::INMUTILN,
            &[&codec.encode("INMCOPY").unwrap()],
        ));

        let units = decode_units(&input, &codec).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(find_str(&units, keys::INMDSNAM), Some("PYTHON.XMI.PDS"));
        assert_eq!(find_int(&units, keys::INMLRECL), Some(80));
        assert_eq!(find_str(&units, keys::INMUTILN), Some("INMCOPY"));
    }

    #[test]
    fn decodes_timestamps() {
        let codec = codec();
        let stamp = codec.encode("20210309045318").unwrap();
        let input = fixtures::unit(keys::INMFTIME, &[&stamp]);
        let units = decode_units(&input, &codec).unwrap();
        let ts = find_timestamp(&units, keys::INMFTIME).unwrap();
        assert_eq!(crate::dates::iso_datetime(&ts), "2021-03-09T04:53:18.000000");
    }

    #[test]
    fn unknown_keys_are_preserved_as_bytes() {
        let codec = codec();
        let input = fixtures::unit(0x7777, &[&[0xDE, 0xAD], &[0xBE]]);
        let units = decode_units(&input, &codec).unwrap();
        assert_eq!(units[0].key, 0x7777);
        assert_eq!(units[0].name(), None);
        assert_eq!(
            units[0].value,
            TextUnitValue::Bytes(vec![0xDE, 0xAD, 0xBE])
        );
    }

    #[test]
    fn zero_padding_ends_the_run() {
        let codec = codec();
        let mut input = fixtures::unit(keys::INMNUMF, &[&[0x00, 0x01]]);
        input.extend_from_slice(&[0u8; 10]);
        let units = decode_units(&input, &codec).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(find_int(&units, keys::INMNUMF), Some(1));
    }

    #[test]
    fn truncated_unit_fails() {
        let codec = codec();
        let input = [0x10, 0x24, 0x00, 0x01, 0x00, 0x20, 0xF0];
        assert!(decode_units(&input, &codec).is_err());
    }
}
