//! The JSON projection of a decoded archive.
//!
//! Control-record metadata is emitted verbatim: one object per INMR01 /
//! INMR02[i] / INMR03[i] for transmissions, a `file` map keyed by dataset
//! name for tapes. Raw areas (COPYR2 extents, directory parms) are
//! hex-escaped; dates render as ISO-8601 with microseconds. Key order is
//! canonical (sorted) by construction.

use serde_json::{json, Map, Value};

use crate::{
    archive::{Archive, ContainerKind, Dataset},
    config::Config,
    dates,
    ebcdic::EbcdicCodec,
    iebcopy::{Copyr1, Copyr2, IspfStats, Member},
    text_unit::{TextUnit, TextUnitValue},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    /// Embed text-classified stream contents as UTF-8 strings.
    pub text: bool,
}

pub fn dump_json(archive: &Archive, config: &Config, opts: &DumpOptions) -> Value {
    let codec = EbcdicCodec::new(&config.encoding).unwrap_or_default();
    let mut root = Map::new();

    if archive.kind == ContainerKind::Xmi {
        root.insert("INMR01".to_string(), units_json(&archive.inmr01));

        let ordered: Vec<&Dataset> = archive
            .message
            .iter()
            .chain(archive.datasets.iter())
            .collect();
        let inmr02: Vec<Value> = ordered
            .iter()
            .flat_map(|ds| ds.inmr02.iter())
            .map(|units| units_json(units))
            .collect();
        let inmr03: Vec<Value> = ordered
            .iter()
            .flat_map(|ds| ds.inmr03.iter())
            .map(|units| units_json(units))
            .collect();
        root.insert("INMR02".to_string(), Value::Array(inmr02));
        root.insert("INMR03".to_string(), Value::Array(inmr03));
        if !archive.inmr04.is_empty() {
            let exits: Vec<Value> = archive
                .inmr04
                .iter()
                .map(|payload| json!(hex::encode(payload)))
                .collect();
            root.insert("INMR04".to_string(), Value::Array(exits));
        }
    }

    if let Some(volume) = &archive.volume {
        root.insert(
            "volume".to_string(),
            json!({ "serial": volume.serial.as_str(), "owner": volume.owner }),
        );
    }

    let mut files = Map::new();
    if let Some(message) = &archive.message {
        files.insert(
            "MESSAGE".to_string(),
            dataset_json(message, &codec, config, opts),
        );
    }
    for (i, ds) in archive.datasets.iter().enumerate() {
        let key = ds
            .name
            .clone()
            .unwrap_or_else(|| format!("DATASET{:04}", i + 1));
        files.insert(key, dataset_json(ds, &codec, config, opts));
    }
    root.insert("file".to_string(), Value::Object(files));

    if !archive.warnings.is_empty() {
        root.insert("warnings".to_string(), json!(archive.warnings));
    }
    Value::Object(root)
}

fn units_json(units: &[TextUnit]) -> Value {
    let mut map = Map::new();
    for unit in units {
        let key = unit
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("0x{:04x}", unit.key));
        let value = match &unit.value {
            TextUnitValue::Str(s) => json!(s),
            TextUnitValue::Int(n) => json!(n),
            TextUnitValue::Timestamp(ts) => json!(dates::iso_datetime(ts)),
            TextUnitValue::Bytes(b) => json!(hex::encode(b)),
        };
        map.insert(key, value);
    }
    Value::Object(map)
}

fn dataset_json(ds: &Dataset, codec: &EbcdicCodec, config: &Config, opts: &DumpOptions) -> Value {
    let mut map = Map::new();
    map.insert("dsorg".to_string(), json!(ds.org));
    map.insert("recfm".to_string(), json!(ds.recfm));
    map.insert("lrecl".to_string(), json!(ds.lrecl));
    map.insert("blksize".to_string(), json!(ds.blksize));
    map.insert("bytes".to_string(), json!(ds.unloaded_bytes));
    if let Some(created) = &ds.created {
        map.insert("created".to_string(), json!(dates::iso_datetime(created)));
    }

    if let Some(labels) = &ds.labels {
        map.insert(
            "label".to_string(),
            json!({
                "serial": labels.serial.as_str(),
                "volume_seq": labels.volume_seq,
                "dataset_seq": labels.dataset_seq,
                "created": labels.created.as_ref().map(dates::iso_date),
                "expires": labels.expires.as_ref().map(dates::iso_date),
                "block_count": labels.block_count,
                "user_labels": labels.user_labels,
            }),
        );
    }

    if let Some(copyr1) = &ds.copyr1 {
        map.insert("COPYR1".to_string(), copyr1_json(copyr1));
    }
    if let Some(copyr2) = &ds.copyr2 {
        map.insert("COPYR2".to_string(), copyr2_json(copyr2));
    }

    if ds.members.is_empty() {
        if opts.text && ds.classify(codec, config).is_text() {
            map.insert("contents".to_string(), json!(ds.text(codec, config)));
        }
    } else {
        let mut members = Map::new();
        for member in &ds.members {
            members.insert(
                member.name.to_string(),
                member_json(ds, member, codec, config, opts),
            );
        }
        map.insert("members".to_string(), Value::Object(members));
    }
    Value::Object(map)
}

fn copyr1_json(c: &Copyr1) -> Value {
    json!({
        "dsorg": c.dsorg,
        "blksize": c.blksize,
        "lrecl": c.lrecl,
        "recfm": c.recfm,
        "key_length": c.key_length,
        "option_codes": c.option_codes,
        "sms_flags": c.sms_flags,
        "container_blksize": c.container_blksize,
        "device": {
            "ucb_type": hex::encode(c.device.ucb_type),
            "max_record": c.device.max_record,
            "cylinders": c.device.cylinders,
            "tracks_per_cylinder": c.device.tracks_per_cylinder,
            "track_length": c.device.track_length,
            "block_overhead": c.device.block_overhead,
        },
        "last_referenced": c.last_referenced.as_ref().map(dates::iso_date),
        "secondary_space_extension": hex::encode(c.secondary_space_extension),
        "secondary_allocation": hex::encode(c.secondary_allocation),
        "last_used_ttr": hex::encode(c.last_used_ttr),
        "track_balance": hex::encode(c.track_balance),
    })
}

fn copyr2_json(c: &Copyr2) -> Value {
    json!({
        "deb": hex::encode(&c.deb),
        "extents": c.extents.iter().map(hex::encode).collect::<Vec<_>>(),
    })
}

fn member_json(
    ds: &Dataset,
    member: &Member,
    codec: &EbcdicCodec,
    config: &Config,
    opts: &DumpOptions,
) -> Value {
    let mut map = Map::new();
    map.insert("ttr".to_string(), json!(format!("{:06x}", member.ttr)));
    map.insert("alias".to_string(), json!(member.alias));
    map.insert("halfwords".to_string(), json!(member.halfwords));
    map.insert("notes".to_string(), json!(member.notes));
    map.insert("parms".to_string(), json!(hex::encode(&member.parms)));
    map.insert("bytes".to_string(), json!(member.byte_len()));
    map.insert(
        "ispf".to_string(),
        match &member.ispf {
            Some(ispf) => ispf_json(ispf),
            None => Value::Bool(false),
        },
    );
    if opts.text && ds.classify_member(member, codec, config).is_text() {
        map.insert(
            "contents".to_string(),
            json!(ds.member_text(member, codec, config)),
        );
    }
    Value::Object(map)
}

fn ispf_json(ispf: &IspfStats) -> Value {
    json!({
        "version": ispf.version,
        "flags": ispf.flags,
        "created": ispf.created.as_ref().map(dates::iso_date),
        "modified": ispf.modified.as_ref().map(dates::iso_datetime),
        "lines": ispf.lines,
        "newlines": ispf.newlines,
        "modlines": ispf.modlines,
        "owner": ispf.owner.as_str(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_fixtures;

    fn dump(data: &[u8], text: bool) -> Value {
        let config = Config::default();
        let archive = Archive::decode(data, &config).unwrap();
        assert!(archive.error.is_none(), "{:?}", archive.error);
        dump_json(&archive, &config, &DumpOptions { text })
    }

    #[test]
    fn sequential_dump_mirrors_the_control_records() {
        let codec = EbcdicCodec::default();
        let value = dump(&test_fixtures::seq_xmi(&codec), false);

        assert_eq!(value["INMR01"]["INMFNODE"], "ORIGNODE");
        assert_eq!(value["INMR01"]["INMFTIME"], "2021-03-09T04:53:18.000000");
        assert_eq!(value["INMR02"][0]["INMDSNAM"], "PYTHON.XMI.SEQ");
        assert_eq!(value["INMR02"][0]["INMLRECL"], 80);
        assert_eq!(value["file"]["PYTHON.XMI.SEQ"]["dsorg"], "PS");
        assert_eq!(value["file"]["PYTHON.XMI.SEQ"]["recfm"], "FB");
        assert!(value["file"]["PYTHON.XMI.SEQ"].get("contents").is_none());
    }

    #[test]
    fn text_option_embeds_contents() {
        let codec = EbcdicCodec::default();
        let value = dump(&test_fixtures::seq_xmi(&codec), true);
        let contents = value["file"]["PYTHON.XMI.SEQ"]["contents"]
            .as_str()
            .unwrap();
        assert!(contents.starts_with("HELLO FROM THE HOST\n"));
    }

    #[test]
    fn pds_dump_carries_copyr_and_member_details() {
        let codec = EbcdicCodec::default();
        let value = dump(&test_fixtures::pds_msg_xmi(&codec), false);

        let pds = &value["file"]["PYTHON.XMI.PDS"];
        assert_eq!(pds["dsorg"], "PO");
        assert_eq!(pds["COPYR1"]["lrecl"], 80);
        assert_eq!(pds["COPYR2"]["extents"].as_array().unwrap().len(), 16);

        let members = &pds["members"];
        assert_eq!(members["TESTING"]["ttr"], "00000e");
        assert_eq!(members["TESTING"]["alias"], false);
        assert_eq!(members["TESTING"]["halfwords"], 15);
        assert_eq!(members["TESTING"]["ispf"]["version"], "01.00");
        assert_eq!(members["TESTING"]["ispf"]["owner"], "PHIL");
        assert_eq!(
            members["TESTING"]["ispf"]["modified"],
            "2021-03-08T22:53:29.000000"
        );
        assert_eq!(members["Z15IMG"]["ispf"], false);

        assert!(value["file"].get("MESSAGE").is_some());
    }

    #[test]
    fn key_order_is_canonical() {
        let codec = EbcdicCodec::default();
        let value = dump(&test_fixtures::seq_xmi(&codec), false);
        let rendered = serde_json::to_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(
            serde_json::to_string(&reparsed).unwrap(),
            rendered,
            "serialization round-trips byte-for-byte"
        );
    }
}
