//! Node firmware command and reply tables.
//!
//! These tables are the binary contract with the node firmware: opcodes,
//! field order, widths and endianness must not change.

use crate::schema::{Catalog, CommandDef, Encoding, FieldDef, ReplyDef, ShapeDef};
use Encoding::{I16Le, U16Le, U32Be, U32Le, U8};

/// Custom command group opcodes reserved by node applications
pub mod custom_groups {
    /// Base application group
    pub const BASE: u8 = 0x30;
    /// Weather station group
    pub const WEATHER: u8 = 0x32;
    /// Climate control group
    pub const CLIMA: u8 = 0x33;
}

/// Reply code of node log events, sent unsolicited
pub const LOGEVENT_CODE: u8 = 57;
/// Reply code of node error replies
pub const ERROR_CODE: u8 = 127;

// Command fields

const ECHO: &[FieldDef] = &[FieldDef::trailing("echo")];
const NODETAG_SET: &[FieldDef] = &[FieldDef::trailing("tag")];
const UPDATE_START: &[FieldDef] = &[
    FieldDef::int("size", U32Le).or(0),
    FieldDef::trailing("md5").or_empty(),
];
const UPDATE_CHUNK: &[FieldDef] = &[FieldDef::trailing("chunk").or_empty()];
const UPDATE_DIGEST: &[FieldDef] = &[FieldDef::int("options", U8).or(0)];
const TARGET_OR_ZERO: &[FieldDef] = &[FieldDef::int("target", U32Le).or(0)];
const PAYLOAD: &[FieldDef] = &[FieldDef::trailing("payload")];

const DISCOVERY_GET: &[FieldDef] = &[FieldDef::int("index", U8)];
const DISCOVERY_START: &[FieldDef] = &[
    FieldDef::int("mask", U8),
    FieldDef::int("filter", U8),
    FieldDef::int("slots", U8),
];

const RSSICHECK_START: &[FieldDef] = &[FieldDef::int("target", U32Be).or(0)];

const FLASH_RANGE: &[FieldDef] = &[
    FieldDef::int("address", U32Le).or(0),
    FieldDef::int("length", U32Le).or(0),
];
const FLASH_WRITE: &[FieldDef] = &[
    FieldDef::int("address", U32Le).or(0),
    FieldDef::trailing("payload").or_empty(),
];
const SPIFLASH: &[FieldDef] = &[FieldDef::int("group", U8), FieldDef::trailing("payload")];

const HASH: &[FieldDef] = &[FieldDef::int("hash", U16Le)];
const ENTITY_HASH: &[FieldDef] = &[FieldDef::int("service", U8), FieldDef::int("index", U8)];
const TYPE_HASH: &[FieldDef] = &[FieldDef::int("type", U8), FieldDef::int("hash", U16Le)];
const TYPE_HASH_VALUE: &[FieldDef] = &[
    FieldDef::int("type", U8),
    FieldDef::int("hash", U16Le),
    FieldDef::int("value", U16Le),
];
const TYPE_HASH_NUM: &[FieldDef] = &[
    FieldDef::int("type", U8),
    FieldDef::int("hash", U16Le),
    FieldDef::int("num", U16Le),
];
const TYPE_HASH_NUM_VALUE: &[FieldDef] = &[
    FieldDef::int("type", U8),
    FieldDef::int("hash", U16Le),
    FieldDef::int("num", U16Le),
    FieldDef::int("value", U16Le),
];

const TARGET_PAYLOAD: &[FieldDef] = &[FieldDef::int("target", U32Le), FieldDef::trailing("payload")];
const BEACONS: &[FieldDef] = &[FieldDef::int("mask", U8).or(0), FieldDef::int("filter", U8).or(0)];
const MULTIPATH: &[FieldDef] = &[
    FieldDef::int("target", U32Le).or(0),
    FieldDef::int("pathlen", U8).or(0),
    FieldDef::int("path", U32Le).repeated(),
    FieldDef::trailing("payload"),
];

// Command tables

const DISCOVERY_COMMANDS: &[CommandDef] = &[
    CommandDef::new("reset", 0, &[]),
    CommandDef::new("count", 2, &[]),
    CommandDef::new("get", 4, DISCOVERY_GET),
    CommandDef::new("start", 6, DISCOVERY_START),
];

const RSSICHECK_COMMANDS: &[CommandDef] = &[
    CommandDef::new("startcheck", 2, RSSICHECK_START),
    CommandDef::new("roundtrip", 4, &[]),
];

const SPIFLASH_COMMANDS: &[CommandDef] = &[
    CommandDef::new("getmd5", 1, FLASH_RANGE),
    CommandDef::new("erase", 2, FLASH_RANGE),
    CommandDef::new("write", 3, FLASH_WRITE),
    CommandDef::new("eboot", 4, FLASH_RANGE),
];

const ENTITIES_COMMANDS: &[CommandDef] = &[
    CommandDef::new("countpref", 0, TYPE_HASH),
    CommandDef::new("getprefvalue", 2, TYPE_HASH_NUM),
    CommandDef::new("setprefvalue", 4, TYPE_HASH_NUM_VALUE),
];

/// Top-level command table
pub const COMMANDS: &[CommandDef] = &[
    CommandDef::new("echo", 0, ECHO),
    CommandDef::new("firm", 2, &[]),
    CommandDef::new("nodeId", 4, &[]),
    CommandDef::new("nodetag", 6, &[]),
    CommandDef::new("nodetagSet", 8, NODETAG_SET),
    CommandDef::new("updateStart", 10, UPDATE_START),
    CommandDef::new("updateChunk", 12, UPDATE_CHUNK),
    CommandDef::new("updateDigest", 14, UPDATE_DIGEST),
    CommandDef::new("updateMemMD5", 16, UPDATE_START),
    CommandDef::new("logDestination", 18, &[]),
    CommandDef::new("setLogDestination", 20, TARGET_OR_ZERO),
    CommandDef::new("custom", 22, PAYLOAD),
    CommandDef::new("reboot", 24, &[]),
    CommandDef::group("discovery", 26, DISCOVERY_COMMANDS),
    CommandDef::group("rssicheck", 28, RSSICHECK_COMMANDS),
    CommandDef::group("spiflash", 30, SPIFLASH_COMMANDS)
        .with_fields(SPIFLASH)
        .echoed_replies(),
    CommandDef::new("filterGroups", 32, &[]),
    CommandDef::new("setFilterGroups", 34, TARGET_OR_ZERO),
    CommandDef::new("readBinarySensor", 36, HASH).no_reply(),
    CommandDef::new("serviceEntitiesCount", 38, &[]),
    CommandDef::new("serviceEntityHash", 40, ENTITY_HASH),
    CommandDef::new("serviceEntityState", 42, TYPE_HASH),
    CommandDef::new("serviceEntityStateSet", 44, TYPE_HASH_VALUE),
    CommandDef::new("serviceEntityPrefsSet", 46, TYPE_HASH_NUM_VALUE),
    CommandDef::group("entities", 48, ENTITIES_COMMANDS),
    CommandDef::new("broadcast", 112, PAYLOAD).no_reply(),
    CommandDef::new("unicast", 114, TARGET_PAYLOAD).no_reply(),
    CommandDef::new("beacons", 116, BEACONS),
    CommandDef::new("multipath", 118, MULTIPATH).no_reply(),
    CommandDef::new("polite", 120, TARGET_PAYLOAD).no_reply(),
    CommandDef::new("filter", 124, TARGET_PAYLOAD).no_reply(),
];

// Reply fields

const REVISION: &[FieldDef] = &[FieldDef::trailing("revision")];
const COUNT: &[FieldDef] = &[FieldDef::int("size", U8)];
const ERROR_DATA: &[FieldDef] = &[FieldDef::trailing("data")];
const SERIAL: &[FieldDef] = &[FieldDef::int("serial", U32Le)];
const ERROR_BYTE: &[FieldDef] = &[FieldDef::int("error", U8)];
const UPDATE_PROGRESS: &[FieldDef] = &[
    FieldDef::int("error", U8),
    FieldDef::int("remaining", U32Le),
    FieldDef::int("progress", U32Le),
    FieldDef::int("bufferlen", U32Le),
];
const MEM_MD5_PROGRESS: &[FieldDef] = &[
    FieldDef::int("result", U8),
    FieldDef::int("remaining", U32Le),
    FieldDef::int("progress", U32Le),
    FieldDef::int("bufferlen", U32Le),
];
const DISCOVERY_ENTRY: &[FieldDef] = &[
    FieldDef::int("index", U8),
    FieldDef::int("serial", U32Le),
    FieldDef::int("rssi1", I16Le),
    FieldDef::int("rssi2", I16Le),
    FieldDef::int("flags", U16Le),
];
const DISCOVERY_ENTRY_SHORT: &[FieldDef] = &[
    FieldDef::int("index", U8),
    FieldDef::int("serial", U32Le),
    FieldDef::int("rssi1", I16Le),
    FieldDef::int("flags", U16Le),
];
const ENTITY_COUNTS: &[FieldDef] = &[
    FieldDef::int("all", U8),
    FieldDef::int("sensors", U8),
    FieldDef::int("binaries", U8),
    FieldDef::int("switches", U8),
    FieldDef::int("lights", U8),
];
const ENTITY_COUNTS_TEXTS: &[FieldDef] = &[
    FieldDef::int("all", U8),
    FieldDef::int("sensors", U8),
    FieldDef::int("binaries", U8),
    FieldDef::int("switches", U8),
    FieldDef::int("lights", U8),
    FieldDef::int("texts", U8),
];
const HASH_INFO: &[FieldDef] = &[FieldDef::int("hash", U16Le), FieldDef::trailing("info")];
const STATE_VALUE: &[FieldDef] = &[FieldDef::int("value", I16Le)];
const STATE_TYPED: &[FieldDef] = &[FieldDef::int("type", U8), FieldDef::trailing("value")];
const PREF_VALUE: &[FieldDef] = &[FieldDef::int("value", U16Le)];
const LOG_EVENT: &[FieldDef] = &[
    FieldDef::int("level", U16Le),
    FieldDef::int("from", U32Le),
    FieldDef::trailing("line"),
];
const BEACON: &[FieldDef] = &[FieldDef::int("serial", U32Le), FieldDef::int("rssi", I16Le)];
const RSSI_PAIR: &[FieldDef] = &[FieldDef::int("remote", I16Le), FieldDef::int("local", I16Le)];
const RSSI: &[FieldDef] = &[FieldDef::int("rssi", I16Le)];
const MD5_STATUS: &[FieldDef] = &[FieldDef::int("erased", U8), FieldDef::trailing("md5")];
const RESULT_BYTE: &[FieldDef] = &[FieldDef::int("result", U8)];

// Reply shapes

const R_ECHO: &[ShapeDef] = &[ShapeDef::new("echo", ECHO)];
const R_FIRM: &[ShapeDef] = &[ShapeDef::new("firm", REVISION)];
const R_NODE_ID: &[ShapeDef] = &[ShapeDef::new("nodeId", SERIAL)];
const R_NODETAG: &[ShapeDef] = &[ShapeDef::new("nodetag", NODETAG_SET)];
const R_NODETAG_SET: &[ShapeDef] = &[ShapeDef::new("nodetagSet", &[])];
const R_UPDATE_START: &[ShapeDef] = &[ShapeDef::new("updateStart", ERROR_BYTE)];
const R_UPDATE_CHUNK: &[ShapeDef] = &[ShapeDef::new("updateChunk", UPDATE_PROGRESS)];
const R_UPDATE_DIGEST: &[ShapeDef] = &[ShapeDef::new("updateDigest", ERROR_BYTE)];
const R_UPDATE_MEM_MD5: &[ShapeDef] = &[ShapeDef::new("updateMemMD5", MEM_MD5_PROGRESS)];
const R_LOG_DESTINATION: &[ShapeDef] = &[ShapeDef::new("logDestination", SERIAL)];
const R_SET_LOG_DESTINATION: &[ShapeDef] = &[ShapeDef::new("setLogDestination", &[])];
const R_CUSTOM: &[ShapeDef] = &[ShapeDef::new("custom", PAYLOAD)];
const R_REBOOT: &[ShapeDef] = &[ShapeDef::new("reboot", &[])];

const R_DISCOVERY_RESET: &[ShapeDef] = &[ShapeDef::new("reset", &[])];
const R_DISCOVERY_COUNT: &[ShapeDef] = &[ShapeDef::new("count", COUNT)];
const R_DISCOVERY_GET: &[ShapeDef] = &[
    ShapeDef::new("get", DISCOVERY_ENTRY),
    ShapeDef::new("get", DISCOVERY_ENTRY_SHORT).implying(&[("rssi2", -1)]),
];
const R_DISCOVERY_START: &[ShapeDef] = &[ShapeDef::new("start", &[])];

const R_STARTCHECK: &[ShapeDef] = &[ShapeDef::new("startcheck", RSSI_PAIR)];
const R_ROUNDTRIP: &[ShapeDef] = &[ShapeDef::new("roundtrip", RSSI)];

const R_GETMD5: &[ShapeDef] = &[ShapeDef::new("getmd5", MD5_STATUS)];
const R_ERASE: &[ShapeDef] = &[ShapeDef::new("erase", RESULT_BYTE)];
const R_WRITE: &[ShapeDef] = &[ShapeDef::new("write", ERROR_BYTE)];
const R_EBOOT: &[ShapeDef] = &[ShapeDef::new("eboot", &[])];

const R_FILTER_GROUPS: &[ShapeDef] = &[ShapeDef::new("filterGroups", SERIAL)];
const R_SET_FILTER_GROUPS: &[ShapeDef] = &[ShapeDef::new("setFilterGroups", &[])];
const R_ENTITIES_COUNT: &[ShapeDef] = &[
    ShapeDef::new("serviceEntitiesCount", ENTITY_COUNTS),
    ShapeDef::new("serviceEntitiesCount", ENTITY_COUNTS_TEXTS),
];
const R_ENTITY_HASH: &[ShapeDef] = &[ShapeDef::new("serviceEntityHash", HASH_INFO)];
const R_ENTITY_STATE: &[ShapeDef] = &[
    ShapeDef::new("serviceEntityState", STATE_VALUE),
    ShapeDef::new("serviceEntityState", STATE_TYPED),
];
const R_ENTITY_STATE_SET: &[ShapeDef] = &[ShapeDef::new("serviceEntityStateSet", &[])];
const R_ENTITY_PREFS_SET: &[ShapeDef] = &[ShapeDef::new("serviceEntityPrefsSet", &[])];

const R_COUNTPREF: &[ShapeDef] = &[ShapeDef::new("countpref", PREF_VALUE)];
const R_GETPREFVALUE: &[ShapeDef] = &[ShapeDef::new("getprefvalue", PREF_VALUE)];
const R_SETPREFVALUE: &[ShapeDef] = &[ShapeDef::new("setprefvalue", &[])];

const R_LOGEVENT: &[ShapeDef] = &[ShapeDef::new("logevent", LOG_EVENT)];
const R_BEACONS: &[ShapeDef] = &[ShapeDef::new("beacons", BEACON)];
const R_ERROR: &[ShapeDef] = &[ShapeDef::new("error", ERROR_DATA)];

// Reply tables

const DISCOVERY_REPLIES: &[ReplyDef] = &[
    ReplyDef::new(1, R_DISCOVERY_RESET),
    ReplyDef::new(3, R_DISCOVERY_COUNT),
    ReplyDef::new(5, R_DISCOVERY_GET),
    ReplyDef::new(7, R_DISCOVERY_START),
];

const RSSICHECK_REPLIES: &[ReplyDef] = &[
    ReplyDef::new(3, R_STARTCHECK),
    ReplyDef::new(5, R_ROUNDTRIP),
];

const SPIFLASH_REPLIES: &[ReplyDef] = &[
    ReplyDef::new(1, R_GETMD5),
    ReplyDef::new(2, R_ERASE),
    ReplyDef::new(3, R_WRITE),
    ReplyDef::new(4, R_EBOOT),
];

const ENTITIES_REPLIES: &[ReplyDef] = &[
    ReplyDef::new(1, R_COUNTPREF),
    ReplyDef::new(3, R_GETPREFVALUE),
    ReplyDef::new(5, R_SETPREFVALUE),
];

/// Top-level reply table
pub const REPLIES: &[ReplyDef] = &[
    ReplyDef::new(1, R_ECHO),
    ReplyDef::new(3, R_FIRM),
    ReplyDef::new(5, R_NODE_ID),
    ReplyDef::new(7, R_NODETAG),
    ReplyDef::new(9, R_NODETAG_SET),
    ReplyDef::new(11, R_UPDATE_START),
    ReplyDef::new(13, R_UPDATE_CHUNK),
    ReplyDef::new(15, R_UPDATE_DIGEST),
    ReplyDef::new(17, R_UPDATE_MEM_MD5),
    ReplyDef::new(19, R_LOG_DESTINATION),
    ReplyDef::new(21, R_SET_LOG_DESTINATION),
    ReplyDef::new(23, R_CUSTOM),
    ReplyDef::new(25, R_REBOOT),
    ReplyDef::group(27, "discovery", DISCOVERY_REPLIES),
    ReplyDef::group(29, "rssicheck", RSSICHECK_REPLIES),
    ReplyDef::group(31, "spiflash", SPIFLASH_REPLIES),
    ReplyDef::new(33, R_FILTER_GROUPS),
    ReplyDef::new(35, R_SET_FILTER_GROUPS),
    ReplyDef::new(39, R_ENTITIES_COUNT),
    ReplyDef::new(41, R_ENTITY_HASH),
    ReplyDef::new(43, R_ENTITY_STATE),
    ReplyDef::new(45, R_ENTITY_STATE_SET),
    ReplyDef::new(47, R_ENTITY_PREFS_SET),
    ReplyDef::group(49, "entities", ENTITIES_REPLIES),
    ReplyDef::new(LOGEVENT_CODE, R_LOGEVENT),
    ReplyDef::new(117, R_BEACONS),
    ReplyDef::new(ERROR_CODE, R_ERROR),
];

/// The node firmware schema
pub const STANDARD: Catalog = Catalog::new(COMMANDS, REPLIES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_is_consistent() {
        STANDARD.validate().unwrap();
    }

    #[test]
    fn test_resolve_nested_prefix() {
        let (def, prefix) = STANDARD.resolve("spiflash/getmd5").unwrap();
        assert_eq!(def.name, "getmd5");
        assert_eq!(prefix.as_slice(), &[30, 1]);

        let (def, prefix) = STANDARD.resolve("discovery/start").unwrap();
        assert_eq!(def.fields.len(), 3);
        assert_eq!(prefix.as_slice(), &[26, 6]);
    }

    #[test]
    fn test_resolve_group_itself() {
        let (def, prefix) = STANDARD.resolve("spiflash").unwrap();
        assert_eq!(def.fields.len(), 2);
        assert_eq!(prefix.as_slice(), &[30]);
    }

    #[test]
    fn test_resolve_unknown() {
        assert!(STANDARD.resolve("nodeIdx").is_none());
        assert!(STANDARD.resolve("discovery/nothing").is_none());
        assert!(STANDARD.resolve("nodeId/extra").is_none());
    }
}
