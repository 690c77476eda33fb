//! Fixed-width text record carrying a [`ConnectionInfo`].
//!
//! ```text
//! LLLL:QQQQQQ:PPPPPP:RRRRRRRR:VVVVVVVVVVVVVVVV:IIIIIIIIIIIIIIII:SSSSSSSSSSSSSSSS
//! ```
//!
//! Fields are hexadecimal: LID, QPN, PSN, rkey, virtual address, GID
//! interface id, GID subnet prefix. There is no length prefix and no
//! terminator; both sides rely on the exact widths.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::rdma::gid::Gid;
use crate::rdma::info::ConnectionInfo;
use crate::rdma::types::MASK_24;

/// Hex digit count of each field, in wire order.
pub const FIELD_WIDTHS: [usize; 7] = [4, 6, 6, 8, 16, 16, 16];

/// Field names, in wire order.
pub const FIELD_NAMES: [&str; 7] = ["lid", "qpn", "psn", "rkey", "vaddr", "gid.interface_id", "gid.subnet_prefix"];

/// Byte length of an encoded record.
pub const RECORD_LEN: usize = 4 + 6 + 6 + 8 + 16 + 16 + 16 + 6;

/// Record encoding/decoding error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("record is {got} bytes, expected 78")]
    Length { got: usize },

    #[error("record has {0} fields, expected 7")]
    FieldCount(usize),

    #[error("field `{0}` is not a hex number of the expected width")]
    Field(&'static str),

    #[error("{field} {value:#x} does not fit in 24 bits")]
    OutOfRange { field: &'static str, value: u32 },
}

fn record_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = FIELD_WIDTHS
            .iter()
            .map(|w| format!("([0-9a-fA-F]{{{}}})", w))
            .collect::<Vec<_>>()
            .join(":");
        Regex::new(&format!("^{}$", pattern)).expect("record pattern is valid")
    })
}

/// Encode `info` into its wire record.
pub fn encode(info: &ConnectionInfo) -> Result<[u8; RECORD_LEN], WireError> {
    for (field, value) in [("qpn", info.qpn), ("psn", info.psn)] {
        if value > MASK_24 {
            return Err(WireError::OutOfRange { field, value });
        }
    }

    let text = format!(
        "{:04x}:{:06x}:{:06x}:{:08x}:{:016x}:{:016x}:{:016x}",
        info.lid,
        info.qpn,
        info.psn,
        info.rkey,
        info.vaddr,
        info.gid.interface_id,
        info.gid.subnet_prefix,
    );
    let mut record = [0u8; RECORD_LEN];
    record.copy_from_slice(text.as_bytes());
    Ok(record)
}

/// Decode a wire record. Only an exact, complete record is accepted.
pub fn decode(record: &[u8]) -> Result<ConnectionInfo, WireError> {
    let fields = record.split(|b| *b == b':').count();
    if fields != FIELD_WIDTHS.len() {
        return Err(WireError::FieldCount(fields));
    }
    if record.len() != RECORD_LEN {
        return Err(WireError::Length { got: record.len() });
    }

    let caps = std::str::from_utf8(record)
        .ok()
        .and_then(|text| record_regex().captures(text))
        .ok_or_else(|| WireError::Field(first_bad_field(record)))?;

    // Widths are bounded by the pattern, so each capture fits its type.
    let hex = |i: usize| u64::from_str_radix(&caps[i + 1], 16).map_err(|_| WireError::Field(FIELD_NAMES[i]));
    Ok(ConnectionInfo {
        lid: hex(0)? as _,
        qpn: hex(1)? as _,
        psn: hex(2)? as _,
        rkey: hex(3)? as _,
        vaddr: hex(4)?,
        gid: Gid {
            interface_id: hex(5)?,
            subnet_prefix: hex(6)?,
        },
    })
}

fn first_bad_field(record: &[u8]) -> &'static str {
    let index = record
        .split(|b| *b == b':')
        .zip(FIELD_WIDTHS)
        .position(|(field, width)| field.len() != width || !field.iter().all(u8::is_ascii_hexdigit))
        .unwrap_or(0);
    FIELD_NAMES[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str =
        "0003:00004a:001234:0000abcd:0000000000010000:1111111111111111:2222222222222222";

    fn scenario_info() -> ConnectionInfo {
        ConnectionInfo {
            lid: 0x0003,
            qpn: 0x00004a,
            psn: 0x001234,
            rkey: 0x0000abcd,
            vaddr: 0x10000,
            gid: Gid::new(0x2222222222222222, 0x1111111111111111),
        }
    }

    #[test]
    fn scenario_encodes_exactly() {
        let record = encode(&scenario_info()).unwrap();
        assert_eq!(RECORD_LEN, 78);
        assert_eq!(&record[..], SCENARIO.as_bytes());
        assert_eq!(decode(&record).unwrap(), scenario_info());
    }

    #[test]
    fn extreme_values_survive() {
        let info = ConnectionInfo {
            lid: u16::MAX,
            qpn: MASK_24,
            psn: MASK_24,
            rkey: u32::MAX,
            vaddr: u64::MAX,
            gid: Gid::new(u64::MAX, 0),
        };
        assert_eq!(decode(&encode(&info).unwrap()).unwrap(), info);
    }

    #[test]
    fn uppercase_hex_accepted() {
        let upper = SCENARIO.replace("abcd", "ABCD").replace("4a", "4A");
        assert_eq!(decode(upper.as_bytes()).unwrap(), scenario_info());
    }

    #[test]
    fn qpn_beyond_24_bits_rejected() {
        let mut info = scenario_info();
        info.qpn = 0x0100_0000;
        assert_eq!(
            encode(&info),
            Err(WireError::OutOfRange {
                field: "qpn",
                value: 0x0100_0000
            })
        );
    }

    #[test]
    fn short_and_malformed_records_rejected() {
        assert_eq!(
            decode(&SCENARIO.as_bytes()[..77]),
            Err(WireError::Length { got: 77 })
        );
        assert_eq!(
            decode(b"0003:00004a:001234:0000abcd"),
            Err(WireError::FieldCount(4))
        );
        let extra = format!("{}:00", &SCENARIO[..75]);
        assert_eq!(decode(extra.as_bytes()), Err(WireError::FieldCount(8)));

        let bad = SCENARIO.replacen("001234", "00123g", 1);
        assert_eq!(decode(bad.as_bytes()), Err(WireError::Field("psn")));

        // Right length and field count, wrong widths.
        let shifted = SCENARIO.replacen("0003:00004a", "00030:0004a", 1);
        assert_eq!(decode(shifted.as_bytes()), Err(WireError::Field("lid")));
    }
}
