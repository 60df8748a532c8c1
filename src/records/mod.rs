pub mod values;
pub mod vif;

use crate::units::Unit;
use log::{debug, warn};
use vif::{lookup_combinable, lookup_fb, lookup_fd, lookup_primary, VifCombinable, VifInfo, VifRange};

/// Function field of the DIF byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementType {
    Any,
    Instantaneous,
    Maximum,
    Minimum,
    AtError,
}

/// How the binary integer data of a record is to be interpreted. Most
/// meters follow the standard (two's complement), a few mis-declare and
/// need the unsigned reading forced by their driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifSignedness {
    Signed,
    Unsigned,
}

/// Canonical hex key of a record: DIF + DIFEs + VIF + VIFEs, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DifVifKey(String);

impl DifVifKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        DifVifKey(hex::encode(bytes))
    }

    pub fn from_str(s: &str) -> Self {
        DifVifKey(s.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordData {
    NoData,
    BinaryInt,
    Real,
    Bcd,
    Lvar,
    Selection,
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Number(f64),
    Timestamp {
        secs: i64,
        pretty: String,
        date_only: bool,
    },
    Text(String),
    None,
}

/// One data record parsed out of the telegram plaintext.
#[derive(Debug, Clone)]
pub struct DVEntry {
    /// Offset of the DIF byte relative to the full frame.
    pub offset: usize,
    /// Total bytes this record consumed (header and data).
    pub length: usize,
    pub key: DifVifKey,
    pub measurement_type: MeasurementType,
    pub vif_range: VifRange,
    pub vif_unit: Unit,
    pub vif_exponent: i32,
    pub vif_factor: f64,
    pub combinables: Vec<VifCombinable>,
    pub storage_nr: u32,
    pub tariff_nr: u32,
    pub subunit_nr: u32,
    pub data_kind: RecordData,
    /// Raw data bytes exactly as transmitted.
    pub value: Vec<u8>,
    /// Unit text carried by a plain-text VIF (0x7C), if any.
    pub plain_vif_unit: Option<String>,
    pub decoded: DecodedValue,
    /// No decoder succeeded; kept for diagnostics only.
    pub flagged: bool,
}

impl DVEntry {
    /// The record's number without any VIF scaling applied.
    pub fn raw_number(&self, signedness: DifSignedness) -> Option<f64> {
        match self.data_kind {
            RecordData::BinaryInt => match signedness {
                DifSignedness::Signed => values::int_le_signed(&self.value).map(|v| v as f64),
                DifSignedness::Unsigned => values::int_le_unsigned(&self.value).map(|v| v as f64),
            },
            RecordData::Bcd => values::bcd_to_i64(&self.value).map(|v| v as f64),
            RecordData::Real => values::real32_le(&self.value),
            _ => None,
        }
    }

    /// The record's number with the VIF decimal exponent and wire-unit
    /// factor applied, expressed in `vif_unit`.
    pub fn scaled_number(&self, signedness: DifSignedness) -> Option<f64> {
        let raw = self.raw_number(signedness)?;
        Some(raw * 10f64.powi(self.vif_exponent) * self.vif_factor)
    }

    pub fn text(&self) -> Option<String> {
        match &self.decoded {
            DecodedValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Option<(i64, String, bool)> {
        match &self.decoded {
            DecodedValue::Timestamp {
                secs,
                pretty,
                date_only,
            } => Some((*secs, pretty.clone(), *date_only)),
            _ => None,
        }
    }
}

/// Result of one record-parser pass over a plaintext payload.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    pub entries: Vec<DVEntry>,
    /// Opaque bytes following a DIF 0x0F/0x1F marker, for drivers that
    /// do their own content processing.
    pub mfct_data: Option<Vec<u8>>,
    pub mfct_data_offset: usize,
    /// True when a 0x1F marker promised more records in a later telegram.
    pub more_records_follow: bool,
}

fn measurement_type_of(dif: u8) -> MeasurementType {
    match (dif >> 4) & 0x3 {
        0b00 => MeasurementType::Instantaneous,
        0b01 => MeasurementType::Maximum,
        0b10 => MeasurementType::Minimum,
        _ => MeasurementType::AtError,
    }
}

struct Cursor<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.payload.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let s = self.payload.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(s)
    }
}

/// Data field length and kind from the low nibble of the DIF.
/// LVAR length is read separately.
fn data_kind_of(dif: u8) -> Option<(RecordData, usize)> {
    match dif & 0x0F {
        0x0 => Some((RecordData::NoData, 0)),
        n @ 0x1..=0x4 => Some((RecordData::BinaryInt, n as usize)),
        0x5 => Some((RecordData::Real, 4)),
        0x6 => Some((RecordData::BinaryInt, 6)),
        0x7 => Some((RecordData::BinaryInt, 8)),
        0x8 => Some((RecordData::Selection, 0)),
        n @ 0x9..=0xC => Some((RecordData::Bcd, (n - 0x8) as usize)),
        0xD => Some((RecordData::Lvar, 0)),
        0xE => Some((RecordData::Bcd, 6)),
        _ => None,
    }
}

fn decode_value(entry: &mut DVEntry) {
    match entry.data_kind {
        RecordData::NoData | RecordData::Selection => {
            entry.decoded = DecodedValue::None;
            return;
        }
        _ => {}
    }

    /* Dates and times by VIF range and data length. */
    if entry.vif_range == VifRange::Date && entry.value.len() == 2 {
        if let Some(d) = values::date_type_g(&entry.value) {
            entry.decoded = DecodedValue::Timestamp {
                secs: d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp()).unwrap_or(0),
                pretty: d.format("%Y-%m-%d").to_string(),
                date_only: true,
            };
            return;
        }
        entry.flagged = true;
        return;
    }
    if entry.vif_range == VifRange::DateTime {
        let dt = match entry.value.len() {
            4 => values::datetime_type_f(&entry.value),
            6 => values::datetime_type_i(&entry.value),
            _ => None,
        };
        if let Some(dt) = dt {
            entry.decoded = DecodedValue::Timestamp {
                secs: dt.and_utc().timestamp(),
                pretty: dt.format("%Y-%m-%d %H:%M").to_string(),
                date_only: false,
            };
            return;
        }
        if entry.value.len() == 3 {
            if let Some(secs) = values::time_type_j(&entry.value) {
                entry.decoded = DecodedValue::Number(secs as f64);
                return;
            }
        }
        entry.flagged = true;
        return;
    }

    /* Identifier-ish ranges become text no matter the data coding. */
    if entry.vif_range.is_textual() {
        let s = match entry.data_kind {
            RecordData::Lvar => values::lvar_to_string(
                &entry.value,
                entry.vif_range != VifRange::Customer,
            ),
            _ => values::bcd_to_string(&entry.value),
        };
        entry.decoded = DecodedValue::Text(s);
        return;
    }

    match entry.data_kind {
        RecordData::Lvar => {
            entry.decoded = DecodedValue::Text(values::lvar_to_string(&entry.value, true));
        }
        _ => match entry.scaled_number(DifSignedness::Signed) {
            Some(v) => entry.decoded = DecodedValue::Number(v),
            None => entry.flagged = true,
        },
    }
}

/// Parse one record starting at the cursor. Returns None on a malformed
/// or truncated record; the caller flags it and resynchronizes.
fn parse_one(cur: &mut Cursor, base_offset: usize) -> Option<DVEntry> {
    let record_start = cur.pos;
    let dif = cur.u8()?;

    let (mut data_kind, mut data_len) = data_kind_of(dif)?;
    let mut key_bytes = vec![dif];
    let mut storage_nr = ((dif >> 6) & 0x1) as u32;
    let mut tariff_nr = 0u32;
    let mut subunit_nr = 0u32;

    /* DIFE chain. */
    let mut ext = dif & 0x80 != 0;
    let mut k = 0u32;
    while ext {
        if k >= 10 {
            return None;
        }
        let dife = cur.u8()?;
        key_bytes.push(dife);
        storage_nr += ((dife & 0x0F) as u32) << (1 + 4 * k);
        tariff_nr += (((dife >> 4) & 0x3) as u32) << (2 * k);
        subunit_nr += (((dife >> 6) & 0x1) as u32) << k;
        ext = dife & 0x80 != 0;
        k += 1;
    }

    /* VIF and its extension chain. */
    let vif = cur.u8()?;
    key_bytes.push(vif);
    let mut combinables: Vec<VifCombinable> = Vec::new();
    let mut plain_vif_unit: Option<String> = None;

    let (info, mut ext) = match vif {
        0x7C | 0xFC => {
            /* Plain-text VIF: length + ASCII unit, reversed on the wire. */
            let len = cur.u8()? as usize;
            key_bytes.push(len as u8);
            let chars = cur.take(len)?;
            key_bytes.extend_from_slice(chars);
            plain_vif_unit = Some(values::lvar_to_string(chars, true));
            (
                VifInfo {
                    range: VifRange::PlainText,
                    unit: Unit::Counter,
                    exponent: 0,
                    factor: 1.0,
                },
                vif & 0x80 != 0,
            )
        }
        0xFB => {
            let vife = cur.u8()?;
            key_bytes.push(vife);
            (lookup_fb(vife), vife & 0x80 != 0)
        }
        0xFD => {
            let vife = cur.u8()?;
            key_bytes.push(vife);
            (lookup_fd(vife), vife & 0x80 != 0)
        }
        0x7F | 0xFF => (
            VifInfo {
                range: VifRange::ManufacturerSpecific,
                unit: Unit::Counter,
                exponent: 0,
                factor: 1.0,
            },
            vif & 0x80 != 0,
        ),
        _ => (lookup_primary(vif & 0x7F), vif & 0x80 != 0),
    };

    let mut n_vifes = 0;
    while ext {
        if n_vifes >= 10 {
            return None;
        }
        let vife = cur.u8()?;
        key_bytes.push(vife);
        combinables.push(lookup_combinable(vife));
        ext = vife & 0x80 != 0;
        n_vifes += 1;
    }

    /* Variable-length data carries its own length byte. */
    if data_kind == RecordData::Lvar {
        let l = cur.u8()?;
        match l {
            0x00..=0xBF => data_len = l as usize,
            0xC0..=0xC9 => {
                data_kind = RecordData::Bcd;
                data_len = (l - 0xC0) as usize;
            }
            0xD0..=0xD9 => {
                data_kind = RecordData::Bcd;
                data_len = (l - 0xD0) as usize;
            }
            0xE0..=0xEF => {
                data_kind = RecordData::BinaryInt;
                data_len = (l - 0xE0) as usize;
            }
            _ => return None,
        }
    }

    let value = cur.take(data_len)?.to_vec();

    let mut entry = DVEntry {
        offset: base_offset + record_start,
        length: cur.pos - record_start,
        key: DifVifKey::from_bytes(&key_bytes),
        measurement_type: measurement_type_of(dif),
        vif_range: info.range,
        vif_unit: info.unit,
        vif_exponent: info.exponent,
        vif_factor: info.factor,
        combinables,
        storage_nr,
        tariff_nr,
        subunit_nr,
        data_kind,
        value,
        plain_vif_unit,
        decoded: DecodedValue::None,
        flagged: false,
    };
    decode_value(&mut entry);
    Some(entry)
}

/// Walk a plaintext payload and produce one DVEntry per record.
///
/// Never fails as a whole: malformed records are flagged and the walk
/// resynchronizes one byte after the offending DIF. `base_offset` is the
/// payload's position in the full frame so entry offsets stay global.
pub fn parse_records(payload: &[u8], base_offset: usize) -> RecordSet {
    let mut set = RecordSet::default();
    let mut i = 0usize;

    while i < payload.len() {
        let dif = payload[i];

        /* Idle filler between records and AES padding. */
        if dif == 0x2F {
            i += 1;
            continue;
        }

        /* Manufacturer specific data follows, optionally with more
        records promised in a later telegram (0x1F). */
        if dif == 0x0F || dif == 0x1F {
            set.mfct_data_offset = base_offset + i + 1;
            set.mfct_data = Some(payload[i + 1..].to_vec());
            set.more_records_follow = dif == 0x1F;
            break;
        }

        let mut cur = Cursor { payload, pos: i };
        match parse_one(&mut cur, base_offset) {
            Some(entry) => {
                debug!(
                    "(records) {} {:?} storage {} at offset {}",
                    entry.key.as_str(),
                    entry.vif_range,
                    entry.storage_nr,
                    entry.offset
                );
                i = cur.pos;
                set.entries.push(entry);
            }
            None => {
                warn!(
                    "(records) malformed record at offset {}, dif {:02x}",
                    base_offset + i,
                    dif
                );
                set.entries.push(DVEntry {
                    offset: base_offset + i,
                    length: 1,
                    key: DifVifKey::from_bytes(&[dif]),
                    measurement_type: measurement_type_of(dif),
                    vif_range: VifRange::Unknown,
                    vif_unit: Unit::Counter,
                    vif_exponent: 0,
                    vif_factor: 1.0,
                    combinables: Vec::new(),
                    storage_nr: 0,
                    tariff_nr: 0,
                    subunit_nr: 0,
                    data_kind: RecordData::Invalid,
                    value: Vec::new(),
                    plain_vif_unit: None,
                    decoded: DecodedValue::None,
                    flagged: true,
                });
                i += 1;
            }
        }
    }

    set
}

#[cfg(test)]
mod records_tests {
    use super::*;

    #[test]
    fn total_volume_record() {
        /* 0C 13 48 55 00 00: 8 digit BCD, volume in liters. */
        let payload = hex::decode("0C13485500004f").unwrap();
        let set = parse_records(&payload[..6], 0);
        assert_eq!(set.entries.len(), 1);
        let e = &set.entries[0];
        assert_eq!(e.key.as_str(), "0c13");
        assert_eq!(e.vif_range, VifRange::Volume);
        assert_eq!(e.measurement_type, MeasurementType::Instantaneous);
        assert_eq!(e.storage_nr, 0);
        assert_eq!(e.scaled_number(DifSignedness::Signed), Some(5.548));
    }

    #[test]
    fn storage_and_tariff_from_difes() {
        /* 84 10 13 <4 bytes>: DIFE 0x10 adds tariff 1. */
        let payload = hex::decode("841013E8030000").unwrap();
        let set = parse_records(&payload, 0);
        let e = &set.entries[0];
        assert_eq!(e.tariff_nr, 1);
        assert_eq!(e.storage_nr, 0);
        assert_eq!(e.scaled_number(DifSignedness::Signed), Some(1.0));

        /* 4C 13: storage bit in the DIF itself. */
        let payload = hex::decode("4C1378563412").unwrap();
        let set = parse_records(&payload, 0);
        assert_eq!(set.entries[0].storage_nr, 1);
    }

    #[test]
    fn software_version_is_text() {
        /* 0B FD 0F 02 00 01 -> "010002" */
        let payload = hex::decode("0BFD0F020001").unwrap();
        let set = parse_records(&payload, 0);
        let e = &set.entries[0];
        assert_eq!(e.vif_range, VifRange::SoftwareVersion);
        assert_eq!(e.text(), Some("010002".to_string()));
    }

    #[test]
    fn datetime_record() {
        /* 04 6D 0D 0B 5C 2B */
        let payload = hex::decode("046D0D0B5C2B").unwrap();
        let set = parse_records(&payload, 0);
        let (secs, pretty, date_only) = set.entries[0].timestamp().unwrap();
        assert!(secs > 0);
        assert_eq!(pretty, "2018-11-28 11:13");
        assert!(!date_only);
    }

    #[test]
    fn manufacturer_data_blob() {
        let payload = hex::decode("0C13485500000FDEADBEEF").unwrap();
        let set = parse_records(&payload, 10);
        assert_eq!(set.entries.len(), 1);
        assert_eq!(set.mfct_data, Some(hex::decode("DEADBEEF").unwrap()));
        assert_eq!(set.mfct_data_offset, 17);
        assert!(!set.more_records_follow);
    }

    #[test]
    fn filler_bytes_are_skipped() {
        let payload = hex::decode("2F2F0C13485500002F2F").unwrap();
        let set = parse_records(&payload, 0);
        assert_eq!(set.entries.len(), 1);
        assert_eq!(set.entries[0].offset, 2);
    }

    #[test]
    fn malformed_record_is_flagged_and_walk_continues() {
        /* 0x6F is an invalid DIF low nibble; parser must advance one byte
        and pick up the valid record afterwards. */
        let payload = hex::decode("6F0C1348550000").unwrap();
        let set = parse_records(&payload, 0);
        assert_eq!(set.entries.len(), 2);
        assert!(set.entries[0].flagged);
        assert_eq!(set.entries[1].scaled_number(DifSignedness::Signed), Some(5.548));
    }

    #[test]
    fn truncated_record_is_flagged() {
        /* Promises 4 BCD bytes, delivers none. */
        let payload = hex::decode("0C1348").unwrap();
        let set = parse_records(&payload, 0);
        assert!(set.entries.iter().all(|e| e.flagged));
    }

    #[test]
    fn entries_are_contiguous() {
        let payload = hex::decode("0C1348550000426CE1F14C1300000000").unwrap();
        let set = parse_records(&payload, 0);
        let mut expected = 0usize;
        for e in &set.entries {
            assert_eq!(e.offset, expected);
            expected += e.length;
        }
        assert_eq!(expected, payload.len());
    }

    #[test]
    fn lvar_string_record() {
        /* 0D FD 11 03 "XYZ" -> customer, wire order kept. */
        let payload = hex::decode("0DFD1103").unwrap();
        let mut payload = payload.clone();
        payload.extend_from_slice(b"XYZ");
        let set = parse_records(&payload, 0);
        assert_eq!(set.entries[0].text(), Some("XYZ".to_string()));
    }
}
