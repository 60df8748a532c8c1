pub mod crypto;
pub mod ell;
pub mod tpl;

use crate::frames::LinkMode;
use crate::records::{self, DVEntry};
use crate::telegram::crypto::{CryptoError, MeterKeys};
use crate::telegram::ell::{AflHeader, AflReassembler, EllHeader};
use crate::telegram::tpl::{TplHeader, TplSecurityMode};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelegramError {
    #[error("telegram too short, need at least {0} bytes")]
    Truncated(usize),
    #[error("unknown CI field {0:02x}")]
    UnknownCi(u8),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("fragment stored, telegram incomplete")]
    FragmentPending,
    #[error("compact frames (CI 79) need a format cache and are skipped")]
    CompactFrame,
}

/// Reception metadata attached to a telegram on arrival.
#[derive(Debug, Clone, Default)]
pub struct AboutTelegram {
    pub device: String,
    pub rssi_dbm: i32,
    /// Capture time, seconds since the epoch.
    pub timestamp: u64,
    pub link_mode: Option<LinkMode>,
}

/// How meter ids are rendered towards the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IdentityMode {
    #[default]
    #[serde(rename = "ID")]
    Id,
    #[serde(rename = "ID_MFCT")]
    IdMfct,
    #[serde(rename = "FULL")]
    Full,
}

/// One identity exposed by a telegram layer. The last address pushed is
/// the one the consumer sees, earlier ones are intermediate hops.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub id: String,
    pub mfct: u16,
    pub version: u8,
    pub device_type: u8,
}

impl Address {
    pub fn render(&self, mode: IdentityMode) -> String {
        match mode {
            IdentityMode::Id => self.id.clone(),
            IdentityMode::IdMfct => format!("{}.M={}", self.id, mfct_to_string(self.mfct)),
            IdentityMode::Full => format!(
                "{}.M={}.V={:02x}.T={:02x}",
                self.id,
                mfct_to_string(self.mfct),
                self.version,
                self.device_type
            ),
        }
    }
}

/// Manufacturer field to its three letter code. Letters are packed five
/// bits each; the top bit is a normalized/raw marker some meters set
/// incorrectly, so comparisons mask it off.
pub fn mfct_to_string(m: u16) -> String {
    let l1 = ((m >> 10) & 0x1F) as u8 + 64;
    let l2 = ((m >> 5) & 0x1F) as u8 + 64;
    let l3 = (m & 0x1F) as u8 + 64;
    String::from_utf8(vec![l1, l2, l3]).unwrap_or_else(|_| "???".to_string())
}

pub fn mfct_from_str(s: &str) -> Option<u16> {
    let b = s.as_bytes();
    if b.len() != 3 {
        return None;
    }
    let mut m: u16 = 0;
    for letter in b {
        let letter = letter.to_ascii_uppercase();
        if !letter.is_ascii_uppercase() {
            return None;
        }
        m = (m << 5) | ((letter - 64) as u16 & 0x1F);
    }
    Some(m)
}

pub const MANUFACTURER_SON: u16 = 0x4DEE;
pub const MANUFACTURER_TCH: u16 = 0x5068;
pub const MANUFACTURER_APA: u16 = 0x0601;
pub const MANUFACTURER_APT: u16 = 0x0614;
pub const MANUFACTURER_AMX: u16 = 0x05B8;
pub const MANUFACTURER_ITW: u16 = 0x2697;
pub const MANUFACTURER_MAD: u16 = 0x3424;

lazy_static! {
    static ref MEDIA_NAMES: HashMap<u8, &'static str> = {
        let mut m = HashMap::new();
        m.insert(0x00, "other");
        m.insert(0x01, "oil");
        m.insert(0x02, "electricity");
        m.insert(0x03, "gas");
        m.insert(0x04, "heat");
        m.insert(0x05, "steam");
        m.insert(0x06, "warm water");
        m.insert(0x07, "water");
        m.insert(0x08, "heat cost allocation");
        m.insert(0x09, "compressed air");
        m.insert(0x0A, "cooling load volume at outlet");
        m.insert(0x0B, "cooling load volume at inlet");
        m.insert(0x0C, "heat volume at inlet");
        m.insert(0x0D, "heat/cooling load");
        m.insert(0x15, "hot water");
        m.insert(0x16, "cold water");
        m.insert(0x17, "dual water");
        m.insert(0x18, "pressure");
        m.insert(0x19, "a/d converter");
        m.insert(0x1A, "smoke detector");
        m.insert(0x1B, "room sensor");
        m.insert(0x1C, "gas detector");
        m.insert(0x20, "breaker");
        m.insert(0x21, "valve");
        m.insert(0x25, "customer unit");
        m.insert(0x28, "waste water");
        m.insert(0x29, "garbage");
        m
    };
}

/// Human readable media name for a device type byte. A couple of
/// Techem proprietary types encode the water temperature in the type.
pub fn media_name(device_type: u8, mfct: u16) -> &'static str {
    if (mfct & 0x7FFF) == MANUFACTURER_TCH {
        match device_type {
            0x62 => return "warm water",
            0x72 => return "cold water",
            _ => {}
        }
    }
    MEDIA_NAMES.get(&device_type).copied().unwrap_or("unknown")
}

/// Pattern over meter addresses: an id with optional `*` wildcard plus
/// optional manufacturer/version/type constraints, e.g.
/// `12345678`, `76*`, `*.M=SON.V=3c`.
#[derive(Debug, Clone)]
pub struct AddressExpression {
    raw: String,
    id_regex: Regex,
    mfct: Option<u16>,
    version: Option<u8>,
    device_type: Option<u8>,
}

impl AddressExpression {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let id_part = parts.next()?;
        if id_part.is_empty() {
            return None;
        }

        let mut mfct = None;
        let mut version = None;
        let mut device_type = None;
        for p in parts {
            let (tag, value) = p.split_once('=')?;
            match tag {
                "M" | "m" => mfct = Some(mfct_from_str(value)?),
                "V" | "v" => version = Some(u8::from_str_radix(value, 16).ok()?),
                "T" | "t" => device_type = Some(u8::from_str_radix(value, 16).ok()?),
                _ => return None,
            }
        }

        /* Only digits and wildcards may appear in the id pattern. */
        if !id_part.chars().all(|c| c.is_ascii_digit() || c == '*') {
            return None;
        }
        let pattern = format!("^{}$", id_part.replace('*', "[0-9]*"));
        let id_regex = Regex::new(&pattern).ok()?;

        Some(AddressExpression {
            raw: s.to_string(),
            id_regex,
            mfct,
            version,
            device_type,
        })
    }

    pub fn matches(&self, a: &Address) -> bool {
        if !self.id_regex.is_match(&a.id) {
            return false;
        }
        if let Some(m) = self.mfct {
            if (m & 0x7FFF) != (a.mfct & 0x7FFF) {
                return false;
            }
        }
        if let Some(v) = self.version {
            if v != a.version {
                return false;
            }
        }
        if let Some(t) = self.device_type {
            if t != a.device_type {
                return false;
            }
        }
        true
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Mutable state of one decoding pass over a received frame.
#[derive(Debug, Clone, Default)]
pub struct Telegram {
    pub about: AboutTelegram,

    /// Working buffer, CRCs already stripped. Decryption happens in place.
    pub frame: Vec<u8>,

    /* Data link layer. */
    pub dll_c: u8,
    pub dll_mfct: u16,
    pub dll_id: [u8; 4],
    pub dll_version: u8,
    pub dll_type: u8,

    pub ell: Option<EllHeader>,
    pub afl: Option<AflHeader>,
    pub tpl: Option<TplHeader>,
    pub tpl_sec_mode: Option<TplSecurityMode>,
    pub num_encrypted_bytes: usize,
    pub num_not_encrypted_at_end: usize,

    /// Offset of the first application data byte in `frame`.
    pub header_size: usize,

    pub dv_entries: Vec<DVEntry>,
    pub mfct_data: Option<Vec<u8>>,
    pub mfct_data_offset: usize,
    pub more_records_follow: bool,

    pub addresses: Vec<Address>,
    pub discard: bool,
}

fn id_string(id: &[u8; 4]) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", id[3], id[2], id[1], id[0])
}

impl Telegram {
    pub fn new(about: AboutTelegram) -> Self {
        Telegram {
            about,
            ..Default::default()
        }
    }

    /// Parse only the link layer header, enough to decide which meter the
    /// telegram belongs to. No key material is needed.
    pub fn parse_header(&mut self, frame: &[u8]) -> Result<(), TelegramError> {
        if frame.len() < 11 {
            return Err(TelegramError::Truncated(11));
        }
        self.frame = frame.to_vec();
        self.dll_c = frame[1];
        self.dll_mfct = u16::from_le_bytes([frame[2], frame[3]]);
        self.dll_id = [frame[4], frame[5], frame[6], frame[7]];
        self.dll_version = frame[8];
        self.dll_type = frame[9];

        self.addresses.clear();
        self.addresses.push(Address {
            id: id_string(&self.dll_id),
            mfct: self.dll_mfct,
            version: self.dll_version,
            device_type: self.dll_type,
        });
        Ok(())
    }

    /// The identity the consumer sees.
    pub fn address(&self) -> Option<&Address> {
        self.addresses.last()
    }

    /// Eight link layer address bytes in IV order.
    fn dll_address_bytes(&self) -> [u8; 8] {
        let mut a = [0u8; 8];
        a[0..2].copy_from_slice(&self.dll_mfct.to_le_bytes());
        a[2..6].copy_from_slice(&self.dll_id);
        a[6] = self.dll_version;
        a[7] = self.dll_type;
        a
    }

    /// Application payload for drivers doing their own content parsing:
    /// the manufacturer data blob when the telegram carries one, the
    /// record region otherwise.
    pub fn extract_payload(&self) -> Vec<u8> {
        match &self.mfct_data {
            Some(d) => d.clone(),
            None => self.frame.get(self.header_size..).map(|s| s.to_vec()).unwrap_or_default(),
        }
    }

    /// Run the full layer walk: DLL, ELL/AFL, TPL with decryption, then
    /// the record parser. Fragmented telegrams return `FragmentPending`
    /// until the reassembler has seen the final fragment.
    pub fn parse(
        &mut self,
        frame: &[u8],
        keys: &MeterKeys,
        reassembler: &mut AflReassembler,
    ) -> Result<(), TelegramError> {
        self.parse_header(frame)?;

        let mut pos = 10usize;
        loop {
            let ci = *self
                .frame
                .get(pos)
                .ok_or(TelegramError::Truncated(pos + 1))?;

            match ci {
                0x8C | 0x8D => {
                    let dll_mfct = self.dll_mfct;
                    let (hdr, next) = ell::strip_ell(&mut self.frame, pos, dll_mfct, keys)?;
                    debug!("(telegram) stripped ELL header, {} bytes", next - pos);
                    self.ell = Some(hdr);
                    pos = next;
                }
                0x90 => {
                    let afl = ell::parse_afl(&self.frame, pos)?;
                    let body = pos + afl.length;
                    let fragment = self.frame[body..].to_vec();
                    let address_id = id_string(&self.dll_id);
                    let assembled =
                        reassembler.offer(&address_id, &afl, &fragment, self.about.timestamp);
                    self.afl = Some(afl);
                    match assembled {
                        None => return Err(TelegramError::FragmentPending),
                        Some(payload) => {
                            self.frame.truncate(body);
                            self.frame.extend_from_slice(&payload);
                            pos = body;
                        }
                    }
                }
                0x79 => {
                    return Err(TelegramError::CompactFrame);
                }
                0xA0..=0xB7 => {
                    /* Manufacturer specific application layer, the whole
                    payload belongs to the driver. */
                    self.header_size = pos + 1;
                    self.mfct_data = Some(self.frame[pos + 1..].to_vec());
                    self.mfct_data_offset = pos + 1;
                    debug!(
                        "(telegram) CI {:02x} manufacturer payload, {} bytes",
                        ci,
                        self.frame.len() - pos - 1
                    );
                    return Ok(());
                }
                ci if tpl::is_tpl_ci(ci) => {
                    let hdr = tpl::parse_tpl(&self.frame, pos)?;
                    let body = pos + hdr.length;

                    if let (Some(id), Some(mfct), Some(version), Some(device_type)) =
                        (hdr.id, hdr.mfct, hdr.version, hdr.device_type)
                    {
                        self.addresses.push(Address {
                            id: id_string(&id),
                            mfct,
                            version,
                            device_type,
                        });
                    }

                    let dll_address = self.dll_address_bytes();
                    let (mode, nenc, trailing) =
                        tpl::decrypt_payload(&mut self.frame, body, &hdr, &dll_address, keys)?;
                    self.tpl_sec_mode = Some(mode);
                    self.num_encrypted_bytes = nenc;
                    self.num_not_encrypted_at_end = trailing;
                    self.tpl = Some(hdr);
                    self.header_size = body;

                    let payload = self.frame[body..].to_vec();
                    let set = records::parse_records(&payload, body);
                    self.dv_entries = set.entries;
                    if set.mfct_data.is_some() {
                        self.mfct_data = set.mfct_data;
                        self.mfct_data_offset = set.mfct_data_offset;
                    }
                    self.more_records_follow = set.more_records_follow;
                    debug!(
                        "(telegram) {} records, {} encrypted bytes, mode {}",
                        self.dv_entries.len(),
                        nenc,
                        self.tpl_sec_mode.map(|m| m.to_nr()).unwrap_or(0)
                    );
                    return Ok(());
                }
                other => return Err(TelegramError::UnknownCi(other)),
            }
        }
    }
}

#[cfg(test)]
mod telegram_tests {
    use super::*;

    #[test]
    fn manufacturer_codec() {
        assert_eq!(mfct_to_string(MANUFACTURER_SON), "SON");
        assert_eq!(mfct_to_string(MANUFACTURER_TCH), "TCH");
        assert_eq!(mfct_from_str("SON"), Some(MANUFACTURER_SON));
        assert_eq!(mfct_from_str("APA"), Some(MANUFACTURER_APA));
        /* Normalized flag in the top bit is masked in comparisons. */
        assert_eq!(mfct_to_string(0x8614 & 0x7FFF), "APT");
        assert_eq!(mfct_from_str("XY"), None);
    }

    #[test]
    fn dll_parse_and_address() {
        /* supercom587: A2 44 EE4D 78563412 3C 06 7A ... */
        let frame = hex::decode("A244EE4D785634123C067A8F000000").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        t.parse_header(&frame).unwrap();
        assert_eq!(t.dll_c, 0x44);
        assert_eq!(t.dll_mfct, MANUFACTURER_SON);
        assert_eq!(t.dll_version, 0x3C);
        assert_eq!(t.dll_type, 0x06);
        let a = t.address().unwrap();
        assert_eq!(a.id, "12345678");
        assert_eq!(a.render(IdentityMode::Id), "12345678");
        assert_eq!(a.render(IdentityMode::IdMfct), "12345678.M=SON");
        assert_eq!(a.render(IdentityMode::Full), "12345678.M=SON.V=3c.T=06");
    }

    #[test]
    fn plaintext_short_tpl_yields_records() {
        let frame = hex::decode("A244EE4D785634123C067A8F0000000C1348550000").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let mut r = AflReassembler::new(4, 60);
        t.parse(&frame, &MeterKeys::none(), &mut r).unwrap();
        assert_eq!(t.tpl_sec_mode, Some(TplSecurityMode::None));
        assert_eq!(t.header_size, 15);
        assert_eq!(t.dv_entries.len(), 1);
        assert_eq!(t.dv_entries[0].offset, 15);
    }

    #[test]
    fn mfct_specific_ci_keeps_payload_opaque() {
        let frame = hex::decode("2F446850200141029562A206702901006017030004000300").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let mut r = AflReassembler::new(4, 60);
        t.parse(&frame, &MeterKeys::none(), &mut r).unwrap();
        assert!(t.dv_entries.is_empty());
        let payload = t.extract_payload();
        assert_eq!(payload[0], 0x06);
        assert_eq!(payload[3], 0x01);
        assert_eq!(t.address().unwrap().id, "02410120");
    }

    #[test]
    fn unknown_ci_is_an_error() {
        let frame = hex::decode("A244EE4D785634123C06FE").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let mut r = AflReassembler::new(4, 60);
        assert_eq!(
            t.parse(&frame, &MeterKeys::none(), &mut r),
            Err(TelegramError::UnknownCi(0xFE))
        );
    }

    #[test]
    fn address_expressions() {
        let a = Address {
            id: "12345678".to_string(),
            mfct: MANUFACTURER_SON,
            version: 0x3C,
            device_type: 0x06,
        };
        assert!(AddressExpression::parse("12345678").unwrap().matches(&a));
        assert!(AddressExpression::parse("*").unwrap().matches(&a));
        assert!(AddressExpression::parse("12*").unwrap().matches(&a));
        assert!(!AddressExpression::parse("13*").unwrap().matches(&a));
        assert!(AddressExpression::parse("12345678.M=SON.V=3c.T=06")
            .unwrap()
            .matches(&a));
        assert!(!AddressExpression::parse("12345678.M=TCH").unwrap().matches(&a));
        assert!(AddressExpression::parse("bogus!").is_none());
    }

    #[test]
    fn media_names_follow_device_type() {
        assert_eq!(media_name(0x06, MANUFACTURER_SON), "warm water");
        assert_eq!(media_name(0x07, MANUFACTURER_SON), "water");
        assert_eq!(media_name(0x62, MANUFACTURER_TCH), "warm water");
        assert_eq!(media_name(0xEF, 0), "unknown");
    }

    #[test]
    fn fragmented_telegram_waits_for_final_fragment() {
        /* DLL + AFL header with MF set. */
        let mut frame1 = hex::decode("1E44EE4D785634123C06").unwrap();
        frame1.extend_from_slice(&[0x90, 0x02]);
        frame1.extend_from_slice(&(0x4000u16 | 0x0001u16).to_le_bytes()); /* MF | fid 1 */
        frame1.extend_from_slice(&[0x7A, 0x8F, 0x00]);

        let mut frame2 = hex::decode("1E44EE4D785634123C06").unwrap();
        frame2.extend_from_slice(&[0x90, 0x02]);
        frame2.extend_from_slice(&0x0001u16.to_le_bytes());
        frame2.extend_from_slice(&[0x00, 0x00, 0x0C, 0x13, 0x48, 0x55, 0x00, 0x00]);

        let mut r = AflReassembler::new(4, 60);
        let mut t1 = Telegram::new(AboutTelegram::default());
        assert_eq!(
            t1.parse(&frame1, &MeterKeys::none(), &mut r),
            Err(TelegramError::FragmentPending)
        );

        let mut t2 = Telegram::new(AboutTelegram::default());
        t2.parse(&frame2, &MeterKeys::none(), &mut r).unwrap();
        assert_eq!(t2.dv_entries.len(), 1);
        assert_eq!(
            t2.dv_entries[0].scaled_number(crate::records::DifSignedness::Signed),
            Some(5.548)
        );
    }
}
