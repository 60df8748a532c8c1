use crate::telegram::crypto::{self, CryptoError, MeterKeys};
use log::debug;

/* CI values that select the TPL header variant, direction meter to
   gateway. OMS Annex D D.2. */
pub const TPL_NO_HEADER_CIS: [u8; 4] = [0x66, 0x70, 0x71, 0x78];
pub const TPL_SHORT_HEADER_CIS: [u8; 10] = [0x67, 0x6E, 0x74, 0x7A, 0x7D, 0x7F, 0x88, 0x9E, 0xC1, 0xC4];
pub const TPL_LONG_HEADER_CIS: [u8; 9] = [0x68, 0x6F, 0x72, 0x75, 0x7C, 0x7E, 0x9F, 0xC2, 0xC5];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TplSecurityMode {
    None,
    Aes5,
    Aes7,
    Reserved(u8),
}

impl TplSecurityMode {
    pub fn from_config(cfg: u16) -> Self {
        match (cfg >> 8) & 0x1F {
            0 => TplSecurityMode::None,
            5 => TplSecurityMode::Aes5,
            7 => TplSecurityMode::Aes7,
            m => TplSecurityMode::Reserved(m as u8),
        }
    }

    pub fn to_nr(&self) -> u8 {
        match self {
            TplSecurityMode::None => 0,
            TplSecurityMode::Aes5 => 5,
            TplSecurityMode::Aes7 => 7,
            TplSecurityMode::Reserved(m) => *m,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TplHeaderKind {
    NoHeader,
    Short,
    Long,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TplHeader {
    pub ci: u8,
    pub kind: TplHeaderKind,
    pub acc: u8,
    pub sts: u8,
    pub cfg: u16,
    /// Extension byte present with security mode 7.
    pub cfg_ext: Option<u8>,
    /* Secondary identity carried by the long header. */
    pub id: Option<[u8; 4]>,
    pub mfct: Option<u16>,
    pub version: Option<u8>,
    pub device_type: Option<u8>,
    /// Header bytes consumed including the CI field.
    pub length: usize,
}

impl TplHeader {
    pub fn security_mode(&self) -> TplSecurityMode {
        TplSecurityMode::from_config(self.cfg)
    }
}

pub fn is_tpl_ci(ci: u8) -> bool {
    TPL_NO_HEADER_CIS.contains(&ci)
        || TPL_SHORT_HEADER_CIS.contains(&ci)
        || TPL_LONG_HEADER_CIS.contains(&ci)
}

/// Parse the TPL header at `pos`.
pub fn parse_tpl(frame: &[u8], pos: usize) -> Result<TplHeader, CryptoError> {
    let err = |m: &str| CryptoError::MalformedCrypto(m.to_string());
    let ci = *frame.get(pos).ok_or_else(|| err("TPL CI missing"))?;

    if TPL_NO_HEADER_CIS.contains(&ci) {
        return Ok(TplHeader {
            ci,
            kind: TplHeaderKind::NoHeader,
            acc: 0,
            sts: 0,
            cfg: 0,
            cfg_ext: None,
            id: None,
            mfct: None,
            version: None,
            device_type: None,
            length: 1,
        });
    }

    let (kind, fixed) = if TPL_SHORT_HEADER_CIS.contains(&ci) {
        (TplHeaderKind::Short, 4)
    } else if TPL_LONG_HEADER_CIS.contains(&ci) {
        (TplHeaderKind::Long, 12)
    } else {
        return Err(err(&format!("CI {:02x} is not a TPL header", ci)));
    };

    if pos + 1 + fixed > frame.len() {
        return Err(err("TPL header truncated"));
    }

    let mut at = pos + 1;
    let (id, mfct, version, device_type) = if kind == TplHeaderKind::Long {
        let id: [u8; 4] = frame[at..at + 4].try_into().unwrap();
        let mfct = u16::from_le_bytes([frame[at + 4], frame[at + 5]]);
        let version = frame[at + 6];
        let device_type = frame[at + 7];
        at += 8;
        (Some(id), Some(mfct), Some(version), Some(device_type))
    } else {
        (None, None, None, None)
    };

    let acc = frame[at];
    let sts = frame[at + 1];
    let cfg = u16::from_le_bytes([frame[at + 2], frame[at + 3]]);
    at += 4;

    /* Mode 7 appends a configuration extension byte. */
    let cfg_ext = if TplSecurityMode::from_config(cfg) == TplSecurityMode::Aes7 {
        let b = *frame.get(at).ok_or_else(|| err("TPL cfg extension missing"))?;
        at += 1;
        Some(b)
    } else {
        None
    };

    debug!(
        "(tpl) ci {:02x} {:?} acc {:02x} sts {:02x} cfg {:04x}",
        ci, kind, acc, sts, cfg
    );

    Ok(TplHeader {
        ci,
        kind,
        acc,
        sts,
        cfg,
        cfg_ext,
        id,
        mfct,
        version,
        device_type,
        length: at - pos,
    })
}

/// Decrypt the TPL payload in place according to the configured security
/// mode. `body` is the offset of the first payload byte, `dll_address` the
/// 8 link-layer address bytes used for the IV when the header carries no
/// secondary identity.
///
/// Returns (mode, encrypted byte count, trailing plaintext byte count).
pub fn decrypt_payload(
    frame: &mut [u8],
    body: usize,
    hdr: &TplHeader,
    dll_address: &[u8; 8],
    keys: &MeterKeys,
) -> Result<(TplSecurityMode, usize, usize), CryptoError> {
    let mode = hdr.security_mode();
    let remaining = frame.len().saturating_sub(body);

    match mode {
        TplSecurityMode::None => Ok((mode, 0, remaining)),
        TplSecurityMode::Reserved(m) => Err(CryptoError::UnsupportedMode(m)),
        TplSecurityMode::Aes5 | TplSecurityMode::Aes7 => {
            let blocks = ((hdr.cfg >> 4) & 0x0F) as usize;
            let nenc = if blocks > 0 {
                16 * blocks
            } else {
                remaining - remaining % 16
            };
            if nenc > remaining {
                return Err(CryptoError::MalformedCrypto(format!(
                    "config claims {} encrypted bytes, only {} present",
                    nenc, remaining
                )));
            }
            if nenc == 0 {
                return Ok((mode, 0, remaining));
            }
            if !keys.has_key() {
                return Err(CryptoError::NeedsKey);
            }

            /* A long header replaces the link layer identity in the IV. */
            let mut address = *dll_address;
            if let (Some(id), Some(mfct), Some(version), Some(device_type)) =
                (hdr.id, hdr.mfct, hdr.version, hdr.device_type)
            {
                address[0..2].copy_from_slice(&mfct.to_le_bytes());
                address[2..6].copy_from_slice(&id);
                address[6] = version;
                address[7] = device_type;
            }

            match mode {
                TplSecurityMode::Aes5 => {
                    let iv = crypto::build_tpl_iv(&address, hdr.acc);
                    crypto::decrypt_aes_cbc_iv(frame, body, nenc, &keys.confidentiality_key, &iv)?;
                }
                _ => {
                    let nonce = crypto::build_tpl_ctr_nonce(&address, hdr.acc);
                    crypto::decrypt_aes_ctr(frame, body, nenc, &keys.confidentiality_key, &nonce)?;
                }
            }

            /* Decryption is verified by the 2F 2F filler marker. */
            if frame[body] != 0x2F || frame[body + 1] != 0x2F {
                return Err(CryptoError::WrongKey);
            }

            Ok((mode, nenc, remaining - nenc))
        }
    }
}

#[cfg(test)]
mod tpl_tests {
    use super::*;
    use aes::cipher::{block_padding::NoPadding, generic_array::GenericArray, BlockEncryptMut, KeyIvInit};

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    const DLL_ADDRESS: [u8; 8] = [0xEE, 0x4D, 0x78, 0x56, 0x34, 0x12, 0x3C, 0x06];

    fn short_header(cfg: u16, acc: u8) -> Vec<u8> {
        let mut v = vec![0x7A, acc, 0x00];
        v.extend_from_slice(&cfg.to_le_bytes());
        v
    }

    #[test]
    fn short_header_parse() {
        let frame = short_header(0x0550, 0x8F);
        let hdr = parse_tpl(&frame, 0).unwrap();
        assert_eq!(hdr.kind, TplHeaderKind::Short);
        assert_eq!(hdr.acc, 0x8F);
        assert_eq!(hdr.cfg, 0x0550);
        assert_eq!(hdr.security_mode(), TplSecurityMode::Aes5);
        assert_eq!(hdr.length, 5);
    }

    #[test]
    fn long_header_carries_secondary_identity() {
        let mut frame = vec![0x72];
        frame.extend_from_slice(&[0x78, 0x56, 0x34, 0x12]); /* id */
        frame.extend_from_slice(&[0xEE, 0x4D]); /* mfct */
        frame.extend_from_slice(&[0x3C, 0x07]); /* version, type */
        frame.extend_from_slice(&[0x2A, 0x00, 0x00, 0x00]); /* acc sts cfg */
        let hdr = parse_tpl(&frame, 0).unwrap();
        assert_eq!(hdr.kind, TplHeaderKind::Long);
        assert_eq!(hdr.id, Some([0x78, 0x56, 0x34, 0x12]));
        assert_eq!(hdr.mfct, Some(0x4DEE));
        assert_eq!(hdr.length, 13);
        assert_eq!(hdr.security_mode(), TplSecurityMode::None);
    }

    #[test]
    fn no_header_ci() {
        let frame = [0x78, 0x0C, 0x13];
        let hdr = parse_tpl(&frame, 0).unwrap();
        assert_eq!(hdr.kind, TplHeaderKind::NoHeader);
        assert_eq!(hdr.length, 1);
    }

    #[test]
    fn mode5_roundtrip_and_marker() {
        let key = [0x11u8; 16];
        let acc = 0x8F;
        let iv = crypto::build_tpl_iv(&DLL_ADDRESS, acc);

        let mut plain = vec![0x2F, 0x2F, 0x0C, 0x13, 0x48, 0x55, 0x00, 0x00];
        plain.resize(16, 0x2F);
        let k = GenericArray::clone_from_slice(&key);
        let i = GenericArray::clone_from_slice(&iv);
        let cipher = Aes128CbcEnc::new(&k.into(), &i.into())
            .encrypt_padded_vec_mut::<NoPadding>(&plain);

        /* One encrypted block announced in the configuration word. */
        let cfg: u16 = 0x0510;
        let mut frame = short_header(cfg, acc);
        let body = frame.len();
        frame.extend_from_slice(&cipher);

        let hdr = parse_tpl(&frame, 0).unwrap();
        let keys = MeterKeys {
            confidentiality_key: key.to_vec(),
        };
        let (mode, nenc, trailing) =
            decrypt_payload(&mut frame, body, &hdr, &DLL_ADDRESS, &keys).unwrap();
        assert_eq!(mode, TplSecurityMode::Aes5);
        assert_eq!(nenc, 16);
        assert_eq!(trailing, 0);
        assert_eq!(&frame[body..body + 8], &[0x2F, 0x2F, 0x0C, 0x13, 0x48, 0x55, 0x00, 0x00]);
    }

    #[test]
    fn mode5_wrong_key_is_detected() {
        let key = [0x11u8; 16];
        let wrong = [0x22u8; 16];
        let acc = 0x8F;
        let iv = crypto::build_tpl_iv(&DLL_ADDRESS, acc);

        let mut plain = vec![0x2F; 16];
        plain[2] = 0x0C;
        let k = GenericArray::clone_from_slice(&key);
        let i = GenericArray::clone_from_slice(&iv);
        let cipher = Aes128CbcEnc::new(&k.into(), &i.into())
            .encrypt_padded_vec_mut::<NoPadding>(&plain);

        let mut frame = short_header(0x0510, acc);
        let body = frame.len();
        frame.extend_from_slice(&cipher);
        let hdr = parse_tpl(&frame, 0).unwrap();

        let keys = MeterKeys {
            confidentiality_key: wrong.to_vec(),
        };
        let res = decrypt_payload(&mut frame, body, &hdr, &DLL_ADDRESS, &keys);
        assert_eq!(res.unwrap_err(), CryptoError::WrongKey);
    }

    #[test]
    fn mode5_without_key_needs_key() {
        let mut frame = short_header(0x0510, 0x01);
        let body = frame.len();
        frame.extend_from_slice(&[0u8; 16]);
        let hdr = parse_tpl(&frame, 0).unwrap();
        let res = decrypt_payload(&mut frame, body, &hdr, &DLL_ADDRESS, &MeterKeys::none());
        assert_eq!(res.unwrap_err(), CryptoError::NeedsKey);
    }

    #[test]
    fn trailing_plaintext_is_preserved() {
        let key = [0x07u8; 16];
        let acc = 0x01;
        let iv = crypto::build_tpl_iv(&DLL_ADDRESS, acc);
        let plain = vec![0x2F; 16];
        let k = GenericArray::clone_from_slice(&key);
        let i = GenericArray::clone_from_slice(&iv);
        let cipher = Aes128CbcEnc::new(&k.into(), &i.into())
            .encrypt_padded_vec_mut::<NoPadding>(&plain);

        let mut frame = short_header(0x0510, acc);
        let body = frame.len();
        frame.extend_from_slice(&cipher);
        frame.extend_from_slice(&[0x02, 0xFD, 0x17, 0x00, 0x00]); /* plaintext tail */
        let hdr = parse_tpl(&frame, 0).unwrap();
        let keys = MeterKeys {
            confidentiality_key: key.to_vec(),
        };
        let (_, nenc, trailing) =
            decrypt_payload(&mut frame, body, &hdr, &DLL_ADDRESS, &keys).unwrap();
        assert_eq!(nenc, 16);
        assert_eq!(trailing, 5);
        assert_eq!(&frame[body + 16..], &[0x02, 0xFD, 0x17, 0x00, 0x00]);
    }

    #[test]
    fn unsupported_mode_is_rejected() {
        let mut frame = short_header(0x0210, 0x01); /* mode 2 */
        let body = frame.len();
        frame.extend_from_slice(&[0u8; 16]);
        let hdr = parse_tpl(&frame, 0).unwrap();
        let res = decrypt_payload(&mut frame, body, &hdr, &DLL_ADDRESS, &MeterKeys::none());
        assert_eq!(res.unwrap_err(), CryptoError::UnsupportedMode(2));
    }
}
