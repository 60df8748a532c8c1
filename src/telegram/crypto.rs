use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, KeyIvInit, StreamCipher,
};
use log::debug;
use thiserror::Error;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    #[error("telegram is encrypted but no key is configured")]
    NeedsKey,
    #[error("decryption did not produce the 2F2F verification marker, wrong key?")]
    WrongKey,
    #[error("security mode {0} is not supported")]
    UnsupportedMode(u8),
    #[error("encrypted region is malformed: {0}")]
    MalformedCrypto(String),
    #[error("AES key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Confidentiality key of one meter. Empty means the meter must transmit
/// plaintext; 16 bytes enables AES modes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterKeys {
    pub confidentiality_key: Vec<u8>,
}

impl MeterKeys {
    pub fn none() -> Self {
        MeterKeys {
            confidentiality_key: Vec::new(),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let key = hex::decode(s).map_err(|_| CryptoError::InvalidKeyLength(0))?;
        if key.len() != 16 {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        Ok(MeterKeys {
            confidentiality_key: key,
        })
    }

    pub fn has_key(&self) -> bool {
        !self.confidentiality_key.is_empty()
    }
}

fn key_array(key: &[u8]) -> Result<[u8; 16], CryptoError> {
    key.try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

/// IV for TPL security mode 5: the 8 link/transport address bytes
/// (mfct LE, id, version, type) followed by the access counter repeated
/// to fill the block.
pub fn build_tpl_iv(address: &[u8; 8], acc: u8) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(address);
    for b in iv[8..].iter_mut() {
        *b = acc;
    }
    iv
}

/// Initial counter block for TPL security mode 7 (AES-128-CTR): address
/// bytes and access counter up front, low bytes left for the running
/// block counter.
pub fn build_tpl_ctr_nonce(address: &[u8; 8], acc: u8) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(address);
    nonce[8] = acc;
    nonce
}

/// IV for ELL session encryption (CI 0x8D): manufacturer, address,
/// communication control and session number, zero padded.
pub fn build_ell_iv(mfct: u16, address: &[u8; 6], cc: u8, sn: &[u8; 4]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..2].copy_from_slice(&mfct.to_le_bytes());
    iv[2..8].copy_from_slice(address);
    iv[8] = cc;
    iv[9..13].copy_from_slice(sn);
    iv
}

/// Decrypt `nbytes` of `frame` in place starting at `pos` with
/// AES-128-CBC. `nbytes` must be a multiple of the block size.
pub fn decrypt_aes_cbc_iv(
    frame: &mut [u8],
    pos: usize,
    nbytes: usize,
    key: &[u8],
    iv: &[u8; 16],
) -> Result<(), CryptoError> {
    if nbytes % 16 != 0 {
        return Err(CryptoError::MalformedCrypto(format!(
            "{} encrypted bytes is not a multiple of 16",
            nbytes
        )));
    }
    if pos + nbytes > frame.len() {
        return Err(CryptoError::MalformedCrypto(format!(
            "encrypted region {}..{} runs past frame end {}",
            pos,
            pos + nbytes,
            frame.len()
        )));
    }
    let key = key_array(key)?;

    let k = GenericArray::clone_from_slice(&key);
    let i = GenericArray::clone_from_slice(iv);
    let plain = Aes128CbcDec::new(&k.into(), &i.into())
        .decrypt_padded_vec_mut::<NoPadding>(&frame[pos..pos + nbytes])
        .map_err(|_| CryptoError::MalformedCrypto("cbc unpad failed".to_string()))?;

    frame[pos..pos + nbytes].copy_from_slice(&plain);
    debug!("(crypto) decrypted {} bytes aes-cbc at offset {}", nbytes, pos);
    Ok(())
}

/// Decrypt `nbytes` of `frame` in place starting at `pos` with
/// AES-128-CTR and the given initial counter block.
pub fn decrypt_aes_ctr(
    frame: &mut [u8],
    pos: usize,
    nbytes: usize,
    key: &[u8],
    nonce: &[u8; 16],
) -> Result<(), CryptoError> {
    if pos + nbytes > frame.len() {
        return Err(CryptoError::MalformedCrypto(format!(
            "encrypted region {}..{} runs past frame end {}",
            pos,
            pos + nbytes,
            frame.len()
        )));
    }
    let key = key_array(key)?;

    let mut cipher = Aes128Ctr::new(&key.into(), nonce.into());
    cipher.apply_keystream(&mut frame[pos..pos + nbytes]);
    debug!("(crypto) decrypted {} bytes aes-ctr at offset {}", nbytes, pos);
    Ok(())
}

#[cfg(test)]
mod crypto_tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    fn encrypt_cbc(plain: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let k = GenericArray::clone_from_slice(key);
        let i = GenericArray::clone_from_slice(iv);
        Aes128CbcEnc::new(&k.into(), &i.into())
            .encrypt_padded_vec_mut::<NoPadding>(plain)
    }

    #[test]
    fn cbc_roundtrip_in_place() {
        let key = [0x11u8; 16];
        let addr = [0xEE, 0x4D, 0x78, 0x56, 0x34, 0x12, 0x3C, 0x06];
        let iv = build_tpl_iv(&addr, 0x8F);

        let mut plain = vec![0x2F, 0x2F, 0x0C, 0x13, 0x48, 0x55, 0x00, 0x00];
        plain.resize(16, 0x2F);
        let cipher = encrypt_cbc(&plain, &key, &iv);

        let mut frame = vec![0xAAu8; 4];
        frame.extend_from_slice(&cipher);
        decrypt_aes_cbc_iv(&mut frame, 4, 16, &key, &iv).unwrap();
        assert_eq!(&frame[4..], plain.as_slice());
        assert_eq!(&frame[..4], &[0xAA; 4]);
    }

    #[test]
    fn cbc_rejects_partial_blocks() {
        let key = [0u8; 16];
        let iv = [0u8; 16];
        let mut frame = vec![0u8; 20];
        assert!(matches!(
            decrypt_aes_cbc_iv(&mut frame, 0, 15, &key, &iv),
            Err(CryptoError::MalformedCrypto(_))
        ));
    }

    #[test]
    fn ctr_roundtrip() {
        let key = [0x42u8; 16];
        let nonce = build_tpl_ctr_nonce(&[1, 2, 3, 4, 5, 6, 7, 8], 0x2A);

        let plain = b"hello wmbus meter".to_vec();
        let mut buf = plain.clone();
        /* CTR is its own inverse. */
        decrypt_aes_ctr(&mut buf, 0, plain.len(), &key, &nonce).unwrap();
        assert_ne!(buf, plain);
        decrypt_aes_ctr(&mut buf, 0, plain.len(), &key, &nonce).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn key_length_is_validated() {
        assert!(matches!(
            MeterKeys::from_hex("0102"),
            Err(CryptoError::InvalidKeyLength(2))
        ));
        let keys = MeterKeys::from_hex("000102030405060708090A0B0C0D0E0F").unwrap();
        assert!(keys.has_key());
        assert!(!MeterKeys::none().has_key());
    }
}
