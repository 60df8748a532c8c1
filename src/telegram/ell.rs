use crate::telegram::crypto::{self, CryptoError, MeterKeys};
use crc16::{State, EN_13757};
use log::{debug, warn};
use std::collections::VecDeque;

/// Extended Link Layer header, CI 0x8C (short) or 0x8D (with session
/// number and encrypted payload).
#[derive(Debug, Clone, PartialEq)]
pub struct EllHeader {
    pub ci: u8,
    pub cc: u8,
    pub acc: u8,
    pub session_number: Option<[u8; 4]>,
    /// CRC over the decrypted ELL payload, present with CI 0x8D.
    pub payload_crc: Option<u16>,
}

impl EllHeader {
    /// Header length in bytes including the CI field.
    pub fn length(&self) -> usize {
        match self.session_number {
            Some(_) => 7,
            None => 3,
        }
    }
}

/// Parse the ELL header at `pos` and, for CI 0x8D, decrypt the session
/// payload in place and verify its CRC. Returns the header and the offset
/// where the next layer starts.
pub fn strip_ell(
    frame: &mut [u8],
    pos: usize,
    dll_mfct: u16,
    keys: &MeterKeys,
) -> Result<(EllHeader, usize), CryptoError> {
    let ci = frame[pos];
    match ci {
        0x8C => {
            if pos + 3 > frame.len() {
                return Err(CryptoError::MalformedCrypto("short ELL truncated".to_string()));
            }
            let hdr = EllHeader {
                ci,
                cc: frame[pos + 1],
                acc: frame[pos + 2],
                session_number: None,
                payload_crc: None,
            };
            Ok((hdr, pos + 3))
        }
        0x8D => {
            if pos + 7 + 2 > frame.len() {
                return Err(CryptoError::MalformedCrypto("session ELL truncated".to_string()));
            }
            let cc = frame[pos + 1];
            let acc = frame[pos + 2];
            let sn = [frame[pos + 3], frame[pos + 4], frame[pos + 5], frame[pos + 6]];

            /* The ELL session number carries the encryption bits in its
            top three bits. Zero means the payload is plaintext. */
            let enc = (sn[3] >> 5) & 0x7;
            let body = pos + 7;
            if enc != 0 {
                if !keys.has_key() {
                    return Err(CryptoError::NeedsKey);
                }
                /* Address part of the IV: id, version, type as transmitted. */
                let addr: [u8; 6] = frame[4..10]
                    .try_into()
                    .map_err(|_| CryptoError::MalformedCrypto("frame too short for ELL IV".to_string()))?;
                let iv = crypto::build_ell_iv(dll_mfct, &addr, cc, &sn);
                let nbytes = frame.len() - body;
                crypto::decrypt_aes_ctr(frame, body, nbytes, &keys.confidentiality_key, &iv)?;
            }

            /* First two plaintext bytes are a CRC over the rest. */
            let crc = u16::from_le_bytes([frame[body], frame[body + 1]]);
            let mut state = State::<EN_13757>::new();
            state.update(&frame[body + 2..]);
            if state.get() != crc {
                return Err(CryptoError::WrongKey);
            }

            let hdr = EllHeader {
                ci,
                cc,
                acc,
                session_number: Some(sn),
                payload_crc: Some(crc),
            };
            Ok((hdr, body + 2))
        }
        other => Err(CryptoError::MalformedCrypto(format!(
            "not an ELL CI: {:02x}",
            other
        ))),
    }
}

/// Authentication and Fragmentation Layer header, CI 0x90.
#[derive(Debug, Clone, PartialEq)]
pub struct AflHeader {
    pub afll: u8,
    pub fcl: u16,
    /// More fragments follow this one.
    pub more_fragments: bool,
    /// Fragment session id, shared by all fragments of one telegram.
    pub fid: u8,
    pub message_counter: Option<u32>,
    pub mac: Option<Vec<u8>>,
    pub message_length: Option<u16>,
    /// Bytes consumed including the CI field.
    pub length: usize,
}

/* FCL presence bits, OMS vol. 2 table. */
const FCL_MF: u16 = 1 << 14;
const FCL_MCLP: u16 = 1 << 13;
const FCL_MLP: u16 = 1 << 12;
const FCL_MCRP: u16 = 1 << 11;
const FCL_MACP: u16 = 1 << 10;
const FCL_KIP: u16 = 1 << 9;

pub fn parse_afl(frame: &[u8], pos: usize) -> Result<AflHeader, CryptoError> {
    let err = |m: &str| CryptoError::MalformedCrypto(m.to_string());

    let afll = *frame.get(pos + 1).ok_or_else(|| err("AFL truncated"))? as usize;
    let end = pos + 2 + afll;
    if afll < 2 || end > frame.len() {
        return Err(err("AFL length field out of range"));
    }

    let fcl = u16::from_le_bytes([frame[pos + 2], frame[pos + 3]]);
    let mut at = pos + 4;

    fn take<'a>(
        frame: &'a [u8],
        at: &mut usize,
        end: usize,
        n: usize,
    ) -> Result<&'a [u8], CryptoError> {
        if *at + n > end {
            return Err(CryptoError::MalformedCrypto(
                "AFL field past header end".to_string(),
            ));
        }
        let s = &frame[*at..*at + n];
        *at += n;
        Ok(s)
    }

    if fcl & FCL_MCLP != 0 {
        take(frame, &mut at, end, 1)?;
    }
    if fcl & FCL_KIP != 0 {
        take(frame, &mut at, end, 2)?;
    }
    let message_counter = if fcl & FCL_MCRP != 0 {
        let b = take(frame, &mut at, end, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    } else {
        None
    };
    let mac = if fcl & FCL_MACP != 0 {
        Some(take(frame, &mut at, end, 8)?.to_vec())
    } else {
        None
    };
    let message_length = if fcl & FCL_MLP != 0 {
        let b = take(frame, &mut at, end, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    } else {
        None
    };

    Ok(AflHeader {
        afll: afll as u8,
        fcl,
        more_fragments: fcl & FCL_MF != 0,
        fid: (fcl & 0xFF) as u8,
        message_counter,
        mac,
        message_length,
        length: 2 + afll,
    })
}

#[derive(Debug)]
struct FragmentSession {
    key: (String, u8),
    payload: Vec<u8>,
    last_seen: u64,
}

/// Reassembles AFL-fragmented telegrams. Sessions are keyed by
/// (address, fragment id) and evicted LRU-style so a chatty or broken
/// sender cannot grow memory without bound.
#[derive(Debug)]
pub struct AflReassembler {
    sessions: VecDeque<FragmentSession>,
    max_sessions: usize,
    timeout_secs: u64,
    pub timed_out: u64,
}

impl AflReassembler {
    pub fn new(max_sessions: usize, timeout_secs: u64) -> Self {
        AflReassembler {
            sessions: VecDeque::new(),
            max_sessions,
            timeout_secs,
            timed_out: 0,
        }
    }

    /// Offer one fragment. Returns the complete spliced payload once the
    /// final fragment arrives, None while the telegram is still partial.
    pub fn offer(
        &mut self,
        address_id: &str,
        afl: &AflHeader,
        fragment: &[u8],
        now: u64,
    ) -> Option<Vec<u8>> {
        self.expire(now);

        let key = (address_id.to_string(), afl.fid);
        let idx = self.sessions.iter().position(|s| s.key == key);

        if afl.more_fragments {
            match idx {
                Some(i) => {
                    let mut s = self.sessions.remove(i).unwrap();
                    s.payload.extend_from_slice(fragment);
                    s.last_seen = now;
                    self.sessions.push_back(s);
                }
                None => {
                    if self.sessions.len() >= self.max_sessions {
                        let dropped = self.sessions.pop_front();
                        if let Some(d) = dropped {
                            warn!("(afl) evicting fragment session {:?}", d.key);
                        }
                    }
                    self.sessions.push_back(FragmentSession {
                        key,
                        payload: fragment.to_vec(),
                        last_seen: now,
                    });
                }
            }
            return None;
        }

        /* Final fragment: splice in arrival order. */
        let mut payload = match idx {
            Some(i) => self.sessions.remove(i).unwrap().payload,
            None => Vec::new(),
        };
        payload.extend_from_slice(fragment);
        debug!(
            "(afl) assembled {} byte payload for session {} fid {}",
            payload.len(),
            address_id,
            afl.fid
        );
        Some(payload)
    }

    /// Drop sessions that have been silent longer than the timeout.
    pub fn expire(&mut self, now: u64) {
        let timeout = self.timeout_secs;
        let before = self.sessions.len();
        self.sessions
            .retain(|s| now.saturating_sub(s.last_seen) <= timeout);
        let dropped = before - self.sessions.len();
        if dropped > 0 {
            self.timed_out += dropped as u64;
            warn!("(afl) discarded {} timed out fragment session(s)", dropped);
        }
    }

    pub fn pending(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod ell_tests {
    use super::*;

    #[test]
    fn short_ell_is_stripped() {
        let mut frame = vec![0u8; 10];
        frame.extend_from_slice(&[0x8C, 0x20, 0x07, 0x7A]);
        let (hdr, next) = strip_ell(&mut frame, 10, 0x4DEE, &MeterKeys::none()).unwrap();
        assert_eq!(hdr.cc, 0x20);
        assert_eq!(hdr.acc, 0x07);
        assert_eq!(next, 13);
        assert_eq!(frame[next], 0x7A);
    }

    #[test]
    fn session_ell_without_key_needs_key() {
        let mut frame = vec![0u8; 10];
        /* enc bits set in the top of the session number. */
        frame.extend_from_slice(&[0x8D, 0x20, 0x07, 0x01, 0x00, 0x00, 0x20, 0xAA, 0xBB, 0xCC]);
        let res = strip_ell(&mut frame, 10, 0x4DEE, &MeterKeys::none());
        assert_eq!(res.unwrap_err(), CryptoError::NeedsKey);
    }

    #[test]
    fn afl_header_fields() {
        let mut frame = vec![0u8; 10];
        let fcl: u16 = FCL_MF | FCL_MCRP | 0x42;
        frame.extend_from_slice(&[0x90, 7]);
        frame.extend_from_slice(&fcl.to_le_bytes());
        frame.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0xFF]);

        let afl = parse_afl(&frame, 10).unwrap();
        assert!(afl.more_fragments);
        assert_eq!(afl.fid, 0x42);
        assert_eq!(afl.message_counter, Some(0x04030201));
        assert_eq!(afl.length, 9);
    }

    #[test]
    fn reassembly_in_order() {
        let mut r = AflReassembler::new(4, 60);
        let more = AflHeader {
            afll: 3,
            fcl: FCL_MF | 1,
            more_fragments: true,
            fid: 1,
            message_counter: None,
            mac: None,
            message_length: None,
            length: 5,
        };
        let last = AflHeader {
            more_fragments: false,
            fcl: 1,
            ..more.clone()
        };

        assert_eq!(r.offer("12345678", &more, &[1, 2], 100), None);
        assert_eq!(r.offer("12345678", &more, &[3, 4], 101), None);
        let full = r.offer("12345678", &last, &[5, 6], 102).unwrap();
        assert_eq!(full, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn missing_fragment_times_out() {
        let mut r = AflReassembler::new(4, 60);
        let more = AflHeader {
            afll: 3,
            fcl: FCL_MF | 7,
            more_fragments: true,
            fid: 7,
            message_counter: None,
            mac: None,
            message_length: None,
            length: 5,
        };
        assert_eq!(r.offer("11111111", &more, &[1], 100), None);
        assert_eq!(r.pending(), 1);
        r.expire(200);
        assert_eq!(r.pending(), 0);
        assert_eq!(r.timed_out, 1);
    }

    #[test]
    fn lru_eviction_is_bounded() {
        let mut r = AflReassembler::new(2, 600);
        let mk = |fid: u8| AflHeader {
            afll: 3,
            fcl: FCL_MF | fid as u16,
            more_fragments: true,
            fid,
            message_counter: None,
            mac: None,
            message_length: None,
            length: 5,
        };
        r.offer("1", &mk(1), &[1], 1);
        r.offer("2", &mk(2), &[2], 2);
        r.offer("3", &mk(3), &[3], 3);
        assert_eq!(r.pending(), 2);
    }
}
