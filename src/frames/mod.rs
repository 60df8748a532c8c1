use crc16::{State, EN_13757};
use log::debug;
use thiserror::Error;

/// Radio framing profile the frame was captured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LinkMode {
    T1,
    C1,
    S1,
    T2,
    C2,
    S2,
    MBus,
}

impl LinkMode {
    pub fn to_str(&self) -> &'static str {
        match self {
            LinkMode::T1 => "T1",
            LinkMode::C1 => "C1",
            LinkMode::S1 => "S1",
            LinkMode::T2 => "T2",
            LinkMode::C2 => "C2",
            LinkMode::S2 => "S2",
            LinkMode::MBus => "MBUS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "T1" | "t1" => Some(LinkMode::T1),
            "C1" | "c1" => Some(LinkMode::C1),
            "S1" | "s1" => Some(LinkMode::S1),
            "T2" | "t2" => Some(LinkMode::T2),
            "C2" | "c2" => Some(LinkMode::C2),
            "S2" | "s2" => Some(LinkMode::S2),
            "MBUS" | "mbus" => Some(LinkMode::MBus),
            _ => None,
        }
    }
}

/// EN 13757-4 knows two over-the-air layouts. Format A interleaves a CRC
/// per block, format B covers larger spans with fewer CRCs and counts them
/// in the L-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WmBusFrameType {
    FormatA,
    FormatB,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("3-of-6 symbol error at wire offset {0}")]
    SymbolError(usize),
    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("CRC mismatch in block {0}")]
    CrcMismatch(usize),
    #[error("L-field {0} is too small for a wM-Bus frame")]
    BadLength(u8),
}

/* The 16 valid 6-bit codewords of the T-mode "3 out of 6" encoding,
   indexed by data nibble. Every codeword has exactly three bits set. */
const ENCODE_3OF6: [u8; 16] = [
    0x16, 0x0D, 0x0E, 0x0B, 0x1C, 0x19, 0x1A, 0x13, 0x2C, 0x29, 0x2A, 0x23, 0x34, 0x31, 0x32, 0x25,
];

lazy_static::lazy_static! {
    /// Inverse of ENCODE_3OF6 with 0xFF marking invalid codewords.
    /// A single invalid codeword drops the whole frame.
    static ref DECODE_3OF6: [u8; 64] = {
        let mut t = [0xFFu8; 64];
        let mut nibble = 0u8;
        while (nibble as usize) < ENCODE_3OF6.len() {
            t[ENCODE_3OF6[nibble as usize] as usize] = nibble;
            nibble += 1;
        }
        t
    };
}

/// Number of bytes in a complete format A frame (including CRC fields) for
/// a given L-field.
///
/// The first block carries 10 bytes (L..device-type), the second 15 data
/// bytes, every further block 16, each followed by 2 CRC bytes.
pub fn packet_size(l: u8) -> usize {
    let nr_blocks = if l < 26 {
        2
    } else {
        ((l as usize - 26) / 16) + 3
    };

    /* All data bytes plus the L-field itself, plus 2 CRC bytes per block. */
    l as usize + 1 + 2 * nr_blocks
}

/// Number of wire bytes needed to carry `packet_bytes` of 3-of-6 encoded
/// frame data.
pub fn byte_size(packet_bytes: usize) -> usize {
    let size = (3 * packet_bytes) / 2;

    /* An odd packet size leaves a half-filled wire byte carrying the
    postamble bits. */
    if packet_bytes % 2 != 0 {
        size + 1
    } else {
        size
    }
}

/// Decode a 3-of-6 encoded wire buffer into at most `max_bytes` frame bytes.
pub fn decode_3of6(wire: &[u8], max_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut out: Vec<u8> = Vec::with_capacity(max_bytes);
    let mut acc: u32 = 0;
    let mut nbits: u32 = 0;
    let mut high: Option<u8> = None;

    for (pos, b) in wire.iter().enumerate() {
        acc = (acc << 8) | (*b as u32);
        nbits += 8;

        while nbits >= 6 && out.len() < max_bytes {
            let code = ((acc >> (nbits - 6)) & 0x3F) as usize;
            nbits -= 6;

            let nibble = DECODE_3OF6[code];
            if nibble == 0xFF {
                return Err(FrameError::SymbolError(pos));
            }
            match high.take() {
                None => high = Some(nibble),
                Some(h) => out.push((h << 4) | nibble),
            }
        }
        if out.len() >= max_bytes {
            break;
        }
    }

    if out.len() < max_bytes {
        return Err(FrameError::Truncated {
            expected: byte_size(max_bytes),
            got: wire.len(),
        });
    }
    Ok(out)
}

fn check_block_crc(data: &[u8], crc_hi: u8, crc_lo: u8) -> bool {
    let mut state = State::<EN_13757>::new();
    state.update(data);
    let s = state.get().to_be_bytes();
    s[0] == crc_hi && s[1] == crc_lo
}

/// Verify and strip the per-block CRCs of a format A frame. The returned
/// buffer holds L-field through last data byte, L+1 bytes in total.
pub fn strip_format_a(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Truncated { expected: 12, got: 0 });
    }
    let l = frame[0];
    if l < 10 {
        return Err(FrameError::BadLength(l));
    }
    let total = packet_size(l);
    if frame.len() < total {
        return Err(FrameError::Truncated {
            expected: total,
            got: frame.len(),
        });
    }

    let mut result: Vec<u8> = Vec::with_capacity(l as usize + 1);
    let mut start = 0usize;
    let mut block = 0usize;
    loop {
        let mut len = if block == 0 { 10 } else { 16 };

        /* The final block may be short. */
        if total < start + len + 2 {
            len = total - start - 2;
        }

        if !check_block_crc(&frame[start..start + len], frame[start + len], frame[start + len + 1]) {
            return Err(FrameError::CrcMismatch(block));
        }
        result.extend_from_slice(&frame[start..start + len]);

        start += len + 2;
        block += 1;
        if start >= total {
            break;
        }
    }

    Ok(result)
}

/// Verify and strip the CRCs of a format B frame. In format B the L-field
/// counts the CRC bytes, so the stripped buffer gets its L-field rewritten
/// to format A semantics before it is handed downstream.
pub fn strip_format_b(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Truncated { expected: 12, got: 0 });
    }
    let l = frame[0];
    if l < 12 {
        return Err(FrameError::BadLength(l));
    }
    let total = l as usize + 1;
    if frame.len() < total {
        return Err(FrameError::Truncated {
            expected: total,
            got: frame.len(),
        });
    }

    let mut result: Vec<u8> = Vec::with_capacity(total);
    if total <= 128 {
        /* Blocks 1+2 share a single trailing CRC. */
        if !check_block_crc(&frame[0..total - 2], frame[total - 2], frame[total - 1]) {
            return Err(FrameError::CrcMismatch(0));
        }
        result.extend_from_slice(&frame[0..total - 2]);
    } else {
        if !check_block_crc(&frame[0..126], frame[126], frame[127]) {
            return Err(FrameError::CrcMismatch(0));
        }
        if !check_block_crc(&frame[128..total - 2], frame[total - 2], frame[total - 1]) {
            return Err(FrameError::CrcMismatch(1));
        }
        result.extend_from_slice(&frame[0..126]);
        result.extend_from_slice(&frame[128..total - 2]);
    }

    /* Rewrite L to count only the remaining content. */
    result[0] = (result.len() - 1) as u8;
    Ok(result)
}

/// One frame as captured by the radio driver, before CRC verification.
#[derive(Debug, Clone)]
pub struct RawRadioFrame {
    pub bytes: Vec<u8>,
    pub link_mode: LinkMode,
    pub frame_type: WmBusFrameType,
    pub rssi_dbm: i32,
    pub lqi: u8,
    /// Radio did not decode the 3-of-6 coding in hardware.
    pub needs_3of6: bool,
    /// Frame already had its CRCs verified and stripped upstream
    /// (simulation input or radios that check CRCs in hardware).
    pub crc_stripped: bool,
}

/// A complete, CRC-verified frame ready for link-layer parsing.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub data: Vec<u8>,
    pub link_mode: LinkMode,
    pub frame_type: WmBusFrameType,
    pub rssi_dbm: i32,
    pub lqi: u8,
}

/// Run 3-of-6 decoding (when needed) and CRC verification, producing the
/// CRC-free frame the telegram decoder operates on.
pub fn assemble(raw: &RawRadioFrame) -> Result<ReceivedFrame, FrameError> {
    let mut bytes = raw.bytes.clone();

    if raw.needs_3of6 {
        if bytes.is_empty() {
            return Err(FrameError::Truncated { expected: 2, got: 0 });
        }
        /* Decode just enough for the L-field, then the full frame. */
        let head = decode_3of6(&bytes, 1)?;
        let total = packet_size(head[0]);
        bytes = decode_3of6(&bytes, total)?;
    }

    let data = if raw.crc_stripped {
        bytes
    } else {
        match raw.frame_type {
            WmBusFrameType::FormatA => strip_format_a(&bytes)?,
            WmBusFrameType::FormatB => strip_format_b(&bytes)?,
        }
    };

    debug!(
        "(frames) assembled {} byte frame, link mode {}, rssi {} dBm",
        data.len(),
        raw.link_mode.to_str(),
        raw.rssi_dbm
    );

    Ok(ReceivedFrame {
        data,
        link_mode: raw.link_mode,
        frame_type: raw.frame_type,
        rssi_dbm: raw.rssi_dbm,
        lqi: raw.lqi,
    })
}
