//! Wireless M-Bus receiver core: the telegram-to-measurement pipeline.
//!
//! Raw frames from a sub-GHz radio pass through framing (3-of-6, CRC),
//! the link/extended/transport layers (including AES decryption), the
//! DIF/VIF record parser and the per-driver field engine, ending up as
//! structured measurement records ready for downstream consumers.

pub mod config;
pub mod drivers;
pub mod frames;
pub mod meters;
pub mod output;
pub mod radio;
pub mod records;
pub mod telegram;
pub mod units;

// Re-export common types for easier access
pub use config::Config;
pub use frames::LinkMode;
pub use meters::{Meter, MeterInfo, Registry};
pub use radio::{RadioDriver, Receiver};
pub use telegram::Telegram;

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
}
