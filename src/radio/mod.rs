use crate::frames::{self, FrameError, LinkMode, RawRadioFrame, WmBusFrameType};
use crate::meters::{Meter, MeterError, MeterInfo, Registry};
use crate::output;
use crate::telegram::crypto::CryptoError;
use crate::telegram::ell::AflReassembler;
use crate::telegram::{AboutTelegram, AddressExpression, Telegram, TelegramError};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::BufRead;

/// Interface the radio transceiver driver exposes to the core. Register
/// programming, SPI and IRQ handling live outside this crate; the core
/// only polls for complete captures.
pub trait RadioDriver {
    /// The next captured frame, or None when the receiver is idle (or,
    /// for replay sources, drained).
    fn poll_frame(&mut self) -> Option<RawRadioFrame>;
    /// Re-arm reception after a capture or an idle period.
    fn restart_rx(&mut self);
    fn get_rssi(&self) -> i8;
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveCounters {
    pub frames_ok: u64,
    pub crc_errors: u64,
    pub decode_errors: u64,
    pub truncated: u64,
    pub telegrams_decoded: u64,
    pub telegrams_dropped: u64,
    pub needs_key: u64,
    pub fragments_pending: u64,
    pub compact_skipped: u64,
}

struct AutoSlot {
    mi: MeterInfo,
    expressions: Vec<AddressExpression>,
}

/// The receive pipeline: one cooperative loop pulling frames from the
/// radio and pushing decoded records to the emit callback. All decoding
/// runs to completion per frame; the only suspension point is inside the
/// radio driver's poll.
pub struct Receiver {
    registry: Registry,
    meters: Vec<Meter>,
    auto_slots: Vec<AutoSlot>,
    /// Meters created on the fly for `auto` slots, keyed by
    /// (slot name, meter id).
    auto_meters: HashMap<(String, String), Meter>,
    pub reassembler: AflReassembler,
    pub counters: ReceiveCounters,
    /// Fed at radio wait boundaries.
    pub watchdog: Option<fn()>,
}

impl Receiver {
    pub fn new(registry: Registry, afl_max_sessions: usize, afl_timeout_secs: u64) -> Self {
        Receiver {
            registry,
            meters: Vec::new(),
            auto_slots: Vec::new(),
            auto_meters: HashMap::new(),
            reassembler: AflReassembler::new(afl_max_sessions, afl_timeout_secs),
            counters: ReceiveCounters::default(),
            watchdog: None,
        }
    }

    /// Install one configured meter. `auto` driver slots resolve their
    /// driver per telegram through the registry's detection table.
    pub fn add_meter(&mut self, mi: MeterInfo) -> Result<(), MeterError> {
        if mi.driver == "auto" {
            let mut expressions = Vec::new();
            for s in &mi.address_expressions {
                let ae = AddressExpression::parse(s)
                    .ok_or_else(|| MeterError::BadAddressExpression(s.clone()))?;
                expressions.push(ae);
            }
            self.auto_slots.push(AutoSlot { mi, expressions });
            return Ok(());
        }

        let di = self
            .registry
            .lookup(&mi.driver)
            .ok_or_else(|| MeterError::UnknownDriver(mi.driver.clone()))?;
        let meter = Meter::create(&mi, di)?;
        info!(
            "(receiver) meter {} using driver {}",
            meter.name, meter.driver_name
        );
        self.meters.push(meter);
        Ok(())
    }

    pub fn num_meters(&self) -> usize {
        self.meters.len() + self.auto_meters.len()
    }

    /// Decode one raw capture into zero or more output records.
    pub fn process_raw(&mut self, raw: &RawRadioFrame, timestamp: u64, device: &str) -> Vec<Map<String, Value>> {
        let frame = match frames::assemble(raw) {
            Ok(f) => f,
            Err(e) => {
                match e {
                    FrameError::CrcMismatch(_) => self.counters.crc_errors += 1,
                    FrameError::SymbolError(_) => self.counters.decode_errors += 1,
                    FrameError::Truncated { .. } => self.counters.truncated += 1,
                    FrameError::BadLength(_) => self.counters.truncated += 1,
                }
                debug!("(receiver) dropping frame: {}", e);
                return Vec::new();
            }
        };
        self.counters.frames_ok += 1;

        let about = AboutTelegram {
            device: device.to_string(),
            rssi_dbm: frame.rssi_dbm,
            timestamp,
            link_mode: Some(frame.link_mode),
        };

        self.reassembler.expire(timestamp);
        self.resolve_auto_meters(&about, &frame.data);

        let mut records = Vec::new();
        for meter in self.meters.iter_mut().chain(self.auto_meters.values_mut()) {
            match meter.handle_telegram(&about, &frame.data, &mut self.reassembler) {
                Ok(Some(t)) => {
                    self.counters.telegrams_decoded += 1;
                    records.push(output::render_json(meter, &t));
                }
                Ok(None) => {}
                Err(TelegramError::FragmentPending) => {
                    self.counters.fragments_pending += 1;
                }
                Err(TelegramError::CompactFrame) => {
                    self.counters.compact_skipped += 1;
                }
                Err(TelegramError::Crypto(CryptoError::NeedsKey)) => {
                    self.counters.needs_key += 1;
                    warn!("(receiver) meter {} needs a key", meter.name);
                }
                Err(e) => {
                    self.counters.telegrams_dropped += 1;
                    debug!("(receiver) meter {} dropped telegram: {}", meter.name, e);
                }
            }
        }
        records
    }

    /// Give every `auto` slot whose expressions match this telegram a
    /// concrete meter, picking the driver by detection triple with the
    /// generic driver as fallback.
    fn resolve_auto_meters(&mut self, _about: &AboutTelegram, frame: &[u8]) {
        if self.auto_slots.is_empty() {
            return;
        }
        let mut t = Telegram::new(AboutTelegram::default());
        if t.parse_header(frame).is_err() {
            return;
        }
        let address = match t.address() {
            Some(a) => a.clone(),
            None => return,
        };

        for slot in &self.auto_slots {
            if !slot.expressions.iter().any(|ae| ae.matches(&address)) {
                continue;
            }
            let key = (slot.mi.name.clone(), address.id.clone());
            if self.auto_meters.contains_key(&key) {
                continue;
            }

            let di = self
                .registry
                .detect_driver(address.mfct, address.device_type, address.version)
                .or_else(|| self.registry.lookup("unknown"));
            let Some(di) = di else { continue };

            let mut mi = slot.mi.clone();
            mi.driver = di.name.clone();
            /* Pin the resolved meter to the concrete id so a wildcard
            slot can spawn one meter per transmitting device. */
            mi.address_expressions = vec![address.id.clone()];
            match Meter::create(&mi, di) {
                Ok(m) => {
                    info!(
                        "(receiver) auto slot {} bound id {} to driver {}",
                        slot.mi.name, address.id, di.name
                    );
                    self.auto_meters.insert(key, m);
                }
                Err(e) => warn!("(receiver) auto slot {}: {}", slot.mi.name, e),
            }
        }
    }

    /// Drain the radio until it reports no more frames. An embedded
    /// radio driver blocks inside poll_frame waiting for its IRQ and
    /// returns None only on shutdown; replay sources return None at end
    /// of input.
    pub fn run(&mut self, radio: &mut dyn RadioDriver, emit: &mut dyn FnMut(String)) {
        loop {
            if let Some(f) = self.watchdog {
                f();
            }
            let Some(raw) = radio.poll_frame() else {
                break;
            };
            let ts = crate::get_unix_ts();
            for record in self.process_raw(&raw, ts, "radio") {
                emit(Value::Object(record).to_string());
            }
            radio.restart_rx();
        }
    }
}

/// Replay radio: reads one hex frame per line (CRCs already stripped,
/// `_` separators and comments tolerated). Used by the binary's stdin
/// mode and by tests.
pub struct HexStreamRadio<R: BufRead> {
    reader: R,
    link_mode: LinkMode,
}

impl<R: BufRead> HexStreamRadio<R> {
    pub fn new(reader: R, link_mode: LinkMode) -> Self {
        HexStreamRadio { reader, link_mode }
    }
}

impl<R: BufRead> RadioDriver for HexStreamRadio<R> {
    fn poll_frame(&mut self) -> Option<RawRadioFrame> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).ok()? == 0 {
                return None;
            }
            let cleaned: String = line
                .trim()
                .trim_start_matches("telegram=")
                .chars()
                .filter(|c| c.is_ascii_hexdigit())
                .collect();
            if cleaned.is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            match hex::decode(&cleaned) {
                Ok(bytes) => {
                    return Some(RawRadioFrame {
                        bytes,
                        link_mode: self.link_mode,
                        frame_type: WmBusFrameType::FormatA,
                        rssi_dbm: 0,
                        lqi: 0,
                        needs_3of6: false,
                        crc_stripped: true,
                    });
                }
                Err(_) => {
                    warn!("(radio) skipping non-hex input line");
                    continue;
                }
            }
        }
    }

    fn restart_rx(&mut self) {}

    fn get_rssi(&self) -> i8 {
        0
    }
}
