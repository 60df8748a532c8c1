use crate::frames::LinkMode;
use crate::meters::fields::DEFAULT_PRINT_PROPERTIES;
use crate::meters::{DriverError, DriverInfo, Meter, MeterType, Registry};
use crate::telegram::{Telegram, MANUFACTURER_APA};
use crate::units::{Quantity, Unit};
use log::debug;

pub fn register(registry: &mut Registry) -> Result<(), DriverError> {
    registry.register(
        DriverInfo::new("apator162", MeterType::WaterMeter, setup)
            .set_default_fields("name,id,total_water_m3,timestamp")
            .add_link_mode(LinkMode::T1)
            .add_link_mode(LinkMode::C1)
            .add_detection(MANUFACTURER_APA, 0x06, 0x05)
            .add_detection(MANUFACTURER_APA, 0x07, 0x05)
            .uses_process_content(process_content),
    )
}

fn setup(m: &mut Meter) {
    m.add_numeric_field(
        "total_water",
        Quantity::Volume,
        DEFAULT_PRINT_PROPERTIES,
        "The total water consumption recorded by this meter.",
    );
}

/// Size in bytes of the data following a register tag. Unlisted tags end
/// the walk since the stream cannot be resynchronized past them.
fn register_size(c: u8) -> Option<usize> {
    match c {
        0x10 => Some(4), /* Total volume */

        0x40 | 0x41 | 0x43 => Some(2),
        0x42 => Some(4),

        0x71 => Some(9),
        0x73 => Some(1 + 4 * 4),  /* Historical data */
        0x75 => Some(1 + 6 * 4),  /* Historical data */
        0x7B => Some(1 + 12 * 4), /* Historical data */

        0x80..=0x84 | 0x86 | 0x87 => Some(10),

        0xA0 => Some(4),

        0xB0..=0xBF => Some(3),
        0xC0..=0xC7 => Some(3),
        0xD0 | 0xD3 => Some(3),

        0xF0 => Some(4),
        _ => None,
    }
}

/// The payload is a manufacturer specific register stream: after the
/// decrypted 2F2F marker, registers start at frame offset 25. Tag 0x10
/// carries the running total as a 32 bit liter count. An FF tag marks the
/// end, the remainder is padding up to the encryption boundary.
fn process_content(m: &mut Meter, t: &Telegram) {
    let frame = &t.frame;
    let mut i = 25usize;
    while i < frame.len() {
        let c = frame[i];
        if c == 0xFF {
            break;
        }
        i += 1;
        let size = match register_size(c) {
            Some(s) => s,
            None => {
                debug!("(apator162) unknown register {:02x} at offset {}", c, i - 1);
                break;
            }
        };
        if i + size >= frame.len() {
            break;
        }
        if c == 0x10 && size == 4 {
            let usage = u32::from_le_bytes([frame[i], frame[i + 1], frame[i + 2], frame[i + 3]]);
            m.set_numeric_value("total_water", Unit::M3, usage as f64 / 1000.0);
        }
        i += size;
    }
}

#[cfg(test)]
mod apator162_tests {
    use super::*;
    use crate::meters::MeterInfo;
    use crate::telegram::crypto;
    use crate::telegram::ell::AflReassembler;
    use crate::telegram::AboutTelegram;
    use aes::cipher::{block_padding::NoPadding, generic_array::GenericArray, BlockEncryptMut, KeyIvInit};

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    /// Build an apator162 style telegram: mode 5 encryption with the all
    /// zero key, register stream with tag 0x10 holding liters.
    fn synthesize(liters: u32) -> Vec<u8> {
        let acc = 0x2E;
        let mut frame = hex::decode("2E44010678563412050670").unwrap();
        frame[10] = 0x7A; /* CI short TPL header */
        frame.push(acc);
        frame.push(0x00); /* sts */
        /* mode 5, two encrypted blocks */
        frame.extend_from_slice(&0x0520u16.to_le_bytes());

        let mut plain = vec![0x2F; 10]; /* marker + filler up to offset 25 */
        plain.push(0x10);
        plain.extend_from_slice(&liters.to_le_bytes());
        plain.push(0xFF);
        plain.resize(32, 0x2F);

        let dll_address: [u8; 8] = frame[2..10].try_into().unwrap();
        let iv = crypto::build_tpl_iv(&dll_address, acc);
        let key = [0u8; 16];
        let k = GenericArray::clone_from_slice(&key);
        let i = GenericArray::clone_from_slice(&iv);
        let cipher = Aes128CbcEnc::new(&k.into(), &i.into())
            .encrypt_padded_vec_mut::<NoPadding>(&plain);
        frame.extend_from_slice(&cipher);
        frame
    }

    #[test]
    fn zero_key_register_walk_extracts_total() {
        let mut reg = Registry::new();
        register(&mut reg).unwrap();
        let di = reg.lookup("apator162").unwrap();

        let mi = MeterInfo {
            name: "Wasser".to_string(),
            driver: "apator162".to_string(),
            address_expressions: vec!["12345678".to_string()],
            key: "NOKEY".to_string(),
            ..Default::default()
        };
        let mut m = Meter::create(&mi, di).unwrap();

        let frame = synthesize(5123);
        let mut r = AflReassembler::new(4, 60);
        m.handle_telegram(&AboutTelegram::default(), &frame, &mut r)
            .unwrap()
            .expect("telegram addressed to this meter");

        let total = m.get_numeric_value("total_water", Unit::M3);
        assert!((total - 5.123).abs() < 1e-9);
    }

    #[test]
    fn register_sizes_match_the_stream_layout() {
        assert_eq!(register_size(0x10), Some(4));
        assert_eq!(register_size(0x7B), Some(49));
        assert_eq!(register_size(0xB7), Some(3));
        assert_eq!(register_size(0x11), None);
    }
}
