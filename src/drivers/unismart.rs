use crate::frames::LinkMode;
use crate::meters::{DriverError, DriverInfo, Meter, MeterType, Registry};
use crate::telegram::{Telegram, MANUFACTURER_AMX};
use log::debug;

pub fn register(registry: &mut Registry) -> Result<(), DriverError> {
    registry.register(
        DriverInfo::new("unismart", MeterType::GasMeter, setup)
            .set_default_fields("name,id,timestamp")
            .add_link_mode(LinkMode::T1)
            .add_detection(MANUFACTURER_AMX, 0x03, 0x01)
            .uses_process_content(process_content),
    )
}

fn setup(_m: &mut Meter) {}

/// The payload decrypts with the zero key but the register layout has
/// not been mapped yet, so no values are extracted.
fn process_content(_m: &mut Meter, t: &Telegram) {
    debug!(
        "(unismart) payload decoding not implemented, {} bytes ignored",
        t.extract_payload().len()
    );
}

#[cfg(test)]
mod unismart_tests {
    use super::*;

    #[test]
    fn registers_with_detection() {
        let mut reg = Registry::new();
        register(&mut reg).unwrap();
        assert_eq!(
            reg.detect_driver(MANUFACTURER_AMX, 0x03, 0x01).unwrap().name,
            "unismart"
        );
    }
}
