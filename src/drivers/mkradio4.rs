use crate::frames::LinkMode;
use crate::meters::fields::DEFAULT_PRINT_PROPERTIES;
use crate::meters::{DriverError, DriverInfo, Meter, MeterType, Registry};
use crate::telegram::{Telegram, MANUFACTURER_TCH};
use crate::units::{Quantity, Unit};
use log::warn;

pub fn register(registry: &mut Registry) -> Result<(), DriverError> {
    registry.register(
        DriverInfo::new("mkradio4", MeterType::WaterMeter, setup)
            .set_default_fields("name,id,total_m3,target_m3,timestamp")
            .add_link_mode(LinkMode::T1)
            .add_detection(MANUFACTURER_TCH, 0x62, 0x95)
            .add_detection(MANUFACTURER_TCH, 0x62, 0x70)
            .add_detection(MANUFACTURER_TCH, 0x72, 0x95)
            .add_detection(MANUFACTURER_TCH, 0x72, 0x70)
            .uses_process_content(process_content),
    )
}

fn setup(m: &mut Meter) {
    m.add_numeric_field(
        "total",
        Quantity::Volume,
        DEFAULT_PRINT_PROPERTIES,
        "The total water consumption recorded by this meter.",
    );
    m.add_numeric_field(
        "target",
        Quantity::Volume,
        DEFAULT_PRINT_PROPERTIES,
        "The total water consumption recorded at the beginning of this month.",
    );
}

/// The MK Radio 4 wraps a proprietary payload in a wM-Bus telegram with a
/// manufacturer specific CI, so the DIF/VIF parser finds nothing useful.
/// Consumption counters sit at fixed offsets as little endian tenths of m3.
fn process_content(m: &mut Meter, t: &Telegram) {
    let content = t.extract_payload();
    if content.len() < 9 {
        warn!("(mkradio4) payload too short, {} bytes", content.len());
        return;
    }

    let prev_lo = content[3] as f64;
    let prev_hi = content[4] as f64;
    let prev = (256.0 * prev_hi + prev_lo) / 10.0;

    let curr_lo = content[7] as f64;
    let curr_hi = content[8] as f64;
    let curr = (256.0 * curr_hi + curr_lo) / 10.0;

    m.set_numeric_value("total", Unit::M3, prev + curr);
    m.set_numeric_value("target", Unit::M3, prev);
}

#[cfg(test)]
mod mkradio4_tests {
    use super::*;
    use crate::meters::MeterInfo;
    use crate::telegram::ell::AflReassembler;
    use crate::telegram::AboutTelegram;

    /* Duschagain mkradio4 02410120 NOKEY */
    const TELEGRAM: &str = "2F446850200141029562A2_0670290100601703000400030000000000000000\
0000000000000000000000000000000000";

    #[test]
    fn proprietary_payload_decodes() {
        let mut reg = Registry::new();
        register(&mut reg).unwrap();
        let di = reg.lookup("mkradio4").unwrap();

        let mi = MeterInfo {
            name: "Duschagain".to_string(),
            driver: "mkradio4".to_string(),
            address_expressions: vec!["02410120".to_string()],
            key: "NOKEY".to_string(),
            ..Default::default()
        };
        let mut m = Meter::create(&mi, di).unwrap();

        let frame = hex::decode(TELEGRAM.replace('_', "")).unwrap();
        let mut r = AflReassembler::new(4, 60);
        let t = m
            .handle_telegram(&AboutTelegram::default(), &frame, &mut r)
            .unwrap()
            .expect("telegram addressed to this meter");

        assert_eq!(t.address().unwrap().id, "02410120");
        assert!(t.dv_entries.is_empty());
        let total = m.get_numeric_value("total", Unit::M3);
        let target = m.get_numeric_value("target", Unit::M3);
        assert!((total - 0.4).abs() < 1e-9);
        assert!((target - 0.1).abs() < 1e-9);
    }
}
