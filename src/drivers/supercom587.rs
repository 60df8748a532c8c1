use crate::frames::LinkMode;
use crate::meters::fields::{
    FieldMatcher, FlagLookup, FlagRule, DEFAULT_PRINT_PROPERTIES, PROP_INCLUDE_TPL_STATUS,
    PROP_STATUS,
};
use crate::meters::{DriverError, DriverInfo, Meter, MeterType, Registry};
use crate::records::vif::VifRange;
use crate::records::MeasurementType;
use crate::telegram::MANUFACTURER_SON;

pub fn register(registry: &mut Registry) -> Result<(), DriverError> {
    registry.register(
        DriverInfo::new("supercom587", MeterType::WaterMeter, setup)
            .set_default_fields("name,id,total_m3,timestamp")
            .add_link_mode(LinkMode::T1)
            .add_detection(MANUFACTURER_SON, 0x06, 0x3C)
            .add_detection(MANUFACTURER_SON, 0x07, 0x3C),
    )
}

fn setup(m: &mut Meter) {
    m.add_library_fields(&["software_version", "total_m3"]);

    m.add_string_field_with_extractor_and_lookup(
        "status",
        "Status of meter.",
        DEFAULT_PRINT_PROPERTIES
            .with(PROP_STATUS)
            .with(PROP_INCLUDE_TPL_STATUS),
        FieldMatcher::build()
            .set_measurement_type(MeasurementType::Instantaneous)
            .set_vif_range(VifRange::ErrorFlags),
        FlagLookup::new().rule(FlagRule::bits("ERROR_FLAGS", 0x000F).default_message("OK")),
    );
}

#[cfg(test)]
mod supercom587_tests {
    use super::*;
    use crate::meters::MeterInfo;
    use crate::telegram::ell::AflReassembler;
    use crate::telegram::AboutTelegram;
    use crate::units::Unit;

    /* MyWarmWater supercom587 12345678 NOKEY */
    const TELEGRAM: &str = "A244EE4D785634123C067A8F0000000C1348550000426CE1F14C13000000008204\
6C21298C0413330000008D04931E3A3CFE33000000330000003300000033000000330000003300000033000000330000\
00330000003300000033000000330000004300000034180000046D0D0B5C2B03FD6C5E150082206C5C290BFD0F020001\
8C4079678885238310FD3100000082106C01018110FD610002FD66020002FD170000";

    #[test]
    fn warm_water_telegram_decodes() {
        let mut reg = Registry::new();
        register(&mut reg).unwrap();
        let di = reg.lookup("supercom587").unwrap();

        let mi = MeterInfo {
            name: "MyWarmWater".to_string(),
            driver: "supercom587".to_string(),
            address_expressions: vec!["12345678".to_string()],
            key: "NOKEY".to_string(),
            ..Default::default()
        };
        let mut m = Meter::create(&mi, di).unwrap();

        let frame = hex::decode(TELEGRAM).unwrap();
        let mut r = AflReassembler::new(4, 60);
        let t = m
            .handle_telegram(&AboutTelegram::default(), &frame, &mut r)
            .unwrap()
            .expect("telegram addressed to this meter");

        assert_eq!(t.address().unwrap().id, "12345678");
        assert_eq!(m.get_numeric_value("total", Unit::M3), 5.548);

        let sw = m.string_values.get("software_version").unwrap();
        assert_eq!(sw.value, "010002");

        let status_fi = m
            .field_infos
            .iter()
            .find(|f| f.vname == "status")
            .cloned()
            .unwrap();
        assert_eq!(m.get_string_value(&status_fi), Some("OK".to_string()));
    }

    #[test]
    fn cold_water_variant_detects_too() {
        let mut reg = Registry::new();
        register(&mut reg).unwrap();
        assert_eq!(
            reg.detect_driver(MANUFACTURER_SON, 0x07, 0x3C).unwrap().name,
            "supercom587"
        );
    }
}
