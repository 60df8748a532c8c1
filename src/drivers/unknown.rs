use crate::meters::fields::{
    FieldMatcher, FlagLookup, FlagRule, DEFAULT_PRINT_PROPERTIES, PROP_INCLUDE_TPL_STATUS,
    PROP_STATUS,
};
use crate::meters::{DriverError, DriverInfo, Meter, MeterType, Registry};
use crate::records::vif::VifRange;
use crate::records::MeasurementType;
use crate::units::Quantity;
use crate::meters::fields::VifScaling;

/// Fallback driver used when no registered driver claims a telegram's
/// identity. It declares no detection triples and runs only the standard
/// field extractors over the common VIF ranges.
pub fn register(registry: &mut Registry) -> Result<(), DriverError> {
    registry.register(
        DriverInfo::new("unknown", MeterType::UnknownMeter, setup)
            .add_alias("auto")
            .set_default_fields("name,id,total_m3,timestamp"),
    )
}

fn setup(m: &mut Meter) {
    m.add_library_fields(&[
        "total_m3",
        "volume_flow_m3h",
        "flow_temperature_c",
        "meter_datetime",
    ]);

    m.add_numeric_field_with_extractor(
        "total_energy",
        "The total energy consumption recorded by this meter.",
        DEFAULT_PRINT_PROPERTIES,
        Quantity::Energy,
        VifScaling::Auto,
        FieldMatcher::build()
            .set_measurement_type(MeasurementType::Instantaneous)
            .set_vif_range(VifRange::EnergyWh),
    );

    m.add_string_field_with_extractor_and_lookup(
        "status",
        "Status and error flags.",
        DEFAULT_PRINT_PROPERTIES
            .with(PROP_STATUS)
            .with(PROP_INCLUDE_TPL_STATUS),
        FieldMatcher::build()
            .set_measurement_type(MeasurementType::Instantaneous)
            .set_vif_range(VifRange::ErrorFlags),
        FlagLookup::new().rule(FlagRule::bits("ERROR_FLAGS", 0xFFFF).default_message("OK")),
    );
}
