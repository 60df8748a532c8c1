use crate::frames::LinkMode;
use crate::meters::fields::DEFAULT_PRINT_PROPERTIES;
use crate::meters::{DriverError, DriverInfo, Meter, MeterType, Registry};
use crate::telegram::{Telegram, MANUFACTURER_APT};
use crate::units::{Quantity, Unit};
use log::warn;

pub fn register(registry: &mut Registry) -> Result<(), DriverError> {
    registry.register(
        DriverInfo::new("apator08", MeterType::WaterMeter, setup)
            .set_default_fields("name,id,total_water_m3,timestamp")
            .add_link_mode(LinkMode::T1)
            .add_detection(MANUFACTURER_APT, 0x03, 0x03)
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

/// The counter sits at a fixed offset right after the link layer header
/// and counts thirds of a liter.
fn process_content(m: &mut Meter, t: &Telegram) {
    let frame = &t.frame;
    if frame.len() < 15 {
        warn!("(apator08) frame too short, {} bytes", frame.len());
        return;
    }
    let i = 11usize;
    let usage = u32::from_le_bytes([frame[i], frame[i + 1], frame[i + 2], frame[i + 3]]);
    let total = (usage as f64 / 3.0) / 1000.0;
    m.set_numeric_value("total_water", Unit::M3, total);
}
