use crate::frames::LinkMode;
use crate::meters::{DriverError, DriverInfo, Meter, MeterType, Registry};
use crate::telegram::MANUFACTURER_ITW;

/* The decoder for this meter family is incomplete; the driver is
   registered so the meter is recognized, but it extracts no values. */

pub fn register(registry: &mut Registry) -> Result<(), DriverError> {
    registry.register(
        DriverInfo::new("itron", MeterType::WaterMeter, setup)
            .set_default_fields("name,id,timestamp")
            .add_link_mode(LinkMode::T1)
            .add_detection(MANUFACTURER_ITW, 0x07, 0x03),
    )
}

fn setup(_m: &mut Meter) {}
