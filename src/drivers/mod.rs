//! Per-meter-model drivers. Every module registers one `DriverInfo`
//! describing how to detect and decode its meter family; `register_all`
//! is called once at startup before the receive loop begins.

pub mod apator08;
pub mod apator162;
pub mod evo868;
pub mod itron;
pub mod mkradio4;
pub mod supercom587;
pub mod unismart;
pub mod unknown;

use crate::meters::{DriverError, Registry};

pub fn register_all(registry: &mut Registry) -> Result<(), DriverError> {
    supercom587::register(registry)?;
    mkradio4::register(registry)?;
    apator162::register(registry)?;
    apator08::register(registry)?;
    unismart::register(registry)?;
    itron::register(registry)?;
    evo868::register(registry)?;
    /* The generic fallback driver goes last and claims nothing. */
    unknown::register(registry)?;
    Ok(())
}

#[cfg(test)]
mod drivers_tests {
    use super::*;

    #[test]
    fn all_builtin_drivers_register_cleanly() {
        let mut reg = Registry::new();
        register_all(&mut reg).unwrap();
        assert!(reg.lookup("supercom587").is_some());
        assert!(reg.lookup("mkradio4").is_some());
        assert!(reg.lookup("apator162").is_some());
        assert!(reg.lookup("unknown").is_some());
    }

    #[test]
    fn registering_twice_is_rejected() {
        let mut reg = Registry::new();
        register_all(&mut reg).unwrap();
        assert!(register_all(&mut reg).is_err());
    }

    #[test]
    fn detection_triples_route_to_the_right_driver() {
        use crate::telegram::{MANUFACTURER_SON, MANUFACTURER_TCH};
        let mut reg = Registry::new();
        register_all(&mut reg).unwrap();
        assert_eq!(
            reg.detect_driver(MANUFACTURER_SON, 0x06, 0x3C).unwrap().name,
            "supercom587"
        );
        assert_eq!(
            reg.detect_driver(MANUFACTURER_TCH, 0x62, 0x95).unwrap().name,
            "mkradio4"
        );
        assert!(reg.detect_driver(0x1234, 0x01, 0x01).is_none());
    }
}
