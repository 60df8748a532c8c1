use lazy_static::lazy_static;
use log::warn;
use std::collections::HashMap;

/// Physical dimension of a measured value. Every `Unit` belongs to exactly
/// one `Quantity`; conversions never cross quantities unless a field opts
/// into an explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Volume,
    Flow,
    Temperature,
    Energy,
    Power,
    Pressure,
    Mass,
    Time,
    PointInTime,
    Hca,
    Voltage,
    Amperage,
    Dimensionless,
    Text,
}

impl Quantity {
    pub fn to_str(&self) -> &'static str {
        match self {
            Quantity::Volume => "Volume",
            Quantity::Flow => "Flow",
            Quantity::Temperature => "Temperature",
            Quantity::Energy => "Energy",
            Quantity::Power => "Power",
            Quantity::Pressure => "Pressure",
            Quantity::Mass => "Mass",
            Quantity::Time => "Time",
            Quantity::PointInTime => "PointInTime",
            Quantity::Hca => "HCA",
            Quantity::Voltage => "Voltage",
            Quantity::Amperage => "Amperage",
            Quantity::Dimensionless => "Dimensionless",
            Quantity::Text => "Text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    M3,
    L,
    M3h,
    Lh,
    LMin,
    C,
    F,
    K,
    Kwh,
    Wh,
    Mj,
    Gj,
    W,
    Kw,
    Bar,
    Kg,
    Hca,
    Second,
    Minute,
    Hour,
    Day,
    DateLT,
    DateTimeLT,
    DateTimeUTC,
    Volt,
    Ampere,
    Counter,
    Txt,
}

impl Unit {
    pub fn quantity(&self) -> Quantity {
        match self {
            Unit::M3 | Unit::L => Quantity::Volume,
            Unit::M3h | Unit::Lh | Unit::LMin => Quantity::Flow,
            Unit::C | Unit::F | Unit::K => Quantity::Temperature,
            Unit::Kwh | Unit::Wh | Unit::Mj | Unit::Gj => Quantity::Energy,
            Unit::W | Unit::Kw => Quantity::Power,
            Unit::Bar => Quantity::Pressure,
            Unit::Kg => Quantity::Mass,
            Unit::Hca => Quantity::Hca,
            Unit::Second | Unit::Minute | Unit::Hour | Unit::Day => Quantity::Time,
            Unit::DateLT | Unit::DateTimeLT | Unit::DateTimeUTC => Quantity::PointInTime,
            Unit::Volt => Quantity::Voltage,
            Unit::Ampere => Quantity::Amperage,
            Unit::Counter => Quantity::Dimensionless,
            Unit::Txt => Quantity::Text,
        }
    }

    /// The lowercase suffix appended to field names, e.g. `total_m3`.
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::M3 => "m3",
            Unit::L => "l",
            Unit::M3h => "m3h",
            Unit::Lh => "lh",
            Unit::LMin => "l_per_min",
            Unit::C => "c",
            Unit::F => "f",
            Unit::K => "k",
            Unit::Kwh => "kwh",
            Unit::Wh => "wh",
            Unit::Mj => "mj",
            Unit::Gj => "gj",
            Unit::W => "w",
            Unit::Kw => "kw",
            Unit::Bar => "bar",
            Unit::Kg => "kg",
            Unit::Hca => "hca",
            Unit::Second => "s",
            Unit::Minute => "min",
            Unit::Hour => "h",
            Unit::Day => "d",
            Unit::DateLT => "date",
            Unit::DateTimeLT => "datetime",
            Unit::DateTimeUTC => "ut",
            Unit::Volt => "v",
            Unit::Ampere => "a",
            Unit::Counter => "counter",
            Unit::Txt => "txt",
        }
    }

    /// Scale of this unit relative to the base unit of its quantity
    /// (m3, m3/h, kWh, W, bar, kg, seconds). Temperatures and points in
    /// time are handled separately in convert().
    fn base_scale(&self) -> Option<f64> {
        match self {
            Unit::M3 => Some(1.0),
            Unit::L => Some(0.001),
            Unit::M3h => Some(1.0),
            Unit::Lh => Some(0.001),
            Unit::LMin => Some(0.06),
            Unit::Kwh => Some(1.0),
            Unit::Wh => Some(0.001),
            Unit::Mj => Some(1.0 / 3.6),
            Unit::Gj => Some(1000.0 / 3.6),
            Unit::W => Some(1.0),
            Unit::Kw => Some(1000.0),
            Unit::Bar => Some(1.0),
            Unit::Kg => Some(1.0),
            Unit::Hca => Some(1.0),
            Unit::Second => Some(1.0),
            Unit::Minute => Some(60.0),
            Unit::Hour => Some(3600.0),
            Unit::Day => Some(86400.0),
            Unit::Volt => Some(1.0),
            Unit::Ampere => Some(1.0),
            Unit::Counter => Some(1.0),
            /* Points in time are all stored as unix seconds. */
            Unit::DateLT | Unit::DateTimeLT | Unit::DateTimeUTC => Some(1.0),
            _ => None,
        }
    }
}

lazy_static! {
    /// Lookup from the lowercase suffix back to the unit, used when parsing
    /// field names like `flow_l_per_min` from calculated-field configs.
    static ref SUFFIX_TO_UNIT: HashMap<&'static str, Unit> = {
        let mut m = HashMap::new();
        for u in ALL_UNITS.iter() {
            m.insert(u.suffix(), *u);
        }
        m
    };
}

pub const ALL_UNITS: [Unit; 28] = [
    Unit::M3,
    Unit::L,
    Unit::M3h,
    Unit::Lh,
    Unit::LMin,
    Unit::C,
    Unit::F,
    Unit::K,
    Unit::Kwh,
    Unit::Wh,
    Unit::Mj,
    Unit::Gj,
    Unit::W,
    Unit::Kw,
    Unit::Bar,
    Unit::Kg,
    Unit::Hca,
    Unit::Second,
    Unit::Minute,
    Unit::Hour,
    Unit::Day,
    Unit::DateLT,
    Unit::DateTimeLT,
    Unit::DateTimeUTC,
    Unit::Volt,
    Unit::Ampere,
    Unit::Counter,
    Unit::Txt,
];

/// The unit a quantity defaults to when a driver does not name one.
pub fn default_unit_for_quantity(q: Quantity) -> Unit {
    match q {
        Quantity::Volume => Unit::M3,
        Quantity::Flow => Unit::M3h,
        Quantity::Temperature => Unit::C,
        Quantity::Energy => Unit::Kwh,
        Quantity::Power => Unit::W,
        Quantity::Pressure => Unit::Bar,
        Quantity::Mass => Unit::Kg,
        Quantity::Time => Unit::Hour,
        Quantity::PointInTime => Unit::DateTimeLT,
        Quantity::Hca => Unit::Hca,
        Quantity::Voltage => Unit::Volt,
        Quantity::Amperage => Unit::Ampere,
        Quantity::Dimensionless => Unit::Counter,
        Quantity::Text => Unit::Txt,
    }
}

pub fn can_convert(from: Unit, to: Unit) -> bool {
    if from == to {
        return true;
    }
    if from.quantity() != to.quantity() {
        return false;
    }
    if from.quantity() == Quantity::Temperature {
        return true;
    }
    from.base_scale().is_some() && to.base_scale().is_some()
}

/// Convert a value between two units of the same quantity.
/// Returns None when the units are incompatible.
pub fn convert(value: f64, from: Unit, to: Unit) -> Option<f64> {
    if from == to {
        return Some(value);
    }
    if from.quantity() != to.quantity() {
        return None;
    }

    if from.quantity() == Quantity::Temperature {
        /* Go through celsius, offsets make these non-linear in the
        base_scale sense. */
        let celsius = match from {
            Unit::C => value,
            Unit::K => value - 273.15,
            Unit::F => (value - 32.0) / 1.8,
            _ => return None,
        };
        return match to {
            Unit::C => Some(celsius),
            Unit::K => Some(celsius + 273.15),
            Unit::F => Some(celsius * 1.8 + 32.0),
            _ => None,
        };
    }

    let f = from.base_scale()?;
    let t = to.base_scale()?;
    Some(value * f / t)
}

/// Convert but warn and fall back to the raw value when the conversion is
/// impossible. Used by the field engine where a bad conversion must not
/// lose the telegram.
pub fn convert_or_warn(value: f64, from: Unit, to: Unit) -> f64 {
    match convert(value, from, to) {
        Some(v) => v,
        None => {
            warn!(
                "(units) cannot convert from {} to {}, keeping raw value",
                from.suffix(),
                to.suffix()
            );
            value
        }
    }
}

/// Split a field name with a trailing unit suffix, e.g.
/// `flow_l_per_min` -> (`flow`, LMin). Longest suffix wins so that
/// `l_per_min` is not mistaken for `min`.
pub fn extract_unit(name: &str) -> Option<(String, Unit)> {
    let mut best: Option<(usize, Unit)> = None;
    for (suffix, unit) in SUFFIX_TO_UNIT.iter() {
        if name.len() > suffix.len() + 1 {
            let tail = &name[name.len() - suffix.len()..];
            let sep = name.as_bytes()[name.len() - suffix.len() - 1];
            if sep == b'_' && tail == *suffix {
                let better = match best {
                    Some((len, _)) => suffix.len() > len,
                    None => true,
                };
                if better {
                    best = Some((suffix.len(), *unit));
                }
            }
        }
    }
    let (len, unit) = best?;
    Some((name[..name.len() - len - 1].to_string(), unit))
}

#[cfg(test)]
mod units_tests {
    use super::*;

    #[test]
    fn volume_conversions() {
        assert_eq!(convert(1.0, Unit::M3, Unit::L), Some(1000.0));
        assert_eq!(convert(5548.0, Unit::L, Unit::M3), Some(5.548));
        assert_eq!(convert(0.6, Unit::M3h, Unit::LMin), Some(10.0));
    }

    #[test]
    fn temperature_conversions() {
        assert_eq!(convert(20.0, Unit::C, Unit::K), Some(293.15));
        assert_eq!(convert(32.0, Unit::F, Unit::C), Some(0.0));
        let f = convert(100.0, Unit::C, Unit::F).unwrap();
        assert!((f - 212.0).abs() < 1e-9);
    }

    #[test]
    fn quantity_mismatch_is_rejected() {
        assert_eq!(convert(1.0, Unit::M3, Unit::Kwh), None);
        assert!(!can_convert(Unit::C, Unit::Bar));
        assert!(can_convert(Unit::Kwh, Unit::Gj));
    }

    #[test]
    fn suffix_extraction() {
        assert_eq!(extract_unit("total_m3"), Some(("total".to_string(), Unit::M3)));
        assert_eq!(
            extract_unit("flow_l_per_min"),
            Some(("flow".to_string(), Unit::LMin))
        );
        assert_eq!(extract_unit("status"), None);
    }

    #[test]
    fn every_unit_has_a_unique_suffix() {
        let mut seen = std::collections::HashSet::new();
        for u in ALL_UNITS.iter() {
            assert!(seen.insert(u.suffix()), "duplicate suffix {}", u.suffix());
        }
    }
}
