use crate::units::Unit;

/// Decoded meaning of a VIF/VIFE chain: what kind of value the record
/// carries and in which unit/scale it is expressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VifRange {
    Volume,
    VolumeFlow,
    FlowTemperature,
    ReturnTemperature,
    ExternalTemperature,
    TemperatureDifference,
    Pressure,
    EnergyWh,
    EnergyMJ,
    Power,
    PowerJh,
    Mass,
    MassFlow,
    OnTime,
    OperatingTime,
    AveragingDuration,
    ActualityDuration,
    Date,
    DateTime,
    HeatCostAllocation,
    ErrorFlags,
    ErrorMask,
    DigitalInput,
    DigitalOutput,
    SoftwareVersion,
    FirmwareVersion,
    HardwareVersion,
    ModelVersion,
    AccessNumber,
    FabricationNo,
    ParameterSet,
    Customer,
    Voltage,
    Amperage,
    CumulationCounter,
    Medium,
    Manufacturer,
    Dimensionless,
    PlainText,
    ManufacturerSpecific,
    AnyVif,
    Unknown,
    Any,
}

impl VifRange {
    /// Ranges whose payload is an identifier rendered as text even when the
    /// data field is BCD or binary (version strings, fabrication numbers).
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            VifRange::SoftwareVersion
                | VifRange::FirmwareVersion
                | VifRange::HardwareVersion
                | VifRange::ModelVersion
                | VifRange::FabricationNo
                | VifRange::ParameterSet
                | VifRange::Customer
        )
    }
}

/// Orthogonal VIFE codes a matcher can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VifCombinable {
    /// E0111010: accumulation of positive contributions only.
    ForwardFlow,
    /// E0111011: accumulation of negative contributions only.
    BackwardFlow,
    /// E0111101: value during lower limit exceeded.
    BelowLowerLimit,
    /// E0111100: value during upper limit exceeded.
    AboveUpperLimit,
    Unknown(u8),
}

pub fn lookup_combinable(vife: u8) -> VifCombinable {
    match vife & 0x7F {
        0x3A => VifCombinable::ForwardFlow,
        0x3B => VifCombinable::BackwardFlow,
        0x3C => VifCombinable::AboveUpperLimit,
        0x3D => VifCombinable::BelowLowerLimit,
        other => VifCombinable::Unknown(other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VifInfo {
    pub range: VifRange,
    pub unit: Unit,
    /// Decimal exponent applied to the raw integer.
    pub exponent: i32,
    /// Extra multiplicative factor for wire units that are not in the
    /// crate's unit table (m3/min, m3/s, J/h).
    pub factor: f64,
}

impl VifInfo {
    fn new(range: VifRange, unit: Unit, exponent: i32) -> Self {
        VifInfo {
            range,
            unit,
            exponent,
            factor: 1.0,
        }
    }

    fn with_factor(range: VifRange, unit: Unit, exponent: i32, factor: f64) -> Self {
        VifInfo {
            range,
            unit,
            exponent,
            factor,
        }
    }

    pub fn unknown() -> Self {
        VifInfo::new(VifRange::Unknown, Unit::Counter, 0)
    }
}

fn time_unit(nn: u8) -> Unit {
    match nn & 0x3 {
        0b00 => Unit::Second,
        0b01 => Unit::Minute,
        0b10 => Unit::Hour,
        _ => Unit::Day,
    }
}

/// Primary VIF table, EN 13757-3 table 10. `vif` is already masked to 7 bits.
pub fn lookup_primary(vif: u8) -> VifInfo {
    let n = (vif & 0x7) as i32;
    let nn = vif & 0x3;
    match vif {
        /* E0000nnn  Energy 10^(nnn-3) Wh */
        0x00..=0x07 => VifInfo::new(VifRange::EnergyWh, Unit::Wh, n - 3),
        /* E0001nnn  Energy 10^nnn J -> MJ */
        0x08..=0x0F => VifInfo::new(VifRange::EnergyMJ, Unit::Mj, n - 6),
        /* E0010nnn  Volume 10^(nnn-6) m3 */
        0x10..=0x17 => VifInfo::new(VifRange::Volume, Unit::M3, n - 6),
        /* E0011nnn  Mass 10^(nnn-3) kg */
        0x18..=0x1F => VifInfo::new(VifRange::Mass, Unit::Kg, n - 3),
        /* E01000nn  On time */
        0x20..=0x23 => VifInfo::new(VifRange::OnTime, time_unit(nn), 0),
        /* E01001nn  Operating time */
        0x24..=0x27 => VifInfo::new(VifRange::OperatingTime, time_unit(nn), 0),
        /* E0101nnn  Power 10^(nnn-3) W */
        0x28..=0x2F => VifInfo::new(VifRange::Power, Unit::W, n - 3),
        /* E0110nnn  Power 10^nnn J/h */
        0x30..=0x37 => VifInfo::with_factor(VifRange::PowerJh, Unit::W, n, 1.0 / 3600.0),
        /* E0111nnn  Volume flow 10^(nnn-6) m3/h */
        0x38..=0x3F => VifInfo::new(VifRange::VolumeFlow, Unit::M3h, n - 6),
        /* E1000nnn  Volume flow ext. 10^(nnn-7) m3/min */
        0x40..=0x47 => VifInfo::with_factor(VifRange::VolumeFlow, Unit::M3h, n - 7, 60.0),
        /* E1001nnn  Volume flow ext. 10^(nnn-9) m3/s */
        0x48..=0x4F => VifInfo::with_factor(VifRange::VolumeFlow, Unit::M3h, n - 9, 3600.0),
        /* E1010nnn  Mass flow 10^(nnn-3) kg/h */
        0x50..=0x57 => VifInfo::new(VifRange::MassFlow, Unit::Kg, n - 3),
        /* E10110nn  Flow temperature 10^(nn-3) C */
        0x58..=0x5B => VifInfo::new(VifRange::FlowTemperature, Unit::C, nn as i32 - 3),
        /* E10111nn  Return temperature 10^(nn-3) C */
        0x5C..=0x5F => VifInfo::new(VifRange::ReturnTemperature, Unit::C, nn as i32 - 3),
        /* E11000nn  Temperature difference 10^(nn-3) K */
        0x60..=0x63 => VifInfo::new(VifRange::TemperatureDifference, Unit::K, nn as i32 - 3),
        /* E11001nn  External temperature 10^(nn-3) C */
        0x64..=0x67 => VifInfo::new(VifRange::ExternalTemperature, Unit::C, nn as i32 - 3),
        /* E11010nn  Pressure 10^(nn-3) bar */
        0x68..=0x6B => VifInfo::new(VifRange::Pressure, Unit::Bar, nn as i32 - 3),
        /* E1101100  Date, data type G */
        0x6C => VifInfo::new(VifRange::Date, Unit::DateLT, 0),
        /* E1101101  Date/time, data types F/I/J */
        0x6D => VifInfo::new(VifRange::DateTime, Unit::DateTimeLT, 0),
        /* E1101110  Units for H.C.A. */
        0x6E => VifInfo::new(VifRange::HeatCostAllocation, Unit::Hca, 0),
        /* E11100nn  Averaging duration */
        0x70..=0x73 => VifInfo::new(VifRange::AveragingDuration, time_unit(nn), 0),
        /* E11101nn  Actuality duration */
        0x74..=0x77 => VifInfo::new(VifRange::ActualityDuration, time_unit(nn), 0),
        /* E1111000  Fabrication number */
        0x78 => VifInfo::new(VifRange::FabricationNo, Unit::Counter, 0),
        /* E1111110  Any VIF (readout selection) */
        0x7E => VifInfo::new(VifRange::AnyVif, Unit::Counter, 0),
        /* E1111111  Manufacturer specific */
        0x7F => VifInfo::new(VifRange::ManufacturerSpecific, Unit::Counter, 0),
        _ => VifInfo::unknown(),
    }
}

/// First extension table, selected by VIF 0xFB.
pub fn lookup_fb(vife: u8) -> VifInfo {
    let v = vife & 0x7F;
    let n = (v & 0x1) as i32;
    let nn = (v & 0x3) as i32;
    match v {
        /* E000000n  Energy 10^(n-1) MWh */
        0x00..=0x01 => VifInfo::new(VifRange::EnergyWh, Unit::Kwh, n + 2),
        /* E000100n  Energy 10^(n-1) GJ */
        0x08..=0x09 => VifInfo::new(VifRange::EnergyMJ, Unit::Gj, n - 1),
        /* E001000n  Volume 10^(n+2) m3 */
        0x10..=0x11 => VifInfo::new(VifRange::Volume, Unit::M3, n + 2),
        /* E001100n  Mass 10^(n+2) t */
        0x18..=0x19 => VifInfo::new(VifRange::Mass, Unit::Kg, n + 5),
        /* E010100n  Power 10^(n-1) MW */
        0x28..=0x29 => VifInfo::new(VifRange::Power, Unit::Kw, n + 2),
        /* E011000n  Power 10^(n-1) GJ/h */
        0x30..=0x31 => VifInfo::with_factor(VifRange::PowerJh, Unit::Kw, n - 1, 1000.0 / 3.6),
        /* E10110nn  Flow temperature 10^(nn-3) F */
        0x58..=0x5B => VifInfo::new(VifRange::FlowTemperature, Unit::F, nn - 3),
        /* E10111nn  Return temperature 10^(nn-3) F */
        0x5C..=0x5F => VifInfo::new(VifRange::ReturnTemperature, Unit::F, nn - 3),
        /* E11000nn  Temperature difference 10^(nn-3) F */
        0x60..=0x63 => VifInfo::new(VifRange::TemperatureDifference, Unit::F, nn - 3),
        /* E11001nn  External temperature 10^(nn-3) F */
        0x64..=0x67 => VifInfo::new(VifRange::ExternalTemperature, Unit::F, nn - 3),
        _ => VifInfo::unknown(),
    }
}

/// Second extension table, selected by VIF 0xFD.
pub fn lookup_fd(vife: u8) -> VifInfo {
    let v = vife & 0x7F;
    match v {
        /* E0001000  Access number (transmission count) */
        0x08 => VifInfo::new(VifRange::AccessNumber, Unit::Counter, 0),
        /* E0001001  Medium (as in fixed header) */
        0x09 => VifInfo::new(VifRange::Medium, Unit::Counter, 0),
        /* E0001010  Manufacturer (as in fixed header) */
        0x0A => VifInfo::new(VifRange::Manufacturer, Unit::Counter, 0),
        /* E0001011  Parameter set identification */
        0x0B => VifInfo::new(VifRange::ParameterSet, Unit::Counter, 0),
        /* E0001100  Model / version */
        0x0C => VifInfo::new(VifRange::ModelVersion, Unit::Counter, 0),
        /* E0001101  Hardware version number */
        0x0D => VifInfo::new(VifRange::HardwareVersion, Unit::Counter, 0),
        /* E0001110  Firmware version number */
        0x0E => VifInfo::new(VifRange::FirmwareVersion, Unit::Counter, 0),
        /* E0001111  Software version number */
        0x0F => VifInfo::new(VifRange::SoftwareVersion, Unit::Counter, 0),
        /* E0010001  Customer */
        0x11 => VifInfo::new(VifRange::Customer, Unit::Counter, 0),
        /* E0010111  Error flags (binary) */
        0x17 => VifInfo::new(VifRange::ErrorFlags, Unit::Counter, 0),
        /* E0011000  Error mask */
        0x18 => VifInfo::new(VifRange::ErrorMask, Unit::Counter, 0),
        /* E0011010  Digital output (binary) */
        0x1A => VifInfo::new(VifRange::DigitalOutput, Unit::Counter, 0),
        /* E0011011  Digital input (binary) */
        0x1B => VifInfo::new(VifRange::DigitalInput, Unit::Counter, 0),
        /* E0111010  Dimensionless / no VIF */
        0x3A => VifInfo::new(VifRange::Dimensionless, Unit::Counter, 0),
        /* E100nnnn  Voltage 10^(nnnn-9) V */
        0x40..=0x4F => VifInfo::new(VifRange::Voltage, Unit::Volt, (v & 0xF) as i32 - 9),
        /* E101nnnn  Current 10^(nnnn-12) A */
        0x50..=0x5F => VifInfo::new(VifRange::Amperage, Unit::Ampere, (v & 0xF) as i32 - 12),
        /* E1100001  Cumulation counter */
        0x61 => VifInfo::new(VifRange::CumulationCounter, Unit::Counter, 0),
        _ => VifInfo::unknown(),
    }
}
