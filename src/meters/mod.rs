pub mod fields;

use crate::frames::LinkMode;
use crate::records::vif::VifRange;
use crate::records::{DVEntry, DifSignedness, MeasurementType};
use crate::telegram::crypto::{CryptoError, MeterKeys};
use crate::telegram::ell::AflReassembler;
use crate::telegram::{AboutTelegram, AddressExpression, IdentityMode, Telegram, TelegramError};
use crate::units::{self, Quantity, Unit};
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext};
use fields::{
    join_status_ok_strings, FieldInfo, FieldMatcher, FlagLookup, PrintProperties, VifScaling,
    DEFAULT_PRINT_PROPERTIES,
};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterType {
    WaterMeter,
    HeatMeter,
    GasMeter,
    ElectricityMeter,
    HeatCostAllocator,
    CoolingMeter,
    UnknownMeter,
}

impl MeterType {
    pub fn to_str(&self) -> &'static str {
        match self {
            MeterType::WaterMeter => "water",
            MeterType::HeatMeter => "heat",
            MeterType::GasMeter => "gas",
            MeterType::ElectricityMeter => "electricity",
            MeterType::HeatCostAllocator => "heat cost allocation",
            MeterType::CoolingMeter => "cooling",
            MeterType::UnknownMeter => "unknown",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("two drivers trying to register the name \"{0}\"")]
    DuplicateName(String),
    #[error("driver {0} tried to register a detection combo already taken by {1}")]
    DetectionCollision(String, String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeterError {
    #[error("unknown driver \"{0}\"")]
    UnknownDriver(String),
    #[error("bad meter key: {0}")]
    BadKey(String),
    #[error("bad address expression \"{0}\"")]
    BadAddressExpression(String),
    #[error("bad calculated field \"{0}\"")]
    BadCalculatedField(String),
}

/// One (manufacturer, type, version) combination a driver claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionTriple {
    pub mfct: u16,
    pub device_type: u8,
    pub version: u8,
}

/// Function installing a driver's fields into a fresh meter.
pub type DriverSetup = fn(&mut Meter);
/// Driver specific bytes-to-fields decoding, invoked after the standard
/// extractors when a driver declares `uses_process_content`.
pub type ContentProcessor = fn(&mut Meter, &Telegram);

/// Everything registered about one supported meter model.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: String,
    pub aliases: Vec<String>,
    pub meter_type: MeterType,
    pub default_fields: Vec<String>,
    pub link_modes: Vec<LinkMode>,
    pub detect: Vec<DetectionTriple>,
    pub uses_process_content: bool,
    pub mfct_tpl_status_bits: Option<FlagLookup>,
    pub setup: DriverSetup,
    pub content_processor: Option<ContentProcessor>,
}

impl DriverInfo {
    pub fn new(name: &str, meter_type: MeterType, setup: DriverSetup) -> Self {
        DriverInfo {
            name: name.to_string(),
            aliases: Vec::new(),
            meter_type,
            default_fields: Vec::new(),
            link_modes: Vec::new(),
            detect: Vec::new(),
            uses_process_content: false,
            mfct_tpl_status_bits: None,
            setup,
            content_processor: None,
        }
    }

    pub fn add_detection(mut self, mfct: u16, device_type: u8, version: u8) -> Self {
        self.detect.push(DetectionTriple {
            mfct,
            device_type,
            version,
        });
        self
    }

    pub fn add_link_mode(mut self, lm: LinkMode) -> Self {
        self.link_modes.push(lm);
        self
    }

    pub fn add_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn set_default_fields(mut self, csv: &str) -> Self {
        self.default_fields = csv.split(',').map(|s| s.trim().to_string()).collect();
        self
    }

    pub fn uses_process_content(mut self, processor: ContentProcessor) -> Self {
        self.uses_process_content = true;
        self.content_processor = Some(processor);
        self
    }

    pub fn set_mfct_tpl_status_bits(mut self, lookup: FlagLookup) -> Self {
        self.mfct_tpl_status_bits = Some(lookup);
        self
    }

    /// Does this driver claim the arriving identity? Some meters transmit
    /// a manufacturer with the top bit set, so comparisons mask it off.
    pub fn detects(&self, mfct: u16, device_type: u8, version: u8) -> bool {
        for d in &self.detect {
            if d.mfct == 0 && d.device_type == 0 && d.version == 0 {
                continue;
            }
            if (d.mfct & 0x7FFF) == (mfct & 0x7FFF)
                && d.device_type == device_type
                && d.version == version
            {
                return true;
            }
        }
        false
    }
}

/// Process wide driver table. Populated once at startup, read only
/// afterwards; registration rejects name and detection collisions.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, usize>,
    list: Vec<DriverInfo>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&mut self, di: DriverInfo) -> Result<(), DriverError> {
        if self.lookup(&di.name).is_some() {
            return Err(DriverError::DuplicateName(di.name.clone()));
        }
        for d in &di.detect {
            for other in &self.list {
                if other.detects(d.mfct, d.device_type, d.version) {
                    return Err(DriverError::DetectionCollision(
                        di.name.clone(),
                        other.name.clone(),
                    ));
                }
            }
        }
        self.by_name.insert(di.name.clone(), self.list.len());
        self.list.push(di);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&DriverInfo> {
        if let Some(i) = self.by_name.get(name) {
            return self.list.get(*i);
        }
        /* No direct hit, look through the aliases. */
        self.list
            .iter()
            .find(|di| di.aliases.iter().any(|a| a == name))
    }

    /// First registered driver claiming the identity, insertion order.
    pub fn detect_driver(&self, mfct: u16, device_type: u8, version: u8) -> Option<&DriverInfo> {
        self.list
            .iter()
            .find(|di| di.detects(mfct, device_type, version))
    }

    pub fn all(&self) -> &[DriverInfo] {
        &self.list
    }
}

/// Meter configuration as handed over by the configuration layer.
#[derive(Debug, Clone, Default)]
pub struct MeterInfo {
    pub name: String,
    pub driver: String,
    pub driver_extras: String,
    pub key: String,
    pub address_expressions: Vec<String>,
    pub identity_mode: IdentityMode,
    pub link_modes: Vec<LinkMode>,
    pub selected_fields: Vec<String>,
    pub extra_constant_fields: Vec<String>,
    pub extra_calculated_fields: Vec<String>,
    pub poll_interval: u64,
}

#[derive(Debug, Clone)]
pub struct NumericField {
    pub unit: Unit,
    pub value: f64,
    pub field_index: usize,
}

#[derive(Debug, Clone)]
pub struct StringField {
    pub value: String,
    pub field_index: usize,
}

/// Runtime instance of a driver bound to one configured meter.
pub struct Meter {
    pub name: String,
    pub driver_name: String,
    pub meter_type: MeterType,
    pub identity_mode: IdentityMode,
    pub address_expressions: Vec<AddressExpression>,
    pub keys: MeterKeys,
    pub link_modes: Vec<LinkMode>,
    pub poll_interval: u64,
    pub selected_fields: Vec<String>,
    pub extra_constant_fields: Vec<(String, String)>,

    pub field_infos: Vec<FieldInfo>,
    pub numeric_values: HashMap<(String, Unit), NumericField>,
    pub string_values: HashMap<String, StringField>,

    mfct_tpl_status_bits: Option<FlagLookup>,
    uses_process_content: bool,
    content_processor: Option<ContentProcessor>,
    tpl_status: Option<u8>,
    num_updates: u64,
}

impl Meter {
    pub fn create(mi: &MeterInfo, di: &DriverInfo) -> Result<Meter, MeterError> {
        let keys = if mi.key.is_empty() || mi.key == "NOKEY" {
            MeterKeys::none()
        } else {
            MeterKeys::from_hex(&mi.key).map_err(|e| MeterError::BadKey(e.to_string()))?
        };

        let mut address_expressions = Vec::new();
        for s in &mi.address_expressions {
            let ae = AddressExpression::parse(s)
                .ok_or_else(|| MeterError::BadAddressExpression(s.clone()))?;
            address_expressions.push(ae);
        }

        let mut extra_constant_fields = Vec::new();
        for ecf in &mi.extra_constant_fields {
            match ecf.split_once('=') {
                Some((k, v)) => extra_constant_fields.push((k.to_string(), v.to_string())),
                None => warn!("(meter) ignoring malformed constant field \"{}\"", ecf),
            }
        }

        let mut link_modes = mi.link_modes.clone();
        for lm in &di.link_modes {
            if !link_modes.contains(lm) {
                link_modes.push(*lm);
            }
        }

        let selected_fields = if mi.selected_fields.is_empty() {
            di.default_fields.clone()
        } else {
            mi.selected_fields.clone()
        };

        let mut m = Meter {
            name: mi.name.clone(),
            driver_name: di.name.clone(),
            meter_type: di.meter_type,
            identity_mode: mi.identity_mode,
            address_expressions,
            keys,
            link_modes,
            poll_interval: mi.poll_interval,
            selected_fields,
            extra_constant_fields,
            field_infos: Vec::new(),
            numeric_values: HashMap::new(),
            string_values: HashMap::new(),
            mfct_tpl_status_bits: di.mfct_tpl_status_bits.clone(),
            uses_process_content: di.uses_process_content,
            content_processor: di.content_processor,
            tpl_status: None,
            num_updates: 0,
        };
        (di.setup)(&mut m);

        for ecf in &mi.extra_calculated_fields {
            m.add_extra_calculated_field(ecf)?;
        }
        Ok(m)
    }

    /* ---- field declaration, called from driver setup functions ---- */

    fn push_field(&mut self, mut fi: FieldInfo) {
        fi.index = self.field_infos.len();
        self.field_infos.push(fi);
    }

    pub fn add_numeric_field_with_extractor(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        quantity: Quantity,
        vif_scaling: VifScaling,
        matcher: FieldMatcher,
    ) {
        self.add_numeric_field_full(
            vname,
            help,
            props,
            quantity,
            vif_scaling,
            DifSignedness::Signed,
            matcher,
            None,
            1.0,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_numeric_field_full(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        quantity: Quantity,
        vif_scaling: VifScaling,
        dif_signedness: DifSignedness,
        matcher: FieldMatcher,
        display_unit: Option<Unit>,
        scale: f64,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity,
            display_unit: display_unit.unwrap_or_else(|| units::default_unit_for_quantity(quantity)),
            vif_scaling,
            dif_signedness,
            scale,
            matcher: Some(matcher),
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula: None,
            override_conversion: false,
        });
    }

    /// A plain numeric field without matcher, filled in by a content
    /// processor or another field's side effect.
    pub fn add_numeric_field(
        &mut self,
        vname: &str,
        quantity: Quantity,
        props: PrintProperties,
        help: &str,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity,
            display_unit: units::default_unit_for_quantity(quantity),
            vif_scaling: VifScaling::Auto,
            dif_signedness: DifSignedness::Signed,
            scale: 1.0,
            matcher: None,
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula: None,
            override_conversion: false,
        });
    }

    pub fn add_numeric_field_with_calculator(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        quantity: Quantity,
        formula: &str,
        display_unit: Option<Unit>,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity,
            display_unit: display_unit.unwrap_or_else(|| units::default_unit_for_quantity(quantity)),
            vif_scaling: VifScaling::Auto,
            dif_signedness: DifSignedness::Signed,
            scale: 1.0,
            matcher: None,
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula: Some(formula.to_string()),
            override_conversion: false,
        });
    }

    pub fn add_string_field_with_extractor(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        matcher: FieldMatcher,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity: Quantity::Text,
            display_unit: Unit::Txt,
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Signed,
            scale: 1.0,
            matcher: Some(matcher),
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula: None,
            override_conversion: false,
        });
    }

    pub fn add_string_field_with_extractor_and_lookup(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        matcher: FieldMatcher,
        lookup: FlagLookup,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity: Quantity::Text,
            display_unit: Unit::Txt,
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Signed,
            scale: 1.0,
            matcher: Some(matcher),
            help: help.to_string(),
            print_properties: props,
            lookup: Some(lookup),
            formula: None,
            override_conversion: false,
        });
    }

    /// A string field without matcher, filled by a content processor.
    pub fn add_string_field(&mut self, vname: &str, help: &str, props: PrintProperties) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity: Quantity::Text,
            display_unit: Unit::Txt,
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Signed,
            scale: 1.0,
            matcher: None,
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula: None,
            override_conversion: false,
        });
    }

    /// Library fields shared by many drivers, added by name.
    pub fn add_library_fields(&mut self, names: &[&str]) {
        for name in names {
            match *name {
                "total_m3" => self.add_numeric_field_with_extractor(
                    "total",
                    "The total water consumption recorded by this meter.",
                    DEFAULT_PRINT_PROPERTIES,
                    Quantity::Volume,
                    VifScaling::Auto,
                    FieldMatcher::build()
                        .set_measurement_type(MeasurementType::Instantaneous)
                        .set_vif_range(VifRange::Volume),
                ),
                "volume_flow_m3h" => self.add_numeric_field_with_extractor(
                    "volume_flow",
                    "The current flow of water through this meter.",
                    DEFAULT_PRINT_PROPERTIES,
                    Quantity::Flow,
                    VifScaling::Auto,
                    FieldMatcher::build()
                        .set_measurement_type(MeasurementType::Instantaneous)
                        .set_vif_range(VifRange::VolumeFlow),
                ),
                "flow_temperature_c" => self.add_numeric_field_with_extractor(
                    "flow_temperature",
                    "Water temperature at the meter.",
                    DEFAULT_PRINT_PROPERTIES,
                    Quantity::Temperature,
                    VifScaling::Auto,
                    FieldMatcher::build()
                        .set_measurement_type(MeasurementType::Instantaneous)
                        .set_vif_range(VifRange::FlowTemperature),
                ),
                "meter_datetime" => self.add_numeric_field_with_extractor(
                    "meter_datetime",
                    "Date and time of the meter clock.",
                    DEFAULT_PRINT_PROPERTIES,
                    Quantity::PointInTime,
                    VifScaling::Auto,
                    FieldMatcher::build()
                        .set_measurement_type(MeasurementType::Instantaneous)
                        .set_vif_range(VifRange::DateTime),
                ),
                "software_version" => self.add_string_field_with_extractor(
                    "software_version",
                    "Software version of the meter firmware.",
                    DEFAULT_PRINT_PROPERTIES,
                    FieldMatcher::build()
                        .set_measurement_type(MeasurementType::Instantaneous)
                        .set_vif_range(VifRange::SoftwareVersion),
                ),
                "fabrication_no" => self.add_string_field_with_extractor(
                    "fabrication_no",
                    "Fabrication number of the meter.",
                    DEFAULT_PRINT_PROPERTIES,
                    FieldMatcher::build()
                        .set_measurement_type(MeasurementType::Instantaneous)
                        .set_vif_range(VifRange::FabricationNo),
                ),
                other => warn!("(meter) no library field named \"{}\"", other),
            }
        }
    }

    /// Parse a `name_unit=formula` expression from the configuration and
    /// install it as a calculated field.
    pub fn add_extra_calculated_field(&mut self, ecf: &str) -> Result<(), MeterError> {
        let (name, formula) = ecf
            .split_once('=')
            .ok_or_else(|| MeterError::BadCalculatedField(ecf.to_string()))?;
        let (vname, unit) = units::extract_unit(name.trim())
            .ok_or_else(|| MeterError::BadCalculatedField(ecf.to_string()))?;
        debug!("(meter) adding calculated field: {}", ecf);
        self.add_numeric_field_with_calculator(
            &vname,
            &format!("Calculated: {}", ecf),
            DEFAULT_PRINT_PROPERTIES,
            unit.quantity(),
            formula.trim(),
            Some(unit),
        );
        Ok(())
    }

    /* ---- value tables ---- */

    pub fn find_field_index(&self, vname: &str, quantity: Quantity) -> Option<usize> {
        self.field_infos
            .iter()
            .position(|fi| fi.vname == vname && fi.quantity == quantity)
    }

    fn store_numeric(&mut self, field_index: usize, name: String, unit: Unit, value: f64) {
        let fi = &self.field_infos[field_index];
        if unit.quantity() != fi.quantity && !fi.override_conversion {
            warn!(
                "(meter) not storing {} {} into field \"{}\" of quantity {}",
                value,
                unit.suffix(),
                fi.vname,
                fi.quantity.to_str()
            );
            return;
        }
        self.numeric_values.insert(
            (name, unit),
            NumericField {
                unit,
                value,
                field_index,
            },
        );
    }

    /// Entry point for content processors: store a value under an
    /// already declared field.
    pub fn set_numeric_value(&mut self, vname: &str, unit: Unit, value: f64) {
        match self.find_field_index(vname, unit.quantity()) {
            Some(i) => {
                let display_unit = self.field_infos[i].display_unit;
                let v = units::convert_or_warn(value, unit, display_unit);
                self.store_numeric(i, vname.to_string(), display_unit, v);
            }
            None => warn!(
                "(meter) cannot set numeric value {} {} for non-existant field \"{}\"",
                value,
                unit.suffix(),
                vname
            ),
        }
    }

    pub fn set_string_value(&mut self, vname: &str, value: &str) {
        match self.field_infos.iter().position(|fi| fi.vname == vname) {
            Some(i) => {
                self.string_values.insert(
                    vname.to_string(),
                    StringField {
                        value: value.to_string(),
                        field_index: i,
                    },
                );
            }
            None => warn!(
                "(meter) cannot set string value \"{}\" for non-existant field \"{}\"",
                value, vname
            ),
        }
    }

    pub fn get_numeric_value(&self, vname: &str, to: Unit) -> f64 {
        for ((name, _), nf) in &self.numeric_values {
            if name == vname {
                return units::convert(nf.value, nf.unit, to).unwrap_or(f64::NAN);
            }
        }
        f64::NAN
    }

    pub fn has_values(&self) -> bool {
        !self.numeric_values.is_empty() || !self.string_values.is_empty()
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn tpl_status(&self) -> Option<u8> {
        self.tpl_status
    }

    /// Translate the TPL status byte. A driver-supplied lookup replaces
    /// the standard EN 13757-3 bit names.
    pub fn decode_tpl_status_byte(&self, sts: u8) -> String {
        if let Some(lookup) = &self.mfct_tpl_status_bits {
            return lookup.translate(sts as u32);
        }
        let mut flags: Vec<&str> = Vec::new();
        match sts & 0x03 {
            0x01 => flags.push("BUSY"),
            0x02 => flags.push("ERROR"),
            0x03 => flags.push("ALARM"),
            _ => {}
        }
        if sts & 0x04 != 0 {
            flags.push("POWER_LOW");
        }
        if sts & 0x08 != 0 {
            flags.push("PERMANENT_ERROR");
        }
        if sts & 0x10 != 0 {
            flags.push("TEMPORARY_ERROR");
        }
        if flags.is_empty() {
            return "OK".to_string();
        }
        flags.join(" ")
    }

    /// Resolve a string field for rendering. For the status field this
    /// composes injected flags and the TPL status, normalized.
    pub fn get_string_value(&self, fi: &FieldInfo) -> Option<String> {
        let base = self.string_values.get(&fi.vname).map(|sf| sf.value.clone());

        if !fi.print_properties.is_status() {
            return base;
        }

        let mut parts: Vec<String> = Vec::new();
        if let Some(b) = base {
            parts.push(b);
        }
        for f in &self.field_infos {
            if f.print_properties.injects_into_status() {
                if let Some(sf) = self.string_values.get(&f.vname) {
                    parts.push(sf.value.clone());
                }
            }
        }
        if fi.print_properties.includes_tpl_status() {
            if let Some(sts) = self.tpl_status {
                parts.push(self.decode_tpl_status_byte(sts));
            }
        }
        Some(join_status_ok_strings(&parts))
    }

    /* ---- telegram handling ---- */

    pub fn is_telegram_for_me(&self, t: &Telegram) -> bool {
        for a in &t.addresses {
            for ae in &self.address_expressions {
                if ae.matches(a) {
                    return true;
                }
            }
        }
        false
    }

    /// Decode one frame addressed to this meter. Returns the parsed
    /// telegram when the frame was for this meter and decoding succeeded,
    /// Ok(None) when the frame belongs to someone else.
    pub fn handle_telegram(
        &mut self,
        about: &AboutTelegram,
        frame: &[u8],
        reassembler: &mut AflReassembler,
    ) -> Result<Option<Telegram>, TelegramError> {
        let mut t = Telegram::new(about.clone());
        if t.parse_header(frame).is_err() {
            return Ok(None);
        }
        if !self.is_telegram_for_me(&t) {
            return Ok(None);
        }

        debug!(
            "(meter) {} {} handling telegram from {}",
            self.name,
            self.driver_name,
            t.address().map(|a| a.id.clone()).unwrap_or_default()
        );

        match t.parse(frame, &self.keys, reassembler) {
            Ok(()) => {}
            Err(TelegramError::Crypto(CryptoError::NeedsKey))
                if self.uses_process_content && !self.keys.has_key() =>
            {
                /* Some proprietary meters encrypt with an all-zero key;
                their drivers expect the zero key attempt when none is
                configured. */
                debug!("(meter) {} retrying with zero key", self.name);
                let zero = MeterKeys {
                    confidentiality_key: vec![0u8; 16],
                };
                t = Telegram::new(about.clone());
                t.parse(frame, &zero, reassembler)?;
            }
            Err(e) => return Err(e),
        }

        /* Each telegram produces a fresh value set so that re-decoding
        the same frame always renders the same record. */
        self.numeric_values.clear();
        self.string_values.clear();
        self.tpl_status = t.tpl.as_ref().map(|h| h.sts);

        self.process_field_extractors(&t);
        if let Some(processor) = self.content_processor {
            processor(self, &t);
        }
        self.process_field_calculators();

        self.num_updates += 1;
        Ok(Some(t))
    }

    /// Phase 1 and 2: walk the telegram's records in wire order against
    /// every declared matcher, then run the matcher-less extractors.
    fn process_field_extractors(&mut self, t: &Telegram) {
        let mut sorted: Vec<&DVEntry> = t.dv_entries.iter().filter(|e| !e.flagged).collect();
        sorted.sort_by_key(|e| e.offset);

        let mut founds: HashMap<usize, HashSet<usize>> = HashMap::new();
        /* Offset of every entry some field already consumed, for the
        duplicate-consumption warning. */
        let mut consumed: HashMap<usize, usize> = HashMap::new();

        for index in 0..self.field_infos.len() {
            let fi = self.field_infos[index].clone();
            let matcher = match &fi.matcher {
                Some(m) => m.clone(),
                None => continue,
            };

            let mut current_match_nr = 0usize;
            for dve in &sorted {
                if !matcher.matches(dve) {
                    continue;
                }
                current_match_nr += 1;
                if matcher.index_nr != current_match_nr && !matcher.match_multiple {
                    /* Matched, but the field wants another index. */
                    continue;
                }
                let seen = founds.entry(index).or_default();
                if seen.contains(&dve.offset) && !matcher.match_multiple {
                    warn!(
                        "(meter) ignoring entry {} at offset {}, field {} already extracted",
                        dve.key.as_str(),
                        dve.offset,
                        fi.vname
                    );
                    continue;
                }
                seen.insert(dve.offset);
                if let Some(earlier) = consumed.insert(dve.offset, index) {
                    /* Not fatal, both fields keep their extraction. */
                    warn!(
                        "(meter) entry {} at offset {} matched by both {} and {}",
                        dve.key.as_str(),
                        dve.offset,
                        self.field_infos[earlier].vname,
                        fi.vname
                    );
                }
                self.extract_field(&fi, t, dve);
                if !matcher.match_multiple {
                    break;
                }
            }
        }

        /* Matcher-less fields search for themselves; status fields that
        merge the TPL status must materialize even without a match. */
        for index in 0..self.field_infos.len() {
            let fi = self.field_infos[index].clone();
            if fi.has_formula() {
                continue;
            }
            let matched = founds.get(&index).map(|s| !s.is_empty()).unwrap_or(false);
            if fi.print_properties.includes_tpl_status()
                && !matched
                && !self.string_values.contains_key(&fi.vname)
            {
                self.string_values.insert(
                    fi.vname.clone(),
                    StringField {
                        value: String::new(),
                        field_index: index,
                    },
                );
            }
        }
    }

    /// Extract one matched entry into the value tables.
    fn extract_field(&mut self, fi: &FieldInfo, _t: &Telegram, dve: &DVEntry) {
        let name = fi.field_name(Some(dve));
        debug!(
            "(meter) using field {} to extract {} at offset {}",
            fi.vname,
            dve.key.as_str(),
            dve.offset
        );

        match fi.quantity {
            Quantity::Text => {
                let value = if let Some(lookup) = &fi.lookup {
                    match dve.raw_number(DifSignedness::Unsigned) {
                        Some(v) => lookup.translate(v as u32),
                        None => {
                            warn!("(meter) field {} expected numeric flags", fi.vname);
                            return;
                        }
                    }
                } else if let Some(s) = dve.text() {
                    s
                } else if let Some(v) = dve.raw_number(DifSignedness::Unsigned) {
                    format!("{}", v)
                } else {
                    return;
                };
                self.string_values.insert(
                    name,
                    StringField {
                        value,
                        field_index: fi.index,
                    },
                );
            }
            Quantity::PointInTime => {
                if let Some((secs, _, _)) = dve.timestamp() {
                    self.store_numeric(fi.index, name, fi.display_unit, secs as f64);
                }
            }
            _ => {
                let base = match fi.vif_scaling {
                    VifScaling::Auto => dve.scaled_number(fi.dif_signedness),
                    VifScaling::None => dve.raw_number(fi.dif_signedness),
                };
                let Some(base) = base else {
                    return;
                };
                let mut value = base;
                let mut unit = fi.display_unit;
                if fi.vif_scaling == VifScaling::Auto {
                    if fi.override_conversion {
                        /* Relabel without conversion. */
                        unit = fi.display_unit;
                    } else {
                        value = units::convert_or_warn(value, dve.vif_unit, fi.display_unit);
                    }
                }
                value *= fi.scale;
                self.store_numeric(fi.index, name, unit, value);
            }
        }
    }

    /// Phase 3: formula fields evaluated against the values extracted so
    /// far. A failed formula drops only its own field.
    fn process_field_calculators(&mut self) {
        let mut context = HashMapContext::<DefaultNumericTypes>::new();
        for ((name, unit), nf) in &self.numeric_values {
            let var = format!("{}_{}", name, unit.suffix());
            let _ = context.set_value(var, evalexpr::Value::Float(nf.value));
        }

        for index in 0..self.field_infos.len() {
            let fi = self.field_infos[index].clone();
            let (Some(formula), None) = (&fi.formula, &fi.matcher) else {
                continue;
            };
            match evalexpr::eval_float_with_context(formula, &context) {
                Ok(v) => {
                    let name = fi.field_name(None);
                    let var = format!("{}_{}", name, fi.display_unit.suffix());
                    let _ = context.set_value(var, evalexpr::Value::Float(v));
                    self.store_numeric(index, name, fi.display_unit, v);
                }
                Err(e) => {
                    warn!(
                        "(meter) dropping calculated field {}: {}",
                        fi.vname, e
                    );
                }
            }
        }
    }

    /// Render the value tables for debug logging.
    pub fn debug_values(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for ((name, unit), nf) in &self.numeric_values {
            lines.push(format!("{}_{} = {}", name, unit.suffix(), nf.value));
        }
        for (name, sf) in &self.string_values {
            lines.push(format!("{} = \"{}\"", name, sf.value));
        }
        lines.sort();
        lines.join("\n")
    }
}
