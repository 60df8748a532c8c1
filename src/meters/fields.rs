use crate::records::vif::{VifCombinable, VifRange};
use crate::records::{DVEntry, DifSignedness, DifVifKey, MeasurementType};
use crate::units::{Quantity, Unit};
use log::warn;

/// Whether the VIF decimal exponent is applied to the raw integer before
/// it reaches the field. `None` keeps raw counter values untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifScaling {
    Auto,
    None,
}

pub const PROP_REQUIRED: u32 = 1 << 0;
pub const PROP_HIDDEN: u32 = 1 << 1;
pub const PROP_STATUS: u32 = 1 << 2;
pub const PROP_INCLUDE_TPL_STATUS: u32 = 1 << 3;
pub const PROP_INJECT_INTO_STATUS: u32 = 1 << 4;
pub const PROP_DEPRECATED: u32 = 1 << 5;

/// Bit set steering how a field is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrintProperties(pub u32);

pub const DEFAULT_PRINT_PROPERTIES: PrintProperties = PrintProperties(0);

impl PrintProperties {
    pub fn with(self, bit: u32) -> Self {
        PrintProperties(self.0 | bit)
    }

    pub fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn hidden(&self) -> bool {
        self.has(PROP_HIDDEN)
    }

    pub fn is_status(&self) -> bool {
        self.has(PROP_STATUS)
    }

    pub fn includes_tpl_status(&self) -> bool {
        self.has(PROP_INCLUDE_TPL_STATUS)
    }

    pub fn injects_into_status(&self) -> bool {
        self.has(PROP_INJECT_INTO_STATUS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateType {
    BitToString,
    IndexToString,
}

/// One translation rule mapping numeric values to flag strings.
#[derive(Debug, Clone)]
pub struct FlagRule {
    pub name: String,
    pub kind: TranslateType,
    pub mask: u32,
    pub default_message: String,
    pub map: Vec<(u32, String)>,
}

impl FlagRule {
    pub fn bits(name: &str, mask: u32) -> Self {
        FlagRule {
            name: name.to_string(),
            kind: TranslateType::BitToString,
            mask,
            default_message: "OK".to_string(),
            map: Vec::new(),
        }
    }

    pub fn index(name: &str, mask: u32) -> Self {
        FlagRule {
            name: name.to_string(),
            kind: TranslateType::IndexToString,
            mask,
            default_message: "OK".to_string(),
            map: Vec::new(),
        }
    }

    pub fn add(mut self, value: u32, s: &str) -> Self {
        self.map.push((value, s.to_string()));
        self
    }

    pub fn default_message(mut self, s: &str) -> Self {
        self.default_message = s.to_string();
        self
    }

    fn translate(&self, value: u32) -> String {
        let masked = value & self.mask;
        match self.kind {
            TranslateType::BitToString => {
                let mut flags: Vec<String> = Vec::new();
                let mut unmapped = masked;
                for (bit, name) in &self.map {
                    if masked & bit != 0 {
                        flags.push(name.clone());
                        unmapped &= !bit;
                    }
                }
                if unmapped != 0 {
                    /* Bits inside the mask no rule names. */
                    flags.push(format!("{}_{:X}", self.name, unmapped));
                }
                if flags.is_empty() {
                    return self.default_message.clone();
                }
                flags.join(" ")
            }
            TranslateType::IndexToString => {
                for (v, name) in &self.map {
                    if *v == masked {
                        return name.clone();
                    }
                }
                self.default_message.clone()
            }
        }
    }
}

/// A set of translation rules applied to one numeric value.
#[derive(Debug, Clone, Default)]
pub struct FlagLookup {
    pub rules: Vec<FlagRule>,
}

impl FlagLookup {
    pub fn new() -> Self {
        FlagLookup { rules: Vec::new() }
    }

    pub fn rule(mut self, r: FlagRule) -> Self {
        self.rules.push(r);
        self
    }

    pub fn translate(&self, value: u32) -> String {
        let parts: Vec<String> = self.rules.iter().map(|r| r.translate(value)).collect();
        join_status_ok_strings(&parts)
    }
}

/// Canonical form of a status string: tokens sorted and deduplicated,
/// "OK"/"null" dropped. The empty normalization renders as "OK" at the
/// output layer.
pub fn sort_status_string(s: &str) -> String {
    let mut tokens: Vec<&str> = s
        .split_whitespace()
        .filter(|t| *t != "OK" && *t != "null")
        .collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens.join(" ")
}

/// Join status fragments where a bare "OK" means "nothing to report".
pub fn join_status_ok_strings(parts: &[String]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<String>>()
        .join(" ");
    let normalized = sort_status_string(&joined);
    if normalized.is_empty() {
        return "OK".to_string();
    }
    normalized
}

/// Declarative predicate selecting DVEntries for a field.
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    pub dif_vif_key: Option<DifVifKey>,
    pub measurement_type: MeasurementType,
    pub vif_range: VifRange,
    pub combinables: Vec<VifCombinable>,
    pub storage_nr: (u32, u32),
    pub tariff_nr: (u32, u32),
    pub subunit_nr: (u32, u32),
    /// Which of N sequential matches to accept, 1 based.
    pub index_nr: usize,
    /// One field scoops every matching entry, interpolating the entry's
    /// counters into the field name.
    pub match_multiple: bool,
}

impl FieldMatcher {
    pub fn build() -> Self {
        FieldMatcher {
            dif_vif_key: None,
            measurement_type: MeasurementType::Any,
            vif_range: VifRange::Any,
            combinables: Vec::new(),
            storage_nr: (0, 0),
            tariff_nr: (0, 0),
            subunit_nr: (0, 0),
            index_nr: 1,
            match_multiple: false,
        }
    }

    pub fn set_difvif_key(mut self, key: &str) -> Self {
        self.dif_vif_key = Some(DifVifKey::from_str(key));
        self
    }

    pub fn set_measurement_type(mut self, mt: MeasurementType) -> Self {
        self.measurement_type = mt;
        self
    }

    pub fn set_vif_range(mut self, vr: VifRange) -> Self {
        self.vif_range = vr;
        self
    }

    pub fn add_combinable(mut self, c: VifCombinable) -> Self {
        self.combinables.push(c);
        self
    }

    pub fn set_storage_nr(mut self, from: u32, to: u32) -> Self {
        self.storage_nr = (from, to);
        self
    }

    pub fn set_tariff_nr(mut self, from: u32, to: u32) -> Self {
        self.tariff_nr = (from, to);
        self
    }

    pub fn set_subunit_nr(mut self, from: u32, to: u32) -> Self {
        self.subunit_nr = (from, to);
        self
    }

    pub fn set_index_nr(mut self, nr: usize) -> Self {
        self.index_nr = nr;
        self
    }

    pub fn expect_multiple(mut self) -> Self {
        self.match_multiple = true;
        self
    }

    pub fn matches(&self, dve: &DVEntry) -> bool {
        /* An exact key pins the record outright. */
        if let Some(key) = &self.dif_vif_key {
            return *key == dve.key;
        }

        if self.measurement_type != MeasurementType::Any
            && self.measurement_type != dve.measurement_type
        {
            return false;
        }
        if self.vif_range != VifRange::Any && self.vif_range != dve.vif_range {
            return false;
        }
        for c in &self.combinables {
            if !dve.combinables.contains(c) {
                return false;
            }
        }
        if dve.storage_nr < self.storage_nr.0 || dve.storage_nr > self.storage_nr.1 {
            return false;
        }
        if dve.tariff_nr < self.tariff_nr.0 || dve.tariff_nr > self.tariff_nr.1 {
            return false;
        }
        if dve.subunit_nr < self.subunit_nr.0 || dve.subunit_nr > self.subunit_nr.1 {
            return false;
        }
        true
    }
}

/// One driver-declared output column.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub index: usize,
    /// Variable name, may contain `{storage_counter}`, `{tariff_counter}`
    /// or `{subunit_counter}` placeholders.
    pub vname: String,
    pub quantity: Quantity,
    pub display_unit: Unit,
    pub vif_scaling: VifScaling,
    pub dif_signedness: DifSignedness,
    /// Applied after VIF scaling and unit conversion, for manufacturer
    /// fields without proper VIFs.
    pub scale: f64,
    pub matcher: Option<FieldMatcher>,
    pub help: String,
    pub print_properties: PrintProperties,
    pub lookup: Option<FlagLookup>,
    pub formula: Option<String>,
    /// Relabel instead of convert when wire and display unit disagree
    /// (VARh reported through a Wh VIF and the like).
    pub override_conversion: bool,
}

impl FieldInfo {
    pub fn has_matcher(&self) -> bool {
        self.matcher.is_some()
    }

    pub fn has_formula(&self) -> bool {
        self.formula.is_some()
    }

    /// The concrete output name for a matched entry, with the entry's
    /// counters interpolated into the template.
    pub fn field_name(&self, dve: Option<&DVEntry>) -> String {
        let mut name = self.vname.clone();
        if !name.contains('{') {
            return name;
        }
        match dve {
            Some(dve) => {
                name = name.replace("{storage_counter}", &dve.storage_nr.to_string());
                name = name.replace("{tariff_counter}", &dve.tariff_nr.to_string());
                name = name.replace("{subunit_counter}", &dve.subunit_nr.to_string());
            }
            None => {
                warn!(
                    "(meter) field template \"{}\" used without a matched entry",
                    self.vname
                );
                for placeholder in ["{storage_counter}", "{tariff_counter}", "{subunit_counter}"] {
                    name = name.replace(placeholder, "x");
                }
            }
        }
        name
    }

    /// Output name with the unit suffix appended. Text and point-in-time
    /// fields carry no suffix.
    pub fn field_name_with_unit(&self, dve: Option<&DVEntry>) -> String {
        let name = self.field_name(dve);
        match self.quantity {
            Quantity::Text | Quantity::PointInTime => name,
            _ => format!("{}_{}", name, self.display_unit.suffix()),
        }
    }
}
