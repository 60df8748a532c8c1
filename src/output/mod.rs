use crate::meters::Meter;
use crate::telegram::{media_name, Telegram};
use crate::units::{Quantity, Unit};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

fn iso_utc(secs: u64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap());
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn number_value(v: f64) -> Value {
    match serde_json::Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None => Value::Null,
    }
}

fn render_point_in_time(secs: f64, unit: Unit) -> Value {
    if !secs.is_finite() {
        return Value::Null;
    }
    let dt = match Utc.timestamp_opt(secs as i64, 0).single() {
        Some(dt) => dt,
        None => return Value::Null,
    };
    match unit {
        Unit::DateLT => Value::String(dt.format("%Y-%m-%d").to_string()),
        Unit::DateTimeLT => Value::String(dt.format("%Y-%m-%d %H:%M").to_string()),
        _ => Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}

/// Render one decoded telegram as the canonical JSON-like record.
///
/// Key order is alphabetical (the map is sorted), so re-rendering the
/// same decode always produces identical bytes.
pub fn render_json(m: &Meter, t: &Telegram) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("_".to_string(), Value::String("telegram".to_string()));
    out.insert("meter".to_string(), Value::String(m.driver_name.clone()));
    out.insert("name".to_string(), Value::String(m.name.clone()));

    if let Some(a) = t.address() {
        out.insert(
            "media".to_string(),
            Value::String(media_name(a.device_type, a.mfct).to_string()),
        );
        out.insert("id".to_string(), Value::String(a.render(m.identity_mode)));
    }

    for fi in &m.field_infos {
        if fi.print_properties.hidden() || fi.print_properties.injects_into_status() {
            continue;
        }

        if fi.quantity == Quantity::Text {
            let key = fi.field_name(None);
            match m.get_string_value(fi) {
                Some(s) => out.insert(key, Value::String(s)),
                None => out.insert(key, Value::Null),
            };
            continue;
        }

        /* One FieldInfo may have produced several values when its matcher
        scooped multiple entries; render each stored name. */
        let mut rendered_any = false;
        for ((name, unit), nf) in &m.numeric_values {
            if nf.field_index != fi.index {
                continue;
            }
            rendered_any = true;
            if fi.quantity == Quantity::PointInTime {
                out.insert(name.clone(), render_point_in_time(nf.value, *unit));
            } else {
                out.insert(format!("{}_{}", name, unit.suffix()), number_value(nf.value));
            }
        }
        if !rendered_any {
            out.insert(fi.field_name_with_unit(None), Value::Null);
        }
    }

    for (k, v) in &m.extra_constant_fields {
        out.insert(k.clone(), Value::String(v.clone()));
    }

    if !t.about.device.is_empty() {
        out.insert("device".to_string(), Value::String(t.about.device.clone()));
        out.insert("rssi_dbm".to_string(), Value::from(t.about.rssi_dbm));
    }

    out.insert(
        "timestamp".to_string(),
        Value::String(iso_utc(t.about.timestamp)),
    );
    out
}

pub fn render_json_string(m: &Meter, t: &Telegram) -> String {
    Value::Object(render_json(m, t)).to_string()
}

fn value_to_plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Flat projection: the selected fields joined by a separator, in the
/// configured order. Unknown field names render empty.
pub fn render_flat(m: &Meter, record: &Map<String, Value>, separator: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for name in &m.selected_fields {
        match record.get(name) {
            Some(v) => parts.push(value_to_plain(v)),
            None => parts.push(String::new()),
        }
    }
    parts.join(separator)
}

/// Environment projection: KEY=value bindings for shell consumers.
pub fn render_env(m: &Meter, record: &Map<String, Value>) -> Vec<String> {
    let mut envs: Vec<String> = Vec::new();

    if let Some(id) = record.get("id") {
        envs.push(format!("METER_ID={}", value_to_plain(id)));
    }
    envs.push(format!("METER_NAME={}", m.name));
    envs.push(format!("METER_TYPE={}", m.driver_name));
    if let Some(media) = record.get("media") {
        envs.push(format!("METER_MEDIA={}", value_to_plain(media)));
    }
    if let Some(ts) = record.get("timestamp") {
        envs.push(format!("METER_TIMESTAMP={}", value_to_plain(ts)));
    }
    envs.push(format!(
        "METER_JSON={}",
        Value::Object(record.clone()).to_string()
    ));

    for (key, value) in record {
        if matches!(
            key.as_str(),
            "_" | "meter" | "name" | "id" | "media" | "timestamp" | "device" | "rssi_dbm"
        ) {
            continue;
        }
        envs.push(format!(
            "METER_{}={}",
            key.to_uppercase(),
            value_to_plain(value)
        ));
    }

    for (k, v) in &m.extra_constant_fields {
        let key = format!("METER_{}", k.to_uppercase());
        if !envs.iter().any(|e| e.starts_with(&key)) {
            envs.push(format!("{}={}", key, v));
        }
    }

    envs
}

#[cfg(test)]
mod output_tests {
    use super::*;
    use crate::drivers;
    use crate::meters::fields::{
        FieldMatcher, FlagLookup, FlagRule, DEFAULT_PRINT_PROPERTIES, PROP_INCLUDE_TPL_STATUS,
        PROP_STATUS,
    };
    use crate::meters::{DriverInfo, Meter, MeterInfo, MeterType, Registry};
    use crate::records::vif::VifRange;
    use crate::records::MeasurementType;
    use crate::telegram::ell::AflReassembler;
    use crate::telegram::AboutTelegram;

    const SUPERCOM_TELEGRAM: &str =
        "A244EE4D785634123C067A8F0000000C1348550000426CE1F14C13000000008204\
6C21298C0413330000008D04931E3A3CFE33000000330000003300000033000000330000003300000033000000330000\
00330000003300000033000000330000004300000034180000046D0D0B5C2B03FD6C5E150082206C5C290BFD0F020001\
8C4079678885238310FD3100000082106C01018110FD610002FD66020002FD170000";

    fn supercom_meter() -> Meter {
        let mut reg = Registry::new();
        drivers::register_all(&mut reg).unwrap();
        let di = reg.lookup("supercom587").unwrap();
        let mi = MeterInfo {
            name: "MyWarmWater".to_string(),
            driver: "supercom587".to_string(),
            address_expressions: vec!["12345678".to_string()],
            key: "NOKEY".to_string(),
            extra_constant_fields: vec!["floor=3".to_string()],
            ..Default::default()
        };
        Meter::create(&mi, di).unwrap()
    }

    fn decode(m: &mut Meter, hex_frame: &str, about: AboutTelegram) -> Telegram {
        let frame = hex::decode(hex_frame).unwrap();
        let mut r = AflReassembler::new(4, 60);
        m.handle_telegram(&about, &frame, &mut r).unwrap().unwrap()
    }

    #[test]
    fn supercom_json_record() {
        let mut m = supercom_meter();
        let about = AboutTelegram {
            device: "sx1262".to_string(),
            rssi_dbm: -77,
            timestamp: 1234567890,
            link_mode: None,
        };
        let t = decode(&mut m, SUPERCOM_TELEGRAM, about);
        let record = render_json(&m, &t);

        assert_eq!(record["_"], "telegram");
        assert_eq!(record["media"], "warm water");
        assert_eq!(record["meter"], "supercom587");
        assert_eq!(record["name"], "MyWarmWater");
        assert_eq!(record["id"], "12345678");
        assert_eq!(record["total_m3"], 5.548);
        assert_eq!(record["software_version"], "010002");
        assert_eq!(record["status"], "OK");
        assert_eq!(record["floor"], "3");
        assert_eq!(record["device"], "sx1262");
        assert_eq!(record["rssi_dbm"], -77);
        assert_eq!(record["timestamp"], "2009-02-13T23:31:30Z");
    }

    #[test]
    fn re_decoding_is_byte_identical() {
        let about = AboutTelegram {
            timestamp: 1600000000,
            ..Default::default()
        };
        let mut m1 = supercom_meter();
        let t1 = decode(&mut m1, SUPERCOM_TELEGRAM, about.clone());
        let first = render_json_string(&m1, &t1);

        let mut m2 = supercom_meter();
        let t2 = decode(&mut m2, SUPERCOM_TELEGRAM, about);
        let second = render_json_string(&m2, &t2);
        assert_eq!(first, second);
    }

    #[test]
    fn flat_projection_follows_selected_fields() {
        let mut m = supercom_meter();
        m.selected_fields = vec![
            "name".to_string(),
            "id".to_string(),
            "total_m3".to_string(),
        ];
        let t = decode(&mut m, SUPERCOM_TELEGRAM, AboutTelegram::default());
        let record = render_json(&m, &t);
        assert_eq!(render_flat(&m, &record, ";"), "MyWarmWater;12345678;5.548");
    }

    #[test]
    fn env_projection() {
        let mut m = supercom_meter();
        let t = decode(&mut m, SUPERCOM_TELEGRAM, AboutTelegram::default());
        let record = render_json(&m, &t);
        let envs = render_env(&m, &record);

        assert!(envs.contains(&"METER_ID=12345678".to_string()));
        assert!(envs.contains(&"METER_NAME=MyWarmWater".to_string()));
        assert!(envs.contains(&"METER_TYPE=supercom587".to_string()));
        assert!(envs.contains(&"METER_MEDIA=warm water".to_string()));
        assert!(envs.contains(&"METER_TOTAL_M3=5.548".to_string()));
        assert!(envs.contains(&"METER_STATUS=OK".to_string()));
        assert!(envs.iter().any(|e| e.starts_with("METER_JSON={")));
    }

    fn leak_driver(m: &mut Meter) {
        m.add_string_field_with_extractor_and_lookup(
            "status",
            "Status of meter.",
            DEFAULT_PRINT_PROPERTIES
                .with(PROP_STATUS)
                .with(PROP_INCLUDE_TPL_STATUS),
            FieldMatcher::build()
                .set_measurement_type(MeasurementType::Instantaneous)
                .set_vif_range(VifRange::ErrorFlags),
            FlagLookup::new().rule(
                FlagRule::bits("ERROR_FLAGS", 0x00FF)
                    .add(0x01, "LEAK")
                    .add(0x02, "BURST"),
            ),
        );
    }

    #[test]
    fn status_merges_driver_and_tpl_flags() {
        let di = DriverInfo::new("leakwater", MeterType::WaterMeter, leak_driver)
            .set_mfct_tpl_status_bits(
                FlagLookup::new().rule(FlagRule::bits("TPL", 0xFF).add(0x04, "BATTERY_LOW")),
            );
        let mi = MeterInfo {
            name: "Wet".to_string(),
            driver: "leakwater".to_string(),
            address_expressions: vec!["12345678".to_string()],
            ..Default::default()
        };
        let mut m = Meter::create(&mi, &di).unwrap();

        /* TPL status 0x04, error flags 0x03. */
        let t = decode(
            &mut m,
            "A244EE4D785634123C067A8F04000002FD170300",
            AboutTelegram::default(),
        );
        let record = render_json(&m, &t);
        assert_eq!(record["status"], "BATTERY_LOW BURST LEAK");
    }

    #[test]
    fn empty_telegram_renders_ok_status() {
        /* Header only, no records at all. */
        let mut m = supercom_meter();
        let t = decode(&mut m, "A244EE4D785634123C067A8F000000", AboutTelegram::default());
        assert!(t.dv_entries.is_empty());
        let record = render_json(&m, &t);
        assert_eq!(record["status"], "OK");
        assert_eq!(record["total_m3"], Value::Null);
    }
}
