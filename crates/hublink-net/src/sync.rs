/*!
 * Full-enumeration sync engine.
 *
 * A sync pass fetches `/api.json` from every stale hub and reconciles the
 * directory with the reply: the yellow pages re-index every advertised
 * function, the white pages drive device arrival, rename, refresh and
 * removal detection. This module owns the reply processing; the request
 * plumbing around it lives in the client.
 */
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::Utc;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use hublink_core::error::{Error, Result};
use hublink_core::types::HardwareId;

use crate::directory::{DeviceEntry, Directory};
use crate::hub::Hub;

/// A queued plug-state change, delivered on explicit request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlugEvent {
    /// A device appeared on a hub
    Arrival(String),
    /// A device's logical name changed
    Rename(String),
    /// A device disappeared; it is forgotten after delivery
    Removal(String),
}

#[derive(Debug, Deserialize)]
struct ApiRoot {
    services: Option<Services>,
    network: Option<NetworkInfo>,
}

#[derive(Debug, Deserialize)]
struct Services {
    #[serde(rename = "whitePages")]
    white_pages: Option<Vec<WhitePageEntry>>,
    #[serde(
        rename = "yellowPages",
        default,
        deserialize_with = "yellow_pages_in_order"
    )]
    yellow_pages: Option<Vec<(String, Vec<YellowPageEntry>)>>,
}

/// Function indexes are assigned in document order, so the yellow pages
/// must keep the order the hub sent; a plain map would shuffle classes
/// between parses
fn yellow_pages_in_order<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Vec<(String, Vec<YellowPageEntry>)>>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PagesVisitor;

    impl<'de> Visitor<'de> for PagesVisitor {
        type Value = Vec<(String, Vec<YellowPageEntry>)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of function classes to yellow-page entries")
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut pages = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry()? {
                pages.push(entry);
            }
            Ok(pages)
        }
    }

    deserializer.deserialize_map(PagesVisitor).map(Some)
}

#[derive(Debug, Deserialize)]
struct WhitePageEntry {
    #[serde(rename = "serialNumber")]
    serial_number: String,
    #[serde(rename = "networkUrl")]
    network_url: String,
    #[serde(rename = "logicalName", default)]
    logical_name: String,
    #[serde(default)]
    beacon: u8,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct YellowPageEntry {
    #[serde(rename = "hardwareId")]
    hardware_id: String,
    #[serde(rename = "logicalName", default)]
    logical_name: String,
    #[serde(rename = "advertisedValue", default)]
    advertised_value: String,
    #[serde(rename = "baseType", default)]
    base_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkInfo {
    #[serde(rename = "adminPassword", default)]
    admin_password: String,
}

/// Reconcile the directory with one hub's enumeration reply
///
/// `queue_arrivals` and `queue_renames` reflect whether the corresponding
/// callbacks are registered; events are only queued when someone will drain
/// them. Devices listed by the hub get their missing flag cleared; removal
/// of the ones still flagged is the caller's decision.
pub fn process_enumeration(
    hub: &mut Hub,
    directory: &mut Directory,
    body: &[u8],
    events: &mut VecDeque<PlugEvent>,
    queue_arrivals: bool,
    queue_renames: bool,
) -> Result<()> {
    let root: ApiRoot = serde_json::from_slice(body)
        .map_err(|e| Error::invalid_argument(format!("Bad enumeration reply: {}", e)))?;
    let services = root
        .services
        .ok_or_else(|| Error::invalid_argument("Enumeration reply lacks services"))?;
    let white_pages = services
        .white_pages
        .ok_or_else(|| Error::invalid_argument("Enumeration reply lacks whitePages"))?;
    let yellow_pages = services
        .yellow_pages
        .ok_or_else(|| Error::invalid_argument("Enumeration reply lacks yellowPages"))?;

    hub.write_protected = root
        .network
        .map(|n| !n.admin_password.is_empty())
        .unwrap_or(false);

    // Re-index advertised functions; a logical-name discrepancy on a known
    // hardware id means the device changed behind our back
    let mut force_refresh: HashSet<String> = HashSet::new();
    let mut functions_by_serial: HashMap<String, Vec<String>> = HashMap::new();
    for (class, entries) in &yellow_pages {
        let index = directory.function_class(class);
        for entry in entries {
            let hwid = HardwareId::parse(&entry.hardware_id)?;
            let serial = hwid.serial().to_string();
            let function_id = hwid.function_id().to_string();
            let discrepancy = index.reindex_function(
                hwid,
                &entry.logical_name,
                Some(&entry.advertised_value),
                entry.base_type.as_deref(),
            );
            if discrepancy {
                force_refresh.insert(serial.clone());
            }
            functions_by_serial.entry(serial).or_default().push(function_id);
        }
    }

    let now = Utc::now();
    for entry in &white_pages {
        let root_url = device_root_url(&hub.url, &entry.network_url);
        if let Some(ydx) = entry.index {
            hub.set_serial_for_ydx(ydx, &entry.serial_number);
        }
        // The hub lists itself with a bare /api URL
        if entry.network_url.trim_end_matches('/') == "/api" {
            hub.serial = Some(entry.serial_number.clone());
        }
        let functions = functions_by_serial
            .remove(&entry.serial_number)
            .unwrap_or_default();

        if directory.device(&entry.serial_number).is_none() {
            info!(serial = %entry.serial_number, url = %root_url, "Device arrival");
            let mut device =
                DeviceEntry::new(&entry.serial_number, &root_url, &entry.logical_name, entry.beacon);
            device.functions = functions;
            directory.insert_device(device);
            if queue_arrivals {
                events.push_back(PlugEvent::Arrival(entry.serial_number.clone()));
            }
            continue;
        }
        let (renamed, moved) = {
            let device = directory
                .device_mut(&entry.serial_number)
                .expect("device known to exist");
            let renamed = device.logical_name != entry.logical_name;
            let moved = device.root_url != root_url;
            if moved || renamed || device.beacon != entry.beacon
                || force_refresh.contains(&entry.serial_number)
            {
                debug!(serial = %entry.serial_number, "Refreshing device state");
                device.beacon = entry.beacon;
                device.drop_cache();
            }
            device.functions = functions;
            device.last_seen = now;
            device.missing = false;
            (renamed, moved)
        };
        if moved {
            directory.move_device(&entry.serial_number, &root_url);
        }
        if renamed {
            directory.rename_device(&entry.serial_number, &entry.logical_name);
            if queue_renames {
                events.push_back(PlugEvent::Rename(entry.serial_number.clone()));
            }
        }
    }
    Ok(())
}

/// Compute a device root URL, prefixing hub-relative paths
fn device_root_url(hub_url: &str, network_url: &str) -> String {
    let mut url = if network_url.contains("://") {
        network_url.to_string()
    } else {
        format!("{}{}", hub_url, network_url.trim_start_matches('/'))
    };
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    const HUB_URL: &str = "http://192.168.1.20:4444/";

    fn hub() -> Hub {
        Hub::new("192.168.1.20", "", "", false).unwrap()
    }

    fn enumeration() -> Vec<u8> {
        serde_json::json!({
            "services": {
                "whitePages": [
                    {
                        "serialNumber": "HUBETH01-A1B2C",
                        "networkUrl": "/api",
                        "logicalName": "lab-hub",
                        "beacon": 0,
                        "index": 0
                    },
                    {
                        "serialNumber": "THRMSTR1-32DD7",
                        "networkUrl": "/bySerial/THRMSTR1-32DD7/api",
                        "logicalName": "probe",
                        "beacon": 0,
                        "index": 1
                    }
                ],
                "yellowPages": {
                    "Temperature": [
                        {
                            "hardwareId": "THRMSTR1-32DD7.temperature1",
                            "logicalName": "oven",
                            "advertisedValue": "26.05",
                            "baseType": "Sensor"
                        }
                    ]
                }
            },
            "network": { "adminPassword": "secret" }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_enumeration_populates_directory() {
        let mut hub = hub();
        let mut dir = Directory::new();
        let mut events = VecDeque::new();

        process_enumeration(&mut hub, &mut dir, &enumeration(), &mut events, true, true).unwrap();

        assert!(hub.write_protected);
        assert_eq!(hub.serial.as_deref(), Some("HUBETH01-A1B2C"));
        assert_eq!(hub.serial_for_ydx(1), Some("THRMSTR1-32DD7"));

        let device = dir.device("THRMSTR1-32DD7").unwrap();
        assert_eq!(device.logical_name, "probe");
        assert_eq!(
            device.root_url,
            format!("{}bySerial/THRMSTR1-32DD7/api/", HUB_URL)
        );
        assert_eq!(device.functions, vec!["temperature1"]);

        let index = dir.class_index("Temperature").unwrap();
        let record = index.get("THRMSTR1-32DD7.temperature1").unwrap();
        assert_eq!(record.value, "26.05");
        assert_eq!(record.base_type, "Sensor");
        assert_eq!(index.resolve("oven").unwrap().as_str(), "THRMSTR1-32DD7.temperature1");

        assert_eq!(
            events,
            VecDeque::from(vec![
                PlugEvent::Arrival("HUBETH01-A1B2C".to_string()),
                PlugEvent::Arrival("THRMSTR1-32DD7".to_string()),
            ])
        );
    }

    #[test]
    fn test_second_pass_is_stable() {
        let mut hub = hub();
        let mut dir = Directory::new();
        let mut events = VecDeque::new();

        process_enumeration(&mut hub, &mut dir, &enumeration(), &mut events, true, true).unwrap();
        events.clear();

        dir.mark_missing_under(HUB_URL);
        process_enumeration(&mut hub, &mut dir, &enumeration(), &mut events, true, true).unwrap();

        assert!(events.is_empty());
        assert!(dir.still_missing_under(HUB_URL).is_empty());
    }

    #[test]
    fn test_rename_queues_event_and_drops_cache() {
        let mut hub = hub();
        let mut dir = Directory::new();
        let mut events = VecDeque::new();
        process_enumeration(&mut hub, &mut dir, &enumeration(), &mut events, false, true).unwrap();
        events.clear();

        let renamed = String::from_utf8(enumeration())
            .unwrap()
            .replace("\"probe\"", "\"kiln\"");
        process_enumeration(&mut hub, &mut dir, renamed.as_bytes(), &mut events, false, true)
            .unwrap();

        assert_eq!(
            events,
            VecDeque::from(vec![PlugEvent::Rename("THRMSTR1-32DD7".to_string())])
        );
        let device = dir.device("THRMSTR1-32DD7").unwrap();
        assert_eq!(device.logical_name, "kiln");
        assert!(device.api_cache.is_none());
        assert!(dir.device_by_ident("kiln").is_some());
        assert!(dir.device_by_ident("probe").is_none());
    }

    #[test]
    fn test_function_name_discrepancy_forces_refresh() {
        let mut hub = hub();
        let mut dir = Directory::new();
        let mut events = VecDeque::new();
        process_enumeration(&mut hub, &mut dir, &enumeration(), &mut events, false, false)
            .unwrap();

        // Simulate a stale cache on the device, then change the function name
        let marker = serde_json::json!({"cached": true});
        dir.device_mut("THRMSTR1-32DD7").unwrap().api_cache =
            Some((marker, std::time::Instant::now()));
        let changed = String::from_utf8(enumeration())
            .unwrap()
            .replace("\"oven\"", "\"kiln\"");
        process_enumeration(&mut hub, &mut dir, changed.as_bytes(), &mut events, false, false)
            .unwrap();

        let device = dir.device("THRMSTR1-32DD7").unwrap();
        assert!(device.api_cache.is_none());
        let index = dir.class_index("Temperature").unwrap();
        assert_eq!(index.resolve("kiln").unwrap().as_str(), "THRMSTR1-32DD7.temperature1");
    }

    #[test]
    fn test_function_indexes_follow_document_order() {
        let body = br#"{
            "services": {
                "whitePages": [
                    {
                        "serialNumber": "MLTISNS1-77A01",
                        "networkUrl": "/bySerial/MLTISNS1-77A01/api",
                        "logicalName": "rig",
                        "beacon": 0,
                        "index": 0
                    }
                ],
                "yellowPages": {
                    "DataLogger": [
                        {"hardwareId": "MLTISNS1-77A01.dataLogger", "advertisedValue": "ON"}
                    ],
                    "Files": [
                        {"hardwareId": "MLTISNS1-77A01.files", "advertisedValue": "12"}
                    ],
                    "Temperature": [
                        {"hardwareId": "MLTISNS1-77A01.temperature1", "advertisedValue": "21.0"}
                    ],
                    "Voltage": [
                        {"hardwareId": "MLTISNS1-77A01.voltage1", "advertisedValue": "230.0"},
                        {"hardwareId": "MLTISNS1-77A01.voltage2", "advertisedValue": "12.0"}
                    ]
                }
            }
        }"#;

        // The funydx table routes tiny notifications, so it must come out
        // identical on every parse of the same reply
        for _ in 0..32 {
            let mut hub = hub();
            let mut dir = Directory::new();
            let mut events = VecDeque::new();
            process_enumeration(&mut hub, &mut dir, body, &mut events, false, false).unwrap();
            let device = dir.device("MLTISNS1-77A01").unwrap();
            assert_eq!(
                device.functions,
                vec!["dataLogger", "files", "temperature1", "voltage1", "voltage2"]
            );
        }
    }

    #[test]
    fn test_missing_pages_fail() {
        let mut hub = hub();
        let mut dir = Directory::new();
        let mut events = VecDeque::new();
        let body = br#"{"services": {"whitePages": []}}"#;
        let err = process_enumeration(&mut hub, &mut dir, body, &mut events, false, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(process_enumeration(&mut hub, &mut dir, b"not json", &mut events, false, false)
            .is_err());
    }
}
