/*!
 * Device directory and function-type indexes.
 *
 * The directory is the client's view of every device reachable through the
 * registered hubs: one [`DeviceEntry`] per serial number, plus one
 * [`FunctionTypeIndex`] per discovered function class mapping hardware ids
 * and logical names to their advertised state. It is a pure data container;
 * the sync engine and notification decoder feed it.
 */
use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};

use hublink_core::error::{Error, Result};
use hublink_core::types::HardwareId;

/// One function advertised by a device
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRecord {
    /// Fully-qualified hardware id
    pub hwid: HardwareId,
    /// User-assigned logical name, empty if unset
    pub logical_name: String,
    /// Last advertised value
    pub value: String,
    /// Abstract base type, empty when the class is its own base
    pub base_type: String,
}

/// Index of every known function of one class
#[derive(Debug, Default)]
pub struct FunctionTypeIndex {
    records: Vec<FunctionRecord>,
    by_hwid: HashMap<String, usize>,
    hwid_by_name: HashMap<String, String>,
}

impl FunctionTypeIndex {
    /// (Re)index a function, returning whether an existing record disagreed
    /// on the logical name
    pub fn reindex_function(
        &mut self,
        hwid: HardwareId,
        logical_name: &str,
        value: Option<&str>,
        base_type: Option<&str>,
    ) -> bool {
        match self.by_hwid.get(hwid.as_str()) {
            Some(&pos) => {
                let record = &mut self.records[pos];
                let discrepancy = record.logical_name != logical_name;
                if discrepancy {
                    self.hwid_by_name.remove(&record.logical_name);
                    record.logical_name = logical_name.to_string();
                }
                if let Some(value) = value {
                    record.value = value.to_string();
                }
                if let Some(base_type) = base_type {
                    record.base_type = base_type.to_string();
                }
                if !logical_name.is_empty() {
                    self.hwid_by_name
                        .insert(logical_name.to_string(), hwid.as_str().to_string());
                }
                discrepancy
            }
            None => {
                if !logical_name.is_empty() {
                    self.hwid_by_name
                        .insert(logical_name.to_string(), hwid.as_str().to_string());
                }
                self.by_hwid
                    .insert(hwid.as_str().to_string(), self.records.len());
                self.records.push(FunctionRecord {
                    hwid,
                    logical_name: logical_name.to_string(),
                    value: value.unwrap_or("").to_string(),
                    base_type: base_type.unwrap_or("").to_string(),
                });
                false
            }
        }
    }

    /// Update the advertised value of a function
    pub fn set_value(&mut self, hwid: &str, value: &str) -> bool {
        match self.by_hwid.get(hwid) {
            Some(&pos) => {
                self.records[pos].value = value.to_string();
                true
            }
            None => false,
        }
    }

    /// Look up a record by hardware id
    pub fn get(&self, hwid: &str) -> Option<&FunctionRecord> {
        self.by_hwid.get(hwid).map(|&pos| &self.records[pos])
    }

    /// Resolve a hardware id or logical name to a hardware id
    pub fn resolve(&self, ident: &str) -> Option<&HardwareId> {
        if let Some(&pos) = self.by_hwid.get(ident) {
            return Some(&self.records[pos].hwid);
        }
        let hwid = self.hwid_by_name.get(ident)?;
        self.by_hwid.get(hwid).map(|&pos| &self.records[pos].hwid)
    }

    /// First indexed hardware id, in discovery order
    pub fn first_hardware_id(&self) -> Option<&HardwareId> {
        self.records.first().map(|r| &r.hwid)
    }

    /// Hardware id following `current` in discovery order
    pub fn next_hardware_id(&self, current: &str) -> Option<&HardwareId> {
        let pos = *self.by_hwid.get(current)?;
        self.records.get(pos + 1).map(|r| &r.hwid)
    }

    /// Number of indexed functions
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record belonging to a device
    fn remove_device(&mut self, serial: &str) {
        let removed: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.hwid.serial() == serial)
            .map(|r| r.hwid.as_str().to_string())
            .collect();
        if removed.is_empty() {
            return;
        }
        self.records.retain(|r| r.hwid.serial() != serial);
        self.by_hwid.clear();
        for (pos, record) in self.records.iter().enumerate() {
            self.by_hwid.insert(record.hwid.as_str().to_string(), pos);
        }
        self.hwid_by_name
            .retain(|_, hwid| !removed.contains(hwid));
    }
}

/// One known device
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// Serial number, the primary key
    pub serial: String,
    /// Root URL of the device, hub-prefixed
    pub root_url: String,
    /// User-assigned logical name, empty if unset
    pub logical_name: String,
    /// Localization beacon state
    pub beacon: u8,
    /// Function ids in notification index order
    pub functions: Vec<String>,
    /// Cached attribute snapshot and its expiry
    pub api_cache: Option<(serde_json::Value, Instant)>,
    /// Device UTC time of the last time reference, seconds with fraction
    pub time_ref: f64,
    /// Interval covered by timed reports, seconds
    pub report_duration: f64,
    /// Whether the device has log content waiting to be pulled
    pub log_pending: bool,
    /// When the device was first enumerated
    pub first_seen: DateTime<Utc>,
    /// When the device was last confirmed by an enumeration
    pub last_seen: DateTime<Utc>,
    /// Set at the start of a sync pass, cleared when the hub lists the device
    pub missing: bool,
}

impl DeviceEntry {
    /// Create a fresh entry for a newly enumerated device
    pub fn new(serial: &str, root_url: &str, logical_name: &str, beacon: u8) -> Self {
        let now = Utc::now();
        Self {
            serial: serial.to_string(),
            root_url: root_url.to_string(),
            logical_name: logical_name.to_string(),
            beacon,
            functions: Vec::new(),
            api_cache: None,
            time_ref: 0.0,
            report_duration: 0.0,
            log_pending: false,
            first_seen: now,
            last_seen: now,
            missing: false,
        }
    }

    /// Number of advertised functions
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Function id at a position in enumeration order
    pub fn function_id(&self, i: usize) -> Option<&str> {
        self.functions.get(i).map(String::as_str)
    }

    /// Function id for a tiny-notification function index
    ///
    /// Notification indexes follow enumeration order, so the two lookups
    /// coincide.
    pub fn function_id_by_ydx(&self, ydx: usize) -> Option<&str> {
        self.function_id(ydx)
    }

    /// Invalidate the cached attribute snapshot
    pub fn drop_cache(&mut self) {
        self.api_cache = None;
    }
}

/// The client's directory of devices and function classes
#[derive(Debug, Default)]
pub struct Directory {
    devices: HashMap<String, DeviceEntry>,
    serial_by_url: HashMap<String, String>,
    serial_by_name: HashMap<String, String>,
    classes: Vec<String>,
    indexes: HashMap<String, FunctionTypeIndex>,
}

impl Directory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Access a function-class index, creating it on first sight
    ///
    /// Idempotent and independent of any registered hub.
    pub fn function_class(&mut self, class: &str) -> &mut FunctionTypeIndex {
        if !self.indexes.contains_key(class) {
            self.classes.push(class.to_string());
            self.indexes.insert(class.to_string(), FunctionTypeIndex::default());
        }
        self.indexes.get_mut(class).expect("index just inserted")
    }

    /// Read-only access to a function-class index
    pub fn class_index(&self, class: &str) -> Option<&FunctionTypeIndex> {
        self.indexes.get(class)
    }

    /// Discovered class names, in discovery order
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Insert or replace a device entry
    pub fn insert_device(&mut self, entry: DeviceEntry) {
        self.serial_by_url
            .insert(entry.root_url.clone(), entry.serial.clone());
        if !entry.logical_name.is_empty() {
            self.serial_by_name
                .insert(entry.logical_name.clone(), entry.serial.clone());
        }
        self.devices.insert(entry.serial.clone(), entry);
    }

    /// Look up a device by serial
    pub fn device(&self, serial: &str) -> Option<&DeviceEntry> {
        self.devices.get(serial)
    }

    /// Mutable device lookup by serial
    pub fn device_mut(&mut self, serial: &str) -> Option<&mut DeviceEntry> {
        self.devices.get_mut(serial)
    }

    /// Look up a device by serial or logical name
    pub fn device_by_ident(&self, ident: &str) -> Option<&DeviceEntry> {
        if let Some(entry) = self.devices.get(ident) {
            return Some(entry);
        }
        let serial = self.serial_by_name.get(ident)?;
        self.devices.get(serial)
    }

    /// Serial of the device rooted at a URL
    pub fn serial_by_url(&self, url: &str) -> Option<&str> {
        self.serial_by_url.get(url).map(String::as_str)
    }

    /// Iterate over every known device
    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    /// Serials of devices whose root URL starts with `url_prefix`
    pub fn serials_under(&self, url_prefix: &str) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.root_url.starts_with(url_prefix))
            .map(|d| d.serial.clone())
            .collect()
    }

    /// Record a device's logical name change in the name lookup map
    pub fn rename_device(&mut self, serial: &str, new_name: &str) {
        if let Some(entry) = self.devices.get_mut(serial) {
            if !entry.logical_name.is_empty() {
                self.serial_by_name.remove(&entry.logical_name);
            }
            entry.logical_name = new_name.to_string();
            if !new_name.is_empty() {
                self.serial_by_name
                    .insert(new_name.to_string(), serial.to_string());
            }
        }
    }

    /// Record a device's root URL change, keeping the URL lookup map in step
    pub fn move_device(&mut self, serial: &str, new_url: &str) {
        if let Some(entry) = self.devices.get_mut(serial) {
            self.serial_by_url.remove(&entry.root_url);
            entry.root_url = new_url.to_string();
            self.serial_by_url
                .insert(new_url.to_string(), serial.to_string());
        }
    }

    /// Forget a device and every function it carried
    pub fn remove_device(&mut self, serial: &str) {
        if let Some(entry) = self.devices.remove(serial) {
            self.serial_by_url.remove(&entry.root_url);
            if !entry.logical_name.is_empty() {
                self.serial_by_name.remove(&entry.logical_name);
            }
        }
        for index in self.indexes.values_mut() {
            index.remove_device(serial);
        }
    }

    /// Resolve an identifier within one function class
    ///
    /// Accepts a hardware id, a `serial.functionId` with a logical device
    /// name in place of the serial, or a bare logical function name.
    pub fn resolve(&self, class: &str, ident: &str) -> Result<HardwareId> {
        let index = self
            .indexes
            .get(class)
            .ok_or_else(|| Error::device_not_found(format!("No {} function found", class)))?;
        if let Some(hwid) = index.resolve(ident) {
            return Ok(hwid.clone());
        }
        // Dotted form with a device logical name on the left
        if let Some((dev_ident, func_part)) = ident.split_once('.') {
            if let Some(entry) = self.device_by_ident(dev_ident) {
                let hwid = HardwareId::new(&entry.serial, func_part);
                if let Some(found) = index.resolve(hwid.as_str()) {
                    return Ok(found.clone());
                }
            }
        }
        Err(Error::device_not_found(format!(
            "No {} function matches {}",
            class, ident
        )))
    }

    /// Resolve an identifier against every class sharing an abstract base
    /// type, in class discovery order; first match wins
    pub fn resolve_base_type(&self, base_type: &str, ident: &str) -> Result<HardwareId> {
        for class in &self.classes {
            let index = &self.indexes[class];
            let matches_base = index
                .first_hardware_id()
                .and_then(|hwid| index.get(hwid.as_str()))
                .map(|r| r.base_type == base_type)
                .unwrap_or(false);
            if !matches_base {
                continue;
            }
            if let Ok(hwid) = self.resolve(class, ident) {
                return Ok(hwid);
            }
        }
        Err(Error::device_not_found(format!(
            "No {} matches {}",
            base_type, ident
        )))
    }

    /// Mark every device under a hub as tentatively missing
    pub fn mark_missing_under(&mut self, url_prefix: &str) {
        for entry in self.devices.values_mut() {
            if entry.root_url.starts_with(url_prefix) {
                entry.missing = true;
            }
        }
    }

    /// Serials still flagged missing under a hub after a sync pass
    pub fn still_missing_under(&self, url_prefix: &str) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.missing && d.root_url.starts_with(url_prefix))
            .map(|d| d.serial.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hwid(s: &str) -> HardwareId {
        HardwareId::parse(s).unwrap()
    }

    #[test]
    fn test_reindex_reports_name_discrepancy() {
        let mut index = FunctionTypeIndex::default();
        let id = hwid("THRMSTR1-32DD7.temperature1");
        assert!(!index.reindex_function(id.clone(), "probe", Some("21.0"), None));
        assert!(!index.reindex_function(id.clone(), "probe", Some("21.5"), None));
        assert!(index.reindex_function(id.clone(), "oven", None, None));
        assert_eq!(index.resolve("oven"), Some(&id));
        assert_eq!(index.resolve("probe"), None);
        assert_eq!(index.get(id.as_str()).unwrap().value, "21.5");
    }

    #[test]
    fn test_discovery_order_iteration() {
        let mut index = FunctionTypeIndex::default();
        index.reindex_function(hwid("A.relay1"), "", None, None);
        index.reindex_function(hwid("B.relay1"), "", None, None);
        index.reindex_function(hwid("B.relay2"), "", None, None);
        let first = index.first_hardware_id().unwrap().clone();
        assert_eq!(first.as_str(), "A.relay1");
        let second = index.next_hardware_id(first.as_str()).unwrap().clone();
        assert_eq!(second.as_str(), "B.relay1");
        let third = index.next_hardware_id(second.as_str()).unwrap().clone();
        assert_eq!(third.as_str(), "B.relay2");
        assert_eq!(index.next_hardware_id(third.as_str()), None);
    }

    #[test]
    fn test_lazy_class_creation_is_idempotent() {
        let mut dir = Directory::new();
        dir.function_class("Temperature");
        dir.function_class("Relay");
        dir.function_class("Temperature");
        assert_eq!(dir.classes(), &["Temperature", "Relay"]);
    }

    #[test]
    fn test_remove_device_strips_functions() {
        let mut dir = Directory::new();
        dir.insert_device(DeviceEntry::new("A", "http://h:4444/a/", "alpha", 0));
        dir.insert_device(DeviceEntry::new("B", "http://h:4444/b/", "", 0));
        let index = dir.function_class("Relay");
        index.reindex_function(hwid("A.relay1"), "door", None, None);
        index.reindex_function(hwid("B.relay1"), "", None, None);

        dir.remove_device("A");
        assert!(dir.device("A").is_none());
        assert!(dir.device_by_ident("alpha").is_none());
        let index = dir.class_index("Relay").unwrap();
        assert!(index.get("A.relay1").is_none());
        assert_eq!(index.resolve("door"), None);
        assert_eq!(index.first_hardware_id().unwrap().as_str(), "B.relay1");
    }

    #[test]
    fn test_resolve_logical_device_name() {
        let mut dir = Directory::new();
        dir.insert_device(DeviceEntry::new("SERIAL42", "http://h:4444/x/", "lab", 0));
        dir.function_class("Temperature").reindex_function(
            hwid("SERIAL42.temperature1"),
            "",
            None,
            None,
        );
        let found = dir.resolve("Temperature", "lab.temperature1").unwrap();
        assert_eq!(found.as_str(), "SERIAL42.temperature1");
        assert!(dir.resolve("Temperature", "nowhere.temperature1").is_err());
    }

    #[test]
    fn test_resolve_base_type_first_match() {
        let mut dir = Directory::new();
        dir.function_class("Temperature").reindex_function(
            hwid("A.temperature1"),
            "",
            None,
            Some("Sensor"),
        );
        dir.function_class("Voltage").reindex_function(
            hwid("B.voltage1"),
            "vin",
            None,
            Some("Sensor"),
        );
        let found = dir.resolve_base_type("Sensor", "vin").unwrap();
        assert_eq!(found.as_str(), "B.voltage1");
        assert!(dir.resolve_base_type("Sensor", "nothing").is_err());
    }

    #[test]
    fn test_missing_flags() {
        let mut dir = Directory::new();
        dir.insert_device(DeviceEntry::new("A", "http://h:4444/a/", "", 0));
        dir.insert_device(DeviceEntry::new("B", "http://other:4444/b/", "", 0));
        dir.mark_missing_under("http://h:4444/");
        assert_eq!(dir.still_missing_under("http://h:4444/"), vec!["A"]);
        dir.device_mut("A").unwrap().missing = false;
        assert!(dir.still_missing_under("http://h:4444/").is_empty());
        assert!(!dir.device("B").unwrap().missing);
    }
}
