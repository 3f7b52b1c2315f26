/*!
 * Client context facade.
 *
 * [`HubClient`] owns the whole runtime state: registered hubs, the device
 * directory, the pending-request scheduler and the queued plug events. All
 * methods take `&mut self`; the library is driven from a single execution
 * context and every wait is a bounded cooperative pump of the scheduler.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use hublink_core::config::{Config, SharedConfig};
use hublink_core::error::{Error, Result};
use hublink_core::types::HardwareId;

use crate::directory::{DeviceEntry, Directory};
use crate::hub::{Hub, UNHEALTHY_LIST_VALIDITY};
use crate::notify::{parse_line, Notification};
use crate::request::{reply_status, request_timeout, IoEvent, RequestScheduler};
use crate::sync::{process_enumeration, PlugEvent};
use crate::transport::{RequestSpec, TransportFactory, TransportMeta, Verb};

/// Callback invoked with a device entry on plug events
pub type DeviceCallback = Box<dyn FnMut(&DeviceEntry) + Send>;
/// Callback invoked on advertised-value changes
pub type ValueCallback = Box<dyn FnMut(&HardwareId, &str) + Send>;
/// Callback invoked on timed reports: hardware id, device time, interval
/// covered, raw payload
pub type TimedReportCallback = Box<dyn FnMut(&HardwareId, f64, f64, &[u8]) + Send>;

/// Granularity of the cooperative pump inside blocking waits
const PUMP_SLICE: Duration = Duration::from_millis(100);

/// The client runtime
pub struct HubClient {
    config: SharedConfig,
    factory: Arc<dyn TransportFactory>,
    hubs: Vec<Hub>,
    directory: Directory,
    scheduler: RequestScheduler,
    events: VecDeque<PlugEvent>,
    arrival_cb: Option<DeviceCallback>,
    change_cb: Option<DeviceCallback>,
    removal_cb: Option<DeviceCallback>,
    value_cb: Option<ValueCallback>,
    report_cb: Option<TimedReportCallback>,
    force_next_sync: bool,
    last_error: Option<(i32, String)>,
}

impl HubClient {
    /// Create a client with the given configuration and transport factory
    pub fn new(config: Config, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config: SharedConfig::new(config),
            factory: Arc::clone(&factory),
            hubs: Vec::new(),
            directory: Directory::new(),
            scheduler: RequestScheduler::new(factory),
            events: VecDeque::new(),
            arrival_cb: None,
            change_cb: None,
            removal_cb: None,
            value_cb: None,
            report_cb: None,
            force_next_sync: false,
            last_error: None,
        }
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        self.config.get()
    }

    /// Read-only access to the device directory
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Number of registered hubs
    pub fn hub_count(&self) -> usize {
        self.hubs.len()
    }

    /// Code and message of the last failed operation
    pub fn last_error(&self) -> Option<(i32, &str)> {
        self.last_error.as_ref().map(|(code, msg)| (*code, msg.as_str()))
    }

    /// Register a hub and verify it is reachable
    ///
    /// The hub is enumerated immediately; if that first pass fails, the hub
    /// is dropped again and the error returned.
    pub async fn register_hub(&mut self, url: &str, user: &str, password: &str) -> Result<()> {
        let res = self.register_hub_inner(url, user, password).await;
        self.note(res)
    }

    async fn register_hub_inner(&mut self, url: &str, user: &str, password: &str) -> Result<()> {
        let (normalized, created) = self.add_hub(url, user, password, false)?;
        let sync_res = self.update_device_list_inner(true).await;
        let failed = self
            .hubs
            .iter()
            .find(|h| h.url == normalized)
            .and_then(|h| h.last_error.clone());
        if let Some(err) = failed {
            // A registration that merged into an existing hub must not
            // take that hub and its devices down with it
            if created {
                self.drop_hub(&normalized).await;
            }
            return Err(attribute_error(&normalized, err));
        }
        sync_res
    }

    /// Register a hub without requiring it to be reachable yet
    pub fn preregister_hub(&mut self, url: &str, user: &str, password: &str) -> Result<()> {
        let res = self.add_hub(url, user, password, true).map(|_| ());
        self.note(res)
    }

    /// Forget a hub, aborting its requests and its devices
    pub async fn unregister_hub(&mut self, url: &str) -> Result<()> {
        let normalized = crate::hub::normalize_url(url)?;
        if !self.hubs.iter().any(|h| h.url == normalized) {
            return Ok(());
        }
        info!(url = %normalized, "Unregistering hub");
        self.drop_hub(&normalized).await;
        Ok(())
    }

    /// Returns the normalized URL and whether a new entry was created
    fn add_hub(
        &mut self,
        url: &str,
        user: &str,
        password: &str,
        mandatory: bool,
    ) -> Result<(String, bool)> {
        let hub = Hub::new(url, user, password, mandatory)?;
        if let Some(existing) = self.hubs.iter_mut().find(|h| h.url == hub.url) {
            // Same URL registered again: adopt the newer credentials
            existing.user = hub.user;
            existing.password = hub.password;
            existing.enabled = true;
            existing.mandatory |= mandatory;
            return Ok((existing.url.clone(), false));
        }
        info!(url = %hub.url, mandatory, "Registering hub");
        let url = hub.url.clone();
        self.hubs.push(hub);
        Ok((url, true))
    }

    async fn drop_hub(&mut self, url: &str) {
        self.scheduler
            .abort_hub(url, Error::io(format!("Hub {} unregistered", url)))
            .await;
        for serial in self.directory.serials_under(url) {
            self.directory.remove_device(&serial);
        }
        self.hubs.retain(|h| h.url != url);
    }

    /// Register the device arrival callback
    ///
    /// Arms a forced enumeration so already-present devices are reported.
    pub fn on_device_arrival(&mut self, cb: DeviceCallback) {
        self.arrival_cb = Some(cb);
        self.force_next_sync = true;
    }

    /// Register the device rename callback
    pub fn on_device_change(&mut self, cb: DeviceCallback) {
        self.change_cb = Some(cb);
    }

    /// Register the device removal callback
    pub fn on_device_removal(&mut self, cb: DeviceCallback) {
        self.removal_cb = Some(cb);
    }

    /// Register the advertised-value callback
    pub fn on_value_change(&mut self, cb: ValueCallback) {
        self.value_cb = Some(cb);
    }

    /// Register the timed-report callback
    pub fn on_timed_report(&mut self, cb: TimedReportCallback) {
        self.report_cb = Some(cb);
    }

    /// Run a sync pass over every stale (or, with `force`, every enabled) hub
    pub async fn update_device_list(&mut self, force: bool) -> Result<()> {
        let res = self.update_device_list_inner(force).await;
        self.note(res)
    }

    async fn update_device_list_inner(&mut self, force: bool) -> Result<()> {
        let now = Instant::now();
        let force = force || std::mem::take(&mut self.force_next_sync);
        let timeout = self.config.get().network.network_timeout();

        let mut issued: Vec<(String, u64)> = Vec::new();
        for hub in &mut self.hubs {
            if !hub.enabled || (!force && now < hub.dev_list_expires) {
                continue;
            }
            hub.last_error = None;
            self.directory.mark_missing_under(&hub.url);
            let spec = RequestSpec::get(hub.url.clone(), "/api.json")
                .with_credentials(hub.user.clone(), hub.password.clone());
            let id = self.scheduler.issue(spec, false, false, Some(timeout));
            issued.push((hub.url.clone(), id));
        }
        if issued.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        while issued.iter().any(|(_, id)| !self.scheduler.is_completed(*id))
            && Instant::now() < deadline
        {
            self.pump(PUMP_SLICE).await?;
        }

        let mut pass_error: Option<Error> = None;
        for (url, id) in issued {
            if !self.scheduler.is_completed(id) {
                self.scheduler
                    .abort(id, Error::timeout(format!("{}api.json", url)))
                    .await;
            }
            let req = match self.scheduler.take_finished(id) {
                Some(req) => req,
                None => continue,
            };
            let Some(idx) = self.hubs.iter().position(|h| h.url == url) else {
                continue;
            };
            let outcome = match req.error {
                Some(err) => Err(err),
                None => reply_status(&req.meta, &req.reply).and_then(|_| {
                    process_enumeration(
                        &mut self.hubs[idx],
                        &mut self.directory,
                        &req.reply,
                        &mut self.events,
                        self.arrival_cb.is_some(),
                        self.change_cb.is_some(),
                    )
                }),
            };
            match outcome {
                Ok(()) => {
                    for serial in self.directory.still_missing_under(&url) {
                        if self.removal_cb.is_some() {
                            self.events.push_back(PlugEvent::Removal(serial));
                        } else {
                            info!(%serial, "Device removal");
                            self.directory.remove_device(&serial);
                        }
                    }
                    let hub = &mut self.hubs[idx];
                    let validity = if hub.notif_healthy {
                        self.config.get().network.device_list_validity()
                    } else {
                        UNHEALTHY_LIST_VALIDITY
                    };
                    hub.dev_list_expires = Instant::now() + validity;
                }
                Err(err) => {
                    warn!(url = %url, %err, "Hub enumeration failed");
                    let hub = &mut self.hubs[idx];
                    hub.last_error = Some(err.clone());
                    hub.dev_list_expires = Instant::now() + UNHEALTHY_LIST_VALIDITY;
                    pass_error.get_or_insert_with(|| attribute_error(&url, err));
                }
            }
        }
        self.merge_duplicate_hubs().await;

        match pass_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hubs that turn out to be the same physical hub (same learned serial)
    /// collapse onto the first registration; the newer registration's
    /// credentials win and its in-flight requests abort
    async fn merge_duplicate_hubs(&mut self) {
        let mut first_by_serial: HashMap<String, usize> = HashMap::new();
        let mut discard: Vec<usize> = Vec::new();
        for (i, hub) in self.hubs.iter().enumerate() {
            let Some(serial) = hub.serial.clone() else { continue };
            match first_by_serial.get(&serial) {
                Some(_) => discard.push(i),
                None => {
                    first_by_serial.insert(serial, i);
                }
            }
        }
        for &i in discard.iter().rev() {
            let dup = self.hubs.remove(i);
            warn!(url = %dup.url, serial = ?dup.serial, "Duplicate hub registration merged");
            if let Some(keeper) = self.hubs.iter_mut().find(|h| h.serial == dup.serial) {
                if !dup.user.is_empty() || !dup.password.is_empty() {
                    keeper.user = dup.user.clone();
                    keeper.password = dup.password.clone();
                }
                keeper.mandatory |= dup.mandatory;
            }
            for serial in self.directory.serials_under(&dup.url) {
                self.directory.remove_device(&serial);
            }
            self.scheduler
                .abort_hub(
                    &dup.url,
                    Error::double_access(format!("{} duplicates an earlier hub", dup.url)),
                )
                .await;
        }
    }

    /// Run one cooperative scheduler step and apply its outcome
    ///
    /// Reopens notification streams past their retry deadline, enqueues
    /// log pulls for devices that flagged pending log content, advances all
    /// transports with a bounded wait and routes notification bytes.
    pub async fn pump(&mut self, wait: Duration) -> Result<()> {
        let now = Instant::now();
        for hub in &mut self.hubs {
            if !hub.enabled {
                continue;
            }
            if let Some(id) = hub.notif_request {
                if !self.scheduler.contains(id) {
                    debug!(url = %hub.url, "Notification stream ended");
                    hub.notify_failed(now);
                }
            }
            if hub.notif_request.map(|id| !self.scheduler.contains(id)).unwrap_or(true)
                && now >= hub.retry_at
            {
                let spec = RequestSpec::get(hub.url.clone(), hub.notify_path())
                    .with_credentials(hub.user.clone(), hub.password.clone());
                hub.notif_request = Some(self.scheduler.issue(spec, false, true, None));
            }
        }

        self.pull_device_logs();

        let io_events = self.scheduler.poll_once(wait).await;
        for event in io_events {
            match event {
                IoEvent::Notification { hub_url, bytes } => {
                    self.route_notification(&hub_url, &bytes);
                }
                IoEvent::Completed { .. } => {}
            }
        }
        Ok(())
    }

    /// Issue fire-and-forget log pulls for devices that flagged pending logs
    fn pull_device_logs(&mut self) {
        let mut pulls: Vec<(String, RequestSpec)> = Vec::new();
        for hub in &self.hubs {
            if !hub.enabled {
                continue;
            }
            for serial in self.directory.serials_under(&hub.url) {
                let Some(device) = self.directory.device(&serial) else { continue };
                if !device.log_pending {
                    continue;
                }
                if let Ok(spec) = device_spec(hub, device, Verb::Get, "/logs.txt", Vec::new()) {
                    pulls.push((serial, spec));
                }
            }
        }
        for (serial, spec) in pulls {
            debug!(%serial, "Pulling device logs");
            if let Some(device) = self.directory.device_mut(&serial) {
                device.log_pending = false;
            }
            self.scheduler
                .issue(spec, true, false, Some(request_timeout("/logs.txt")));
        }
    }

    /// Feed raw notification-stream bytes for a hub, applying complete lines
    fn route_notification(&mut self, hub_url: &str, bytes: &[u8]) {
        let Some(idx) = self.hubs.iter().position(|h| h.url == hub_url) else {
            return;
        };
        self.hubs[idx].notif_carry.extend_from_slice(bytes);
        loop {
            let newline = self.hubs[idx]
                .notif_carry
                .iter()
                .position(|&b| b == b'\n');
            let Some(nl) = newline else { break };
            let line: Vec<u8> = self.hubs[idx].notif_carry[..nl].to_vec();
            self.hubs[idx].notif_carry.drain(..=nl);
            if self.hubs[idx].notif_pos >= 0 {
                self.hubs[idx].notif_pos += nl as i64 + 1;
            }
            let notification = parse_line(&line);
            self.apply_notification(idx, notification);
        }
    }

    fn apply_notification(&mut self, idx: usize, notification: Notification) {
        let now = Instant::now();
        if notification.is_tiny() {
            self.hubs[idx].notify_healthy();
        }
        match notification {
            Notification::KeepAlive | Notification::FlushV2 => {}
            Notification::FunctionValue { dev, fun, value } => {
                let Some((serial, function_id)) = self.resolve_ydx(idx, dev, fun) else {
                    return;
                };
                self.set_function_value(&serial, &function_id, &value);
            }
            Notification::FunctionName {
                dev,
                fun,
                name,
                base_type: _,
            } => {
                let Some((serial, function_id)) = self.resolve_ydx(idx, dev, fun) else {
                    return;
                };
                let hwid = HardwareId::new(&serial, &function_id);
                let class = hwid.function_class();
                let discrepancy =
                    self.directory
                        .function_class(&class)
                        .reindex_function(hwid, &name, None, None);
                if discrepancy {
                    if let Some(device) = self.directory.device_mut(&serial) {
                        device.drop_cache();
                    }
                }
            }
            Notification::DeviceTimeRef {
                dev,
                unix_time,
                millis,
            } => {
                let Some(serial) = self.hubs[idx].serial_for_ydx(dev).map(str::to_string) else {
                    return;
                };
                if let Some(device) = self.directory.device_mut(&serial) {
                    let time = f64::from(unix_time) + f64::from(millis) / 1000.0;
                    if device.time_ref > 0.0 {
                        device.report_duration = time - device.time_ref;
                    }
                    device.time_ref = time;
                }
            }
            Notification::TimedReport {
                dev,
                fun,
                average: _,
                payload,
            } => {
                let Some((serial, function_id)) = self.resolve_ydx(idx, dev, fun) else {
                    return;
                };
                let (time_ref, duration) = self
                    .directory
                    .device(&serial)
                    .map(|d| (d.time_ref, d.report_duration))
                    .unwrap_or((0.0, 0.0));
                let hwid = HardwareId::new(&serial, &function_id);
                if let Some(cb) = self.report_cb.as_mut() {
                    cb(&hwid, time_ref, duration, &payload);
                }
            }
            Notification::DeviceLog { dev } => {
                let Some(serial) = self.hubs[idx].serial_for_ydx(dev).map(str::to_string) else {
                    return;
                };
                if let Some(device) = self.directory.device_mut(&serial) {
                    device.log_pending = true;
                }
            }
            Notification::ConfigChange { dev } => {
                let Some(serial) = self.hubs[idx].serial_for_ydx(dev).map(str::to_string) else {
                    return;
                };
                if let Some(device) = self.directory.device_mut(&serial) {
                    device.drop_cache();
                }
            }
            Notification::LegacyName {
                serial,
                name,
                beacon,
            } => {
                if let Some(device) = self.directory.device_mut(&serial) {
                    device.beacon = beacon;
                    let renamed = device.logical_name != name;
                    if renamed {
                        self.directory.rename_device(&serial, &name);
                        if self.change_cb.is_some() {
                            self.events.push_back(PlugEvent::Rename(serial));
                        }
                    }
                }
                self.hubs[idx].invalidate_device_list(now);
            }
            Notification::LegacyReindex { serial } => {
                debug!(%serial, "Legacy plug notification, forcing resync");
                self.hubs[idx].invalidate_device_list(now);
            }
            Notification::LegacyFunctionValue {
                serial,
                function_id,
                value,
            } => {
                self.set_function_value(&serial, &function_id, &value);
            }
            Notification::NotSynchronized { notif_pos } => {
                let hub = &mut self.hubs[idx];
                hub.notif_pos = notif_pos;
                hub.notif_healthy = false;
                hub.invalidate_device_list(now);
            }
            Notification::Desync => {
                warn!(url = %self.hubs[idx].url, "Notification protocol desync");
                self.hubs[idx].mark_desync(now);
            }
        }
    }

    fn resolve_ydx(&self, idx: usize, dev: usize, fun: usize) -> Option<(String, String)> {
        let serial = self.hubs[idx].serial_for_ydx(dev)?.to_string();
        let function_id = self
            .directory
            .device(&serial)?
            .function_id_by_ydx(fun)?
            .to_string();
        Some((serial, function_id))
    }

    fn set_function_value(&mut self, serial: &str, function_id: &str, value: &str) {
        let hwid = HardwareId::new(serial, function_id);
        let class = hwid.function_class();
        self.directory
            .function_class(&class)
            .set_value(hwid.as_str(), value);
        if let Some(cb) = self.value_cb.as_mut() {
            cb(&hwid, value);
        }
    }

    /// Deliver queued plug events to their callbacks, in FIFO order
    ///
    /// A removed device stays resolvable during its removal callback and is
    /// forgotten right after it returns.
    pub fn handle_events(&mut self) -> Result<()> {
        while let Some(event) = self.events.pop_front() {
            match event {
                PlugEvent::Arrival(serial) => {
                    if let Some(device) = self.directory.device(&serial) {
                        if let Some(cb) = self.arrival_cb.as_mut() {
                            cb(device);
                        }
                    }
                }
                PlugEvent::Rename(serial) => {
                    if let Some(device) = self.directory.device(&serial) {
                        if let Some(cb) = self.change_cb.as_mut() {
                            cb(device);
                        }
                    }
                }
                PlugEvent::Removal(serial) => {
                    if let Some(device) = self.directory.device(&serial) {
                        if let Some(cb) = self.removal_cb.as_mut() {
                            cb(device);
                        }
                    }
                    info!(%serial, "Device removal");
                    self.directory.remove_device(&serial);
                }
            }
        }
        Ok(())
    }

    /// Wait while keeping the runtime pumped, so notifications are never
    /// starved during a long pause
    pub async fn sleep(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let slice = remaining.min(PUMP_SLICE);
            self.pump(slice).await?;
            if self.scheduler.pending_count() == 0 {
                tokio::time::sleep(slice).await;
            }
        }
    }

    /// Perform a synchronous request against a device, by serial or name
    ///
    /// Pumps the scheduler until the request completes or its endpoint-class
    /// deadline passes, then maps the reply status.
    pub async fn device_request(
        &mut self,
        device_ident: &str,
        verb: Verb,
        path: &str,
        body: Vec<u8>,
    ) -> Result<(TransportMeta, Bytes)> {
        let res = self.device_request_inner(device_ident, verb, path, body).await;
        self.note(res)
    }

    async fn device_request_inner(
        &mut self,
        device_ident: &str,
        verb: Verb,
        path: &str,
        body: Vec<u8>,
    ) -> Result<(TransportMeta, Bytes)> {
        let device = self
            .directory
            .device_by_ident(device_ident)
            .ok_or_else(|| Error::device_not_found(format!("No such device: {}", device_ident)))?;
        let hub = self
            .hubs
            .iter()
            .find(|h| h.enabled && h.owns_url(&device.root_url))
            .ok_or_else(|| {
                Error::device_not_found(format!("No hub serves {}", device.serial))
            })?;
        let spec = device_spec(hub, device, verb, path, body)?;
        let timeout = request_timeout(path);
        let id = self.scheduler.issue(spec, false, false, Some(timeout));

        let deadline = Instant::now() + timeout;
        while !self.scheduler.is_completed(id) && Instant::now() < deadline {
            self.pump(PUMP_SLICE).await?;
        }
        if !self.scheduler.is_completed(id) {
            self.scheduler
                .abort(id, Error::timeout(format!("{} did not complete", path)))
                .await;
        }
        let req = self
            .scheduler
            .take_finished(id)
            .ok_or_else(|| Error::io("Request disappeared from the scheduler"))?;
        if let Some(err) = req.error {
            return Err(err);
        }
        reply_status(&req.meta, &req.reply)?;
        Ok((req.meta, req.reply.freeze()))
    }

    /// Fetch a device's attribute snapshot, serving it from cache while the
    /// configured validity lasts
    pub async fn request_device_api(&mut self, serial: &str) -> Result<serde_json::Value> {
        if let Some(device) = self.directory.device(serial) {
            if let Some((snapshot, expires)) = &device.api_cache {
                if Instant::now() < *expires {
                    return Ok(snapshot.clone());
                }
            }
        }
        let (_, body) = self
            .device_request(serial, Verb::Get, "/api.json", Vec::new())
            .await?;
        let snapshot: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
            let err = Error::invalid_argument(format!("Bad device API reply: {}", e));
            self.last_error = Some((err.code(), err.to_string()));
            err
        })?;
        let expires = Instant::now() + self.config.get().network.cache_validity();
        if let Some(device) = self.directory.device_mut(serial) {
            device.api_cache = Some((snapshot.clone(), expires));
        }
        Ok(snapshot)
    }

    /// Resolve an identifier within a function class
    pub fn resolve_function(&self, class: &str, ident: &str) -> Result<HardwareId> {
        self.directory.resolve(class, ident)
    }

    /// Record an error in the last-error funnel, passing it through
    fn note<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            self.last_error = Some((err.code(), err.to_string()));
        }
        res
    }
}

/// Build a request spec for a device-relative path
fn device_spec(
    hub: &Hub,
    device: &DeviceEntry,
    verb: Verb,
    path: &str,
    body: Vec<u8>,
) -> Result<RequestSpec> {
    let rel = device
        .root_url
        .strip_prefix(&hub.url)
        .ok_or_else(|| Error::device_not_found(format!("{} moved hubs", device.serial)))?;
    let base = rel
        .trim_end_matches('/')
        .trim_end_matches("api")
        .trim_end_matches('/');
    let full_path = if base.is_empty() {
        path.to_string()
    } else {
        format!("/{}{}", base, path)
    };
    Ok(RequestSpec {
        hub_url: hub.url.clone(),
        verb,
        path: full_path,
        body,
        user: hub.user.clone(),
        password: hub.password.clone(),
    })
}

/// Attribute a hub-level failure to its hub in the reported message
fn attribute_error(url: &str, err: Error) -> Error {
    let msg = format!("{}: {}", url, err);
    match err {
        Error::Unauthorized(_) => Error::Unauthorized(msg),
        Error::Timeout(_) => Error::Timeout(msg),
        Error::InvalidArgument(_) => Error::InvalidArgument(msg),
        Error::DoubleAccess(_) => Error::DoubleAccess(msg),
        _ => Error::Io(msg),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::mock::{MockFactory, Script};

    const HUB_URL: &str = "http://192.168.1.20:4444/";

    fn enumeration_json() -> String {
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
            }
        })
        .to_string()
    }

    fn client(factory: Arc<MockFactory>) -> HubClient {
        HubClient::new(Config::default(), factory)
    }

    #[test]
    fn test_config_accessor() {
        let client = client(MockFactory::new());
        assert_eq!(client.config().network.network_timeout_ms, 20_000);
    }

    #[test_log::test(tokio::test)]
    async fn test_register_hub_enumerates() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(Arc::clone(&factory));

        client.register_hub("192.168.1.20", "", "").await.unwrap();

        assert_eq!(client.hub_count(), 1);
        let device = client.directory().device("THRMSTR1-32DD7").unwrap();
        assert_eq!(device.logical_name, "probe");
        let index = client.directory().class_index("Temperature").unwrap();
        assert_eq!(index.get("THRMSTR1-32DD7.temperature1").unwrap().value, "26.05");
        assert!(client.last_error().is_none());
        // The notification stream was opened alongside the enumeration
        assert!(factory.opened().iter().any(|s| s.path.starts_with("/not.byn")));
    }

    #[test_log::test(tokio::test)]
    async fn test_register_hub_failure_drops_hub() {
        let factory = MockFactory::new()
            .script("/api.json", Script::refused(Error::io("connection refused")))
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(factory);

        let err = client.register_hub("192.168.1.20", "", "").await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains(HUB_URL));
        assert_eq!(client.hub_count(), 0);
        assert_eq!(client.last_error().unwrap().0, -8);
    }

    #[test_log::test(tokio::test)]
    async fn test_reregister_failure_keeps_existing_hub() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/api.json", Script::refused(Error::io("connection refused")))
            .script("/not.byn", Script::stream(vec![]))
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(factory);
        client.register_hub("192.168.1.20", "", "").await.unwrap();

        // The second registration merges into the first; its failed
        // verification must not unregister the healthy hub
        let err = client
            .register_hub("192.168.1.20", "admin", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(client.hub_count(), 1);
        assert!(client.directory().device("THRMSTR1-32DD7").is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_preregistered_hub_survives_failure() {
        let factory = MockFactory::new()
            .script("/api.json", Script::refused(Error::io("connection refused")))
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(factory);

        client.preregister_hub("192.168.1.20", "", "").unwrap();
        assert!(client.update_device_list(true).await.is_err());
        assert_eq!(client.hub_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_notification_updates_value() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script(
                "/not.byn",
                // First step delivers nothing: the line arrives only once
                // the registration pass is over
                Script::stream(vec![vec![], b"yB027.15\n".to_vec(), b"\n".to_vec()]),
            );
        let mut client = client(factory);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        client.on_value_change(Box::new(move |hwid, value| {
            seen_cb.lock().unwrap().push((hwid.as_str().to_string(), value.to_string()));
        }));

        client.register_hub("192.168.1.20", "", "").await.unwrap();
        for _ in 0..5 {
            client.pump(Duration::ZERO).await.unwrap();
        }

        let index = client.directory().class_index("Temperature").unwrap();
        assert_eq!(index.get("THRMSTR1-32DD7.temperature1").unwrap().value, "27.15");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("THRMSTR1-32DD7.temperature1".to_string(), "27.15".to_string())]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_legacy_value_notification() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script(
                "/not.byn",
                Script::stream(vec![
                    vec![],
                    b"YN015THRMSTR1-32DD7,temperature1,26.05\0\n".to_vec(),
                ]),
            );
        let mut client = client(factory);
        client.register_hub("192.168.1.20", "", "").await.unwrap();
        for _ in 0..5 {
            client.pump(Duration::ZERO).await.unwrap();
        }
        let index = client.directory().class_index("Temperature").unwrap();
        assert_eq!(index.get("THRMSTR1-32DD7.temperature1").unwrap().value, "26.05");
    }

    #[test_log::test(tokio::test)]
    async fn test_desync_forces_resync() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/api.json", Script::reply(enumeration_json()))
            .script(
                "/not.byn",
                Script::stream(vec![vec![], b"@@garbage@@\n".to_vec()]),
            )
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(Arc::clone(&factory));
        client.register_hub("192.168.1.20", "", "").await.unwrap();
        for _ in 0..5 {
            client.pump(Duration::ZERO).await.unwrap();
        }
        // The desync invalidated the enumeration deadline
        client.update_device_list(false).await.unwrap();
        let api_fetches = factory
            .opened()
            .iter()
            .filter(|s| s.path == "/api.json")
            .count();
        assert_eq!(api_fetches, 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_removal_event_forgets_after_callback() {
        let without_device = serde_json::json!({
            "services": {
                "whitePages": [{
                    "serialNumber": "HUBETH01-A1B2C",
                    "networkUrl": "/api",
                    "logicalName": "lab-hub",
                    "beacon": 0,
                    "index": 0
                }],
                "yellowPages": {}
            }
        })
        .to_string();
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/api.json", Script::reply(without_device))
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(factory);
        let removed = Arc::new(Mutex::new(Vec::new()));
        let removed_cb = Arc::clone(&removed);
        client.on_device_removal(Box::new(move |device| {
            removed_cb.lock().unwrap().push(device.serial.clone());
        }));

        client.register_hub("192.168.1.20", "", "").await.unwrap();
        assert!(client.directory().device("THRMSTR1-32DD7").is_some());

        client.update_device_list(true).await.unwrap();
        // Still resolvable until events are delivered
        assert!(client.directory().device("THRMSTR1-32DD7").is_some());
        client.handle_events().unwrap();
        assert_eq!(removed.lock().unwrap().as_slice(), &["THRMSTR1-32DD7"]);
        assert!(client.directory().device("THRMSTR1-32DD7").is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_arrival_events_fifo() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(factory);
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let arrivals_cb = Arc::clone(&arrivals);
        client.on_device_arrival(Box::new(move |device| {
            arrivals_cb.lock().unwrap().push(device.serial.clone());
        }));

        client.register_hub("192.168.1.20", "", "").await.unwrap();
        client.handle_events().unwrap();
        assert_eq!(
            arrivals.lock().unwrap().as_slice(),
            &["HUBETH01-A1B2C", "THRMSTR1-32DD7"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_device_request_maps_status() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/not.byn", Script::stream(vec![]))
            .script(
                "/bySerial/THRMSTR1-32DD7/api/temperature1",
                Script::reply("OK\r\n{\"unit\":\"C\"}"),
            );
        let mut client = client(Arc::clone(&factory));
        client.register_hub("192.168.1.20", "", "").await.unwrap();

        let (_, body) = client
            .device_request(
                "probe",
                Verb::Get,
                "/api/temperature1.json",
                Vec::new(),
            )
            .await
            .unwrap();
        assert!(body.starts_with(b"OK"));
        assert!(factory
            .opened()
            .iter()
            .any(|s| s.path == "/bySerial/THRMSTR1-32DD7/api/temperature1.json"));
    }

    #[test_log::test(tokio::test)]
    async fn test_device_request_unknown_device() {
        let factory = MockFactory::new();
        let mut client = client(factory);
        let err = client
            .device_request("ghost", Verb::Get, "/api.json", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
        assert_eq!(client.last_error().unwrap().0, -4);
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_hub_merges() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/not.byn", Script::stream(vec![]))
            .script("/not.byn", Script::stream(vec![]));
        let mut client = client(factory);
        client.register_hub("192.168.1.20", "", "").await.unwrap();
        client
            .register_hub("http://192.168.1.20:4444", "admin", "pw")
            .await
            .unwrap();
        // Same URL collapses onto the existing registration
        assert_eq!(client.hub_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_log_pending_triggers_pull() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script("/not.byn", Script::stream(vec![vec![], b"wB0\n".to_vec()]))
            .script(
                "/bySerial/THRMSTR1-32DD7/logs.txt",
                Script::reply("OK\r\nlog line"),
            );
        let mut client = client(Arc::clone(&factory));
        client.register_hub("192.168.1.20", "", "").await.unwrap();
        for _ in 0..6 {
            client.pump(Duration::ZERO).await.unwrap();
        }
        assert!(factory
            .opened()
            .iter()
            .any(|s| s.path == "/bySerial/THRMSTR1-32DD7/logs.txt"));
        assert!(!client
            .directory()
            .device("THRMSTR1-32DD7")
            .unwrap()
            .log_pending);
    }

    #[test_log::test(tokio::test)]
    async fn test_sleep_keeps_pumping() {
        let factory = MockFactory::new()
            .script("/api.json", Script::reply(enumeration_json()))
            .script(
                "/not.byn",
                Script::stream(vec![vec![], b"yB028.00\n".to_vec()]),
            );
        let mut client = client(factory);
        client.register_hub("192.168.1.20", "", "").await.unwrap();

        client.sleep(Duration::from_millis(30)).await.unwrap();
        let index = client.directory().class_index("Temperature").unwrap();
        assert_eq!(index.get("THRMSTR1-32DD7.temperature1").unwrap().value, "28.00");
    }
}
