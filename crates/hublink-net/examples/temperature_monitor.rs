//! Drives a HubClient against a canned in-memory hub: one enumeration reply
//! and a short notification stream, no sockets involved. Shows where a real
//! transport implementation plugs in.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use hublink_core::config::Config;
use hublink_core::error::{Error, Result};
use hublink_net::transport::{
    RequestSpec, Transport, TransportFactory, TransportMeta, TransportStatus,
};
use hublink_net::HubClient;

/// Transport replaying a fixed reply, one chunk per step
struct ReplayTransport {
    chunks: VecDeque<Vec<u8>>,
    pending: Vec<u8>,
    closes: bool,
    meta: TransportMeta,
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn process(&mut self, _wait: Duration) -> Result<TransportStatus> {
        match self.chunks.pop_front() {
            Some(chunk) => {
                self.pending.extend_from_slice(&chunk);
                Ok(TransportStatus::DataReady)
            }
            None if self.closes => Ok(TransportStatus::Eof),
            None => Ok(TransportStatus::Idle),
        }
    }

    fn eof(&self) -> bool {
        self.closes && self.chunks.is_empty()
    }

    fn take_bytes(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.pending))
    }

    fn meta(&self) -> &TransportMeta {
        &self.meta
    }

    fn error(&self) -> Option<Error> {
        None
    }

    async fn close(&mut self) {}
}

/// Factory serving the canned hub content
struct ReplayFactory {
    notifications: Mutex<VecDeque<Vec<u8>>>,
}

#[async_trait]
impl TransportFactory for ReplayFactory {
    async fn open(&self, spec: &RequestSpec) -> Result<Box<dyn Transport>> {
        let (chunks, closes) = if spec.path.starts_with("/not.byn") {
            (std::mem::take(&mut *self.notifications.lock().unwrap()), false)
        } else if spec.path == "/api.json" {
            (VecDeque::from(vec![ENUMERATION.as_bytes().to_vec()]), true)
        } else {
            return Err(Error::file_not_found(spec.path.clone()));
        };
        Ok(Box::new(ReplayTransport {
            chunks,
            pending: Vec::new(),
            closes,
            meta: TransportMeta {
                http_status: 200,
                status_line: "HTTP/1.1 200 OK".to_string(),
            },
        }))
    }
}

const ENUMERATION: &str = r#"{
  "services": {
    "whitePages": [
      {"serialNumber": "HUBETH01-A1B2C", "networkUrl": "/api",
       "logicalName": "lab-hub", "beacon": 0, "index": 0},
      {"serialNumber": "THRMSTR1-32DD7",
       "networkUrl": "/bySerial/THRMSTR1-32DD7/api",
       "logicalName": "probe", "beacon": 0, "index": 1}
    ],
    "yellowPages": {
      "Temperature": [
        {"hardwareId": "THRMSTR1-32DD7.temperature1", "logicalName": "oven",
         "advertisedValue": "26.05", "baseType": "Sensor"}
      ]
    }
  }
}"#;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    hublink_core::logging::init()?;

    let factory = Arc::new(ReplayFactory {
        notifications: Mutex::new(VecDeque::from(vec![
            b"yB026.40\n".to_vec(),
            b"yB026.75\n".to_vec(),
            b"yB027.10\n".to_vec(),
        ])),
    });

    let mut client = HubClient::new(Config::default(), factory);
    client.on_device_arrival(Box::new(|device| {
        info!(serial = %device.serial, name = %device.logical_name, "Device arrived");
    }));
    client.on_value_change(Box::new(|hwid, value| {
        info!(%hwid, value, "Value update");
    }));

    client.register_hub("192.168.1.20", "", "").await?;
    client.handle_events()?;

    // Let the notification stream deliver its updates
    client.sleep(Duration::from_millis(300)).await?;

    let hwid = client.resolve_function("Temperature", "oven")?;
    let record = client
        .directory()
        .class_index("Temperature")
        .and_then(|index| index.get(hwid.as_str()))
        .expect("function was enumerated");
    info!(%hwid, value = %record.value, "Final reading");

    Ok(())
}
