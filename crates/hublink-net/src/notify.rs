/*!
 * Notification stream decoder.
 *
 * Hubs push state changes over a persistent streaming request, one line per
 * notification. Two generations coexist on the wire: compact "tiny" lines
 * keyed by a single opcode byte plus packed device/function indexes, and
 * legacy lines carrying a 4-byte tag and comma-separated fields. This module
 * is a pure parser; applying a parsed notification to the directory is the
 * client's job.
 */
use hublink_core::codec::{decode_packed, decode_public_value};

/// Tiny opcode: advertised value update
const TAG_FUNC_VALUE: u8 = b'y';
/// Tiny opcode: function logical-name update
const TAG_FUNC_NAME: u8 = b'8';
/// Tiny opcode: timed value report
const TAG_TIMED_REPORT: u8 = b't';
/// Tiny opcode: timed averaged report
const TAG_TIMED_AVG_REPORT: u8 = b'u';
/// Tiny opcode: device log pending
const TAG_DEV_LOG: u8 = b'w';
/// Tiny opcode: device configuration changed
const TAG_CONF_CHANGE: u8 = b's';
/// Tiny opcode: packed V2 advertised value
const TAG_FUNC_VALUE_V2: u8 = b'v';
/// Tiny opcode: V2 group flush
const TAG_FLUSH_V2: u8 = b'z';

/// Leading tag of a legacy notification line
const LEGACY_TAG: &[u8] = b"YN01";

/// Function index standing for the device itself in timed reports
const FUNYDX_TIME_REF: usize = 15;

/// One parsed notification line
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Empty line, sent periodically to keep the stream alive
    KeepAlive,
    /// Advertised value update, indexes relative to the hub's device table
    FunctionValue {
        /// Device index in the hub's enumeration table
        dev: usize,
        /// Function index within the device
        fun: usize,
        /// New advertised value
        value: String,
    },
    /// Function logical-name update
    FunctionName {
        /// Device index in the hub's enumeration table
        dev: usize,
        /// Function index within the device
        fun: usize,
        /// New logical name
        name: String,
        /// Base-type tag when the hub advertises one
        base_type: Option<u8>,
    },
    /// Device time reference preceding a run of timed reports
    DeviceTimeRef {
        /// Device index in the hub's enumeration table
        dev: usize,
        /// Device UTC time, seconds since the epoch
        unix_time: u32,
        /// Sub-second part, milliseconds
        millis: u16,
    },
    /// Timed value report for one function
    TimedReport {
        /// Device index in the hub's enumeration table
        dev: usize,
        /// Function index within the device
        fun: usize,
        /// Whether the report averages an interval
        average: bool,
        /// Raw report payload, format tag first
        payload: Vec<u8>,
    },
    /// The device has log content waiting to be pulled
    DeviceLog {
        /// Device index in the hub's enumeration table
        dev: usize,
    },
    /// The device configuration changed, cached attributes are stale
    ConfigChange {
        /// Device index in the hub's enumeration table
        dev: usize,
    },
    /// End of a V2 notification group, no action required
    FlushV2,
    /// Legacy device arrival/rename/beacon line
    LegacyName {
        /// Device serial number
        serial: String,
        /// Device logical name
        name: String,
        /// Beacon state
        beacon: u8,
    },
    /// Legacy plug/unplug or name-change line, forces a resync
    LegacyReindex {
        /// Device serial number
        serial: String,
    },
    /// Legacy long-form advertised value update
    LegacyFunctionValue {
        /// Device serial number
        serial: String,
        /// Function id on the device
        function_id: String,
        /// New advertised value
        value: String,
    },
    /// Stream is not resumable at the requested offset
    NotSynchronized {
        /// Absolute stream position to resume from
        notif_pos: i64,
    },
    /// Unrecognized line shape, the stream must be considered corrupt
    Desync,
}

impl Notification {
    /// Whether this notification proves the tiny protocol is being decoded
    /// correctly (used to mark the hub's notifications healthy)
    pub fn is_tiny(&self) -> bool {
        matches!(
            self,
            Notification::FunctionValue { .. }
                | Notification::FunctionName { .. }
                | Notification::DeviceTimeRef { .. }
                | Notification::TimedReport { .. }
                | Notification::DeviceLog { .. }
                | Notification::ConfigChange { .. }
                | Notification::FlushV2
        )
    }
}

/// Parse one notification line, without its trailing newline
pub fn parse_line(line: &[u8]) -> Notification {
    if line.is_empty() {
        return Notification::KeepAlive;
    }
    if line.len() > LEGACY_TAG.len() && line.starts_with(LEGACY_TAG) {
        return parse_legacy(line[4], &line[5..]);
    }
    if line.len() >= 3 {
        if let Some(n) = parse_tiny(line[0], line[1], line[2], &line[3..]) {
            return n;
        }
    }
    Notification::Desync
}

/// Decode the packed device/function indexes of a tiny line
///
/// The function index byte carries the 8th bit of the device index: values
/// of 64 and above fold back by 64 and add 128 to the device index.
fn unpack_indexes(dev_byte: u8, fun_byte: u8) -> Option<(usize, usize)> {
    if dev_byte < b'A' || fun_byte < b'0' {
        return None;
    }
    let mut dev = usize::from(dev_byte - b'A');
    let mut fun = usize::from(fun_byte - b'0');
    if fun >= 64 {
        fun -= 64;
        dev += 128;
    }
    Some((dev, fun))
}

fn parse_tiny(opcode: u8, dev_byte: u8, fun_byte: u8, payload: &[u8]) -> Option<Notification> {
    let (dev, fun) = unpack_indexes(dev_byte, fun_byte)?;
    match opcode {
        TAG_FUNC_VALUE => Some(Notification::FunctionValue {
            dev,
            fun,
            value: first_segment(payload),
        }),
        TAG_FUNC_NAME => {
            let mut parts = payload.splitn(2, |&b| b == 0);
            let name = String::from_utf8_lossy(parts.next().unwrap_or(&[])).into_owned();
            let base_type = parts
                .next()
                .and_then(|rest| rest.first())
                .and_then(|&b| b.checked_sub(b'0'));
            Some(Notification::FunctionName {
                dev,
                fun,
                name,
                base_type,
            })
        }
        TAG_TIMED_REPORT | TAG_TIMED_AVG_REPORT => {
            if fun == FUNYDX_TIME_REF {
                if payload.len() < 6 {
                    return None;
                }
                let unix_time = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                // Sub-second byte counts 1/250ths of a second
                let millis = u16::from(payload[5]) * 4;
                Some(Notification::DeviceTimeRef {
                    dev,
                    unix_time,
                    millis,
                })
            } else {
                Some(Notification::TimedReport {
                    dev,
                    fun,
                    average: opcode == TAG_TIMED_AVG_REPORT,
                    payload: payload.to_vec(),
                })
            }
        }
        TAG_DEV_LOG => Some(Notification::DeviceLog { dev }),
        TAG_CONF_CHANGE => Some(Notification::ConfigChange { dev }),
        TAG_FUNC_VALUE_V2 => {
            let decoded = decode_packed(payload);
            let (&type_v2, data) = decoded.split_first()?;
            Some(Notification::FunctionValue {
                dev,
                fun,
                value: decode_public_value(type_v2, data),
            })
        }
        TAG_FLUSH_V2 => Some(Notification::FlushV2),
        _ => None,
    }
}

fn parse_legacy(subtype: u8, rest: &[u8]) -> Notification {
    match subtype {
        b'0' => {
            let fields = split_fields(rest);
            if fields.len() < 2 {
                return Notification::Desync;
            }
            let beacon = fields
                .get(2)
                .and_then(|f| f.parse::<u8>().ok())
                .unwrap_or(0);
            Notification::LegacyName {
                serial: fields[0].clone(),
                name: fields[1].clone(),
                beacon,
            }
        }
        b'2' | b'4' | b'8' => {
            let fields = split_fields(rest);
            match fields.first() {
                Some(serial) if !serial.is_empty() => Notification::LegacyReindex {
                    serial: serial.clone(),
                },
                _ => Notification::Desync,
            }
        }
        b'5' => {
            let fields = split_fields(rest);
            if fields.len() < 3 {
                return Notification::Desync;
            }
            Notification::LegacyFunctionValue {
                serial: fields[0].clone(),
                function_id: fields[1].clone(),
                value: first_segment(fields[2].as_bytes()),
            }
        }
        b'@' => match String::from_utf8_lossy(rest).trim().parse::<i64>() {
            Ok(notif_pos) => Notification::NotSynchronized { notif_pos },
            Err(_) => Notification::Desync,
        },
        _ => Notification::Desync,
    }
}

/// The payload up to the first embedded NUL, as a string
fn first_segment(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

fn split_fields(rest: &[u8]) -> Vec<String> {
    rest.split(|&b| b == b',')
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect()
}
