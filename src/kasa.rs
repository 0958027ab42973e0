//! TP-Link Kasa smart plug client.
//!
//! Kasa plugs accept JSON commands over TCP (port 9999). Each message is
//! obfuscated with an XOR autokey cipher seeded with 171 and prefixed with its
//! big-endian u32 length. One connection carries one request/response pair.

use crate::client::DeviceClient;
use crate::error::{AppError, Result};
use crate::monitor::{DeviceIdentity, InstantaneousReading};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 9999;

const INITIAL_KEY: u8 = 171;
const MAX_RESPONSE_LEN: usize = 64 * 1024;

const GET_SYSINFO: &str = r#"{"system":{"get_sysinfo":{}}}"#;
const GET_REALTIME: &str = r#"{"emeter":{"get_realtime":{}}}"#;

pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plain
        .iter()
        .map(|b| {
            key ^= b;
            key
        })
        .collect()
}

pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|&b| {
            let plain = key ^ b;
            key = b;
            plain
        })
        .collect()
}

/// Length-prefixed, encrypted wire form of `payload`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let body = encrypt(payload);
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Append the Kasa port unless `addr` already names one.
pub fn with_default_port(addr: &str, port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => addr.to_string(),
        _ if addr.starts_with('[') => addr.to_string(),
        _ if addr.contains(':') => format!("[{addr}]:{port}"),
        _ => format!("{addr}:{port}"),
    }
}

#[derive(Debug, Deserialize)]
struct SysInfo {
    #[serde(default)]
    err_code: i64,
    #[serde(default, alias = "mic_mac")]
    mac: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    feature: String,
    #[serde(default)]
    rssi: i32,
    #[serde(default, rename = "deviceId")]
    device_id: String,
    #[serde(default)]
    sw_ver: String,
    #[serde(default)]
    hw_ver: String,
}

/// Older firmware reports W/V/A/kWh, newer firmware mW/mV/mA/Wh.
#[derive(Debug, Deserialize)]
struct Realtime {
    #[serde(default)]
    err_code: i64,
    power: Option<f64>,
    power_mw: Option<f64>,
    voltage: Option<f64>,
    voltage_mv: Option<f64>,
    current: Option<f64>,
    current_ma: Option<f64>,
    total: Option<f64>,
    total_wh: Option<f64>,
}

fn pick(unit: Option<f64>, milli: Option<f64>) -> f64 {
    unit.or_else(|| milli.map(|v| v / 1000.0)).unwrap_or_default()
}

impl From<SysInfo> for DeviceIdentity {
    fn from(s: SysInfo) -> Self {
        DeviceIdentity {
            mac: s.mac,
            model: s.model,
            alias: s.alias,
            feature: s.feature,
            rssi: s.rssi,
            device_id: s.device_id,
            software_version: s.sw_ver,
            hardware_version: s.hw_ver,
        }
    }
}

impl From<Realtime> for InstantaneousReading {
    fn from(r: Realtime) -> Self {
        InstantaneousReading {
            power: pick(r.power, r.power_mw),
            voltage: pick(r.voltage, r.voltage_mv),
            current: pick(r.current, r.current_ma),
            total_kwh: pick(r.total, r.total_wh),
        }
    }
}

/// Pull `response[module][method]` out of a decrypted reply.
fn extract<T: serde::de::DeserializeOwned>(
    response: &[u8],
    module: &str,
    method: &str,
) -> Result<T> {
    let mut v: Value = serde_json::from_slice(response)?;
    let inner = v
        .get_mut(module)
        .and_then(|m| m.get_mut(method))
        .map(Value::take)
        .ok_or_else(|| AppError::Protocol(format!("response has no {module}.{method}")))?;
    Ok(serde_json::from_value(inner)?)
}

fn parse_sysinfo(response: &[u8]) -> Result<DeviceIdentity> {
    let info: SysInfo = extract(response, "system", "get_sysinfo")?;
    if info.err_code != 0 {
        return Err(AppError::Protocol(format!(
            "get_sysinfo returned err_code {}",
            info.err_code
        )));
    }
    Ok(info.into())
}

fn parse_realtime(response: &[u8]) -> Result<InstantaneousReading> {
    let rt: Realtime = extract(response, "emeter", "get_realtime")?;
    if rt.err_code != 0 {
        return Err(AppError::Protocol(format!(
            "get_realtime returned err_code {}",
            rt.err_code
        )));
    }
    Ok(rt.into())
}

#[derive(Debug, Clone)]
pub struct KasaClient {
    addr: String,
}

impl KasaClient {
    pub fn new(addr: &str, default_port: u16) -> Self {
        Self {
            addr: with_default_port(addr, default_port),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn query(&self, command: &str) -> Result<Vec<u8>> {
        debug!(addr = %self.addr, command, "querying plug");
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| AppError::device(&self.addr, e))?;
        stream
            .write_all(&frame(command.as_bytes()))
            .await
            .map_err(|e| AppError::device(&self.addr, e))?;

        let len = stream
            .read_u32()
            .await
            .map_err(|e| AppError::device(&self.addr, e))? as usize;
        if len > MAX_RESPONSE_LEN {
            return Err(AppError::Protocol(format!(
                "response of {len} bytes exceeds limit of {MAX_RESPONSE_LEN}"
            )));
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| AppError::device(&self.addr, e))?;
        Ok(decrypt(&body))
    }
}

#[async_trait]
impl DeviceClient for KasaClient {
    async fn identity(&self) -> Result<DeviceIdentity> {
        parse_sysinfo(&self.query(GET_SYSINFO).await?)
    }

    async fn reading(&self) -> Result<InstantaneousReading> {
        parse_realtime(&self.query(GET_REALTIME).await?)
    }
}
