//! Device information service client for the instruments protocol.
//!
//! Lists processes, resolves pids and reports hardware, network and sysmon
//! attribute information.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::warn;

use crate::{
    IdeviceError,
    dtx::{Channel, DtxMessage},
    nskeyedarchive::{ArchiveValue, NsObject},
};

use super::InstrumentsConnection;

pub const CHANNEL_IDENTIFIER: &str = "com.apple.instruments.server.services.deviceinfo";

/// A process running on the device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u64,
    pub name: String,
    pub real_app_name: Option<String>,
    pub is_application: bool,
    pub start_date: Option<DateTime<Utc>>,
}

impl ProcessInfo {
    fn from_entry(entry: &IndexMap<String, ArchiveValue>) -> Option<Self> {
        let pid = entry.get("pid").and_then(|p| p.as_unsigned())?;
        Some(Self {
            pid,
            name: entry
                .get("name")
                .and_then(|n| n.as_string())
                .unwrap_or_default()
                .to_string(),
            real_app_name: entry
                .get("realAppName")
                .and_then(|n| n.as_string())
                .map(str::to_string),
            is_application: entry
                .get("isApplication")
                .and_then(|b| b.as_boolean())
                .unwrap_or(false),
            start_date: match entry.get("startDate").and_then(|d| d.as_object()) {
                Some(NsObject::Date(d)) => d.to_chrono(),
                _ => None,
            },
        })
    }
}

/// Client for the device information service
#[derive(Debug, Clone)]
pub struct DeviceInfoClient {
    channel: Channel,
}

impl DeviceInfoClient {
    pub async fn new(conn: &InstrumentsConnection) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: conn.channel(CHANNEL_IDENTIFIER).await?,
        })
    }

    /// Lists every running process
    ///
    /// Entries without a pid are skipped.
    pub async fn running_processes(&self) -> Result<Vec<ProcessInfo>, IdeviceError> {
        let msg = self.channel.invoke("runningProcesses", &[]).await?;
        let Some(first) = msg.payload.first() else {
            return Ok(Vec::new());
        };
        let entries = first.as_array().ok_or(IdeviceError::UnexpectedResponse)?;

        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.as_dictionary().and_then(ProcessInfo::from_entry) {
                Some(p) => res.push(p),
                None => warn!("Skipping malformed process entry: {entry}"),
            }
        }
        Ok(res)
    }

    /// Resolves the executable name of a pid
    pub async fn execname_for_pid(&self, pid: u64) -> Result<String, IdeviceError> {
        let msg = self
            .channel
            .invoke("execnameForPid:", &[ArchiveValue::from(pid)])
            .await?;
        msg.payload
            .first()
            .and_then(|p| p.as_string())
            .map(str::to_string)
            .ok_or(IdeviceError::UnexpectedResponse)
    }

    /// CPU type, core counts and similar details
    pub async fn hardware_information(
        &self,
    ) -> Result<IndexMap<String, ArchiveValue>, IdeviceError> {
        dictionary(self.channel.invoke("hardwareInformation", &[]).await?)
    }

    /// Network interfaces by BSD name
    pub async fn network_information(
        &self,
    ) -> Result<IndexMap<String, ArchiveValue>, IdeviceError> {
        dictionary(self.channel.invoke("networkInformation", &[]).await?)
    }

    /// Attribute names sysmontap can report per process
    pub async fn sysmon_process_attributes(&self) -> Result<Vec<ArchiveValue>, IdeviceError> {
        list(self.channel.invoke("sysmonProcessAttributes", &[]).await?)
    }

    /// Attribute names sysmontap can report for the whole system
    pub async fn sysmon_system_attributes(&self) -> Result<Vec<ArchiveValue>, IdeviceError> {
        list(self.channel.invoke("sysmonSystemAttributes", &[]).await?)
    }
}

fn dictionary(msg: DtxMessage) -> Result<IndexMap<String, ArchiveValue>, IdeviceError> {
    if msg.payload.len() != 1 {
        warn!("Expected exactly one payload element: {msg}");
        return Err(IdeviceError::UnexpectedResponse);
    }
    msg.payload
        .into_iter()
        .next()
        .and_then(|p| p.into_dictionary())
        .ok_or(IdeviceError::UnexpectedResponse)
}

fn list(msg: DtxMessage) -> Result<Vec<ArchiveValue>, IdeviceError> {
    match msg.payload.into_iter().next() {
        Some(ArchiveValue::Array(a)) | Some(ArchiveValue::Set(a)) => Ok(a),
        _ => Err(IdeviceError::UnexpectedResponse),
    }
}
