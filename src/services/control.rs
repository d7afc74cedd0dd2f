//! Framed command protocol
//!
//! Frames are text: the first character selects a category, the second an
//! operation, anything after that is a JSON payload. Responses carry the same
//! two-character prefix and go back to the requesting client only.
//!
//! | Code | Operation                      | Response        |
//! |------|--------------------------------|-----------------|
//! | `G1` | configuration with credentials | `G1{...}`       |
//! | `G2` | live network and system status | `G2{...}`       |
//! | `S1` | set network configuration      | `S1`            |
//! | `S2` | set device configuration       | `S2`            |
//! | `XJ` | telemetry                      | `XJ{...}`       |
//! | `X6` | reboot                         | none            |

use crate::{
    platform::HardwareInfo,
    services::{config_store::ConfigStore, connectivity::ConnectionState, reboot::RebootFlag},
};
use anyhow::{Context, Result, ensure};
use log::{debug, error};
use serde_json::{Value, json};
use std::time::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    GetConfig,
    GetStatus,
    SetNetworkConfig,
    SetDeviceConfig,
    GetTelemetry,
    Reboot,
}

type Handler = fn(&mut ControlContext<'_>, &ControlMessage) -> Option<String>;

impl Command {
    const TABLE: [(&'static str, Command); 6] = [
        ("G1", Command::GetConfig),
        ("G2", Command::GetStatus),
        ("S1", Command::SetNetworkConfig),
        ("S2", Command::SetDeviceConfig),
        ("XJ", Command::GetTelemetry),
        ("X6", Command::Reboot),
    ];

    pub fn from_code(code: &str) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(entry, _)| *entry == code)
            .map(|(_, command)| *command)
    }

    pub fn code(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, command)| *command == self)
            .map(|(code, _)| *code)
            .unwrap_or_default()
    }

    fn expects_payload(self) -> bool {
        matches!(self, Command::SetNetworkConfig | Command::SetDeviceConfig)
    }

    fn handler(self) -> Handler {
        match self {
            Command::GetConfig => ControlChannel::get_config,
            Command::GetStatus => ControlChannel::get_status,
            Command::SetNetworkConfig => ControlChannel::set_network_config,
            Command::SetDeviceConfig => ControlChannel::set_device_config,
            Command::GetTelemetry => ControlChannel::get_telemetry,
            Command::Reboot => ControlChannel::reboot,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControlMessage {
    pub command: Command,
    pub payload: Option<Value>,
}

impl ControlMessage {
    /// Parse a text frame
    ///
    /// Returns `Ok(None)` for frames that are silently ignored (too short or
    /// unknown code) and an error for set commands with a malformed payload.
    pub fn parse(frame: &str) -> Result<Option<Self>> {
        let Some(code) = frame.get(..2) else {
            return Ok(None);
        };

        let Some(command) = Command::from_code(code) else {
            debug!("ignoring unknown command: {code}");
            return Ok(None);
        };

        let payload = if command.expects_payload() {
            let value = serde_json::from_str::<Value>(&frame[2..])
                .context(format!("failed to parse {code} payload"))?;
            ensure!(value.is_object(), "failed to parse {code} payload: not an object");
            Some(value)
        } else {
            None
        };

        Ok(Some(Self { command, payload }))
    }
}

/// Device state visible to command handlers for one request
pub struct ControlContext<'a> {
    pub store: &'a mut ConfigStore,
    pub connection: &'a ConnectionState,
    pub hardware: &'a dyn HardwareInfo,
    pub rssi: i32,
    pub uptime: Duration,
    pub reboot: &'a mut RebootFlag,
}

/// Dispatcher for control frames
pub struct ControlChannel;

impl ControlChannel {
    /// Handle one frame, returning the response frame if there is one
    pub fn dispatch(frame: &str, context: &mut ControlContext<'_>) -> Option<String> {
        match ControlMessage::parse(frame) {
            Ok(Some(message)) => {
                debug!("dispatch {:?}", message.command);
                (message.command.handler())(context, &message)
            }
            Ok(None) => None,
            Err(e) => {
                error!("dropping control frame: {e:#}: {frame}");
                None
            }
        }
    }

    fn respond(command: Command, body: Option<Value>) -> Option<String> {
        match body {
            Some(body) => Some(format!("{}{body}", command.code())),
            None => Some(command.code().to_string()),
        }
    }

    fn get_config(context: &mut ControlContext<'_>, message: &ControlMessage) -> Option<String> {
        Self::respond(message.command, Some(context.store.serialize(true)))
    }

    fn get_status(context: &mut ControlContext<'_>, message: &ControlMessage) -> Option<String> {
        let hardware = context.hardware;
        let flash = hardware.flash_geometry();

        let status = json!({
            "ssid": context.connection.ssid,
            "hostname": context.store.config().hostname,
            "ip": context.connection.local_ip.to_string(),
            "mac": hardware.mac_address(),
            "version": VERSION,
            "built": BUILD_DATE,
            "flashchipid": flash.chip_id,
            "usedflashsize": flash.used_size.to_string(),
            "realflashsize": flash.real_size.to_string(),
            "freeheap": hardware.free_memory().to_string(),
        });

        Self::respond(message.command, Some(status))
    }

    fn set_network_config(
        context: &mut ControlContext<'_>,
        message: &ControlMessage,
    ) -> Option<String> {
        let payload = message.payload.as_ref()?;

        context.store.apply_network_fields(payload);
        context.store.save_or_log();

        Self::respond(message.command, None)
    }

    fn set_device_config(
        context: &mut ControlContext<'_>,
        message: &ControlMessage,
    ) -> Option<String> {
        let payload = message.payload.as_ref()?;

        context.store.apply_device_fields(payload);
        context.store.save_or_log();

        Self::respond(message.command, None)
    }

    fn get_telemetry(context: &mut ControlContext<'_>, message: &ControlMessage) -> Option<String> {
        let telemetry = json!({
            "system": {
                "rssi": context.rssi.to_string(),
                "freeheap": context.hardware.free_memory().to_string(),
                "uptime": context.uptime.as_millis().to_string(),
            }
        });

        Self::respond(message.command, Some(telemetry))
    }

    fn reboot(context: &mut ControlContext<'_>, _message: &ControlMessage) -> Option<String> {
        context.reboot.request("control channel");
        None
    }
}
