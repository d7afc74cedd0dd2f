//! Hardware and operating system collaborators
//!
//! The device core never talks to the radio, the flash or the network stack
//! directly. Everything it needs from the outside world is expressed by the
//! traits in this module, so the state machines can be driven by fakes in
//! tests and by [`linux`] on a real host.

pub mod linux;

use crate::services::connectivity::ConnectionState;
use anyhow::Result;
#[cfg(feature = "mock")]
use mockall::automock;
use std::net::Ipv4Addr;
use trait_variant::make;

/// Asynchronous notifications raised by the wireless driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WifiEvent {
    /// Station joined and obtained an address
    GotIp { ip: Ipv4Addr, netmask: Ipv4Addr },
    /// Station lost the association
    Disconnected,
}

/// Address assignment used for a station join
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addressing {
    Dhcp,
    Static {
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        netmask: Ipv4Addr,
        dns: Ipv4Addr,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinRequest {
    pub ssid: String,
    pub passphrase: String,
    pub hostname: String,
    pub addressing: Addressing,
}

/// Name-resolution service announcement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub hostname: String,
    pub instance_name: String,
    pub service: String,
    pub protocol: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlashGeometry {
    pub chip_id: String,
    pub used_size: u64,
    pub real_size: u64,
}

/// Station/access point radio control
///
/// `join` only requests the association; its outcome is reported later as a
/// [`WifiEvent`] on the channel handed to the driver at construction.
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait WifiDriver {
    async fn join(&mut self, request: JoinRequest) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    async fn start_access_point(&mut self, ssid: String) -> Result<Ipv4Addr>;
    async fn rssi(&self) -> Result<i32>;
}

#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait NameAdvertiser {
    async fn advertise(&mut self, advertisement: Advertisement) -> Result<()>;
}

/// Streaming firmware replacement
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait FirmwareUpdater {
    async fn begin(&mut self) -> Result<()>;
    async fn write(&mut self, data: Vec<u8>) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
    async fn remount_storage(&mut self) -> Result<()>;
}

#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait SystemControl {
    async fn restart(&mut self) -> Result<()>;
}

/// Hardware identity and resource figures
#[cfg_attr(feature = "mock", automock)]
pub trait HardwareInfo {
    /// Hardware-derived unique identifier
    fn chip_id(&self) -> u32;
    fn mac_address(&self) -> String;
    fn flash_geometry(&self) -> FlashGeometry;
    fn free_memory(&self) -> u64;
}

/// Consumer of status snapshots (OLED, LEDs, console)
#[cfg_attr(feature = "mock", automock)]
pub trait StatusDisplay {
    fn update_status(&mut self, status: &ConnectionState);
}

/// Bundle of collaborator types used by one device instance
pub trait Platform {
    type Wifi: WifiDriver;
    type Advertiser: NameAdvertiser;
    type Firmware: FirmwareUpdater;
    type System: SystemControl;
    type Hardware: HardwareInfo;
    type Display: StatusDisplay;
}

pub struct Collaborators<P: Platform> {
    pub wifi: P::Wifi,
    pub advertiser: P::Advertiser,
    pub firmware: P::Firmware,
    pub system: P::System,
    pub hardware: P::Hardware,
    pub display: P::Display,
}
