//! Linux host collaborators
//!
//! Wireless control goes through NetworkManager (`nmcli`), name advertisement
//! through Avahi, identity and memory figures come from `/sys` and `/proc`.

use super::{
    Advertisement, Addressing, Collaborators, FirmwareUpdater, FlashGeometry, HardwareInfo,
    JoinRequest, NameAdvertiser, Platform, StatusDisplay, SystemControl, WifiDriver, WifiEvent,
};
use crate::{
    config::AppConfig,
    services::connectivity::{ConnectionState, ConnectionStatus},
};
use anyhow::{Context, Result, bail, ensure};
use log::{debug, info, warn};
use std::{
    ffi::OsStr,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};

const STATION_CONNECTION: &str = "stick-core";
const ACCESS_POINT_CONNECTION: &str = "stick-core-ap";
const ACCESS_POINT_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const NM_STATE_CONNECTED: u32 = 100;

pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    type Wifi = NmcliWifi;
    type Advertiser = AvahiAdvertiser;
    type Firmware = FileFirmwareUpdater;
    type System = SystemdControl;
    type Hardware = ProcHardware;
    type Display = LogDisplay;
}

impl LinuxPlatform {
    pub fn collaborators(
        config: &AppConfig,
        events: mpsc::Sender<WifiEvent>,
    ) -> Collaborators<Self> {
        let interface = &config.wifi.interface;
        let paths = &config.paths;

        Collaborators {
            wifi: NmcliWifi::new(interface, events),
            advertiser: AvahiAdvertiser::default(),
            firmware: FileFirmwareUpdater::new(
                &paths.firmware_staging_file,
                &paths.firmware_image_file,
            ),
            system: SystemdControl,
            hardware: ProcHardware::new(interface, &paths.firmware_image_file),
            display: LogDisplay::default(),
        }
    }
}

async fn run<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .context(format!("failed to run {program}"))?;

    ensure!(
        output.status.success(),
        "{program} failed: {}",
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Link state of one interface as reported by `nmcli -t device show`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkState {
    pub connected: bool,
    pub address: Option<(Ipv4Addr, Ipv4Addr)>,
}

pub fn prefix_to_netmask(prefix: u8) -> Result<Ipv4Addr> {
    ensure!(prefix <= 32, "invalid prefix length: {prefix}");

    Ok(Ipv4Addr::from(
        u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0),
    ))
}

fn netmask_to_prefix(netmask: Ipv4Addr) -> u32 {
    u32::from(netmask).count_ones()
}

pub fn parse_link_state(output: &str) -> Result<LinkState> {
    let mut link = LinkState::default();

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        if key == "GENERAL.STATE" {
            let code = value
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .parse::<u32>()
                .context(format!("failed to parse device state: {value}"))?;
            link.connected = code == NM_STATE_CONNECTED;
        } else if key.starts_with("IP4.ADDRESS") && link.address.is_none() {
            let (ip, prefix) = value
                .split_once('/')
                .context(format!("failed to parse address: {value}"))?;
            let ip = ip
                .parse::<Ipv4Addr>()
                .context(format!("failed to parse address: {value}"))?;
            let prefix = prefix
                .parse::<u8>()
                .context(format!("failed to parse prefix: {value}"))?;
            link.address = Some((ip, prefix_to_netmask(prefix)?));
        }
    }

    Ok(link)
}

/// Signal strength of the associated network from `nmcli -t device wifi list`
///
/// nmcli reports a 0-100 percentage which is mapped back to dBm.
pub fn parse_signal(output: &str) -> Option<i32> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("*:"))
        .and_then(|signal| signal.trim().parse::<i32>().ok())
        .map(|percent| percent.clamp(0, 100) / 2 - 100)
}

/// Station join and access point hosting through NetworkManager
pub struct NmcliWifi {
    interface: String,
    events: mpsc::Sender<WifiEvent>,
    monitor: Option<JoinHandle<()>>,
}

impl NmcliWifi {
    pub fn new(interface: &str, events: mpsc::Sender<WifiEvent>) -> Self {
        Self {
            interface: interface.to_string(),
            events,
            monitor: None,
        }
    }

    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }

    async fn replace_connection(&self, name: &str, settings: Vec<String>) -> Result<()> {
        if let Err(e) = run("nmcli", ["connection", "delete", name]).await {
            debug!("no previous connection {name}: {e:#}");
        }

        let mut args = vec![
            "connection".to_string(),
            "add".to_string(),
            "type".to_string(),
            "wifi".to_string(),
            "ifname".to_string(),
            self.interface.clone(),
            "con-name".to_string(),
            name.to_string(),
            "autoconnect".to_string(),
            "no".to_string(),
        ];
        args.extend(settings);

        run("nmcli", args)
            .await
            .context(format!("failed to create connection {name}"))?;

        Ok(())
    }

    fn station_settings(request: &JoinRequest) -> Vec<String> {
        let mut settings = vec![
            "ssid".to_string(),
            request.ssid.clone(),
            "ipv4.dhcp-hostname".to_string(),
            request.hostname.clone(),
        ];

        if !request.passphrase.is_empty() {
            settings.extend([
                "wifi-sec.key-mgmt".to_string(),
                "wpa-psk".to_string(),
                "wifi-sec.psk".to_string(),
                request.passphrase.clone(),
            ]);
        }

        match &request.addressing {
            Addressing::Dhcp => {
                settings.extend(["ipv4.method".to_string(), "auto".to_string()]);
            }
            Addressing::Static {
                ip,
                gateway,
                netmask,
                dns,
            } => {
                settings.extend([
                    "ipv4.method".to_string(),
                    "manual".to_string(),
                    "ipv4.addresses".to_string(),
                    format!("{ip}/{}", netmask_to_prefix(*netmask)),
                    "ipv4.gateway".to_string(),
                    gateway.to_string(),
                    "ipv4.dns".to_string(),
                    dns.to_string(),
                ]);
            }
        }

        settings
    }

    /// Bring the station connection up and report link changes until it drops
    async fn monitor_link(interface: String, events: mpsc::Sender<WifiEvent>) {
        if let Err(e) = run("nmcli", ["connection", "up", STATION_CONNECTION]).await {
            warn!("failed to activate {STATION_CONNECTION}: {e:#}");
            let _ = events.send(WifiEvent::Disconnected).await;
            return;
        }

        let mut reported = false;

        loop {
            let link = match run(
                "nmcli",
                ["-t", "-f", "GENERAL.STATE,IP4.ADDRESS", "device", "show", interface.as_str()],
            )
            .await
            .and_then(|output| parse_link_state(&output))
            {
                Ok(link) => link,
                Err(e) => {
                    warn!("failed to query {interface}: {e:#}");
                    LinkState::default()
                }
            };

            match (link.connected, link.address, reported) {
                (true, Some((ip, netmask)), false) => {
                    reported = true;
                    if events.send(WifiEvent::GotIp { ip, netmask }).await.is_err() {
                        return;
                    }
                }
                (false, _, true) => {
                    let _ = events.send(WifiEvent::Disconnected).await;
                    return;
                }
                _ => {}
            }

            tokio::time::sleep(LINK_POLL_INTERVAL).await;
        }
    }
}

impl Drop for NmcliWifi {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

impl WifiDriver for NmcliWifi {
    async fn join(&mut self, request: JoinRequest) -> Result<()> {
        self.stop_monitor();

        self.replace_connection(STATION_CONNECTION, Self::station_settings(&request))
            .await?;

        self.monitor = Some(tokio::spawn(Self::monitor_link(
            self.interface.clone(),
            self.events.clone(),
        )));

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_monitor();

        run("nmcli", ["device", "disconnect", self.interface.as_str()])
            .await
            .context("failed to disconnect")?;

        Ok(())
    }

    async fn start_access_point(&mut self, ssid: String) -> Result<Ipv4Addr> {
        self.stop_monitor();

        self.replace_connection(
            ACCESS_POINT_CONNECTION,
            vec![
                "ssid".to_string(),
                ssid,
                "802-11-wireless.mode".to_string(),
                "ap".to_string(),
                "ipv4.method".to_string(),
                "shared".to_string(),
                "ipv4.addresses".to_string(),
                format!("{ACCESS_POINT_ADDRESS}/24"),
            ],
        )
        .await?;

        run("nmcli", ["connection", "up", ACCESS_POINT_CONNECTION])
            .await
            .context("failed to activate access point")?;

        Ok(ACCESS_POINT_ADDRESS)
    }

    async fn rssi(&self) -> Result<i32> {
        let output = run(
            "nmcli",
            [
                "-t",
                "-f",
                "IN-USE,SIGNAL",
                "device",
                "wifi",
                "list",
                "ifname",
                self.interface.as_str(),
                "--rescan",
                "no",
            ],
        )
        .await?;

        parse_signal(&output).context("not associated")
    }
}

/// mDNS/DNS-SD announcement through Avahi
#[derive(Default)]
pub struct AvahiAdvertiser {
    publisher: Option<Child>,
}

impl NameAdvertiser for AvahiAdvertiser {
    async fn advertise(&mut self, advertisement: Advertisement) -> Result<()> {
        if let Some(mut publisher) = self.publisher.take() {
            if let Err(e) = publisher.kill().await {
                warn!("failed to stop previous announcement: {e:#}");
            }
        }

        if let Err(e) = run("avahi-set-host-name", [&advertisement.hostname]).await {
            warn!("failed to set mDNS host name: {e:#}");
        }

        let publisher = Command::new("avahi-publish-service")
            .arg(&advertisement.instance_name)
            .arg(format!(
                "_{}._{}",
                advertisement.service, advertisement.protocol
            ))
            .arg(advertisement.port.to_string())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn avahi-publish-service")?;

        info!(
            "announcing {} as {}.local",
            advertisement.instance_name, advertisement.hostname
        );

        self.publisher = Some(publisher);
        Ok(())
    }
}

pub fn parse_meminfo(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|value| value.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut octets = [0u8; 6];
    let mut parts = mac.trim().split(':');

    for octet in octets.iter_mut() {
        *octet = u8::from_str_radix(parts.next()?, 16).ok()?;
    }

    parts.next().is_none().then_some(octets)
}

fn is_physical_block_device(name: &str) -> bool {
    !["loop", "ram", "zram", "dm-", "md"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Identity and resource figures of the host
pub struct ProcHardware {
    mac: [u8; 6],
    image_file: PathBuf,
}

impl ProcHardware {
    pub fn new(interface: &str, image_file: &Path) -> Self {
        let address_file = Path::new("/sys/class/net").join(interface).join("address");

        let mac = fs::read_to_string(&address_file)
            .ok()
            .and_then(|mac| parse_mac(&mac))
            .unwrap_or_else(|| {
                warn!("failed to read MAC address from {address_file:?}");
                [0; 6]
            });

        Self {
            mac,
            image_file: image_file.to_path_buf(),
        }
    }

    fn storage_size() -> Result<u64> {
        let device = fs::read_dir("/sys/block")
            .context("failed to list block devices")?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .find(|name| is_physical_block_device(name))
            .context("no block device found")?;

        let sectors = fs::read_to_string(Path::new("/sys/block").join(&device).join("size"))
            .context(format!("failed to read size of {device}"))?;

        Ok(sectors
            .trim()
            .parse::<u64>()
            .context(format!("failed to parse size of {device}"))?
            * 512)
    }

    fn storage_id() -> Result<String> {
        let machine_id =
            fs::read_to_string("/etc/machine-id").context("failed to read machine id")?;

        match machine_id.trim().get(..6) {
            Some(id) => Ok(id.to_string()),
            None => bail!("machine id too short"),
        }
    }
}

impl HardwareInfo for ProcHardware {
    fn chip_id(&self) -> u32 {
        u32::from_be_bytes([0, self.mac[3], self.mac[4], self.mac[5]])
    }

    fn mac_address(&self) -> String {
        self.mac
            .iter()
            .map(|octet| format!("{octet:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn flash_geometry(&self) -> FlashGeometry {
        FlashGeometry {
            chip_id: Self::storage_id().unwrap_or_else(|e| {
                debug!("{e:#}");
                String::new()
            }),
            used_size: fs::metadata(&self.image_file)
                .map(|metadata| metadata.len())
                .unwrap_or(0),
            real_size: Self::storage_size().unwrap_or_else(|e| {
                debug!("{e:#}");
                0
            }),
        }
    }

    fn free_memory(&self) -> u64 {
        fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo(&content))
            .unwrap_or(0)
    }
}

/// Firmware images are staged next to the active one and swapped on finish
pub struct FileFirmwareUpdater {
    staging_file: PathBuf,
    image_file: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
}

impl FileFirmwareUpdater {
    pub fn new(staging_file: &Path, image_file: &Path) -> Self {
        Self {
            staging_file: staging_file.to_path_buf(),
            image_file: image_file.to_path_buf(),
            file: None,
            written: 0,
        }
    }
}

impl FirmwareUpdater for FileFirmwareUpdater {
    async fn begin(&mut self) -> Result<()> {
        self.written = 0;
        self.file = Some(
            tokio::fs::File::create(&self.staging_file)
                .await
                .context(format!("failed to create {:?}", self.staging_file))?,
        );

        Ok(())
    }

    async fn write(&mut self, data: Vec<u8>) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .context("no firmware update in progress")?;

        file.write_all(&data)
            .await
            .context("failed to write firmware chunk")?;
        self.written += data.len() as u64;

        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let mut file = self.file.take().context("no firmware update in progress")?;

        ensure!(self.written > 0, "empty firmware image");

        file.flush().await.context("failed to flush firmware image")?;
        file.sync_all()
            .await
            .context("failed to sync firmware image")?;
        drop(file);

        tokio::fs::rename(&self.staging_file, &self.image_file)
            .await
            .context("failed to install firmware image")?;

        info!("installed {} byte firmware image", self.written);
        Ok(())
    }

    async fn remount_storage(&mut self) -> Result<()> {
        let dir = self
            .image_file
            .parent()
            .context("firmware image has no parent directory")?;

        tokio::fs::create_dir_all(dir)
            .await
            .context(format!("failed to remount {dir:?}"))?;

        Ok(())
    }
}

pub struct SystemdControl;

impl SystemControl for SystemdControl {
    async fn restart(&mut self) -> Result<()> {
        run("systemctl", ["reboot"])
            .await
            .context("failed to request reboot")?;

        Ok(())
    }
}

/// Status display that writes status changes to the log
#[derive(Default)]
pub struct LogDisplay {
    last: Option<ConnectionStatus>,
}

impl StatusDisplay for LogDisplay {
    fn update_status(&mut self, status: &ConnectionState) {
        if self.last == Some(status.status) {
            debug!(
                "status: {:?} {} {} {}%",
                status.status, status.ssid, status.local_ip, status.signal_quality
            );
            return;
        }

        info!(
            "status: {:?} {} {}/{}",
            status.status, status.ssid, status.local_ip, status.subnet_mask
        );
        self.last = Some(status.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_link_state_connected() {
        let output = "GENERAL.STATE:100 (connected)\nIP4.ADDRESS[1]:192.168.1.50/24\n";

        assert_eq!(
            parse_link_state(output).expect("should parse"),
            LinkState {
                connected: true,
                address: Some((
                    Ipv4Addr::new(192, 168, 1, 50),
                    Ipv4Addr::new(255, 255, 255, 0)
                )),
            }
        );
    }

    #[test]
    fn test_parse_link_state_disconnected() {
        let link = parse_link_state("GENERAL.STATE:30 (disconnected)\n").expect("should parse");

        assert!(!link.connected);
        assert!(link.address.is_none());
    }

    #[test]
    fn test_parse_link_state_rejects_garbage() {
        assert!(parse_link_state("GENERAL.STATE:unknown\n").is_err());
        assert!(parse_link_state("IP4.ADDRESS[1]:192.168.1.50\n").is_err());
    }

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(0).unwrap(), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_netmask(16).unwrap(), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(
            prefix_to_netmask(32).unwrap(),
            Ipv4Addr::new(255, 255, 255, 255)
        );
        assert!(prefix_to_netmask(33).is_err());
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)), 24);
    }

    #[test]
    fn test_parse_signal() {
        let output = " :72\n*:80\n :40\n";

        assert_eq!(parse_signal(output), Some(-60));
        assert_eq!(parse_signal(" :80\n"), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:        3884096 kB\nMemFree:          301112 kB\nMemAvailable:    2000000 kB\n";

        assert_eq!(parse_meminfo(content), Some(2_048_000_000));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_parse_mac_and_chip_id() {
        let mac = parse_mac("dc:a6:32:ab:c1:23\n").expect("should parse");
        let hardware = ProcHardware {
            mac,
            image_file: PathBuf::from("/nonexistent"),
        };

        assert_eq!(hardware.chip_id(), 0xabc123);
        assert_eq!(hardware.mac_address(), "DC:A6:32:AB:C1:23");
        assert!(parse_mac("dc:a6:32").is_none());
        assert!(parse_mac("dc:a6:32:ab:c1:23:00").is_none());
    }

    #[test]
    fn test_block_device_filter() {
        assert!(is_physical_block_device("mmcblk0"));
        assert!(is_physical_block_device("sda"));
        assert!(!is_physical_block_device("loop3"));
        assert!(!is_physical_block_device("zram0"));
    }

    #[tokio::test]
    async fn test_firmware_image_installed_on_finish() {
        let dir = TempDir::new().expect("should create temp dir");
        let staging = dir.path().join("firmware.part");
        let image = dir.path().join("firmware.bin");
        let mut updater = FileFirmwareUpdater::new(&staging, &image);

        updater.begin().await.expect("should begin");
        updater.write(b"EFU\0".to_vec()).await.expect("should write");
        updater.write(b"body".to_vec()).await.expect("should write");
        assert!(!image.exists());

        updater.finish().await.expect("should finish");
        updater.remount_storage().await.expect("should remount");

        assert_eq!(fs::read(&image).expect("should read image"), b"EFU\0body");
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_firmware_finish_rejects_empty_image() {
        let dir = TempDir::new().expect("should create temp dir");
        let image = dir.path().join("firmware.bin");
        let mut updater = FileFirmwareUpdater::new(&dir.path().join("firmware.part"), &image);

        assert!(updater.write(vec![1]).await.is_err());

        updater.begin().await.expect("should begin");
        assert!(updater.finish().await.is_err());
        assert!(!image.exists());
    }
}
