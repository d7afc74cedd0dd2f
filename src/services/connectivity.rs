//! Wireless connection supervision
//!
//! [`ConnectivitySupervisor`] owns the live [`ConnectionState`] and drives the
//! station join, the fixed-interval reconnect after link loss and the access
//! point fallback. Deferred work is kept as a single pending [`Timer`] which
//! the device loop fires via
//! [`ConnectivitySupervisor::fire_timer`].

use crate::{
    platform::{Advertisement, JoinRequest, NameAdvertiser, WifiDriver, WifiEvent},
    services::config_store::Configuration,
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use std::{net::Ipv4Addr, ops::Range, time::Duration};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until, timeout_at},
};

/// Delay between a link loss and the next join attempt
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Randomized delay before each join request, in milliseconds
pub const JOIN_JITTER_MS: Range<u64> = 100..500;

const ACCESS_POINT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    LocalAccessPoint,
}

/// Snapshot of the wireless link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub ssid: String,
    pub local_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Percentage, only meaningful while connected
    pub signal_quality: u8,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            ssid: String::new(),
            local_ip: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::UNSPECIFIED,
            signal_quality: 0,
        }
    }
}

impl ConnectionState {
    fn with_status(status: ConnectionStatus, ssid: &str) -> Self {
        Self {
            status,
            ssid: ssid.to_string(),
            ..Default::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Deferred supervisor work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    /// Request the join once the startup jitter elapsed
    Join,
    /// Restart the connect sequence after a link loss
    Reconnect,
    /// Give up on a join that got no address within `sta_timeout`
    JoinTimeout,
}

pub struct ConnectivitySupervisor<W, A>
where
    W: WifiDriver,
    A: NameAdvertiser,
{
    wifi: W,
    advertiser: A,
    chip_id: u32,
    http_port: u16,
    state: ConnectionState,
    timer: Option<(Instant, Timer)>,
    changed: bool,
}

impl<W, A> ConnectivitySupervisor<W, A>
where
    W: WifiDriver,
    A: NameAdvertiser,
{
    pub fn new(wifi: W, advertiser: A, chip_id: u32, http_port: u16) -> Self {
        Self {
            wifi,
            advertiser,
            chip_id,
            http_port,
            state: ConnectionState::default(),
            timer: None,
            changed: true,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn wifi(&self) -> &W {
        &self.wifi
    }

    pub fn advertiser(&self) -> &A {
        &self.advertiser
    }

    pub fn pending_timer(&self) -> Option<(Instant, Timer)> {
        self.timer
    }

    /// Returns whether the state changed since the last call
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    fn transition(&mut self, state: ConnectionState) {
        debug!("connection state: {:?} -> {:?}", self.state.status, state.status);
        self.state = state;
        self.changed = true;
    }

    /// Start the connect sequence for the configured network
    ///
    /// Without a configured network name this is a no-op and returns false.
    /// Otherwise the state becomes `Connecting` and the join request is
    /// deferred by a random jitter.
    pub fn initiate_connection(&mut self, config: &Configuration) -> bool {
        if config.ssid.is_empty() {
            info!("no wireless network configured");
            return false;
        }

        info!("connecting to {} as {}", config.ssid, config.hostname);
        self.transition(ConnectionState::with_status(
            ConnectionStatus::Connecting,
            &config.ssid,
        ));

        let jitter = Duration::from_millis(rand::rng().random_range(JOIN_JITTER_MS));
        self.timer = Some((Instant::now() + jitter, Timer::Join));
        true
    }

    /// Explicit reconnect request from outside, also leaves access point mode
    pub fn reconnect(&mut self, config: &Configuration) -> bool {
        self.timer = None;
        self.initiate_connection(config)
    }

    /// Run the pending timer, if any
    pub async fn fire_timer(&mut self, config: &Configuration) {
        let Some((_, timer)) = self.timer.take() else {
            return;
        };

        match timer {
            Timer::Join => {
                if let Err(e) = self.request_join(config).await {
                    error!("{e:#}");
                    self.on_link_lost(config);
                    return;
                }

                let deadline = Instant::now() + Duration::from_secs(u64::from(config.sta_timeout));
                self.timer = Some((deadline, Timer::JoinTimeout));
            }
            Timer::Reconnect => {
                self.initiate_connection(config);
            }
            Timer::JoinTimeout => {
                if self.state.status != ConnectionStatus::Connecting {
                    return;
                }

                warn!(
                    "failed to connect to {} within {}s",
                    config.ssid, config.sta_timeout
                );
                self.abort_join(config).await;
                self.on_link_lost(config);
            }
        }
    }

    async fn request_join(&mut self, config: &Configuration) -> Result<()> {
        let request = JoinRequest {
            ssid: config.ssid.clone(),
            passphrase: config.passphrase.clone(),
            hostname: config.hostname.clone(),
            addressing: config.addressing(),
        };

        if config.dhcp {
            info!("joining {} with DHCP", config.ssid);
        } else {
            info!("joining {} with static IP", config.ssid);
        }

        self.wifi
            .join(request)
            .await
            .context(format!("failed to request join of {}", config.ssid))
    }

    /// Startup join: connect and wait up to `sta_timeout` for the address
    ///
    /// Blocks the caller, which is acceptable only while no client traffic
    /// is served yet. Returns false when the attempt was aborted; resolving
    /// that (fallback or restart) is up to the caller.
    pub async fn connect_at_startup(
        &mut self,
        config: &Configuration,
        events: &mut mpsc::Receiver<WifiEvent>,
    ) -> bool {
        if !self.initiate_connection(config) {
            return false;
        }

        if let Some((jitter_deadline, Timer::Join)) = self.timer.take() {
            sleep_until(jitter_deadline).await;
        }

        if let Err(e) = self.request_join(config).await {
            error!("{e:#}");
            self.abort_join(config).await;
            return false;
        }

        let deadline = Instant::now() + Duration::from_secs(u64::from(config.sta_timeout));

        loop {
            match timeout_at(deadline, events.recv()).await {
                Ok(Some(WifiEvent::GotIp { ip, netmask })) => {
                    self.on_connected(ip, netmask, config).await;
                    return true;
                }
                Ok(Some(WifiEvent::Disconnected)) => {
                    debug!("still waiting for {}", config.ssid);
                }
                Ok(None) => {
                    warn!("wireless event channel closed");
                    break;
                }
                Err(_) => break,
            }
        }

        warn!(
            "failed to connect to {} within {}s",
            config.ssid, config.sta_timeout
        );
        self.abort_join(config).await;
        false
    }

    async fn abort_join(&mut self, config: &Configuration) {
        self.timer = None;

        if let Err(e) = self.wifi.disconnect().await {
            warn!("failed to abort join: {e:#}");
        }

        self.transition(ConnectionState::with_status(
            ConnectionStatus::Disconnected,
            &config.ssid,
        ));
    }

    pub async fn handle_event(&mut self, event: WifiEvent, config: &Configuration) {
        match event {
            WifiEvent::GotIp { ip, netmask } => self.on_connected(ip, netmask, config).await,
            WifiEvent::Disconnected => self.on_link_lost(config),
        }
    }

    /// Join completed: record the address and announce the hostname
    pub async fn on_connected(&mut self, ip: Ipv4Addr, netmask: Ipv4Addr, config: &Configuration) {
        if self.state.status == ConnectionStatus::LocalAccessPoint {
            debug!("ignoring station address {ip} in access point mode");
            return;
        }

        info!("connected with IP: {ip}");

        self.timer = None;
        self.transition(ConnectionState {
            status: ConnectionStatus::Connected,
            ssid: config.ssid.clone(),
            local_ip: ip,
            subnet_mask: netmask,
            signal_quality: 0,
        });

        let advertisement = Advertisement {
            hostname: config.hostname.clone(),
            instance_name: format!("{} ({:x})", config.id, self.chip_id),
            service: "http".to_string(),
            protocol: "tcp".to_string(),
            port: self.http_port,
        };

        if let Err(e) = self.advertiser.advertise(advertisement).await {
            error!("failed to set up name advertisement: {e:#}");
        }
    }

    /// Link lost: go `Disconnected` and schedule exactly one reconnect
    pub fn on_link_lost(&mut self, config: &Configuration) {
        if self.state.status == ConnectionStatus::LocalAccessPoint {
            debug!("ignoring station disconnect in access point mode");
            return;
        }

        warn!("wifi disconnected");

        self.transition(ConnectionState::with_status(
            ConnectionStatus::Disconnected,
            &config.ssid,
        ));
        self.timer = Some((Instant::now() + RECONNECT_DELAY, Timer::Reconnect));
    }

    /// Host an access point named `hostname`
    ///
    /// There is no automatic way back to station mode from here.
    pub async fn start_access_point(&mut self, hostname: &str) -> Result<()> {
        self.timer = None;

        let ip = self
            .wifi
            .start_access_point(hostname.to_string())
            .await
            .context("failed to start access point")?;

        info!("access point {hostname} up at {ip}");

        self.transition(ConnectionState {
            status: ConnectionStatus::LocalAccessPoint,
            ssid: hostname.to_string(),
            local_ip: ip,
            subnet_mask: ACCESS_POINT_NETMASK,
            signal_quality: 0,
        });

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::Addressing;
    use anyhow::bail;

    #[derive(Default)]
    pub(crate) struct FakeWifi {
        pub joins: Vec<JoinRequest>,
        pub disconnects: usize,
        pub access_points: Vec<String>,
        pub fail_join: bool,
        pub rssi: i32,
    }

    impl WifiDriver for FakeWifi {
        async fn join(&mut self, request: JoinRequest) -> Result<()> {
            self.joins.push(request);
            if self.fail_join {
                bail!("radio busy");
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.disconnects += 1;
            Ok(())
        }

        async fn start_access_point(&mut self, ssid: String) -> Result<Ipv4Addr> {
            self.access_points.push(ssid);
            Ok(Ipv4Addr::new(192, 168, 4, 1))
        }

        async fn rssi(&self) -> Result<i32> {
            Ok(self.rssi)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeAdvertiser {
        pub advertisements: Vec<Advertisement>,
        pub fail: bool,
    }

    impl NameAdvertiser for FakeAdvertiser {
        async fn advertise(&mut self, advertisement: Advertisement) -> Result<()> {
            self.advertisements.push(advertisement);
            if self.fail {
                bail!("responder unavailable");
            }
            Ok(())
        }
    }

    type Supervisor = ConnectivitySupervisor<FakeWifi, FakeAdvertiser>;

    fn supervisor() -> Supervisor {
        ConnectivitySupervisor::new(FakeWifi::default(), FakeAdvertiser::default(), 0xabc123, 80)
    }

    fn lab_config() -> Configuration {
        Configuration {
            id: "Porch".to_string(),
            ssid: "Lab".to_string(),
            passphrase: "secret".to_string(),
            hostname: "pixels".to_string(),
            dhcp: true,
            sta_timeout: 5,
            ap_timeout: 60,
            ..Default::default()
        }
    }

    const LEASE: WifiEvent = WifiEvent::GotIp {
        ip: Ipv4Addr::new(192, 168, 1, 50),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
    };

    #[tokio::test(start_paused = true)]
    async fn test_empty_network_name_never_joins() {
        let mut supervisor = supervisor();
        let config = Configuration {
            ssid: String::new(),
            ..lab_config()
        };
        let (_tx, mut rx) = mpsc::channel(4);

        assert!(!supervisor.initiate_connection(&config));
        assert!(!supervisor.connect_at_startup(&config, &mut rx).await);

        assert_eq!(supervisor.state().status, ConnectionStatus::Disconnected);
        assert!(supervisor.pending_timer().is_none());
        assert!(supervisor.wifi().joins.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_join_times_out() {
        let mut supervisor = supervisor();
        let config = lab_config();
        let (_tx, mut rx) = mpsc::channel(4);
        let start = Instant::now();

        assert!(!supervisor.connect_at_startup(&config, &mut rx).await);

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(supervisor.state().status, ConnectionStatus::Disconnected);
        assert_eq!(supervisor.wifi().joins.len(), 1);
        assert_eq!(supervisor.wifi().disconnects, 1);
        assert!(supervisor.pending_timer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_join_succeeds_and_advertises() {
        let mut supervisor = supervisor();
        let config = lab_config();
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(WifiEvent::Disconnected).await.expect("should send");
        tx.send(LEASE).await.expect("should send");

        assert!(supervisor.connect_at_startup(&config, &mut rx).await);

        let state = supervisor.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.ssid, "Lab");
        assert_eq!(state.local_ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(state.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));

        let join = &supervisor.wifi().joins[0];
        assert_eq!(join.ssid, "Lab");
        assert_eq!(join.passphrase, "secret");
        assert_eq!(join.addressing, Addressing::Dhcp);

        let advertisement = &supervisor.advertiser().advertisements[0];
        assert_eq!(advertisement.hostname, "pixels");
        assert_eq!(advertisement.instance_name, "Porch (abc123)");
        assert_eq!(advertisement.service, "http");
        assert_eq!(advertisement.port, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertisement_failure_is_soft() {
        let mut supervisor = supervisor();
        supervisor.advertiser.fail = true;
        let config = lab_config();

        supervisor.handle_event(LEASE, &config).await;

        assert_eq!(supervisor.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_schedules_single_reconnect() {
        let mut supervisor = supervisor();
        let config = lab_config();
        supervisor.handle_event(LEASE, &config).await;
        supervisor.take_changed();

        supervisor.handle_event(WifiEvent::Disconnected, &config).await;

        assert_eq!(supervisor.state().status, ConnectionStatus::Disconnected);
        assert!(supervisor.take_changed());
        assert_eq!(
            supervisor.pending_timer(),
            Some((Instant::now() + RECONNECT_DELAY, Timer::Reconnect))
        );

        // a repeated loss replaces the pending reconnect instead of adding one
        tokio::time::advance(Duration::from_secs(1)).await;
        supervisor.on_link_lost(&config);
        assert_eq!(
            supervisor.pending_timer(),
            Some((Instant::now() + RECONNECT_DELAY, Timer::Reconnect))
        );

        tokio::time::advance(RECONNECT_DELAY).await;
        supervisor.fire_timer(&config).await;
        assert_eq!(supervisor.state().status, ConnectionStatus::Connecting);
        assert!(matches!(supervisor.pending_timer(), Some((_, Timer::Join))));

        supervisor.fire_timer(&config).await;
        assert_eq!(supervisor.wifi().joins.len(), 1);
        assert_eq!(
            supervisor.pending_timer(),
            Some((Instant::now() + Duration::from_secs(5), Timer::JoinTimeout))
        );

        supervisor.handle_event(LEASE, &config).await;
        assert_eq!(supervisor.state().status, ConnectionStatus::Connected);
        assert!(supervisor.pending_timer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_retry_join_times_out_and_retries() {
        let mut supervisor = supervisor();
        let config = lab_config();
        supervisor.handle_event(LEASE, &config).await;
        supervisor.handle_event(WifiEvent::Disconnected, &config).await;

        tokio::time::advance(RECONNECT_DELAY).await;
        supervisor.fire_timer(&config).await;
        supervisor.fire_timer(&config).await;
        assert_eq!(supervisor.state().status, ConnectionStatus::Connecting);
        assert_eq!(supervisor.wifi().joins.len(), 1);

        let Some((deadline, Timer::JoinTimeout)) = supervisor.pending_timer() else {
            panic!("join should carry a deadline");
        };
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(deadline <= Instant::now());
        supervisor.fire_timer(&config).await;

        assert_eq!(supervisor.state().status, ConnectionStatus::Disconnected);
        assert_eq!(supervisor.wifi().disconnects, 1);
        assert_eq!(
            supervisor.pending_timer(),
            Some((Instant::now() + RECONNECT_DELAY, Timer::Reconnect))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_after_connect_is_ignored() {
        let mut supervisor = supervisor();
        let config = lab_config();
        supervisor.initiate_connection(&config);
        supervisor.fire_timer(&config).await;
        supervisor.handle_event(LEASE, &config).await;

        // a deadline that slipped past on_connected must not drop the link
        supervisor.timer = Some((Instant::now(), Timer::JoinTimeout));
        supervisor.fire_timer(&config).await;

        assert_eq!(supervisor.state().status, ConnectionStatus::Connected);
        assert_eq!(supervisor.wifi().disconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_join_request_retries() {
        let mut supervisor = supervisor();
        supervisor.wifi.fail_join = true;
        let config = lab_config();

        assert!(supervisor.initiate_connection(&config));
        supervisor.fire_timer(&config).await;

        assert_eq!(supervisor.state().status, ConnectionStatus::Disconnected);
        assert!(matches!(
            supervisor.pending_timer(),
            Some((_, Timer::Reconnect))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_point_ignores_station_events() {
        let mut supervisor = supervisor();
        let config = lab_config();

        supervisor
            .start_access_point("esps-abc123")
            .await
            .expect("should start access point");

        let state = supervisor.state().clone();
        assert_eq!(state.status, ConnectionStatus::LocalAccessPoint);
        assert_eq!(state.ssid, "esps-abc123");
        assert_eq!(state.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));

        supervisor.handle_event(WifiEvent::Disconnected, &config).await;
        supervisor.handle_event(LEASE, &config).await;

        assert_eq!(supervisor.state(), &state);
        assert!(supervisor.pending_timer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_leaves_access_point_mode() {
        let mut supervisor = supervisor();
        let config = lab_config();
        supervisor
            .start_access_point("esps-abc123")
            .await
            .expect("should start access point");

        assert!(supervisor.reconnect(&config));

        assert_eq!(supervisor.state().status, ConnectionStatus::Connecting);
        assert!(matches!(supervisor.pending_timer(), Some((_, Timer::Join))));
    }

    #[cfg(feature = "mock")]
    mod mocked {
        use super::*;
        use crate::platform::{MockNameAdvertiser, MockWifiDriver};

        #[tokio::test(start_paused = true)]
        async fn static_addressing_is_forwarded_to_driver() {
            let mut wifi = MockWifiDriver::default();
            wifi.expect_join()
                .withf(|request| {
                    request.addressing
                        == Addressing::Static {
                            ip: Ipv4Addr::new(10, 0, 0, 9),
                            gateway: Ipv4Addr::new(10, 0, 0, 1),
                            netmask: Ipv4Addr::new(255, 0, 0, 0),
                            dns: Ipv4Addr::new(10, 0, 0, 1),
                        }
                })
                .times(1)
                .returning(|_| Box::pin(async { Ok(()) }));

            let mut supervisor =
                ConnectivitySupervisor::new(wifi, MockNameAdvertiser::default(), 1, 80);
            let config = Configuration {
                dhcp: false,
                ip: [10, 0, 0, 9],
                gateway: [10, 0, 0, 1],
                netmask: [255, 0, 0, 0],
                ..lab_config()
            };

            assert!(supervisor.initiate_connection(&config));
            supervisor.fire_timer(&config).await;
        }
    }
}
