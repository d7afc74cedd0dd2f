//! Device runtime
//!
//! One task owns every piece of device state and serves requests, wireless
//! events, deferred timers and the status refresh in turn. Clients talk to it
//! only through a [`DeviceHandle`].

use crate::{
    platform::{
        Collaborators, HardwareInfo, Platform, StatusDisplay, SystemControl, WifiDriver,
        WifiEvent,
    },
    services::{
        config_store::{ConfigStore, LoadOutcome},
        connectivity::{ConnectionStatus, ConnectivitySupervisor},
        control::{ControlChannel, ControlContext},
        reboot::RebootFlag,
        status::StatusReporter,
        upload::{ConfigUpload, FirmwareUpload, UploadChunk, UploadKind, UploadResponse},
    },
};
use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};
use std::{path::PathBuf, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{Instant, sleep, sleep_until},
};

/// Grace period between the reboot request and the restart
pub const REBOOT_DELAY: Duration = Duration::from_millis(100);

/// Broadcast to every client when an upload begins
pub const UPLOAD_NOTICE: &str = "X6";

const REQUEST_QUEUE: usize = 16;
const NOTICE_QUEUE: usize = 8;

#[derive(Debug, PartialEq, Eq)]
pub enum UploadReply {
    Accepted(UploadResponse),
    /// Uploads are not served in access point mode
    Refused,
}

pub enum Request {
    Control {
        frame: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Upload {
        kind: UploadKind,
        chunk: UploadChunk,
        reply: oneshot::Sender<UploadReply>,
    },
    Reconnect {
        reply: oneshot::Sender<bool>,
    },
    Config {
        reply: oneshot::Sender<Result<String>>,
    },
    FreeMemory {
        reply: oneshot::Sender<u64>,
    },
}

/// Cloneable client side of the device loop
#[derive(Clone)]
pub struct DeviceHandle {
    requests: mpsc::Sender<Request>,
    notices: broadcast::Sender<String>,
}

impl DeviceHandle {
    /// Create a handle together with the receiving ends for [`Device::new`]
    pub fn channel() -> (Self, mpsc::Receiver<Request>) {
        let (requests, receiver) = mpsc::channel(REQUEST_QUEUE);
        let (notices, _) = broadcast::channel(NOTICE_QUEUE);

        (Self { requests, notices }, receiver)
    }

    pub fn notices(&self) -> broadcast::Sender<String> {
        self.notices.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notices.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();

        self.requests
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("device loop stopped"))?;

        response.await.context("device loop dropped the request")
    }

    pub async fn control(&self, frame: String) -> Result<Option<String>> {
        self.request(|reply| Request::Control { frame, reply }).await
    }

    pub async fn upload(&self, kind: UploadKind, chunk: UploadChunk) -> Result<UploadReply> {
        self.request(|reply| Request::Upload { kind, chunk, reply })
            .await
    }

    pub async fn reconnect(&self) -> Result<bool> {
        self.request(|reply| Request::Reconnect { reply }).await
    }

    pub async fn config(&self) -> Result<String> {
        self.request(|reply| Request::Config { reply }).await?
    }

    pub async fn free_memory(&self) -> Result<u64> {
        self.request(|reply| Request::FreeMemory { reply }).await
    }
}

pub struct Device<P: Platform> {
    store: ConfigStore,
    supervisor: ConnectivitySupervisor<P::Wifi, P::Advertiser>,
    firmware_upload: FirmwareUpload<P::Firmware>,
    config_upload: ConfigUpload,
    reporter: StatusReporter,
    reboot: RebootFlag,
    system: P::System,
    hardware: P::Hardware,
    display: P::Display,
    requests: mpsc::Receiver<Request>,
    events: mpsc::Receiver<WifiEvent>,
    notices: broadcast::Sender<String>,
    rssi: i32,
    started: Instant,
}

impl<P: Platform> Device<P> {
    pub fn new(
        collaborators: Collaborators<P>,
        config_file: impl Into<PathBuf>,
        http_port: u16,
        handle: &DeviceHandle,
        requests: mpsc::Receiver<Request>,
        events: mpsc::Receiver<WifiEvent>,
    ) -> Self {
        let chip_id = collaborators.hardware.chip_id();

        Self {
            store: ConfigStore::new(config_file, chip_id),
            supervisor: ConnectivitySupervisor::new(
                collaborators.wifi,
                collaborators.advertiser,
                chip_id,
                http_port,
            ),
            firmware_upload: FirmwareUpload::new(collaborators.firmware),
            config_upload: ConfigUpload::new(),
            reporter: StatusReporter::new(),
            reboot: RebootFlag::default(),
            system: collaborators.system,
            hardware: collaborators.hardware,
            display: collaborators.display,
            requests,
            events,
            notices: handle.notices(),
            rssi: 0,
            started: Instant::now(),
        }
    }

    /// Load the configuration and bring the network up
    ///
    /// Access point mode is entered when forced, when there was no usable
    /// configuration, or when the join fails and fallback is enabled. A failed
    /// join without fallback schedules a restart.
    pub async fn start(&mut self, force_access_point: bool) {
        let outcome = self.store.load();
        let config = self.store.config();
        let forced = force_access_point || outcome != LoadOutcome::Loaded;

        let joined = if forced {
            info!("starting in access point mode ({outcome:?})");
            false
        } else {
            self.supervisor
                .connect_at_startup(config, &mut self.events)
                .await
        };

        if joined {
            return;
        }

        if forced || config.ap_fallback {
            if let Err(e) = self.supervisor.start_access_point(&config.hostname).await {
                error!("{e:#}");
                self.reboot.request("access point unavailable");
            }
        } else {
            self.reboot.request("station join failed without access point fallback");
        }
    }

    /// Serve until a restart is due or every client handle is gone
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.supervisor.take_changed() {
                self.reporter.mark_dirty();
            }

            if self.reboot.is_pending() {
                return self.restart().await;
            }

            let timer = self.supervisor.pending_timer();
            let refresh = self.reporter.next_refresh();

            tokio::select! {
                biased;

                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        info!("all device handles dropped");
                        return Ok(());
                    }
                },
                Some(event) = self.events.recv() => {
                    debug!("wifi event: {event:?}");
                    self.supervisor.handle_event(event, self.store.config()).await;
                },
                _ = sleep_until(timer.map(|(deadline, _)| deadline).unwrap_or(refresh)), if timer.is_some() => {
                    self.supervisor.fire_timer(self.store.config()).await;
                },
                _ = sleep_until(refresh) => self.refresh_status().await,
            }
        }
    }

    async fn restart(&mut self) -> Result<()> {
        sleep(REBOOT_DELAY).await;
        info!("restarting");

        self.system.restart().await.context("failed to restart")
    }

    async fn refresh_status(&mut self) {
        if self.supervisor.state().is_connected() {
            match self.supervisor.wifi().rssi().await {
                Ok(rssi) => self.rssi = rssi,
                Err(e) => debug!("failed to query rssi: {e:#}"),
            }
        } else {
            self.rssi = 0;
        }

        let snapshot = self
            .reporter
            .refresh(self.supervisor.state(), self.rssi, Instant::now());
        self.display.update_status(&snapshot);
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Control { frame, reply } => {
                let mut context = ControlContext {
                    store: &mut self.store,
                    connection: self.supervisor.state(),
                    hardware: &self.hardware,
                    rssi: self.rssi,
                    uptime: self.started.elapsed(),
                    reboot: &mut self.reboot,
                };
                let _ = reply.send(ControlChannel::dispatch(&frame, &mut context));
            }
            Request::Upload { kind, chunk, reply } => {
                let _ = reply.send(self.upload(kind, chunk).await);
            }
            Request::Reconnect { reply } => {
                info!("reconnect requested");
                let _ = reply.send(self.supervisor.reconnect(self.store.config()));
            }
            Request::Config { reply } => {
                let _ = reply.send(self.store.serialize_pretty(false));
            }
            Request::FreeMemory { reply } => {
                let _ = reply.send(self.hardware.free_memory());
            }
        }
    }

    async fn upload(&mut self, kind: UploadKind, chunk: UploadChunk) -> UploadReply {
        if self.supervisor.state().status == ConnectionStatus::LocalAccessPoint {
            warn!("refusing {kind:?} upload in access point mode");
            return UploadReply::Refused;
        }

        if chunk.offset == 0 && self.notices.send(UPLOAD_NOTICE.to_string()).is_err() {
            debug!("no clients to notify about upload");
        }

        let response = match kind {
            UploadKind::Config => self.config_upload.process(chunk, &mut self.store),
            UploadKind::Firmware => {
                self.firmware_upload
                    .process(chunk, &self.store, &mut self.reboot)
                    .await
            }
        };

        UploadReply::Accepted(response)
    }
}
