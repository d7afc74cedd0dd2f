//! Staged uploads
//!
//! Uploads arrive as ordered chunks carrying their byte offset and a final
//! flag. A chunk at offset 0 starts a new session and abandons whatever the
//! previous session of the same kind left behind.

use crate::{
    platform::FirmwareUpdater,
    services::{
        config_store::{CONFIG_MAX_SIZE, ConfigStore},
        reboot::RebootFlag,
    },
};
use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UploadKind {
    Firmware,
    Config,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadChunk {
    pub offset: usize,
    pub data: Vec<u8>,
    pub last: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadState {
    #[default]
    Idle,
    Accumulating,
    Complete,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadResponse {
    /// Chunk accepted, more expected
    Continue,
    Finished,
    Error(String),
}

/// Configuration file upload, buffered up to [`CONFIG_MAX_SIZE`]
#[derive(Default)]
pub struct ConfigUpload {
    buffer: Option<Vec<u8>>,
    state: UploadState,
    error: Option<String>,
}

impl ConfigUpload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn process(&mut self, chunk: UploadChunk, store: &mut ConfigStore) -> UploadResponse {
        if chunk.offset == 0 {
            if self.buffer.is_some() {
                warn!("discarding abandoned configuration upload");
            }
            info!("configuration upload started");

            self.buffer = Some(Vec::with_capacity(CONFIG_MAX_SIZE));
            self.state = UploadState::Accumulating;
            self.error = None;
        }

        debug!(
            "configuration chunk at {} with {} bytes",
            chunk.offset,
            chunk.data.len()
        );

        if self.state == UploadState::Accumulating {
            if let Err(e) = self.append(chunk.offset, &chunk.data) {
                self.fail(e);
            }
        } else if self.state != UploadState::Failed {
            self.fail(anyhow!("no configuration upload in progress"));
        }

        if !chunk.last {
            return UploadResponse::Continue;
        }

        info!(
            "configuration upload finished: {} bytes",
            chunk.offset + chunk.data.len()
        );

        // released on every path
        let buffer = self.buffer.take();

        let result = match (self.state, buffer) {
            (UploadState::Accumulating, Some(buffer)) => Self::apply(&buffer, store),
            _ => Err(anyhow!(
                self.error
                    .take()
                    .unwrap_or_else(|| "configuration upload failed".to_string())
            )),
        };

        match result {
            Ok(()) => {
                self.state = UploadState::Complete;
                UploadResponse::Finished
            }
            Err(e) => {
                error!("configuration upload rejected: {e:#}");
                self.state = UploadState::Failed;
                UploadResponse::Error(format!("{e:#}"))
            }
        }
    }

    fn append(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let buffer = self
            .buffer
            .as_mut()
            .context("no configuration upload in progress")?;

        let end = offset
            .checked_add(data.len())
            .context("configuration chunk offset overflow")?;

        ensure!(
            end <= CONFIG_MAX_SIZE,
            "configuration upload exceeds {CONFIG_MAX_SIZE} bytes"
        );

        buffer.resize(offset, 0);
        buffer.extend_from_slice(data);
        Ok(())
    }

    fn fail(&mut self, e: anyhow::Error) {
        error!("configuration upload failed: {e:#}");
        self.state = UploadState::Failed;
        self.error.get_or_insert_with(|| format!("{e:#}"));
    }

    fn apply(buffer: &[u8], store: &mut ConfigStore) -> Result<()> {
        let document = serde_json::from_slice::<Value>(buffer)
            .context("failed to parse configuration upload")?;

        ensure!(
            document.is_object(),
            "failed to parse configuration upload: not an object"
        );

        store.apply_network_fields(&document);
        store.apply_device_fields(&document);
        store.save_or_log();
        Ok(())
    }
}

/// Firmware upload, streamed into the updater without buffering
pub struct FirmwareUpload<F>
where
    F: FirmwareUpdater,
{
    updater: F,
    state: UploadState,
    error: Option<String>,
    /// Set by a chunk at offset 0, cleared by the final chunk
    in_progress: bool,
}

impl<F> FirmwareUpload<F>
where
    F: FirmwareUpdater,
{
    pub fn new(updater: F) -> Self {
        Self {
            updater,
            state: UploadState::Idle,
            error: None,
            in_progress: false,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn updater(&self) -> &F {
        &self.updater
    }

    /// Feed one chunk
    ///
    /// Errors are recorded and reported with the final chunk; delivery of
    /// the remaining chunks goes on regardless. The final chunk of a started
    /// upload always ends with a restart request, whatever the outcome.
    /// Chunks that belong to no started upload are rejected.
    pub async fn process(
        &mut self,
        chunk: UploadChunk,
        store: &ConfigStore,
        reboot: &mut RebootFlag,
    ) -> UploadResponse {
        if chunk.offset == 0 {
            if self.in_progress {
                warn!("discarding abandoned firmware upload");
            }
            info!("firmware upload started");

            self.state = UploadState::Accumulating;
            self.error = None;
            self.in_progress = true;

            if let Err(e) = self.updater.begin().await {
                self.fail(e);
            }
        } else if !self.in_progress {
            self.fail(anyhow!("no firmware upload in progress"));
        }

        if self.state == UploadState::Accumulating {
            if let Err(e) = self.updater.write(chunk.data).await {
                self.fail(e);
            }
        }

        if !chunk.last {
            return UploadResponse::Continue;
        }

        if !self.in_progress {
            return UploadResponse::Error(
                self.error
                    .take()
                    .unwrap_or_else(|| "no firmware upload in progress".to_string()),
            );
        }

        info!("firmware upload finished");
        self.in_progress = false;

        if self.state == UploadState::Accumulating {
            if let Err(e) = self.updater.finish().await {
                self.fail(e);
            }
        }

        if let Err(e) = self.updater.remount_storage().await {
            error!("failed to remount storage: {e:#}");
        }
        store.save_or_log();
        reboot.request("firmware upload");

        match self.error.take() {
            None => {
                self.state = UploadState::Complete;
                UploadResponse::Finished
            }
            Some(e) => UploadResponse::Error(e),
        }
    }

    fn fail(&mut self, e: anyhow::Error) {
        error!("firmware update error: {e:#}");
        self.state = UploadState::Failed;
        self.error.get_or_insert_with(|| format!("{e:#}"));
    }
}
