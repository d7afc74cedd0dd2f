use crate::{
    device::{DeviceHandle, UploadReply},
    services::upload::{UploadChunk, UploadKind, UploadResponse},
};
use actix_multipart::Multipart;
use actix_web::{HttpRequest, HttpResponse, Responder, http::header::ContentType, web};
use actix_ws::{Message, MessageStream, Session};
use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone)]
pub struct Api {
    pub device: DeviceHandle,
}

impl Api {
    pub fn new(device: DeviceHandle) -> Self {
        Api { device }
    }

    pub fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/ws", web::get().to(Self::websocket))
            .route("/updatefw", web::post().to(Self::upload_firmware))
            .route("/config", web::post().to(Self::upload_config))
            .route("/conf", web::get().to(Self::config))
            .route("/heap", web::get().to(Self::heap))
            .route("/reconnect", web::post().to(Self::reconnect));
    }

    pub async fn websocket(
        req: HttpRequest,
        body: web::Payload,
        api: web::Data<Self>,
    ) -> actix_web::Result<HttpResponse> {
        debug!("websocket() called");

        let (response, session, stream) = actix_ws::handle(&req, body)?;

        actix_web::rt::spawn(Self::serve_socket(api.device.clone(), session, stream));

        Ok(response)
    }

    /// Relay control frames of one client until it goes away
    ///
    /// Responses go to this client only; upload notices reach every client.
    async fn serve_socket(device: DeviceHandle, mut session: Session, mut stream: MessageStream) {
        let mut notices = device.subscribe();

        loop {
            tokio::select! {
                message = stream.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!("websocket protocol error: {e}");
                            break;
                        }
                        None => break,
                    };

                    match message {
                        Message::Text(frame) => match device.control(frame.to_string()).await {
                            Ok(Some(response)) => {
                                if session.text(response).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error!("control frame not handled: {e:#}");
                                break;
                            }
                        },
                        Message::Binary(data) => {
                            warn!("ignoring binary frame of {} bytes", data.len());
                        }
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(reason) => {
                            debug!("websocket closed by client: {reason:?}");
                            let _ = session.close(reason).await;
                            return;
                        }
                        _ => {}
                    }
                }
                notice = notices.recv() => match notice {
                    Ok(notice) => {
                        if session.text(notice).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!("client missed {skipped} notices"),
                    Err(RecvError::Closed) => break,
                }
            }
        }

        let _ = session.close(None).await;
    }

    pub async fn upload_firmware(payload: Multipart, api: web::Data<Self>) -> impl Responder {
        debug!("upload_firmware() called");

        match Self::stream_upload(UploadKind::Firmware, payload, &api.device).await {
            Ok(UploadReply::Accepted(UploadResponse::Finished)) => {
                HttpResponse::Ok().body("Update Finished")
            }
            Ok(UploadReply::Accepted(UploadResponse::Error(e))) => {
                HttpResponse::Ok().body(format!("Update Error: {e}"))
            }
            Ok(UploadReply::Accepted(UploadResponse::Continue)) => {
                HttpResponse::Ok().body("Update Error: incomplete upload")
            }
            Ok(UploadReply::Refused) => HttpResponse::Forbidden().finish(),
            Err(e) => {
                error!("firmware upload failed: {e:#}");
                HttpResponse::InternalServerError().body(format!("Update Error: {e}"))
            }
        }
    }

    pub async fn upload_config(payload: Multipart, api: web::Data<Self>) -> impl Responder {
        debug!("upload_config() called");

        match Self::stream_upload(UploadKind::Config, payload, &api.device).await {
            Ok(UploadReply::Accepted(UploadResponse::Finished)) => {
                HttpResponse::Ok().body("Config Update Finished")
            }
            Ok(UploadReply::Refused) => HttpResponse::Forbidden().finish(),
            Ok(UploadReply::Accepted(_)) => {
                HttpResponse::InternalServerError().body("Config Update Error.")
            }
            Err(e) => {
                error!("configuration upload failed: {e:#}");
                HttpResponse::InternalServerError().body("Config Update Error.")
            }
        }
    }

    /// Cut the first file of a multipart body into offset-tagged chunks
    ///
    /// One chunk is held back so the final one can be flagged.
    async fn stream_upload(
        kind: UploadKind,
        mut payload: Multipart,
        device: &DeviceHandle,
    ) -> Result<UploadReply> {
        let mut field = payload
            .next()
            .await
            .ok_or_else(|| anyhow!("no file in upload"))?
            .map_err(|e| anyhow!("failed to read upload: {e}"))?;

        let filename = field
            .content_disposition()
            .and_then(|disposition| disposition.get_filename())
            .unwrap_or_default()
            .to_string();
        info!("{kind:?} upload of {filename:?} started");

        let mut offset = 0;
        let mut pending: Option<Vec<u8>> = None;

        while let Some(bytes) = field.next().await {
            let bytes = bytes.map_err(|e| anyhow!("failed to read upload: {e}"))?;

            if bytes.is_empty() {
                continue;
            }

            if let Some(data) = pending.replace(bytes.to_vec()) {
                let len = data.len();
                let reply = device
                    .upload(
                        kind,
                        UploadChunk {
                            offset,
                            data,
                            last: false,
                        },
                    )
                    .await?;

                if reply == UploadReply::Refused {
                    return Ok(reply);
                }
                offset += len;
            }
        }

        device
            .upload(
                kind,
                UploadChunk {
                    offset,
                    data: pending.unwrap_or_default(),
                    last: true,
                },
            )
            .await
    }

    pub async fn config(api: web::Data<Self>) -> impl Responder {
        debug!("config() called");

        match api.device.config().await {
            Ok(config) => HttpResponse::Ok()
                .content_type(ContentType::json())
                .body(config),
            Err(e) => {
                error!("config failed: {e:#}");
                HttpResponse::InternalServerError().body(e.to_string())
            }
        }
    }

    pub async fn heap(api: web::Data<Self>) -> impl Responder {
        debug!("heap() called");

        match api.device.free_memory().await {
            Ok(free) => HttpResponse::Ok().body(free.to_string()),
            Err(e) => {
                error!("heap failed: {e:#}");
                HttpResponse::InternalServerError().body(e.to_string())
            }
        }
    }

    pub async fn reconnect(api: web::Data<Self>) -> impl Responder {
        debug!("reconnect() called");

        match api.device.reconnect().await {
            Ok(true) => HttpResponse::Ok().body("Reconnecting"),
            Ok(false) => HttpResponse::Conflict().body("No network configured"),
            Err(e) => {
                error!("reconnect failed: {e:#}");
                HttpResponse::InternalServerError().body(e.to_string())
            }
        }
    }
}
