//! HTTP adapter
//!
//! Handlers forward requests into the device loop through a
//! [`DeviceHandle`]; commands are answered through a transient frame sink
//! registered for exactly that request.

use crate::device::{DeviceGone, DeviceHandle};
use actix_files::Files;
use actix_web::{
    HttpRequest, HttpResponse, Responder,
    http::header,
    web::{self, Data},
};
use anyhow::Result;
use log::{debug, error, warn};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

/// Map a device result to a response.
///
/// # Arguments
/// * `result` - The result returned by the device loop
/// * `operation` - Operation name used in log messages
///
/// # Returns
/// * `HttpResponse::Ok` with the JSON encoded value on success
/// * `HttpResponse::ServiceUnavailable` if the device loop is gone
/// * `HttpResponse::InternalServerError` for any other error
fn handle_device_result<T: Serialize>(result: Result<T>, operation: &str) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Ok().json(data),
        Err(e) if e.is::<DeviceGone>() => {
            error!("api: {operation} failed: {e:#}");
            HttpResponse::ServiceUnavailable().body(e.to_string())
        }
        Err(e) => {
            error!("api: {operation} failed: {e:#}");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct Api {
    pub device: DeviceHandle,
}

impl Api {
    pub fn new(device: DeviceHandle) -> Self {
        Api { device }
    }

    /// Register all routes, serving `static_dir` when given.
    pub fn configure(self, cfg: &mut web::ServiceConfig, static_dir: Option<PathBuf>) {
        cfg.app_data(Data::new(self))
            .route("/api", web::post().to(Api::post_command))
            .route("/config", web::get().to(Api::config))
            .route("/status", web::get().to(Api::status))
            .route("/version", web::get().to(Api::version));

        if let Some(static_dir) = static_dir {
            cfg.service(
                Files::new("/", static_dir)
                    .index_file("index.html")
                    .default_handler(web::route().to(Api::fallback)),
            );
        }

        cfg.default_service(web::route().to(Api::fallback));
    }

    pub async fn post_command(body: web::Json<Value>, api: web::Data<Self>) -> impl Responder {
        debug!("post_command() called");

        match api.device.post(body.into_inner()).await {
            Ok(Some(frame)) => HttpResponse::Ok().json(&frame),
            Ok(None) => HttpResponse::NoContent().finish(),
            Err(e) if e.is::<DeviceGone>() => {
                error!("api: post_command failed: {e:#}");
                HttpResponse::ServiceUnavailable().body(e.to_string())
            }
            Err(e) => {
                warn!("api: command rejected: {e:#}");
                HttpResponse::BadRequest().body(format!("{e:#}"))
            }
        }
    }

    pub async fn config(api: web::Data<Self>) -> impl Responder {
        debug!("config() called");

        handle_device_result(api.device.settings().await, "config")
    }

    pub async fn status(api: web::Data<Self>) -> impl Responder {
        debug!("status() called");

        handle_device_result(api.device.status().await, "status")
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    /// Captive-portal redirect while the access point serves clients,
    /// `404` otherwise.
    pub async fn fallback(req: HttpRequest, api: web::Data<Self>) -> impl Responder {
        let captive_portal = match api.device.status().await {
            Ok(status) => status.captive_portal,
            Err(e) => {
                warn!("api: status unavailable: {e:#}");
                false
            }
        };

        if captive_portal {
            debug!("api: redirect {} to portal", req.path());
            HttpResponse::Found()
                .insert_header((header::LOCATION, "/"))
                .finish()
        } else {
            HttpResponse::NotFound().finish()
        }
    }
}
