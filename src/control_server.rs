// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! HTTP control surface. Reads and edits camera parameters, switches to
//! auto mode, saves captures to the gallery and serves the latest preview.
//!
//! Bodies are JSON: `{"value": <number>}` for single parameters. Failures
//! answer `{"error": <message>}` with 404 (unknown parameter, no frame yet),
//! 400 (malformed body) or 500 (device or filesystem failure).

use std::future::Future;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::ImageFormat;
use log::{error, info};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::camera_controller::{CameraController, CaptureWhen};
use crate::capture_device::ConfigurationRequest;
use crate::error::CameraError;
use crate::parameter_sync::{ParameterEdit, ParameterSync, ParameterUpdate};
use crate::preview::SharedPreview;

/// How far back the capture endpoint reaches, so the saved frame is the one
/// on screen when the request was made.
const CAPTURE_SECONDS_AGO: f64 = 0.1;

/// Everything the handlers need, injected at router construction.
#[derive(Clone)]
pub struct ControlState {
    pub controller: Arc<CameraController>,
    pub sync: Arc<ParameterSync>,
    /// Directory capture_and_save writes into. Must exist.
    pub gallery: PathBuf,
    pub preview: Arc<SharedPreview>,
}

impl ControlState {
    pub fn new(controller: Arc<CameraController>, gallery: PathBuf,
               preview: Arc<SharedPreview>) -> Self {
        let sync = Arc::new(ParameterSync::new(controller.clone()));
        ControlState{controller, sync, gallery, preview}
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError{status, message: message.into()}
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Parameter not found")
    }
}

impl From<CameraError> for ApiError {
    fn from(e: CameraError) -> Self {
        let status = match e {
            CameraError::EmptyBuffer => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// Controller calls block (reconfigure waits for the device); run them off the
// async workers.
async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where F: FnOnce() -> Result<T, CameraError> + Send + 'static,
      T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| {
            error!("Request failed: {}", e);
            ApiError::from(e)
        }),
        Err(e) => Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("Bad request body: {}", e)))
}

fn success(params: &ConfigurationRequest) -> Json<Value> {
    Json(json!({"status": "success", "params": params}))
}

#[derive(Deserialize)]
struct ValueBody {
    value: f64,
}

#[derive(Deserialize)]
struct ColourGainsBody {
    red: f32,
    blue: f32,
}

#[derive(Deserialize)]
struct ResolutionBody {
    width: u32,
    height: u32,
}

pub fn create_router(state: ControlState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    Router::new()
        .route("/", get(get_params))
        .route("/params", get(get_params).post(post_params))
        .route("/auto_mode", get(get_auto_mode).post(post_auto_mode))
        .route("/capture", post(post_capture))
        .route("/limits", get(get_limits))
        .route("/preview.jpg", get(get_preview))
        .route("/:name", get(get_parameter).post(post_parameter))
        .fallback(|| async { ApiError::not_found() })
        .layer(cors)
        .with_state(state)
}

/// Serves until `shutdown` completes.
pub async fn serve(listener: TcpListener, state: ControlState,
                   shutdown: impl Future<Output = ()> + Send + 'static)
                   -> std::io::Result<()> {
    info!("Control server listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn get_params(State(state): State<ControlState>) -> Json<ConfigurationRequest> {
    Json(state.controller.latest_applied())
}

async fn post_params(State(state): State<ControlState>, body: Bytes) -> ApiResult {
    let update: ParameterUpdate = parse_body(&body)?;
    let sync = state.sync.clone();
    let applied = run_blocking(move || sync.apply_update(&update)).await?;
    Ok(success(&applied))
}

async fn get_parameter(State(state): State<ControlState>,
                       Path(name): Path<String>) -> ApiResult {
    let params = state.controller.latest_applied();
    let value = match name.as_str() {
        "analogue_gain" => json!(params.analogue_gain),
        "exposure_time" => json!(params.exposure_time_us),
        "red_gain" => json!(params.colour_gains.0),
        "blue_gain" => json!(params.colour_gains.1),
        "colour_gains" => json!(params.colour_gains),
        "resolution" => json!(params.resolution),
        _ => return Err(ApiError::not_found()),
    };
    Ok(Json(json!({"value": value})))
}

async fn post_parameter(State(state): State<ControlState>, Path(name): Path<String>,
                        body: Bytes) -> ApiResult {
    let sync = state.sync.clone();
    let applied = match name.as_str() {
        "colour_gains" => {
            let gains: ColourGainsBody = parse_body(&body)?;
            let update = ParameterUpdate{colour_gains: Some((gains.red, gains.blue)),
                                         ..Default::default()};
            run_blocking(move || sync.apply_update(&update)).await?
        },
        "resolution" => {
            let size: ResolutionBody = parse_body(&body)?;
            let update = ParameterUpdate{resolution: Some((size.width, size.height)),
                                         ..Default::default()};
            run_blocking(move || sync.apply_update(&update)).await?
        },
        _ => {
            // Unknown names are rejected before the body is looked at.
            if ParameterEdit::from_name(&name, 0.0).is_none() {
                return Err(ApiError::not_found());
            }
            let body: ValueBody = parse_body(&body)?;
            let edit = ParameterEdit::from_name(&name, body.value)
                .ok_or_else(ApiError::not_found)?;
            run_blocking(move || sync.apply(edit)).await?
        },
    };
    Ok(success(&applied))
}

async fn get_auto_mode(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({"value": state.controller.is_auto()}))
}

async fn post_auto_mode(State(state): State<ControlState>) -> ApiResult {
    let controller = state.controller.clone();
    run_blocking(move || controller.set_auto()).await?;
    Ok(Json(json!({"status": "success"})))
}

async fn post_capture(State(state): State<ControlState>) -> ApiResult {
    let controller = state.controller.clone();
    let gallery = state.gallery.clone();
    let path = run_blocking(move || {
        controller.capture_and_save(&gallery, CaptureWhen::SecondsAgo(CAPTURE_SECONDS_AGO))
    }).await?;
    Ok(Json(json!({"status": "success", "path": path.display().to_string()})))
}

async fn get_limits(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({"model": state.controller.model(),
                "limits": state.controller.control_limits()}))
}

async fn get_preview(State(state): State<ControlState>) -> Result<Response, ApiError> {
    let Some(image) = state.preview.latest() else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "No preview yet"));
    };
    let mut jpeg = Cursor::new(Vec::new());
    image.write_to(&mut jpeg, ImageFormat::Jpeg)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg"),
         (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0")],
        jpeg.into_inner()).into_response())
}
