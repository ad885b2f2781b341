//! The REST configuration surface: `/slicer/api/v1/config/{dpid}`.
//!
//! This crate is the translation layer only. An HTTP server routes the two
//! verbs to [`Api::get_config`] and [`Api::apply`] and writes the returned
//! status and body back; nothing here listens on a socket.
//!
//! `GET` returns the current slices as an array of arrays of endpoints,
//! each endpoint an array of 1-3 integers. `POST` accepts
//!
//! ```json
//! {
//!   "slices":  [[{"circuit": [1], "ingress-bw": 1000}, {"circuit": [2]}]],
//!   "disused": [[3, 100]],
//!   "learn":   {"mac": "0a:00:00:00:00:01", "tuple": [1], "timeout": 300}
//! }
//! ```
//!
//! with every field optional, and responds like `GET` after applying the
//! mutation.

mod body;

pub use self::body::{CircuitBody, LearnBody, UpdateBody};

use slicerd_controller::Controller;
use slicerd_core::{ConfigError, Endpoint};
use slicerd_openflow::ParseMacError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mac(#[from] ParseMacError),
    #[error("unknown switch {0:016x}")]
    UnknownSwitch(u64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Json(_) | ApiError::Config(_) | ApiError::Mac(_) => StatusCode::BadRequest,
            ApiError::UnknownSwitch(_) => StatusCode::NotFound,
        }
    }
}

/// A finished HTTP exchange, ready for whatever server fronts the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub body: String,
}

impl Response {
    fn config(config: &[Vec<Endpoint>]) -> Response {
        let slices: Vec<Vec<Vec<u64>>> = config
            .iter()
            .map(|slice| slice.iter().map(Endpoint::components).collect())
            .collect();
        let mut body =
            serde_json::to_string(&slices).expect("serializing a configuration never fails");
        body.push('\n');
        Response {
            status: StatusCode::Ok,
            body,
        }
    }

    fn error(err: &ApiError) -> Response {
        Response {
            status: err.status(),
            body: format!("{err}\n"),
        }
    }
}

/// Parse the dpid path segment: exactly 16 hex digits.
pub fn parse_dpid(text: &str) -> Option<u64> {
    if text.len() != 16 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(text, 16).ok()
}

pub struct Api {
    controller: Controller,
}

impl Api {
    pub fn new(controller: Controller) -> Self {
        Api { controller }
    }

    /// `GET /slicer/api/v1/config/{dpid}`: 404 for a switch that has never
    /// been seen or configured.
    pub async fn get_config(&self, dpid: u64) -> Response {
        match self.controller.get_config(dpid).await {
            Some(config) => Response::config(&config),
            None => Response::error(&ApiError::UnknownSwitch(dpid)),
        }
    }

    /// `POST /slicer/api/v1/config/{dpid}`: apply a mutation and echo the
    /// resulting configuration. A switch that has not attached yet gets the
    /// configuration buffered for its next attach.
    pub async fn apply(&self, dpid: u64, body: &str) -> Response {
        let update = match body::parse(body) {
            Ok(update) => update,
            Err(err) => {
                log::debug!("{dpid:016x}: rejecting request: {err}");
                return Response::error(&err);
            }
        };
        match self.controller.apply(dpid, update).await {
            Ok(config) => Response::config(&config),
            Err(err) => Response::error(&ApiError::Config(err)),
        }
    }
}
