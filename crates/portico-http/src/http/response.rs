//! The `{code, message, data, success}` response envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub success: bool,
}

pub fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        code: 200,
        message: "success".to_string(),
        data: Some(data),
        success: true,
    })
    .into_response()
}

pub fn ok_message(message: impl Into<String>) -> Response {
    Json(Envelope::<()> {
        code: 200,
        message: message.into(),
        data: None,
        success: true,
    })
    .into_response()
}

pub fn created<T: Serialize>(data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(Envelope {
            code: 201,
            message: "created".to_string(),
            data: Some(data),
            success: true,
        }),
    )
        .into_response()
}
