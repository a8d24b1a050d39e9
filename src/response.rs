//! Response envelope for the setting endpoints.

use axum::{http::StatusCode, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct SuccessMany<T> {
    pub data: Vec<T>,
    pub meta: MetaCount,
}

#[derive(Serialize)]
pub struct MetaCount {
    pub count: u64,
    /// Stored setting version after the write; omitted on reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

pub fn success_many<T: Serialize>(data: Vec<T>, version: Option<i64>) -> (StatusCode, Json<SuccessMany<T>>) {
    let count = data.len() as u64;
    (
        StatusCode::OK,
        Json(SuccessMany {
            data,
            meta: MetaCount { count, version },
        }),
    )
}
