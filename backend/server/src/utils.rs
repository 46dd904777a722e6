use std::sync::LazyLock;

use axum::{body::Bytes, http::HeaderMap};
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::AppError;

pub const MAX_TITLE_LEN: usize = 200;

pub const VOTER_KEY_HEADER: &str = "x-voter-key";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Trims the title and collapses inner whitespace runs to a single space.
pub fn normalize_title(input: &str) -> String {
    WHITESPACE.replace_all(input.trim(), " ").into_owned()
}

/// Decodes a JSON body, treating an empty body as the payload's default.
pub fn parse_json<T>(bytes: &Bytes) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    serde_json::from_slice(bytes).map_err(|_| AppError::MalformedPayload)
}

pub fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, AppError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(AppError::MissingHeader(name))
}
