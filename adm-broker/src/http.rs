//! HTTP error type for the poll-based REST surface: a status code, the
//! call site that raised it, an optional caller-facing message, and an
//! optional source error, rendered as a small JSON object on the wire.

use core::fmt;
use core::panic::Location;
use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

pub struct HttpErrorBuilder {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
}

impl HttpErrorBuilder {
    #[track_caller]
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            loc: Location::caller(),
            msg: None,
        }
    }

    pub fn err<T: Into<Box<dyn StdError + Sync + Send + 'static>>>(self) -> impl FnOnce(T) -> HttpError {
        move |source| HttpError {
            code: self.code,
            loc: self.loc,
            msg: self.msg,
            source: Some(source.into()),
        }
    }

    pub fn with_msg(mut self, msg: &'static str) -> HttpErrorBuilder {
        self.msg = Some(msg);
        self
    }

    pub fn msg(self, msg: &'static str) -> HttpError {
        HttpError {
            code: self.code,
            loc: self.loc,
            msg: Some(msg),
            source: None,
        }
    }
}

pub struct HttpError {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
    pub source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl HttpError {
    #[track_caller]
    pub fn not_found() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::NOT_FOUND)
    }

    #[track_caller]
    pub fn unauthorized() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::UNAUTHORIZED)
    }

    #[track_caller]
    pub fn internal() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    #[track_caller]
    pub fn bad_request() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_REQUEST)
    }

    #[track_caller]
    pub fn conflict() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::CONFLICT)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.code, self.loc)?;

        if let Some(msg) = self.msg {
            write!(f, ": {msg}")?;
        }

        if let Some(source) = self.source.as_deref() {
            write!(f, " [source: {source}")?;
            for cause in anyhow::Chain::new(source).skip(1) {
                write!(f, ", because {cause}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        error!(error = %self);

        let body = ErrorBody {
            error: self.msg.map_or_else(|| self.code.to_string(), ToOwned::to_owned),
            code: self.msg,
        };

        (self.code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = HttpError::not_found().msg("no such workspace");
        let rendered = err.to_string();
        assert!(rendered.contains("404"));
        assert!(rendered.contains("no such workspace"));
    }

    #[test]
    fn err_builder_wraps_source_chain() {
        let io_err = std::io::Error::other("disk full");
        let mapper = HttpError::internal().with_msg("failed to save configuration").err();
        let err = mapper(io_err);

        assert_eq!(err.code, StatusCode::INTERNAL_SERVER_ERROR);
        let rendered = err.to_string();
        assert!(rendered.contains("failed to save configuration"));
        assert!(rendered.contains("disk full"));
    }

    #[test]
    fn into_response_uses_status_code() {
        let response = HttpError::conflict().msg("duplicate submit").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
