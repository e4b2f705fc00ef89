// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use core::time::Duration;
use http_body_util::Full;
use hyper::{header, http, Response, StatusCode};
use serde_json::json;
use tracing::{debug, error};

pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs the given message. A success status code (within 200-299) will cause a debug log to be
///    written, otherwise error will be written.
/// 2. Returns the given message in the body of JSON response with the given status code.
///
/// Response body format:
/// {
///     "message": message
/// }
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

/// Plain-text `200 OK` response, the format every coverage endpoint answers with.
pub fn create_text_response(body: impl Into<Bytes>) -> http::Result<HttpResponse> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
}

/// Builds the reqwest client used to talk to the center.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .build()
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use hyper::header;
    use hyper::StatusCode;

    use super::{create_text_response, log_and_create_http_response, HttpResponse};

    async fn get_response_body_as_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_log_and_create_http_response() {
        let response =
            log_and_create_http_response("Method not allowed", StatusCode::METHOD_NOT_ALLOWED)
                .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(
            get_response_body_as_string(response).await,
            "{\"message\":\"Method not allowed\"}"
        );
    }

    #[tokio::test]
    async fn test_create_text_response() {
        let response = create_text_response("0.500000").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(get_response_body_as_string(response).await, "0.500000");
    }

    #[test]
    fn test_build_client() {
        assert!(super::build_client(std::time::Duration::from_secs(1)).is_ok());
    }
}
