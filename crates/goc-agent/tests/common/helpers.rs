// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use goc_agent::{CoverVar, PackageCover, Registry};
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::atomic::AtomicU32;
use std::time::Duration;
use tokio::time::timeout;

/// Send an HTTP request over TCP and return the status and body
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
) -> Result<(StatusCode, String), Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", format!("127.0.0.1:{}", port))
        .header("Connection", "close")
        .body(Empty::<Bytes>::new())?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    Ok((status, String::from_utf8(body.to_vec())?))
}

fn leak<T: Clone>(values: &[T]) -> &'static [T] {
    Box::leak(values.to_vec().into_boxed_slice())
}

/// One file with three blocks and the given hit counts
pub fn three_block_var(file: &'static str, counts: &[u32]) -> CoverVar {
    let counters: Vec<AtomicU32> = counts.iter().map(|c| AtomicU32::new(*c)).collect();
    CoverVar::new(
        file,
        Box::leak(counters.into_boxed_slice()),
        leak(&[10, 12, (8 << 16) | 2, 14, 14, (30 << 16) | 1, 16, 20, (2 << 16) | 5]),
        leak(&[2, 1, 4]),
    )
}

pub fn test_registry(var: CoverVar) -> Registry {
    Registry::new(PackageCover::new("example.com/orders", vec![var]), vec![])
}
