// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local request/response IPC over a Unix-domain socket.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐              ┌─────────────────┐
//! │     Caller      │              │   Supervisor    │
//! │                 │              │                 │
//! │  ┌───────────┐  │   Unix       │  ┌───────────┐  │
//! │  │ IpcClient │──┼──socket──────┼─►│ IpcServer │  │
//! │  └───────────┘  │              │  └───────────┘  │
//! └─────────────────┘              └─────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages are newline-delimited JSON (NDJSON). Each request carries a
//! numeric `id` that the matching response echoes; see [`protocol`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ConnectOptions, IpcClient};
pub use error::{IpcError, IpcResult};
pub use protocol::{codes, decode, decode_messages, encode, Request, Response, RpcError};
pub use server::{IpcServer, RequestHandler};

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Adder;

    #[async_trait]
    impl RequestHandler for Adder {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                "add" => {
                    let a = params["a"].as_i64().ok_or_else(|| RpcError::invalid_params("a"))?;
                    let b = params["b"].as_i64().ok_or_else(|| RpcError::invalid_params("b"))?;
                    Ok(json!(a + b))
                }
                other => Err(RpcError::method_not_found(other)),
            }
        }
    }

    #[tokio::test]
    async fn test_client_server_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("rpc.sock");

        let mut server = IpcServer::new(&path);
        server.start().await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(Arc::new(Adder), async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let client = IpcClient::connect(&path, ConnectOptions::default()).await.unwrap();
        let sum: i64 = client.call_as("add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(sum, 5);

        let err = client.call("add", json!({"a": 2})).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(codes::INVALID_PARAMS));

        let err = client.call("subtract", Value::Null).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(codes::METHOD_NOT_FOUND));

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
