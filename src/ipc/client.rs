// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! NDJSON request client.
//!
//! A background task reads responses and routes them to the waiting caller
//! by `id`. Responses with an id nobody is waiting for are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::error::{IpcError, IpcResult};
use super::protocol::{decode, encode, Request, Response};
use super::transport::{self, IpcStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// How hard [`IpcClient::connect`] tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Attempts in total; at least one is always made.
    pub attempts: u32,
    pub backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Connected client.
pub struct IpcClient {
    socket_path: PathBuf,
    writer: Mutex<WriteHalf<IpcStream>>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl IpcClient {
    /// Connect, retrying with a fixed backoff.
    pub async fn connect(socket_path: impl AsRef<Path>, options: ConnectOptions) -> IpcResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let attempts = options.attempts.max(1);
        let mut last_error = String::from("failed to connect");

        for attempt in 0..attempts {
            match tokio::time::timeout(CONNECT_TIMEOUT, transport::connect(&socket_path)).await {
                Ok(Ok(stream)) => {
                    debug!(socket = %socket_path.display(), attempt, "Connected");
                    return Ok(Self::from_stream(socket_path, stream, options.request_timeout));
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = "connect timeout".to_string(),
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(options.backoff).await;
            }
        }

        Err(IpcError::ConnectFailed(format!(
            "{}: {}",
            socket_path.display(),
            last_error
        )))
    }

    fn from_stream(socket_path: PathBuf, stream: IpcStream, request_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));

        let routes = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let Ok(response) = decode::<Response>(&line) else {
                    debug!("Ignoring unparsable IPC response");
                    continue;
                };
                let waiter = routes
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = response.id, "Ignoring response with unknown id"),
                }
            }
            // Dropping the senders wakes every caller with ConnectionClosed.
            routes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        });

        Self {
            socket_path,
            writer: Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            reader,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request and wait for its response.
    pub async fn call(&self, method: &str, params: Value) -> IpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode(&Request::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                self.pending_map().remove(&id);
                return Err(IpcError::from_io_error("writing request", e));
            }
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(IpcError::ConnectionClosed),
            Err(_) => {
                self.pending_map().remove(&id);
                return Err(IpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                });
            }
        };

        response.into_result().map_err(|error| IpcError::Remote {
            method: method.to_string(),
            error,
        })
    }

    /// [`call`](Self::call) and deserialize the result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> IpcResult<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
