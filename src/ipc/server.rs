// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! NDJSON request server.
//!
//! One task per connection; requests on a connection are handled
//! concurrently and their responses written back as they complete, so
//! callers correlate by `id`, not by order.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::error::IpcError;
use super::protocol::{decode, encode, Request, Response, RpcError};
use super::transport::{self, IpcListener, IpcStream};

/// Dispatches a decoded request to its implementation.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// IPC server bound to a socket path.
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<IpcListener>,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket.
    pub async fn start(&mut self) -> Result<(), IpcError> {
        let listener = transport::bind(&self.socket_path)
            .await
            .map_err(|source| IpcError::BindFailed {
                path: self.socket_path.display().to_string(),
                source,
            })?;
        info!(socket = %self.socket_path.display(), "IPC server listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    pub async fn serve(
        &mut self,
        handler: Arc<dyn RequestHandler>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), IpcError> {
        if self.listener.is_none() {
            self.start().await?;
        }
        let Some(listener) = self.listener.as_ref() else {
            return Err(IpcError::Transport("server not started".to_string()));
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        debug!("New connection accepted");
                        tokio::spawn(handle_connection(stream, Arc::clone(&handler)));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept IPC connection");
                    }
                },
            }
        }

        self.stop()
    }

    /// Drop the listener and remove the socket file.
    pub fn stop(&mut self) -> Result<(), IpcError> {
        self.listener = None;
        transport::cleanup(&self.socket_path)
            .map_err(|e| IpcError::from_io_error("cleaning up socket", e))?;
        info!("IPC server stopped");
        Ok(())
    }
}

async fn handle_connection(stream: IpcStream, handler: Arc<dyn RequestHandler>) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                warn!(error = %e, "Failed to write IPC response");
                break;
            }
            let _ = write_half.flush().await;
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "IPC read failed");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match decode(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Ignoring unparsable IPC line");
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let tx = tx.clone();
        tokio::spawn(async move {
            debug!(id = request.id, method = %request.method, "IPC request");
            let outcome = handler.handle(&request.method, request.params).await;
            let response = Response::from_result(request.id, outcome);
            match encode(&response) {
                Ok(encoded) => {
                    let _ = tx.send(encoded).await;
                }
                Err(e) => error!(error = %e, "Failed to encode IPC response"),
            }
        });
    }

    drop(tx);
    let _ = writer.await;
}
