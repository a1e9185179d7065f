// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unix-domain socket transport.

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};

pub trait IpcIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IpcIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type IpcStream = Box<dyn IpcIo>;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

pub struct IpcListener {
    #[cfg(unix)]
    inner: UnixListener,
}

/// Bind `path`, replacing any stale socket file and creating the parent
/// directory.
pub async fn bind(path: &Path) -> io::Result<IpcListener> {
    #[cfg(unix)]
    {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let inner = UnixListener::bind(path)?;
        Ok(IpcListener { inner })
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Err(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are not available"))
    }
}

pub async fn connect(path: &Path) -> io::Result<IpcStream> {
    #[cfg(unix)]
    {
        let stream = UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Err(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are not available"))
    }
}

impl IpcListener {
    pub async fn accept(&self) -> io::Result<IpcStream> {
        #[cfg(unix)]
        {
            let (stream, _addr) = self.inner.accept().await?;
            Ok(Box::new(stream))
        }

        #[cfg(not(unix))]
        {
            Err(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are not available"))
        }
    }
}

pub fn cleanup(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested/test.sock");

        let listener = bind(&socket_path).await.unwrap();
        let server_task = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut client = connect(&socket_path).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fake_socket = temp_dir.path().join("nonexistent.sock");

        let err = connect(&fake_socket).await.err().unwrap();
        assert!(
            err.kind() == io::ErrorKind::NotFound || err.kind() == io::ErrorKind::ConnectionRefused,
            "Expected NotFound or ConnectionRefused, got {:?}",
            err.kind()
        );
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("stale.sock");

        let first = bind(&socket_path).await.unwrap();
        drop(first);
        assert!(socket_path.exists());

        // A leftover socket file from a dead server must not block a new bind.
        let _second = bind(&socket_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_socket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("cleanup_test.sock");

        drop(bind(&socket_path).await.unwrap());
        assert!(socket_path.exists());

        cleanup(&socket_path).unwrap();
        assert!(!socket_path.exists());
        // Missing file is fine.
        cleanup(&socket_path).unwrap();
    }
}
