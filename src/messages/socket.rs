//! Low-level stream helpers shared by the codec.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::Error;

/// Write a full buffer without flushing.
pub async fn write_all<S>(stream: &mut S, buf: BytesMut) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    stream.write_all(&buf).await.map_err(Error::Transport)
}

/// Write a full buffer and flush it out in one go. Response batches are
/// assembled in memory and leave through here in a single syscall.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: AsyncWrite + std::marker::Unpin,
{
    stream.write_all(buf).await.map_err(Error::Transport)?;
    stream.flush().await.map_err(Error::Transport)
}
