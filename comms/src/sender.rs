use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// Writes frames onto a stream.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    staging: Vec<u8>,
    frames_sent: usize,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            staging: Vec::new(),
            frames_sent: 0,
        }
    }

    /// Encodes `msg` and writes it as a single frame.
    ///
    /// The length prefix and the encoded head go out first, then the
    /// zero-copy tail straight from `msg`.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { tx, staging, .. } = self;

        staging.clear();
        staging.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let tail = msg.serialize(staging)?.unwrap_or_default();
        let body_len = staging.len() - LEN_TYPE_SIZE + tail.len();
        staging[..LEN_TYPE_SIZE].copy_from_slice(&(body_len as LenType).to_be_bytes());

        tx.write_all(staging).await?;
        if !tail.is_empty() {
            tx.write_all(tail).await?;
        }
        tx.flush().await?;

        self.frames_sent += 1;
        Ok(())
    }

    /// How many frames went out so far.
    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }

    /// Closes the writing half, the other end reads an end of stream next.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
