use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, DEFAULT_MAX_FRAME_LEN, Deserialize, LEN_TYPE_SIZE, LenType};

/// Reads frames off a stream.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Rejects frames whose body is longer than `max_frame_len` bytes.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Arguments
    /// * `buf` - Where the body is read into, the returned `T` borrows from it.
    ///           Its element type keeps the body aligned for numeric views.
    ///
    /// # Returns
    /// The decoded message, or an `io::Error` if the stream failed, ended or
    /// carried a malformed frame.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut len_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut len_buf).await?;

        let len = usize::try_from(LenType::from_be_bytes(len_buf))
            .ok()
            .filter(|&len| len <= self.max_frame_len)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame longer than {} bytes", self.max_frame_len),
                )
            })?;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), <B as bytemuck::Zeroable>::zeroed());

        let body: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        self.rx.read_exact(&mut body[..len]).await?;

        let buf: &'buf Vec<B> = buf;
        let body: &'buf [u8] = bytemuck::cast_slice(buf.as_slice());
        T::deserialize(&body[..len])
    }
}
