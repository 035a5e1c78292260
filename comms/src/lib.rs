//! Length-prefixed frames exchanged between training workers.
//!
//! Every frame is a big endian `u64` body length followed by the body. Bodies
//! start with a `u32` kind header, see [`msg`].

mod align;
mod codec;
pub mod msg;
mod receiver;
mod sender;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::{Align1, Align4};
pub use codec::{Deserialize, Serialize};
pub use receiver::FrameReceiver;
pub use sender::FrameSender;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The largest body a receiver accepts unless told otherwise, 4 GiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 32;

/// Wraps both halves of a connection into frame level handles.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// The receiving and the sending handle, in that order.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
