use std::io;

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, TrainErr};

pub type NetRx = FrameReceiver<Box<dyn AsyncRead + Unpin + Send>>;
pub type NetTx = FrameSender<Box<dyn AsyncWrite + Unpin + Send>>;

/// A connection to another worker of the world.
pub struct Peer {
    rank: usize,
    rx: NetRx,
    tx: NetTx,
    rx_buf: Vec<u32>,
}

impl Peer {
    /// Creates a new `Peer` over any pair of async streams.
    ///
    /// # Arguments
    /// * `rank` - The rank of the worker at the other end.
    /// * `rx` - The reading half of the connection.
    /// * `tx` - The writing half of the connection.
    pub fn new<R, W>(rank: usize, rx: R, tx: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let rx: Box<dyn AsyncRead + Unpin + Send> = Box::new(rx);
        let tx: Box<dyn AsyncWrite + Unpin + Send> = Box::new(tx);
        let (rx, tx) = comms::channel(rx, tx);

        Self::from_channel(rank, rx, tx)
    }

    pub fn from_channel(rank: usize, rx: NetRx, tx: NetTx) -> Self {
        Self {
            rank,
            rx,
            tx,
            rx_buf: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub(super) fn set_rank(&mut self, rank: usize) {
        self.rank = rank;
    }

    pub async fn send(&mut self, msg: &Msg<'_>) -> io::Result<()> {
        self.tx.send(msg).await
    }

    pub async fn send_control(&mut self, cmd: Command) -> io::Result<()> {
        debug!(rank = self.rank; "sending {cmd:?}");
        self.send(&Msg::Control(cmd)).await
    }

    pub async fn send_data(&mut self, payload: Payload<'_>) -> io::Result<()> {
        self.send(&Msg::Data(payload)).await
    }

    /// Tells the other end this worker is giving up.
    pub async fn send_err(&mut self, msg: &str) -> io::Result<()> {
        self.send(&Msg::Err(msg.into())).await
    }

    /// Waits for the next message from this peer.
    pub async fn recv(&mut self) -> Result<Msg<'_>> {
        let Self { rx, rx_buf, .. } = self;
        Ok(rx.recv_into(rx_buf).await?)
    }

    /// Waits for a data message, failing on anything else.
    pub async fn recv_payload(&mut self) -> Result<Payload<'_>> {
        let rank = self.rank;

        match self.recv().await? {
            Msg::Data(payload) => Ok(payload),
            Msg::Err(msg) => Err(TrainErr::Peer {
                rank,
                msg: msg.into_owned(),
            }),
            Msg::Control(cmd) => Err(unexpected(rank, "data", &format!("{cmd:?}"))),
        }
    }

    /// Waits for a control message, failing on anything else.
    pub async fn recv_control(&mut self) -> Result<Command> {
        let rank = self.rank;

        match self.recv().await? {
            Msg::Control(cmd) => {
                debug!(rank = rank; "received {cmd:?}");
                Ok(cmd)
            }
            Msg::Err(msg) => Err(TrainErr::Peer {
                rank,
                msg: msg.into_owned(),
            }),
            Msg::Data(payload) => Err(unexpected(rank, "a command", describe(&payload))),
        }
    }

    /// Waits for a data message and copies its values into `dst`.
    ///
    /// # Arguments
    /// * `dst` - Where the values go, its length must match the payload's.
    /// * `accept` - Picks the values out of the payload kinds valid at this point.
    pub async fn recv_floats_into(
        &mut self,
        dst: &mut [f32],
        accept: fn(Payload<'_>) -> Option<&[f32]>,
    ) -> Result<()> {
        let rank = self.rank;
        let payload = self.recv_payload().await?;
        let what = describe(&payload);

        let Some(values) = accept(payload) else {
            return Err(unexpected(rank, "another payload", what));
        };

        if values.len() != dst.len() {
            return Err(TrainErr::Protocol {
                rank,
                msg: format!("{what} of {} values, expected {}", values.len(), dst.len()),
            });
        }

        dst.copy_from_slice(values);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}

/// A short name for a payload kind.
pub(super) fn describe(payload: &Payload<'_>) -> &'static str {
    match payload {
        Payload::Gradient(_) => "gradient",
        Payload::GradientBf16(_) => "bf16 gradient",
        Payload::Reduced(_) => "reduced gradient",
        Payload::Params(_) => "parameters",
        Payload::Shard(_) => "parameter shard",
        Payload::Scalars(_) => "scalars",
    }
}

pub(super) fn unexpected(rank: usize, expected: &str, got: &str) -> TrainErr {
    TrainErr::Protocol {
        rank,
        msg: format!("expected {expected}, got {got}"),
    }
}
