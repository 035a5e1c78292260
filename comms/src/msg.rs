use std::{borrow::Cow, io};

use half::bf16;

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: u8 = 0;
const CONTROL_KIND: u8 = 1;
const GRADIENT_KIND: u8 = 2;
const GRADIENT_BF16_KIND: u8 = 3;
const REDUCED_KIND: u8 = 4;
const PARAMS_KIND: u8 = 5;
const SHARD_KIND: u8 = 6;
const SCALARS_KIND: u8 = 7;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload<'a> {
    /// A worker's local gradient, in full precision.
    Gradient(&'a [f32]),
    /// A worker's local gradient, rounded to bf16 before leaving the worker.
    GradientBf16(&'a [bf16]),
    /// The averaged gradient sent back by the primary.
    Reduced(&'a [f32]),
    /// A full copy of the flat parameter vector.
    Params(&'a [f32]),
    /// The slice of parameters a worker owns after a sharded update.
    Shard(&'a [f32]),
    /// Per-worker statistics, or their rank-ordered concatenation.
    Scalars(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, world_size: usize },
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl Payload<'_> {
    fn kind(&self) -> u8 {
        match self {
            Payload::Gradient(_) => GRADIENT_KIND,
            Payload::GradientBf16(_) => GRADIENT_BF16_KIND,
            Payload::Reduced(_) => REDUCED_KIND,
            Payload::Params(_) => PARAMS_KIND,
            Payload::Shard(_) => SHARD_KIND,
            Payload::Scalars(_) => SCALARS_KIND,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::GradientBf16(nums) => bytemuck::cast_slice(nums),
            Payload::Gradient(nums)
            | Payload::Reduced(nums)
            | Payload::Params(nums)
            | Payload::Shard(nums)
            | Payload::Scalars(nums) => bytemuck::cast_slice(nums),
        }
    }
}

fn cast_body<'a, T: bytemuck::Pod>(body: &'a [u8]) -> io::Result<&'a [T]> {
    bytemuck::try_cast_slice(body).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed numeric payload of {} bytes: {err}", body.len()),
        )
    })
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&(ERR_KIND as Header).to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&(CONTROL_KIND as Header).to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                buf.extend_from_slice(&(payload.kind() as Header).to_be_bytes());
                Ok(Some(payload.as_bytes()))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);
        let kind = Header::from_be_bytes(header);

        let Ok(kind) = u8::try_from(kind) else {
            return Self::invalid_kind(kind);
        };

        let payload = match kind {
            ERR_KIND => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                return Ok(Self::Err(Cow::Borrowed(string)));
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                return Ok(Self::Control(cmd));
            }
            GRADIENT_KIND => Payload::Gradient(cast_body(rest)?),
            GRADIENT_BF16_KIND => Payload::GradientBf16(cast_body(rest)?),
            REDUCED_KIND => Payload::Reduced(cast_body(rest)?),
            PARAMS_KIND => Payload::Params(cast_body(rest)?),
            SHARD_KIND => Payload::Shard(cast_body(rest)?),
            SCALARS_KIND => Payload::Scalars(cast_body(rest)?),
            byte => return Self::invalid_kind(Header::from(byte)),
        };

        Ok(Self::Data(payload))
    }
}
