use std::ops::Range;

use comms::msg::{Command, Payload};
use half::bf16;
use log::{debug, warn};
use tokio::io;

use super::{
    Precision,
    peer::{Peer, describe, unexpected},
};
use crate::error::{Result, TrainErr};

const IN_PROCESS_CAPACITY: usize = 1 << 16;

/// How a worker is wired to the rest of the world.
///
/// The primary is the hub of a star: it combines every contribution in rank
/// order and sends the result back, so every worker sees the same bits.
pub enum Link {
    /// A world of one, every collective is the identity.
    Local,
    /// The primary, with one peer per replica sorted by rank.
    Hub { peers: Vec<Peer> },
    /// A replica, connected to the primary only.
    Spoke { hub: Peer },
}

fn params(payload: Payload<'_>) -> Option<&[f32]> {
    match payload {
        Payload::Params(values) => Some(values),
        _ => None,
    }
}

fn shard(payload: Payload<'_>) -> Option<&[f32]> {
    match payload {
        Payload::Shard(values) => Some(values),
        _ => None,
    }
}

fn reduced(payload: Payload<'_>) -> Option<&[f32]> {
    match payload {
        Payload::Reduced(values) => Some(values),
        _ => None,
    }
}

fn check_len(rank: usize, what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(TrainErr::Protocol {
            rank,
            msg: format!("{what} of {got} values, expected {expected}"),
        });
    }

    Ok(())
}

/// Rounds every value to the nearest bf16.
pub(super) fn round_to_bf16(values: &mut [f32]) {
    for x in values {
        *x = bf16::from_f32(*x).to_f32();
    }
}

impl Link {
    pub fn hub(mut peers: Vec<Peer>) -> Self {
        peers.sort_by_key(Peer::rank);
        Link::Hub { peers }
    }

    pub fn spoke(hub: Peer) -> Self {
        Link::Spoke { hub }
    }

    /// Builds a whole world inside this process over in-memory streams.
    ///
    /// # Returns
    /// One link per rank, the primary's first.
    pub fn in_process(world_size: usize) -> Vec<Link> {
        if world_size <= 1 {
            return vec![Link::Local];
        }

        let mut hub_peers = Vec::with_capacity(world_size - 1);
        let mut links = Vec::with_capacity(world_size);

        for rank in 1..world_size {
            let (hub_end, spoke_end) = io::duplex(IN_PROCESS_CAPACITY);

            let (rx, tx) = io::split(hub_end);
            hub_peers.push(Peer::new(rank, rx, tx));

            let (rx, tx) = io::split(spoke_end);
            links.push(Link::spoke(Peer::new(0, rx, tx)));
        }

        links.insert(0, Link::hub(hub_peers));
        links
    }

    /// Averages `grads` over every worker, in place.
    ///
    /// # Arguments
    /// * `grads` - This worker's gradient, replaced by the world's mean.
    /// * `precision` - In bf16 mode the contributions are rounded to bf16.
    pub async fn all_reduce_mean(&mut self, grads: &mut [f32], precision: Precision) -> Result<()> {
        match self {
            Link::Local => Ok(()),
            Link::Hub { peers } => {
                if precision == Precision::Bf16 {
                    round_to_bf16(grads);
                }

                for peer in peers.iter_mut() {
                    let rank = peer.rank();

                    match (precision, peer.recv_payload().await?) {
                        (Precision::Fp32Sharded, Payload::Gradient(theirs)) => {
                            check_len(rank, "gradient", theirs.len(), grads.len())?;
                            for (acc, g) in grads.iter_mut().zip(theirs) {
                                *acc += g;
                            }
                        }
                        (Precision::Bf16, Payload::GradientBf16(theirs)) => {
                            check_len(rank, "gradient", theirs.len(), grads.len())?;
                            for (acc, g) in grads.iter_mut().zip(theirs) {
                                *acc += g.to_f32();
                            }
                        }
                        (_, other) => {
                            return Err(unexpected(rank, "a gradient", describe(&other)));
                        }
                    }
                }

                let world_size = (peers.len() + 1) as f32;
                for g in grads.iter_mut() {
                    *g /= world_size;
                }

                for peer in peers.iter_mut() {
                    peer.send_data(Payload::Reduced(grads)).await?;
                }

                debug!(values = grads.len(); "reduced gradients");
                Ok(())
            }
            Link::Spoke { hub } => {
                match precision {
                    Precision::Bf16 => {
                        let rounded: Vec<_> = grads.iter().map(|&g| bf16::from_f32(g)).collect();
                        hub.send_data(Payload::GradientBf16(&rounded)).await?;
                    }
                    Precision::Fp32Sharded => hub.send_data(Payload::Gradient(grads)).await?,
                }

                hub.recv_floats_into(grads, reduced).await
            }
        }
    }

    /// Overwrites every replica's `values` with the primary's.
    pub async fn broadcast(&mut self, values: &mut [f32]) -> Result<()> {
        match self {
            Link::Local => Ok(()),
            Link::Hub { peers } => {
                for peer in peers.iter_mut() {
                    peer.send_data(Payload::Params(values)).await?;
                }
                Ok(())
            }
            Link::Spoke { hub } => hub.recv_floats_into(values, params).await,
        }
    }

    /// Assembles the full parameter vector out of every worker's shard.
    ///
    /// # Arguments
    /// * `values` - The parameters, only `ranges[rank]` is up to date on entry.
    /// * `ranges` - Every worker's shard, indexed by rank.
    /// * `rank` - This worker's rank.
    pub async fn all_gather_shards(
        &mut self,
        values: &mut [f32],
        ranges: &[Range<usize>],
        rank: usize,
    ) -> Result<()> {
        match self {
            Link::Local => Ok(()),
            Link::Hub { peers } => {
                for peer in peers.iter_mut() {
                    let peer_rank = peer.rank();
                    let range = ranges.get(peer_rank).cloned().ok_or_else(|| {
                        TrainErr::Protocol {
                            rank: peer_rank,
                            msg: format!("no shard for a world of {}", ranges.len()),
                        }
                    })?;

                    peer.recv_floats_into(&mut values[range], shard).await?;
                }

                for peer in peers.iter_mut() {
                    peer.send_data(Payload::Params(values)).await?;
                }
                Ok(())
            }
            Link::Spoke { hub } => {
                let own = ranges.get(rank).cloned().unwrap_or_default();
                hub.send_data(Payload::Shard(&values[own])).await?;
                hub.recv_floats_into(values, params).await
            }
        }
    }

    /// Collects `values` from every worker.
    ///
    /// # Returns
    /// The rank ordered concatenation of every worker's `values`, on every worker.
    pub async fn gather(&mut self, values: &[f32]) -> Result<Vec<f32>> {
        match self {
            Link::Local => Ok(values.to_vec()),
            Link::Hub { peers } => {
                let mut all = Vec::with_capacity(values.len() * (peers.len() + 1));
                all.extend_from_slice(values);

                for peer in peers.iter_mut() {
                    let rank = peer.rank();

                    match peer.recv_payload().await? {
                        Payload::Scalars(theirs) => {
                            check_len(rank, "scalars", theirs.len(), values.len())?;
                            all.extend_from_slice(theirs);
                        }
                        other => return Err(unexpected(rank, "scalars", describe(&other))),
                    }
                }

                for peer in peers.iter_mut() {
                    peer.send_data(Payload::Scalars(&all)).await?;
                }
                Ok(all)
            }
            Link::Spoke { hub } => {
                hub.send_data(Payload::Scalars(values)).await?;

                let rank = hub.rank();
                match hub.recv_payload().await? {
                    Payload::Scalars(all) => Ok(all.to_vec()),
                    other => Err(unexpected(rank, "scalars", describe(&other))),
                }
            }
        }
    }

    /// Returns once every worker reached this point.
    pub async fn barrier(&mut self) -> Result<()> {
        self.gather(&[]).await.map(|_| ())
    }

    /// Disconnects from the world in an orderly fashion.
    ///
    /// Replicas announce they're leaving and the primary lets them go once
    /// every replica did.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Link::Local => Ok(()),
            Link::Hub { peers } => {
                for peer in peers.iter_mut() {
                    expect_disconnect(peer).await?;
                }

                for peer in peers.iter_mut() {
                    peer.send_control(Command::Disconnect).await?;
                    peer.shutdown().await?;
                }
                Ok(())
            }
            Link::Spoke { hub } => {
                hub.send_control(Command::Disconnect).await?;
                expect_disconnect(hub).await?;
                hub.shutdown().await?;
                Ok(())
            }
        }
    }

    /// Tells every connected worker this one failed, ignoring delivery errors.
    pub async fn abort(&mut self, reason: &str) {
        let peers: &mut [Peer] = match self {
            Link::Local => return,
            Link::Hub { peers } => peers,
            Link::Spoke { hub } => std::slice::from_mut(hub),
        };

        for peer in peers {
            if let Err(e) = peer.send_err(reason).await {
                warn!(rank = peer.rank(); "couldn't deliver the abort: {e}");
            }
        }
    }
}

async fn expect_disconnect(peer: &mut Peer) -> Result<()> {
    match peer.recv_control().await? {
        Command::Disconnect => Ok(()),
        cmd => Err(unexpected(peer.rank(), "a disconnect", &format!("{cmd:?}"))),
    }
}
