use std::{collections::HashSet, io, time::Duration};

use comms::msg::Command;
use log::{info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};

use super::{WorldInfo, peer::Peer};
use crate::error::{Result, TrainErr};

const CONNECT_ATTEMPTS: usize = 60;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Waits until every replica of the world joined the primary.
///
/// # Arguments
/// * `listener` - The primary's listener.
/// * `world_size` - The amount of workers, the primary included.
///
/// # Returns
/// One peer per replica, in no particular order.
pub async fn accept_replicas(listener: &TcpListener, world_size: usize) -> Result<Vec<Peer>> {
    let mut peers = Vec::with_capacity(world_size.saturating_sub(1));
    let mut joined = HashSet::new();

    while peers.len() + 1 < world_size {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let mut peer = Peer::new(usize::MAX, rx, tx);

        let (rank, their_world) = match peer.recv_control().await? {
            Command::Join { rank, world_size } => (rank, world_size),
            cmd => {
                warn!("{addr} sent {cmd:?} instead of joining");
                continue;
            }
        };

        let reject = |msg: String| TrainErr::Protocol { rank, msg };
        if their_world != world_size {
            return Err(reject(format!(
                "joined a world of {their_world}, expected {world_size}"
            )));
        }
        if rank == 0 || rank >= world_size || !joined.insert(rank) {
            return Err(reject("invalid or duplicated rank".to_string()));
        }

        info!(rank = rank; "worker joined from {addr}");
        peer.set_rank(rank);
        peers.push(peer);
    }

    Ok(peers)
}

/// Connects a replica to the primary, retrying while it isn't listening yet.
///
/// # Arguments
/// * `world` - This replica's place in the world.
///
/// # Returns
/// The connection to the primary.
pub async fn connect_to_primary(world: &WorldInfo) -> Result<Peer> {
    let addr = world.master();
    let mut attempt = 0;

    let stream = loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                attempt += 1;
                warn!(rank = world.rank, attempt = attempt; "can't reach {addr}: {e}");
                time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => {
                return Err(TrainErr::Io(io::Error::new(
                    e.kind(),
                    format!("gave up connecting to {addr}: {e}"),
                )));
            }
        }
    };

    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let mut hub = Peer::new(0, rx, tx);

    hub.send_control(Command::Join {
        rank: world.rank,
        world_size: world.world_size,
    })
    .await?;

    info!(rank = world.rank; "joined the primary at {addr}");
    Ok(hub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replicas_join_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let world = |rank| WorldInfo {
            rank,
            world_size: 3,
            master_addr: "127.0.0.1".to_string(),
            master_port: port,
        };

        let (world2, world1) = (world(2), world(1));
        let (peers, a, b) = tokio::join!(
            accept_replicas(&listener, 3),
            connect_to_primary(&world2),
            connect_to_primary(&world1),
        );

        let mut ranks: Vec<_> = peers.unwrap().iter().map(Peer::rank).collect();
        ranks.sort();
        assert_eq!(ranks, [1, 2]);
        assert_eq!(a.unwrap().rank(), 0);
        assert_eq!(b.unwrap().rank(), 0);
    }
}
