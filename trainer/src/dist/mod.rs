//! Everything a worker needs to train in lockstep with the rest of the world.

mod bootstrap;
mod collective;
mod context;
mod peer;

use std::{env, str::FromStr};

pub use bootstrap::{accept_replicas, connect_to_primary};
pub use collective::Link;
pub use context::ExecutionContext;
pub use peer::Peer;

use crate::config::ConfigErr;

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

/// The part a worker plays in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rank 0, reduces gradients, reports and writes checkpoints.
    Primary,
    Replica,
}

impl Role {
    pub fn from_rank(rank: usize) -> Self {
        if rank == 0 { Role::Primary } else { Role::Replica }
    }

    #[inline]
    pub fn is_primary(self) -> bool {
        self == Role::Primary
    }
}

/// How parameters are stored and updated across the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Every worker updates the whole model, parameters are kept on the bf16
    /// grid and gradients travel as bf16.
    Bf16,
    /// Every worker updates its own shard of the parameters in full precision.
    Fp32Sharded,
}

/// Where this worker sits in the world and how to reach the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldInfo {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl WorldInfo {
    /// A world made of this process alone.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }

    /// Reads `RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT`.
    ///
    /// # Returns
    /// The world description or an error if some variable is malformed.
    pub fn from_env() -> Result<Self, ConfigErr> {
        Self::from_vars(|var| env::var(var).ok())
    }

    fn from_vars(get: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigErr> {
        fn parse<T: FromStr>(
            get: &impl Fn(&'static str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigErr> {
            match get(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigErr::Env { var, value }),
            }
        }

        let world = Self {
            rank: parse(&get, "RANK", 0)?,
            world_size: parse(&get, "WORLD_SIZE", 1)?,
            master_addr: get("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string()),
            master_port: parse(&get, "MASTER_PORT", DEFAULT_MASTER_PORT)?,
        };

        if world.world_size == 0 || world.rank >= world.world_size {
            return Err(ConfigErr::Env {
                var: "RANK",
                value: format!("{} of a world of {}", world.rank, world.world_size),
            });
        }

        Ok(world)
    }

    pub fn role(&self) -> Role {
        Role::from_rank(self.rank)
    }

    /// The address the primary listens on.
    pub fn master(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn world(vars: &[(&'static str, &str)]) -> Result<WorldInfo, ConfigErr> {
        let vars: HashMap<_, _> = vars.iter().map(|&(k, v)| (k, v.to_string())).collect();
        WorldInfo::from_vars(|var| vars.get(var).cloned())
    }

    #[test]
    fn missing_variables_mean_a_single_worker() {
        assert_eq!(world(&[]).unwrap(), WorldInfo::single());
        assert_eq!(WorldInfo::single().role(), Role::Primary);
    }

    #[test]
    fn variables_are_parsed() {
        let world = world(&[
            ("RANK", "2"),
            ("WORLD_SIZE", "4"),
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "1234"),
        ])
        .unwrap();

        assert_eq!(world.role(), Role::Replica);
        assert_eq!(world.master(), "10.0.0.1:1234");
    }

    #[test]
    fn malformed_variables_are_rejected() {
        assert!(matches!(
            world(&[("WORLD_SIZE", "two")]),
            Err(ConfigErr::Env { var: "WORLD_SIZE", .. })
        ));
        assert!(world(&[("RANK", "2"), ("WORLD_SIZE", "2")]).is_err());
    }
}
