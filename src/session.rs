//! Party identities and the per-process session context.
//!
//! A session maps logical ranks to party identities and is validated once at
//! construction; every component receives the session (through the
//! communicator) as an explicit value instead of a global singleton, so
//! multiple concurrent sessions can coexist in one process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal configuration errors detected at session initialization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The local rank is not within `0..world_size`.
    #[error("local rank {rank} is out of range for world size {world_size}")]
    RankOutOfRange {
        /// The offending rank.
        rank: usize,
        /// The session's world size.
        world_size: usize,
    },
    /// The number of registered parties does not match the world size.
    #[error("{actual} parties registered, but world size is {expected}")]
    WorldSizeMismatch {
        /// The expected number of parties.
        expected: usize,
        /// The number of parties registered.
        actual: usize,
    },
    /// A rank in `0..world_size` has no registered party.
    #[error("no party registered for rank {0}")]
    MissingRank(usize),
    /// Two parties were registered with the same rank.
    #[error("duplicate party registered for rank {0}")]
    DuplicateRank(usize),
}

/// A participant identity together with its logical rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Human-readable party name (e.g. `"guest"`, `"host"`, `"arbiter"`).
    pub name: String,
    /// Dense 0-indexed rank within the session.
    pub rank: usize,
}

impl Party {
    /// A party with the given name and rank.
    pub fn new(name: impl Into<String>, rank: usize) -> Self {
        Self {
            name: name.into(),
            rank,
        }
    }
}

/// A validated session context: the local rank plus the full rank-to-party
/// registry.
#[derive(Debug, Clone)]
pub struct Session {
    rank: usize,
    world_size: usize,
    parties: Vec<Party>,
}

impl Session {
    /// Validates the registry and creates the session.
    ///
    /// Ranks must be dense, unique and 0-indexed; the local rank must be
    /// present. Any violation is fatal and never recovered.
    pub fn new(rank: usize, parties: Vec<Party>, world_size: usize) -> Result<Self, SessionError> {
        if parties.len() != world_size {
            return Err(SessionError::WorldSizeMismatch {
                expected: world_size,
                actual: parties.len(),
            });
        }
        if rank >= world_size {
            return Err(SessionError::RankOutOfRange { rank, world_size });
        }
        let mut seen = vec![false; world_size];
        for party in &parties {
            if party.rank >= world_size {
                return Err(SessionError::RankOutOfRange {
                    rank: party.rank,
                    world_size,
                });
            }
            if seen[party.rank] {
                return Err(SessionError::DuplicateRank(party.rank));
            }
            seen[party.rank] = true;
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(SessionError::MissingRank(missing));
        }
        let mut parties = parties;
        parties.sort_by_key(|p| p.rank);
        Ok(Self {
            rank,
            world_size,
            parties,
        })
    }

    /// The local rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of parties in the session.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// The party registered for `rank`.
    pub fn party(&self, rank: usize) -> &Party {
        &self.parties[rank]
    }
}
