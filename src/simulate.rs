//! In-process simulation of a multi-party session, one tokio task per rank.

use std::future::Future;

use thiserror::Error;
use tracing::error;

use crate::channel::Communicator;
use crate::session::{Party, Session, SessionError};
use crate::transport::{Instrumented, LocalTransport};

/// The fabric type handed to every simulated party.
pub type SimChannel = Communicator<Instrumented<LocalTransport>>;

/// Errors raised while setting up or joining a simulated session.
#[derive(Debug, Error)]
pub enum SimulateError {
    /// The session could not be constructed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A party task panicked or was cancelled.
    #[error("party {rank} did not finish: {reason}")]
    Join {
        /// The failing rank.
        rank: usize,
        /// The join failure.
        reason: String,
    },
}

/// Runs `world_size` parties over an in-memory mesh, each executing
/// `f(comm)` in its own tokio task, and collects their outputs in rank
/// order. The per-party closure learns its role from `comm.rank()`.
pub async fn simulate<F, Fut, O>(world_size: usize, f: F) -> Result<Vec<O>, SimulateError>
where
    F: Fn(SimChannel) -> Fut,
    Fut: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    let parties: Vec<Party> = (0..world_size)
        .map(|r| Party::new(format!("party-{r}"), r))
        .collect();
    let mut handles = Vec::with_capacity(world_size);
    for (rank, transport) in LocalTransport::channels(world_size).into_iter().enumerate() {
        let session = Session::new(rank, parties.clone(), world_size)?;
        let comm = Communicator::new(session, Instrumented::new(transport));
        handles.push(tokio::spawn(f(comm)));
    }
    let mut outputs = Vec::with_capacity(world_size);
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(out) => outputs.push(out),
            Err(e) => {
                error!(rank, "party task failed: {e}");
                return Err(SimulateError::Join {
                    rank,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(outputs)
}
