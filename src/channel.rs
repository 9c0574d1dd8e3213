//! The tagged channel fabric: point-to-point sends/receives with monotonic
//! per-group message counters, and collectives composed from them.
//!
//! Every send or receive consumes exactly one index from the appropriate
//! counter (tensor vs. object, send vs. recv) *before* touching the
//! transport, and the index is embedded in the delivery tag. Both sides of a
//! logical exchange must advance their counters in lockstep: protocol code
//! paths on sender and receiver consume exactly one increment per logical
//! message, in matching order, or the parties desynchronize and the receive
//! fails fatally (see [`crate::transport::LocalTransportError::Desynchronized`]).
//!
//! Groups isolate counter namespaces. The active group is a stack: entering
//! a scoped group pushes it and the guard restores the previous group on
//! every exit path, so nested secure sub-protocols compose.

use std::future::Future;
use std::ops::{Deref, DerefMut};

use futures::future::try_join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::session::Session;
use crate::tensor::{IntMatrix, Matrix};
use crate::transport::Transport;

/// Errors raised by the channel fabric.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A payload could not be delivered.
    #[error("failed to send {tag} to party {party}: {reason}")]
    Send {
        /// Destination rank.
        party: usize,
        /// The delivery tag.
        tag: String,
        /// The underlying transport failure.
        reason: String,
    },
    /// A payload could not be received.
    #[error("failed to receive {tag} from party {party}: {reason}")]
    Recv {
        /// Source rank.
        party: usize,
        /// The expected delivery tag.
        tag: String,
        /// The underlying transport failure.
        reason: String,
    },
    /// A payload could not be (de)serialized.
    #[error("failed to (de)serialize {tag}: {reason}")]
    Serde {
        /// The delivery tag.
        tag: String,
        /// The serializer failure.
        reason: String,
    },
    /// The reduce operation is not defined for this payload kind.
    #[error("unsupported reduce op {op:?} for this payload")]
    Unsupported {
        /// The rejected operation.
        op: ReduceOp,
    },
    /// The collective exists in the interface but has no implementation;
    /// callers must not fall back silently.
    #[error("collective {0} is not implemented")]
    NotImplemented(&'static str),
    /// A group was constructed with invalid ranks or a clashing name.
    #[error("invalid group: {0}")]
    InvalidGroup(String),
    /// A collective required a local input that was not provided.
    #[error("missing local input: {0}")]
    MissingInput(&'static str),
}

/// Associative fold operations accepted by [`Communicator::reduce`] and
/// [`Communicator::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise bitwise xor (integer payloads only).
    Xor,
}

/// A payload that can be folded by a reduce collective.
pub trait Reducible: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Folds `other` into `acc` under `op`.
    fn combine(op: ReduceOp, acc: Self, other: Self) -> Result<Self, ChannelError>;
}

impl Reducible for IntMatrix {
    fn combine(op: ReduceOp, acc: Self, other: Self) -> Result<Self, ChannelError> {
        match op {
            ReduceOp::Sum => Ok(acc.add(&other)),
            ReduceOp::Xor => Ok(acc.xor(&other)),
        }
    }
}

impl Reducible for Matrix {
    fn combine(op: ReduceOp, acc: Self, other: Self) -> Result<Self, ChannelError> {
        match op {
            ReduceOp::Sum => Ok(acc.add(&other)),
            ReduceOp::Xor => Err(ChannelError::Unsupported { op }),
        }
    }
}

impl Reducible for f64 {
    fn combine(op: ReduceOp, acc: Self, other: Self) -> Result<Self, ChannelError> {
        match op {
            ReduceOp::Sum => Ok(acc + other),
            ReduceOp::Xor => Err(ChannelError::Unsupported { op }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Tensor,
    Object,
}

#[derive(Debug, Clone, Copy)]
enum Dir {
    Send,
    Recv,
}

/// Snapshot of one group's four message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounters {
    /// Tensor messages sent.
    pub tensor_send: u64,
    /// Tensor messages received.
    pub tensor_recv: u64,
    /// Object messages sent.
    pub object_send: u64,
    /// Object messages received.
    pub object_recv: u64,
}

/// A named subset of ranks with isolated tensor/object message namespaces.
#[derive(Debug)]
struct CommunicateGroup {
    name: String,
    ranks: Vec<usize>,
    ns_tensor: String,
    ns_object: String,
    counters: ChannelCounters,
}

/// Identifier of a registered group; the main group is [`MAIN_GROUP`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupId(usize);

/// The group spanning all ranks, active by default.
pub const MAIN_GROUP: GroupId = GroupId(0);

/// The tagged channel fabric for one party of a session.
pub struct Communicator<T> {
    session: Session,
    transport: T,
    groups: Vec<CommunicateGroup>,
    active: Vec<usize>,
}

impl<T: Transport> Communicator<T> {
    /// Creates the fabric with its main group spanning all ranks.
    pub fn new(session: Session, transport: T) -> Self {
        let main = CommunicateGroup {
            name: "main".to_string(),
            ranks: (0..session.world_size()).collect(),
            ns_tensor: "mpc_tensor".to_string(),
            ns_object: "mpc_obj".to_string(),
            counters: ChannelCounters::default(),
        };
        Self {
            session,
            transport,
            groups: vec![main],
            active: vec![0],
        }
    }

    /// The session this fabric belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The local rank.
    pub fn rank(&self) -> usize {
        self.session.rank()
    }

    /// The session's world size.
    pub fn world_size(&self) -> usize {
        self.session.world_size()
    }

    /// The underlying transport (e.g. to read instrumentation counters).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The counter snapshot of the currently active group.
    pub fn counters(&self) -> ChannelCounters {
        self.groups[self.active_group()].counters
    }

    /// The name of the currently active group.
    pub fn active_group_name(&self) -> &str {
        &self.groups[self.active_group()].name
    }

    /// The ranks of the currently active group, in ascending order.
    pub fn active_ranks(&self) -> Vec<usize> {
        self.group_ranks()
    }

    /// Registers a named sub-group of ranks with fresh, isolated counters.
    pub fn new_group(&mut self, ranks: &[usize], name: &str) -> Result<GroupId, ChannelError> {
        if ranks.len() < 2 {
            return Err(ChannelError::InvalidGroup(format!(
                "a group needs more than 1 rank, got {ranks:?}"
            )));
        }
        let mut sorted = ranks.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != ranks.len() {
            return Err(ChannelError::InvalidGroup(format!(
                "duplicate ranks: {ranks:?}"
            )));
        }
        if let Some(r) = sorted.iter().find(|r| **r >= self.session.world_size()) {
            return Err(ChannelError::InvalidGroup(format!(
                "rank {r} is out of range for world size {}",
                self.session.world_size()
            )));
        }
        if name.is_empty() || self.groups.iter().any(|g| g.name == name) {
            return Err(ChannelError::InvalidGroup(format!(
                "group name {name:?} is empty or already taken"
            )));
        }
        self.groups.push(CommunicateGroup {
            name: name.to_string(),
            ranks: sorted,
            ns_tensor: format!("mpc_tensor_{name}"),
            ns_object: format!("mpc_obj_{name}"),
            counters: ChannelCounters::default(),
        });
        Ok(GroupId(self.groups.len() - 1))
    }

    /// Activates `group` until the returned guard is dropped; nesting
    /// behaves as a stack and the previous group is restored on every exit
    /// path, including errors.
    pub fn scoped(&mut self, group: GroupId) -> GroupGuard<'_, T> {
        self.active.push(group.0);
        GroupGuard { comm: self }
    }

    fn active_group(&self) -> usize {
        self.active.last().copied().unwrap_or(0)
    }

    fn group_ranks(&self) -> Vec<usize> {
        self.groups[self.active_group()].ranks.clone()
    }

    fn next_tag(&mut self, kind: Kind, dir: Dir) -> String {
        let active = self.active_group();
        let group = &mut self.groups[active];
        let (ns, counter) = match (kind, dir) {
            (Kind::Tensor, Dir::Send) => (&group.ns_tensor, &mut group.counters.tensor_send),
            (Kind::Tensor, Dir::Recv) => (&group.ns_tensor, &mut group.counters.tensor_recv),
            (Kind::Object, Dir::Send) => (&group.ns_object, &mut group.counters.object_send),
            (Kind::Object, Dir::Recv) => (&group.ns_object, &mut group.counters.object_recv),
        };
        let index = *counter;
        *counter += 1;
        format!("{ns}_{index}")
    }

    /// Sends a tensor payload to `dst`, consuming one tensor-send index.
    pub async fn send<P: Serialize + Send + Sync>(
        &mut self,
        value: &P,
        dst: usize,
    ) -> Result<(), ChannelError> {
        let tag = self.next_tag(Kind::Tensor, Dir::Send);
        debug!(rank = self.rank(), dst, tag, "sending tensor");
        put_value(&self.transport, dst, &tag, value).await
    }

    /// Receives a tensor payload from `src`, consuming one tensor-recv index.
    pub async fn recv<P: DeserializeOwned>(&mut self, src: usize) -> Result<P, ChannelError> {
        let tag = self.next_tag(Kind::Tensor, Dir::Recv);
        debug!(rank = self.rank(), src, tag, "receiving tensor");
        get_value(&self.transport, src, &tag).await
    }

    /// Sends an object payload to `dst`, consuming one object-send index.
    pub async fn send_obj<P: Serialize + Send + Sync>(
        &mut self,
        value: &P,
        dst: usize,
    ) -> Result<(), ChannelError> {
        let tag = self.next_tag(Kind::Object, Dir::Send);
        debug!(rank = self.rank(), dst, tag, "sending object");
        put_value(&self.transport, dst, &tag, value).await
    }

    /// Receives an object payload from `src`, consuming one object-recv index.
    pub async fn recv_obj<P: DeserializeOwned>(&mut self, src: usize) -> Result<P, ChannelError> {
        let tag = self.next_tag(Kind::Object, Dir::Recv);
        debug!(rank = self.rank(), src, tag, "receiving object");
        get_value(&self.transport, src, &tag).await
    }

    /// Asynchronous send: the counter index is consumed immediately and the
    /// returned future is the waitable handle.
    pub fn isend<'a, P: Serialize>(
        &'a mut self,
        value: &P,
        dst: usize,
    ) -> impl Future<Output = Result<(), ChannelError>> + 'a {
        let tag = self.next_tag(Kind::Tensor, Dir::Send);
        let bytes = serialize(&tag, value);
        let transport = &self.transport;
        async move { put_bytes(transport, dst, &tag, bytes?).await }
    }

    /// Asynchronous receive: the counter index is consumed immediately and
    /// the returned future is the waitable handle.
    pub fn irecv<'a, P: DeserializeOwned>(
        &'a mut self,
        src: usize,
    ) -> impl Future<Output = Result<P, ChannelError>> + 'a {
        let tag = self.next_tag(Kind::Tensor, Dir::Recv);
        let transport = &self.transport;
        async move { get_value(transport, src, &tag).await }
    }

    /// Broadcasts from `src` to all other ranks of the active group.
    ///
    /// The source passes `Some(value)` and consumes one send index for the
    /// whole fan-out; followers consume one recv index. With fewer than two
    /// ranks the value is returned unchanged without touching the transport.
    pub async fn broadcast<P: Serialize + DeserializeOwned + Send + Sync>(
        &mut self,
        value: Option<P>,
        src: usize,
    ) -> Result<P, ChannelError> {
        self.broadcast_kind(value, src, Kind::Tensor).await
    }

    /// [`Communicator::broadcast`] on the object namespace.
    pub async fn broadcast_obj<P: Serialize + DeserializeOwned + Send + Sync>(
        &mut self,
        value: Option<P>,
        src: usize,
    ) -> Result<P, ChannelError> {
        self.broadcast_kind(value, src, Kind::Object).await
    }

    async fn broadcast_kind<P: Serialize + DeserializeOwned + Send + Sync>(
        &mut self,
        value: Option<P>,
        src: usize,
        kind: Kind,
    ) -> Result<P, ChannelError> {
        let ranks = self.group_ranks();
        if ranks.len() < 2 {
            return value.ok_or(ChannelError::MissingInput("broadcast source value"));
        }
        if self.rank() == src {
            let value = value.ok_or(ChannelError::MissingInput("broadcast source value"))?;
            let tag = self.next_tag(kind, Dir::Send);
            let bytes = serialize(&tag, &value)?;
            let transport = &self.transport;
            try_join_all(
                ranks
                    .iter()
                    .filter(|r| **r != src)
                    .map(|dst| put_bytes(transport, *dst, &tag, bytes.clone())),
            )
            .await?;
            Ok(value)
        } else {
            let tag = self.next_tag(kind, Dir::Recv);
            get_value(&self.transport, src, &tag).await
        }
    }

    /// Gathers one value per rank of the active group, in rank order, with
    /// the local value inserted at the local position without a network
    /// round-trip. With fewer than two ranks this returns `[value]` without
    /// touching the transport.
    pub async fn all_gather<P: Serialize + DeserializeOwned + Clone + Send + Sync>(
        &mut self,
        value: P,
    ) -> Result<Vec<P>, ChannelError> {
        let ranks = self.group_ranks();
        if ranks.len() < 2 {
            return Ok(vec![value]);
        }
        let rank = self.rank();
        let send_tag = self.next_tag(Kind::Tensor, Dir::Send);
        let recv_tag = self.next_tag(Kind::Tensor, Dir::Recv);
        let bytes = serialize(&send_tag, &value)?;
        let transport = &self.transport;
        try_join_all(
            ranks
                .iter()
                .filter(|r| **r != rank)
                .map(|dst| put_bytes(transport, *dst, &send_tag, bytes.clone())),
        )
        .await?;
        let mut result = Vec::with_capacity(ranks.len());
        for r in &ranks {
            if *r == rank {
                result.push(value.clone());
            } else {
                result.push(get_value(transport, *r, &recv_tag).await?);
            }
        }
        Ok(result)
    }

    /// Folds every rank's value into `dst` under `op`; the destination
    /// returns `Some(folded)`, all other ranks `None`. With fewer than two
    /// ranks this returns `Some(value)` without touching the transport.
    pub async fn reduce<P: Reducible>(
        &mut self,
        value: P,
        dst: usize,
        op: ReduceOp,
    ) -> Result<Option<P>, ChannelError> {
        let ranks = self.group_ranks();
        if ranks.len() < 2 {
            return Ok(Some(value));
        }
        if self.rank() == dst {
            let tag = self.next_tag(Kind::Tensor, Dir::Recv);
            let mut acc = value;
            for src in ranks.iter().filter(|r| **r != dst) {
                let other: P = get_value(&self.transport, *src, &tag).await?;
                acc = P::combine(op, acc, other)?;
            }
            Ok(Some(acc))
        } else {
            let tag = self.next_tag(Kind::Tensor, Dir::Send);
            put_value(&self.transport, dst, &tag, &value).await?;
            Ok(None)
        }
    }

    /// Folds every rank's value under `op` and returns the result at every
    /// rank, implemented as an all-gather plus a local fold.
    pub async fn all_reduce<P: Reducible>(
        &mut self,
        value: P,
        op: ReduceOp,
    ) -> Result<P, ChannelError> {
        let gathered = self.all_gather(value).await?;
        let mut iter = gathered.into_iter();
        let mut acc = iter
            .next()
            .ok_or(ChannelError::MissingInput("all_reduce value"))?;
        for other in iter {
            acc = P::combine(op, acc, other)?;
        }
        Ok(acc)
    }

    /// Not implemented; callers must not fall back silently.
    pub fn scatter<P>(&mut self, _values: Vec<P>, _src: usize) -> Result<P, ChannelError> {
        Err(ChannelError::NotImplemented("scatter"))
    }

    /// Not implemented; callers must not fall back silently.
    pub fn gather<P>(&mut self, _value: P, _dst: usize) -> Result<Vec<P>, ChannelError> {
        Err(ChannelError::NotImplemented("gather"))
    }
}

/// Scoped activation of a group; dropping the guard restores the previously
/// active group.
pub struct GroupGuard<'a, T> {
    comm: &'a mut Communicator<T>,
}

impl<T> Deref for GroupGuard<'_, T> {
    type Target = Communicator<T>;

    fn deref(&self) -> &Self::Target {
        self.comm
    }
}

impl<T> DerefMut for GroupGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.comm
    }
}

impl<T> Drop for GroupGuard<'_, T> {
    fn drop(&mut self) {
        self.comm.active.pop();
    }
}

fn serialize<P: Serialize>(tag: &str, value: &P) -> Result<Vec<u8>, ChannelError> {
    bincode::serialize(value).map_err(|e| ChannelError::Serde {
        tag: tag.to_string(),
        reason: format!("{e:?}"),
    })
}

async fn put_bytes<T: Transport>(
    transport: &T,
    dst: usize,
    tag: &str,
    bytes: Vec<u8>,
) -> Result<(), ChannelError> {
    transport
        .put(dst, tag, bytes)
        .await
        .map_err(|e| ChannelError::Send {
            party: dst,
            tag: tag.to_string(),
            reason: format!("{e:?}"),
        })
}

async fn put_value<T: Transport, P: Serialize>(
    transport: &T,
    dst: usize,
    tag: &str,
    value: &P,
) -> Result<(), ChannelError> {
    let bytes = serialize(tag, value)?;
    put_bytes(transport, dst, tag, bytes).await
}

async fn get_value<T: Transport, P: DeserializeOwned>(
    transport: &T,
    src: usize,
    tag: &str,
) -> Result<P, ChannelError> {
    let bytes = transport
        .get(src, tag)
        .await
        .map_err(|e| ChannelError::Recv {
            party: src,
            tag: tag.to_string(),
            reason: format!("{e:?}"),
        })?;
    bincode::deserialize(&bytes).map_err(|e| ChannelError::Serde {
        tag: tag.to_string(),
        reason: format!("{e:?}"),
    })
}
