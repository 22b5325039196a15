//! Broadcast artifacts
//!
//! The artifact produced by one refinement round (centroids, a model, ...)
//! has to reach every partition's local step in the next round. A
//! [`Broadcast`] is a read-only, cheaply clonable handle to that value;
//! [`SerializableBroadcast`] is its wire form for workers that do not share
//! memory with the driver.
//!
//! Broadcasts are scoped to a round: publishing the next round's artifact
//! through a [`BroadcastManager`] supersedes the previous one.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sumstat_common::TransportCodec;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AggResult, AggregationError};
use crate::traits::Data;

/// Unique identifier for a broadcast artifact
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastId(pub String);

impl BroadcastId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for BroadcastId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only artifact shared with every partition of one round.
#[derive(Debug)]
pub struct Broadcast<T> {
    id: BroadcastId,
    round: usize,
    value: Arc<T>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            round: self.round,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: Data> Broadcast<T> {
    /// Wrap `value` as the artifact for `round`.
    pub fn new(value: T, round: usize) -> Self {
        Self {
            id: BroadcastId::new(),
            round,
            value: Arc::new(value),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn id(&self) -> &BroadcastId {
        &self.id
    }

    /// Round whose local steps read this artifact.
    pub fn round(&self) -> usize {
        self.round
    }

    /// `n` handles sharing the same value.
    pub fn fan_out(&self, n: usize) -> Vec<Broadcast<T>> {
        (0..n).map(|_| self.clone()).collect()
    }

    /// `n` independent copies of the value, made by encoding it once and
    /// decoding one copy per recipient.
    pub fn replicate(&self, codec: &TransportCodec, n: usize) -> AggResult<Vec<Broadcast<T>>> {
        let wire = SerializableBroadcast::from_broadcast(self, codec)?;
        debug!(
            id = %self.id,
            round = self.round,
            bytes = wire.data.len(),
            copies = n,
            "replicating broadcast"
        );
        (0..n).map(|_| wire.to_broadcast()).collect()
    }
}

/// Serializable broadcast for shipping to workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableBroadcast {
    pub id: BroadcastId,
    pub round: usize,
    /// Encoded frame
    pub data: Vec<u8>,
}

impl SerializableBroadcast {
    pub fn from_broadcast<T: Data>(
        broadcast: &Broadcast<T>,
        codec: &TransportCodec,
    ) -> AggResult<Self> {
        Ok(Self {
            id: broadcast.id.clone(),
            round: broadcast.round,
            data: codec.encode(broadcast.value())?,
        })
    }

    pub fn to_broadcast<T: Data>(&self) -> AggResult<Broadcast<T>> {
        let value: T = sumstat_common::decode_frame(&self.data)?;
        Ok(Broadcast {
            id: self.id.clone(),
            round: self.round,
            value: Arc::new(value),
        })
    }
}

/// Tracks the current broadcast of a refinement run.
#[derive(Debug)]
pub struct BroadcastManager<T> {
    current: Option<Broadcast<T>>,
    superseded: HashSet<BroadcastId>,
    next_round: usize,
}

impl<T: Data> Default for BroadcastManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Data> BroadcastManager<T> {
    pub fn new() -> Self {
        Self {
            current: None,
            superseded: HashSet::new(),
            next_round: 1,
        }
    }

    /// Publish the artifact for the next round, superseding the current one.
    pub fn publish(&mut self, value: T) -> Broadcast<T> {
        let broadcast = Broadcast::new(value, self.next_round);
        self.next_round += 1;
        if let Some(previous) = self.current.replace(broadcast.clone()) {
            debug!(id = %previous.id, round = previous.round, "broadcast superseded");
            self.superseded.insert(previous.id);
        }
        broadcast
    }

    pub fn current(&self) -> Option<&Broadcast<T>> {
        self.current.as_ref()
    }

    /// Look up a broadcast by id. Superseded broadcasts are no longer served.
    pub fn get(&self, id: &BroadcastId) -> AggResult<Broadcast<T>> {
        match &self.current {
            Some(current) if &current.id == id => Ok(current.clone()),
            _ if self.superseded.contains(id) => Err(AggregationError::invalid_parameter(
                format!("broadcast {} has been superseded", id),
            )),
            _ => Err(AggregationError::invalid_parameter(format!(
                "unknown broadcast {}",
                id
            ))),
        }
    }

    /// Drop the current broadcast; called when the run ends.
    pub fn clear(&mut self) {
        if let Some(previous) = self.current.take() {
            self.superseded.insert(previous.id);
        }
    }
}
