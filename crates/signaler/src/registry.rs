//! Community registry: `community → { mac → member }` routing state.
//!
//! The registry is guarded by a single mutex. Operations mutate the table
//! and *compute* the envelopes to emit, returning them as dispatch lists;
//! the caller performs the actual websocket writes after the lock has been
//! released. Holding the lock across a blocking write is the one bug this
//! shape exists to prevent.

use std::collections::HashMap;
use std::sync::Mutex;

use protocol::{Envelope, MacAddr};
use thiserror::Error;
use tokio::sync::mpsc;

/// Registry errors surface to the offending connection only; other members
/// of the community are never disturbed by them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("hardware address {mac} is already claimed in community \"{community}\"")]
    DuplicateMac { community: String, mac: MacAddr },

    #[error("community \"{0}\" does not exist")]
    UnknownCommunity(String),

    #[error("hardware address {mac} is not a member of community \"{community}\"")]
    UnknownMember { community: String, mac: MacAddr },

    #[error("no member {mac} in community \"{community}\" to deliver the exchange to")]
    UnknownDestination { community: String, mac: MacAddr },

    #[error("{0} envelopes cannot be routed")]
    NotAnExchange(&'static str),
}

/// Close status carried on the websocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Orderly member departure.
    Normal,
    /// Protocol violation or error exit.
    Protocol,
    /// Server shutdown.
    GoingAway,
}

/// Work for a member's control-plane transport.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Send an envelope as a JSON text frame.
    Envelope(Envelope),
    /// Send a keep-alive ping.
    Ping,
    /// Close the transport. The reason is truncated to the wire limit at
    /// the single point that performs the close.
    Close { status: CloseStatus, reason: String },
}

/// Handle to a member's control-plane transport: a bounded sender drained
/// by the connection's writer task.
#[derive(Debug, Clone)]
pub struct MemberHandle {
    tx: mpsc::Sender<Outbound>,
}

impl MemberHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Delivers work to the transport's writer task.
    ///
    /// Returns false if the writer is gone; the connection's own loop is
    /// responsible for cleaning the member out of the registry, so failure
    /// here is not an error.
    pub async fn deliver(&self, outbound: Outbound) -> bool {
        self.tx.send(outbound).await.is_ok()
    }
}

/// A computed emission: which transport gets which work.
#[derive(Debug)]
pub struct Dispatch {
    pub handle: MemberHandle,
    pub outbound: Outbound,
}

impl Dispatch {
    fn envelope(handle: MemberHandle, envelope: Envelope) -> Self {
        Self {
            handle,
            outbound: Outbound::Envelope(envelope),
        }
    }

    fn close(handle: MemberHandle, status: CloseStatus, reason: impl Into<String>) -> Self {
        Self {
            handle,
            outbound: Outbound::Close {
                status,
                reason: reason.into(),
            },
        }
    }
}

/// The server-side registry of communities and their members.
pub struct CommunityRegistry {
    communities: Mutex<HashMap<String, HashMap<MacAddr, MemberHandle>>>,
}

impl CommunityRegistry {
    pub fn new() -> Self {
        Self {
            communities: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a member into a community, creating the community if absent.
    ///
    /// First to claim a hardware address in a community wins; a duplicate
    /// address fails and leaves the registry untouched.
    pub fn apply(
        &self,
        community: &str,
        mac: MacAddr,
        handle: MemberHandle,
    ) -> Result<(), RegistryError> {
        let mut communities = self.communities.lock().unwrap();
        let members = communities.entry(community.to_string()).or_default();

        if members.contains_key(&mac) {
            return Err(RegistryError::DuplicateMac {
                community: community.to_string(),
                mac,
            });
        }

        members.insert(mac, handle);
        tracing::debug!(%community, %mac, "member admitted");
        Ok(())
    }

    /// Marks a member ready: every *other* member of the community gets an
    /// introduction to it.
    pub fn ready(&self, community: &str, mac: MacAddr) -> Result<Vec<Dispatch>, RegistryError> {
        let communities = self.communities.lock().unwrap();
        let members = Self::members(&communities, community, mac)?;

        let dispatches = members
            .iter()
            .filter(|(candidate, _)| **candidate != mac)
            .map(|(_, handle)| {
                Dispatch::envelope(handle.clone(), Envelope::Introduction { mac })
            })
            .collect();

        tracing::debug!(%community, %mac, "member ready, introducing");
        Ok(dispatches)
    }

    /// Routes an exchange envelope (`offer`, `answer`, `candidate`) from
    /// `src` to the member named by the envelope's `mac` field, rewriting
    /// that field to `src` so the receiver learns the originator.
    pub fn exchange(
        &self,
        community: &str,
        src: MacAddr,
        envelope: Envelope,
    ) -> Result<Dispatch, RegistryError> {
        let communities = self.communities.lock().unwrap();
        let members = Self::members(&communities, community, src)?;

        let (dst, rewritten) = match envelope {
            Envelope::Offer { mac, payload } => (mac, Envelope::Offer { mac: src, payload }),
            Envelope::Answer { mac, payload } => (mac, Envelope::Answer { mac: src, payload }),
            Envelope::Candidate { mac, payload } => {
                (mac, Envelope::Candidate { mac: src, payload })
            }
            other => return Err(RegistryError::NotAnExchange(other.kind())),
        };

        let handle = members
            .get(&dst)
            .ok_or_else(|| RegistryError::UnknownDestination {
                community: community.to_string(),
                mac: dst,
            })?;

        Ok(Dispatch::envelope(handle.clone(), rewritten))
    }

    /// Removes a member: every other member gets a resignation, the member
    /// is deleted, an emptied community is dropped, and the departing
    /// transport is closed: Normal for orderly departures (no cause),
    /// Protocol with the cause as reason otherwise.
    pub fn exited(
        &self,
        community: &str,
        mac: MacAddr,
        cause: Option<&str>,
    ) -> Result<Vec<Dispatch>, RegistryError> {
        let mut communities = self.communities.lock().unwrap();
        let members = communities
            .get_mut(community)
            .ok_or_else(|| RegistryError::UnknownCommunity(community.to_string()))?;
        let departing = members
            .remove(&mac)
            .ok_or_else(|| RegistryError::UnknownMember {
                community: community.to_string(),
                mac,
            })?;

        let mut dispatches: Vec<Dispatch> = members
            .values()
            .map(|handle| Dispatch::envelope(handle.clone(), Envelope::Resignation { mac }))
            .collect();

        if members.is_empty() {
            communities.remove(community);
            tracing::debug!(%community, "community emptied, removing");
        }

        dispatches.push(match cause {
            None => Dispatch::close(departing, CloseStatus::Normal, "resignation"),
            Some(reason) => Dispatch::close(departing, CloseStatus::Protocol, reason),
        });

        tracing::debug!(%community, %mac, cause = cause.unwrap_or("none"), "member exited");
        Ok(dispatches)
    }

    /// Drops every community and closes every transport with Going-Away.
    pub fn shutdown(&self) -> Vec<Dispatch> {
        let mut communities = self.communities.lock().unwrap();

        let dispatches = communities
            .drain()
            .flat_map(|(_, members)| members.into_values())
            .map(|handle| Dispatch::close(handle, CloseStatus::GoingAway, "shutting down"))
            .collect();

        dispatches
    }

    /// Whether a community currently exists.
    pub fn contains(&self, community: &str) -> bool {
        self.communities.lock().unwrap().contains_key(community)
    }

    /// Number of members in a community (0 if it does not exist).
    pub fn member_count(&self, community: &str) -> usize {
        self.communities
            .lock()
            .unwrap()
            .get(community)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn members<'a>(
        communities: &'a HashMap<String, HashMap<MacAddr, MemberHandle>>,
        community: &str,
        mac: MacAddr,
    ) -> Result<&'a HashMap<MacAddr, MemberHandle>, RegistryError> {
        let members = communities
            .get(community)
            .ok_or_else(|| RegistryError::UnknownCommunity(community.to_string()))?;

        if !members.contains_key(&mac) {
            return Err(RegistryError::UnknownMember {
                community: community.to_string(),
                mac,
            });
        }

        Ok(members)
    }
}

impl Default for CommunityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
