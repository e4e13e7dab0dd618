//! Channel table, topic membership and message relays.
//!
//! Every transition runs under a single lock and returns the [`Envelope`]s it produced; nothing
//! here touches a socket. [`RelayState::dispatch`](crate::RelayState::dispatch) runs a transition
//! and queues its envelopes as one ordered step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connections::ConnectionId;
use crate::error::RelayError;
use crate::protocol::{BroadcastStatus, ClientMessage, ServerMessage, SignalKind};
use crate::topics::Topics;

/// Who an outbound message is for.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Unicast to one connection
    Connection(ConnectionId),
    /// Topic fan-out, already resolved to a member snapshot
    Connections(Vec<ConnectionId>),
    /// Every registered connection at delivery time
    Everyone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub target: Target,
    pub message: ServerMessage,
}

impl Envelope {
    pub fn to(connection_id: impl Into<ConnectionId>, message: ServerMessage) -> Self {
        Self {
            target: Target::Connection(connection_id.into()),
            message,
        }
    }

    pub fn to_many(connection_ids: Vec<ConnectionId>, message: ServerMessage) -> Self {
        Self {
            target: Target::Connections(connection_ids),
            message,
        }
    }

    pub fn everyone(message: ServerMessage) -> Self {
        Self {
            target: Target::Everyone,
            message,
        }
    }
}

/// Live-state record for one channel.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    pub channel_id: String,
    pub owner: ConnectionId,
    /// Never contains the owner.
    listeners: HashSet<ConnectionId>,
    pub started_at: DateTime<Utc>,
}

impl ChannelSession {
    fn new(channel_id: &str, owner: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            owner: owner.to_string(),
            listeners: HashSet::new(),
            started_at: Utc::now(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn count_for_owner(&self) -> Envelope {
        Envelope::to(
            self.owner.clone(),
            ServerMessage::ListenerCount {
                count: self.listener_count(),
            },
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub owner: ConnectionId,
    pub listener_count: usize,
    pub topic_members: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct HubState {
    channels: HashMap<String, ChannelSession>,
    topics: Topics,
}

/// Shared registry of live channels and their subscribers.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one client message sent by `from`.
    pub fn handle(&self, from: &str, message: ClientMessage) -> Vec<Envelope> {
        let kind = message.kind();
        let outcome = match message {
            ClientMessage::StartBroadcast { channel_id } => self.start(from, channel_id.as_deref()),
            ClientMessage::StopBroadcast { channel_id } => Ok(self.stop(from, channel_id.as_deref())),
            ClientMessage::JoinBroadcast { channel_id } => self.join(from, channel_id.as_deref()),
            ClientMessage::LeaveBroadcast { channel_id } => {
                Ok(self.leave(from, channel_id.as_deref()))
            }
            ClientMessage::Offer { to, offer } => Ok(relay_signal(from, SignalKind::Offer, to, offer)),
            ClientMessage::Answer { to, answer } => {
                Ok(relay_signal(from, SignalKind::Answer, to, answer))
            }
            ClientMessage::IceCandidate { to, candidate } => {
                Ok(relay_signal(from, SignalKind::IceCandidate, to, candidate))
            }
            ClientMessage::AudioData {
                channel_id,
                audio,
                timestamp,
            } => Ok(self.relay_audio(from, channel_id.as_deref(), audio, timestamp)),
            ClientMessage::Ping => Ok(vec![Envelope::to(from, ServerMessage::Pong)]),
        };

        outcome.unwrap_or_else(|err| {
            debug!(connection_id = %from, kind, error = %err, "rejected client message");
            vec![Envelope::to(from, err.to_message())]
        })
    }

    /// Go live on `channel_id`. An existing session is replaced, whoever owned it.
    pub fn start(
        &self,
        owner: &str,
        channel_id: Option<&str>,
    ) -> Result<Vec<Envelope>, RelayError> {
        let channel_id = required(channel_id)?;

        let mut state = self.state.lock();
        let previous = state
            .channels
            .insert(channel_id.to_string(), ChannelSession::new(channel_id, owner));
        state.topics.subscribe(channel_id, owner);
        drop(state);

        match previous {
            Some(previous) if previous.owner != owner => warn!(
                channel_id,
                previous_owner = %previous.owner,
                owner,
                "live broadcast taken over by another connection"
            ),
            Some(_) => debug!(channel_id, owner, "broadcast restarted by its owner"),
            None => {}
        }
        counter!("azaan_relay_broadcasts_started_total", 1);
        info!(channel_id, owner, "broadcast started");

        Ok(vec![
            Envelope::everyone(ServerMessage::BroadcastStarted {
                channel_id: channel_id.to_string(),
            }),
            Envelope::to(
                owner,
                ServerMessage::BroadcastStatus {
                    status: BroadcastStatus::Live,
                    channel_id: channel_id.to_string(),
                },
            ),
        ])
    }

    /// End `channel_id` if it is live. Any connection may stop any channel.
    pub fn stop(&self, caller: &str, channel_id: Option<&str>) -> Vec<Envelope> {
        let Some(channel_id) = channel_id.filter(|id| !id.is_empty()) else {
            return Vec::new();
        };

        let mut state = self.state.lock();
        let Some(session) = state.channels.remove(channel_id) else {
            debug!(channel_id, caller, "stop for a channel that is not live");
            return Vec::new();
        };
        let members = state.topics.clear(channel_id);
        drop(state);

        // No ownership check on stop; flag it so takedowns by third parties are visible.
        if session.owner != caller {
            warn!(
                channel_id,
                owner = %session.owner,
                caller,
                "broadcast stopped by a connection that does not own it"
            );
        }
        counter!("azaan_relay_broadcasts_stopped_total", 1);
        info!(channel_id, listeners = session.listener_count(), "broadcast stopped");

        let mut out = Vec::new();
        fan_out(
            &mut out,
            members,
            ServerMessage::BroadcastStopped {
                channel_id: channel_id.to_string(),
            },
        );
        out
    }

    /// Subscribe `listener` to `channel_id`.
    ///
    /// The topic subscription happens before the liveness check and is kept on
    /// [`RelayError::ChannelNotLive`], so an early listener still receives channel traffic
    /// once someone goes live.
    pub fn join(
        &self,
        listener: &str,
        channel_id: Option<&str>,
    ) -> Result<Vec<Envelope>, RelayError> {
        let channel_id = required(channel_id)?;

        let mut state = self.state.lock();
        state.topics.subscribe(channel_id, listener);
        let Some(session) = state.channels.get_mut(channel_id) else {
            return Err(RelayError::ChannelNotLive);
        };

        let mut out = Vec::new();
        if session.owner != listener && session.listeners.insert(listener.to_string()) {
            out.push(session.count_for_owner());
            out.push(Envelope::to(
                session.owner.clone(),
                ServerMessage::ListenerJoined {
                    listener_id: listener.to_string(),
                },
            ));
            counter!("azaan_relay_listeners_joined_total", 1);
            info!(
                channel_id,
                listener,
                listeners = session.listener_count(),
                "listener joined"
            );
        }
        out.push(Envelope::to(
            listener,
            ServerMessage::JoinedBroadcast {
                channel_id: channel_id.to_string(),
                success: true,
            },
        ));
        Ok(out)
    }

    pub fn leave(&self, listener: &str, channel_id: Option<&str>) -> Vec<Envelope> {
        let Some(channel_id) = channel_id.filter(|id| !id.is_empty()) else {
            return Vec::new();
        };

        let mut state = self.state.lock();
        state.topics.unsubscribe(channel_id, listener);
        let Some(session) = state.channels.get_mut(channel_id) else {
            return Vec::new();
        };
        if !session.listeners.remove(listener) {
            return Vec::new();
        }

        info!(
            channel_id,
            listener,
            listeners = session.listener_count(),
            "listener left"
        );
        vec![
            session.count_for_owner(),
            Envelope::to(
                session.owner.clone(),
                ServerMessage::ListenerLeft {
                    listener_id: listener.to_string(),
                },
            ),
        ]
    }

    /// Fan an audio chunk out to every topic member except the sender.
    pub fn relay_audio(
        &self,
        sender: &str,
        channel_id: Option<&str>,
        audio: Option<Value>,
        timestamp: Option<Value>,
    ) -> Vec<Envelope> {
        let (Some(channel_id), Some(audio)) = (
            channel_id.filter(|id| !id.is_empty()),
            audio.filter(present),
        ) else {
            return Vec::new();
        };

        let state = self.state.lock();
        let recipients = state.topics.snapshot_except(channel_id, sender);
        let from_owner = state
            .channels
            .get(channel_id)
            .map(|session| session.owner == sender)
            .unwrap_or(false);
        drop(state);

        // Any topic member may inject audio; only count it.
        if !from_owner {
            counter!("azaan_relay_audio_chunks_unowned_total", 1);
            debug!(channel_id, sender, "audio chunk from a connection that does not own the channel");
        }
        if recipients.is_empty() {
            return Vec::new();
        }
        counter!(
            "azaan_relay_audio_chunks_forwarded_total",
            recipients.len() as u64
        );

        vec![Envelope::to_many(
            recipients,
            ServerMessage::AudioStream { audio, timestamp },
        )]
    }

    /// Tear down everything `connection_id` was part of.
    ///
    /// Channels it owned are stopped and their remaining topic members told so; channels it
    /// listened to lose it from their listener set and their owners get the new count.
    pub fn disconnect(&self, connection_id: &str) -> Vec<Envelope> {
        let mut out = Vec::new();
        let mut state = self.state.lock();

        let owned: Vec<String> = state
            .channels
            .values()
            .filter(|session| session.owner == connection_id)
            .map(|session| session.channel_id.clone())
            .collect();
        for channel_id in owned {
            state.channels.remove(&channel_id);
            let members: Vec<ConnectionId> = state
                .topics
                .clear(&channel_id)
                .into_iter()
                .filter(|member| member != connection_id)
                .collect();
            counter!("azaan_relay_broadcasts_stopped_total", 1);
            info!(
                channel_id = %channel_id,
                owner = connection_id,
                "broadcast ended by owner disconnect"
            );
            fan_out(&mut out, members, ServerMessage::BroadcastStopped { channel_id });
        }

        for session in state.channels.values_mut() {
            if session.listeners.remove(connection_id) {
                out.push(session.count_for_owner());
                out.push(Envelope::to(
                    session.owner.clone(),
                    ServerMessage::ListenerLeft {
                        listener_id: connection_id.to_string(),
                    },
                ));
            }
        }

        state.topics.remove_everywhere(connection_id);
        out
    }

    pub fn is_live(&self, channel_id: &str) -> bool {
        self.state.lock().channels.contains_key(channel_id)
    }

    #[cfg(test)]
    pub(crate) fn owner_of(&self, channel_id: &str) -> Option<ConnectionId> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .map(|session| session.owner.clone())
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, channel_id: &str) -> Option<usize> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .map(ChannelSession::listener_count)
    }

    /// Ids of all live channels, sorted.
    pub fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.state.lock().channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let state = self.state.lock();
        let mut snapshots: Vec<ChannelSnapshot> = state
            .channels
            .values()
            .map(|session| ChannelSnapshot {
                channel_id: session.channel_id.clone(),
                owner: session.owner.clone(),
                listener_count: session.listener_count(),
                topic_members: state.topics.member_count(&session.channel_id),
                started_at: session.started_at,
            })
            .collect();
        drop(state);
        snapshots.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        snapshots
    }
}

/// Forward a negotiation payload to exactly one destination. Missing fields drop the message.
pub fn relay_signal(
    from: &str,
    kind: SignalKind,
    to: Option<String>,
    payload: Option<Value>,
) -> Vec<Envelope> {
    match (to.filter(|to| !to.is_empty()), payload.filter(present)) {
        (Some(to), Some(payload)) => {
            counter!("azaan_relay_signals_relayed_total", 1, "kind" => kind.as_str());
            debug!(from, to = %to, kind = kind.as_str(), "relaying signal");
            vec![Envelope::to(to, kind.forward(from.to_string(), payload))]
        }
        _ => {
            debug!(from, kind = kind.as_str(), "dropping signal without destination or payload");
            Vec::new()
        }
    }
}

fn required(channel_id: Option<&str>) -> Result<&str, RelayError> {
    channel_id
        .filter(|id| !id.is_empty())
        .ok_or(RelayError::MissingChannelId)
}

/// Null, `""`, `{}` and `[]` count as an absent payload.
fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

fn fan_out(out: &mut Vec<Envelope>, members: Vec<ConnectionId>, message: ServerMessage) {
    if !members.is_empty() {
        out.push(Envelope::to_many(members, message));
    }
}
