use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

#[allow(dead_code)]
const CHANNEL_CAPACITY: usize = 256;

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Room(Ulid),
    Requester(Ulid),
}

/// Topics an event is delivered to. Internal bookkeeping events
/// (rescoring, batch records) notify nobody.
pub fn topics_for(event: &Event) -> Vec<Topic> {
    match event {
        Event::RoomAdded { id, .. }
        | Event::RoomUpdated { id, .. }
        | Event::RoomMaintenanceSet { id, .. }
        | Event::RoomOccupancySet { id, .. }
        | Event::RoomRemoved { id } => vec![Topic::Room(*id)],
        Event::RequesterRegistered { id, .. } | Event::RequesterPointerSet { id, .. } => {
            vec![Topic::Requester(*id)]
        }
        Event::RequestSubmitted { requester_id, .. }
        | Event::RequestTransitioned { requester_id, .. }
        | Event::WaitlistJoined { requester_id, .. }
        | Event::WaitlistLeft { requester_id, .. } => vec![Topic::Requester(*requester_id)],
        Event::AllocationOpened { requester_id, room_id, .. }
        | Event::AllocationClosed { requester_id, room_id, .. }
        | Event::AllocationReopened { requester_id, room_id, .. }
        | Event::AllocationVoided { requester_id, room_id, .. } => {
            vec![Topic::Requester(*requester_id), Topic::Room(*room_id)]
        }
        Event::RequestRescored { .. } | Event::BatchRecorded { .. } => Vec::new(),
    }
}

/// Best-effort broadcast hub. The delivery transport (mail, push, …) is an
/// external collaborator subscribing here; a send with nobody listening is
/// a no-op, and a failed send never fails the operation that produced it.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan an event out to every topic it belongs to.
    pub fn publish(&self, event: &Event) {
        for topic in topics_for(event) {
            self.send(topic, event);
        }
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, topic: Topic, event: &Event) {
        if let Some(sender) = self.channels.get(&topic) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a room is deleted).
    #[allow(dead_code)]
    pub fn remove(&self, topic: &Topic) {
        self.channels.remove(topic);
    }
}
