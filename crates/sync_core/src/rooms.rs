use std::collections::{BTreeSet, HashSet, VecDeque};

use shared::{domain::RoomId, protocol::ClientCommand};
use tracing::debug;

/// Tracks held rooms and the join/leave traffic still owed to the server.
#[derive(Debug, Default)]
pub struct RoomTracker {
    held: BTreeSet<RoomId>,
    buffered: VecDeque<ClientCommand>,
    awaiting_ack: HashSet<RoomId>,
    connected: bool,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_joined(&self, room: &RoomId) -> bool {
        self.held.contains(room)
    }

    pub fn held_rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.held.iter()
    }

    pub fn buffered(&self) -> impl Iterator<Item = &ClientCommand> {
        self.buffered.iter()
    }

    /// Returns the command to transmit now, if any.
    pub fn join_room(&mut self, room: RoomId) -> Option<ClientCommand> {
        if !self.held.insert(room.clone()) {
            return None;
        }
        self.awaiting_ack.insert(room.clone());
        self.outbound(ClientCommand::JoinRoom { room })
    }

    pub fn leave_room(&mut self, room: &RoomId) -> Option<ClientCommand> {
        if !self.held.remove(room) {
            return None;
        }
        self.awaiting_ack.remove(room);

        if !self.connected {
            let cancels_join = matches!(
                self.buffered.back(),
                Some(ClientCommand::JoinRoom { room: last }) if last == room
            );
            if cancels_join {
                self.buffered.pop_back();
                debug!(%room, "rooms: buffered join cancelled by leave");
                return None;
            }
        }
        self.outbound(ClientCommand::LeaveRoom { room: room.clone() })
    }

    fn outbound(&mut self, command: ClientCommand) -> Option<ClientCommand> {
        if self.connected {
            Some(command)
        } else {
            self.buffered.push_back(command);
            None
        }
    }

    pub fn acknowledge(&mut self, room: &RoomId) -> bool {
        self.awaiting_ack.remove(room)
    }

    pub fn awaiting_ack(&self) -> impl Iterator<Item = &RoomId> {
        self.awaiting_ack.iter()
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
    }

    /// Commands to transmit on a fresh connection, in order, before any
    /// inbound event is read: a join for every held room the buffer does not
    /// already join, then the buffer itself.
    pub fn on_connected(&mut self) -> Vec<ClientCommand> {
        self.connected = true;

        let buffered_joins: HashSet<&RoomId> = self
            .buffered
            .iter()
            .filter_map(|command| match command {
                ClientCommand::JoinRoom { room } => Some(room),
                ClientCommand::LeaveRoom { .. } => None,
            })
            .collect();

        let mut commands: Vec<ClientCommand> = self
            .held
            .iter()
            .filter(|room| !buffered_joins.contains(room))
            .map(|room| ClientCommand::JoinRoom { room: room.clone() })
            .collect();
        commands.extend(self.buffered.drain(..));

        self.awaiting_ack = self.held.iter().cloned().collect();
        commands
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
