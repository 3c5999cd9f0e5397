use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ChannelId, Role, UserId, WorkspaceId},
    protocol::{ChannelAccess, ChannelPayload, GuestGrants, MemberPermissions, PermissionUpdate},
};
use tracing::debug;

use crate::permissions::{self, CapabilitySet};

/// The actor's role data: the only input the permission resolver reads.
#[derive(Debug, Clone)]
pub struct RoleSnapshot {
    pub workspace_role: Role,
    pub is_guest: bool,
    access: HashMap<ChannelId, ChannelAccess>,
    stale: bool,
    generation: u64,
}

impl RoleSnapshot {
    pub fn new(workspace_role: Role, is_guest: bool) -> Self {
        Self {
            workspace_role,
            is_guest,
            access: HashMap::new(),
            stale: false,
            generation: 0,
        }
    }

    pub fn access(&self, channel_id: &ChannelId) -> Option<&ChannelAccess> {
        self.access.get(channel_id)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump(&mut self) {
        self.generation += 1;
    }

    /// Stale data never permits anything beyond reading.
    pub fn resolve(&self, channel_id: &ChannelId) -> CapabilitySet {
        if self.stale {
            return CapabilitySet::read_only();
        }
        let access = self.access.get(channel_id);
        permissions::resolve(
            self.workspace_role,
            access.and_then(|access| access.role_override),
            self.is_guest,
            access.map(|access| &access.guest_grants),
        )
    }
}

#[derive(Debug)]
pub struct ChannelStore {
    actor_id: UserId,
    workspace_id: WorkspaceId,
    channels: HashMap<ChannelId, ChannelPayload>,
    roles: RoleSnapshot,
}

impl ChannelStore {
    pub fn new(
        actor_id: UserId,
        workspace_id: WorkspaceId,
        workspace_role: Role,
        is_guest: bool,
    ) -> Self {
        Self {
            actor_id,
            workspace_id,
            channels: HashMap::new(),
            roles: RoleSnapshot::new(workspace_role, is_guest),
        }
    }

    pub fn get(&self, channel_id: &ChannelId) -> Option<&ChannelPayload> {
        self.channels.get(channel_id)
    }

    pub fn list(&self) -> Vec<&ChannelPayload> {
        let mut channels: Vec<_> = self.channels.values().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        channels
    }

    pub fn roles(&self) -> &RoleSnapshot {
        &self.roles
    }

    pub fn capabilities(&self, channel_id: &ChannelId) -> CapabilitySet {
        match self.channels.get(channel_id) {
            Some(channel) if channel.workspace_id != self.workspace_id => CapabilitySet::none(),
            _ => self.roles.resolve(channel_id),
        }
    }

    /// Effective role of any member listed on the channel.
    pub fn effective_role(&self, channel_id: &ChannelId, user_id: &UserId) -> Option<Role> {
        let member = self
            .channels
            .get(channel_id)?
            .members
            .iter()
            .find(|member| &member.user_id == user_id)?;
        Some(permissions::effective_role(
            member.workspace_role,
            member.channel_role,
        ))
    }

    /// Returns true when the actor's role data changed. An actor missing
    /// from the member list loses any channel override.
    pub fn upsert(&mut self, channel: ChannelPayload) -> bool {
        let access = channel
            .members
            .iter()
            .find(|member| member.user_id == self.actor_id)
            .map(|me| ChannelAccess {
                channel_id: channel.id.clone(),
                role_override: me.channel_role,
                guest_grants: me.guest_grants,
            });
        let roles_changed = match access {
            Some(access) if self.roles.access.get(&channel.id) != Some(&access) => {
                self.roles.access.insert(channel.id.clone(), access);
                true
            }
            Some(_) => false,
            None => self.roles.access.remove(&channel.id).is_some(),
        };
        if roles_changed {
            self.roles.bump();
        }
        self.channels.insert(channel.id.clone(), channel);
        roles_changed
    }

    /// Channels absent from the new list drop their role data too.
    pub fn replace_all(&mut self, channels: Vec<ChannelPayload>) -> bool {
        self.channels.clear();
        let listed: HashSet<ChannelId> = channels.iter().map(|channel| channel.id.clone()).collect();
        let before = self.roles.access.len();
        self.roles.access.retain(|channel_id, _| listed.contains(channel_id));
        let mut roles_changed = self.roles.access.len() != before;
        if roles_changed {
            debug!(dropped = before - self.roles.access.len(), "channels: dropped access for unlisted channels");
            self.roles.bump();
        }
        for channel in channels {
            roles_changed |= self.upsert(channel);
        }
        roles_changed
    }

    /// Applies a permissions snapshot. For the actor this replaces the role
    /// data wholesale and clears staleness; for anyone else it refreshes the
    /// member entries shown on channel admin screens.
    pub fn apply_permissions(&mut self, permissions: MemberPermissions) -> bool {
        if permissions.workspace_id != self.workspace_id {
            debug!(
                workspace_id = %permissions.workspace_id,
                "channels: ignoring permissions for another workspace"
            );
            return false;
        }

        for access in &permissions.channels {
            let Some(channel) = self.channels.get_mut(&access.channel_id) else {
                continue;
            };
            if let Some(member) = channel
                .members
                .iter_mut()
                .find(|member| member.user_id == permissions.user_id)
            {
                member.workspace_role = permissions.workspace_role;
                member.is_guest = permissions.is_guest;
                member.channel_role = access.role_override;
                member.guest_grants = access.guest_grants;
            }
        }

        if permissions.user_id != self.actor_id {
            return false;
        }

        self.roles.workspace_role = permissions.workspace_role;
        self.roles.is_guest = permissions.is_guest;
        self.roles.access = permissions
            .channels
            .into_iter()
            .map(|access| (access.channel_id.clone(), access))
            .collect();
        self.roles.stale = false;
        self.roles.bump();
        true
    }

    /// A 403 means the server disagrees with our role data.
    pub fn mark_stale(&mut self) {
        if !self.roles.stale {
            self.roles.stale = true;
            self.roles.bump();
        }
    }

    /// Builds a role change for `user_id`. Without explicit grants the
    /// member's current guest grants are kept.
    pub fn member_update(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        role_override: Option<Role>,
        guest_grants: Option<GuestGrants>,
    ) -> PermissionUpdate {
        let guest_grants = guest_grants.or_else(|| {
            self.channels
                .get(channel_id)
                .and_then(|channel| {
                    channel
                        .members
                        .iter()
                        .find(|member| &member.user_id == user_id)
                })
                .map(|member| member.guest_grants)
        });
        PermissionUpdate {
            user_id: user_id.clone(),
            channel_id: channel_id.clone(),
            role_override,
            guest_grants,
        }
    }
}
