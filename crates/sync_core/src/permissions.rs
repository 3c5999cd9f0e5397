use serde::{Deserialize, Serialize};
use shared::{domain::Role, protocol::GuestGrants};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    React,
    SendFiles,
    EditOwnMessages,
    DeleteOwnMessages,
    Moderate,
    EditChannel,
    DeleteChannel,
    ManageMembers,
    ChangeRoles,
    InviteMembers,
    SearchChannels,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub can_read: bool,
    pub can_write: bool,
    pub can_react: bool,
    pub can_send_files: bool,
    pub can_edit_own_messages: bool,
    pub can_delete_own_messages: bool,
    pub can_moderate: bool,
    pub can_edit_channel: bool,
    pub can_delete_channel: bool,
    pub can_manage_members: bool,
    pub can_change_roles: bool,
    pub can_invite_members: bool,
    pub can_search_channels: bool,
}

impl CapabilitySet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            can_read: true,
            ..Self::default()
        }
    }

    pub fn member() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_react: true,
            can_send_files: true,
            can_edit_own_messages: true,
            can_delete_own_messages: true,
            can_invite_members: true,
            can_search_channels: true,
            ..Self::default()
        }
    }

    pub fn channel_admin() -> Self {
        Self {
            can_moderate: true,
            can_edit_channel: true,
            can_delete_channel: true,
            can_manage_members: true,
            can_change_roles: true,
            ..Self::member()
        }
    }

    pub fn full() -> Self {
        Self::channel_admin()
    }

    pub fn guest(grants: GuestGrants) -> Self {
        Self {
            can_read: true,
            can_write: grants.can_write,
            can_react: grants.can_react,
            can_send_files: grants.can_send_files,
            can_edit_own_messages: grants.can_write,
            can_delete_own_messages: grants.can_write,
            ..Self::default()
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Read => self.can_read,
            Capability::Write => self.can_write,
            Capability::React => self.can_react,
            Capability::SendFiles => self.can_send_files,
            Capability::EditOwnMessages => self.can_edit_own_messages,
            Capability::DeleteOwnMessages => self.can_delete_own_messages,
            Capability::Moderate => self.can_moderate,
            Capability::EditChannel => self.can_edit_channel,
            Capability::DeleteChannel => self.can_delete_channel,
            Capability::ManageMembers => self.can_manage_members,
            Capability::ChangeRoles => self.can_change_roles,
            Capability::InviteMembers => self.can_invite_members,
            Capability::SearchChannels => self.can_search_channels,
        }
    }

    /// Editing is limited to the author, even for moderators.
    pub fn can_edit_message(&self, is_author: bool) -> bool {
        is_author && self.can_edit_own_messages
    }

    pub fn can_delete_message(&self, is_author: bool) -> bool {
        self.can_moderate || (is_author && self.can_delete_own_messages)
    }
}

/// Effective channel role: workspace admins stay admins, otherwise the
/// channel override wins over the workspace role.
pub fn effective_role(workspace_role: Role, channel_role_override: Option<Role>) -> Role {
    if workspace_role == Role::Admin {
        return Role::Admin;
    }
    channel_role_override.unwrap_or(workspace_role)
}

pub fn resolve(
    workspace_role: Role,
    channel_role_override: Option<Role>,
    is_guest: bool,
    guest_channel_grants: Option<&GuestGrants>,
) -> CapabilitySet {
    if workspace_role == Role::Admin {
        return CapabilitySet::full();
    }

    let role = effective_role(workspace_role, channel_role_override);
    if is_guest || role == Role::Guest {
        return CapabilitySet::guest(guest_channel_grants.copied().unwrap_or_default());
    }

    match role {
        Role::Admin => CapabilitySet::channel_admin(),
        Role::Member => CapabilitySet::member(),
        Role::Guest => CapabilitySet::guest(guest_channel_grants.copied().unwrap_or_default()),
    }
}

#[cfg(test)]
#[path = "tests/permissions_tests.rs"]
mod tests;
