//! Registry lifecycle notifications

/// Emitted on the registry's broadcast channel
///
/// `Superseded` marks the point where the previous record for a user and
/// everything hanging off it has been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        user_id: String,
        tunnel_id: String,
    },
    Superseded {
        user_id: String,
        old_tunnel_id: String,
        new_tunnel_id: String,
    },
    Unregistered {
        user_id: String,
        tunnel_id: String,
    },
    Evicted {
        user_id: String,
        tunnel_id: String,
    },
    HealthChanged {
        user_id: String,
        tunnel_id: String,
        is_healthy: bool,
    },
}

impl RegistryEvent {
    pub fn tunnel_id(&self) -> &str {
        match self {
            RegistryEvent::Registered { tunnel_id, .. }
            | RegistryEvent::Unregistered { tunnel_id, .. }
            | RegistryEvent::Evicted { tunnel_id, .. }
            | RegistryEvent::HealthChanged { tunnel_id, .. } => tunnel_id,
            RegistryEvent::Superseded { old_tunnel_id, .. } => old_tunnel_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            RegistryEvent::Registered { user_id, .. }
            | RegistryEvent::Superseded { user_id, .. }
            | RegistryEvent::Unregistered { user_id, .. }
            | RegistryEvent::Evicted { user_id, .. }
            | RegistryEvent::HealthChanged { user_id, .. } => user_id,
        }
    }
}
