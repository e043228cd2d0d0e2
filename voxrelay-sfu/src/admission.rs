//! Admission policy
//!
//! Decides whether a user may join a room. Evaluated before the registry is
//! touched, so a denied request never creates a room.

use crate::types::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(String),
}

impl Admission {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Pure admission decision with no side effects
pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, room_id: &RoomId, user_id: &UserId) -> Admission;
}

/// Admission configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Users that may not join any room
    pub denied_users: Vec<String>,
    /// Users that may not join a specific room, keyed by room id
    pub room_denylist: HashMap<String, Vec<String>>,
}

/// Denylist-based policy: everyone is admitted unless listed
#[derive(Debug, Clone, Default)]
pub struct DenyListPolicy {
    denied_users: HashSet<UserId>,
    room_denylist: HashMap<RoomId, HashSet<UserId>>,
}

impl DenyListPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny `user_id` everywhere
    #[must_use]
    pub fn deny_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.denied_users.insert(user_id.into());
        self
    }

    /// Deny `user_id` in `room_id` only
    #[must_use]
    pub fn deny_user_in_room(mut self, room_id: impl Into<RoomId>, user_id: impl Into<UserId>) -> Self {
        self.room_denylist
            .entry(room_id.into())
            .or_default()
            .insert(user_id.into());
        self
    }
}

impl From<&AdmissionConfig> for DenyListPolicy {
    fn from(config: &AdmissionConfig) -> Self {
        let policy = config
            .denied_users
            .iter()
            .fold(Self::new(), |policy, user| policy.deny_user(user.as_str()));
        config.room_denylist.iter().fold(policy, |policy, (room, users)| {
            users
                .iter()
                .fold(policy, |policy, user| policy.deny_user_in_room(room.as_str(), user.as_str()))
        })
    }
}

impl AdmissionPolicy for DenyListPolicy {
    fn admit(&self, room_id: &RoomId, user_id: &UserId) -> Admission {
        if self.denied_users.contains(user_id) {
            return Admission::Deny(format!("user {user_id} is blocked"));
        }
        if self
            .room_denylist
            .get(room_id)
            .is_some_and(|users| users.contains(user_id))
        {
            return Admission::Deny(format!("user {user_id} is blocked from room {room_id}"));
        }
        Admission::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_denylist() {
        let policy = DenyListPolicy::new().deny_user("5");
        assert!(policy.admit(&RoomId::from("r2"), &UserId::from("1")).is_allowed());
        assert!(matches!(
            policy.admit(&RoomId::from("r2"), &UserId::from("5")),
            Admission::Deny(_)
        ));
    }

    #[test]
    fn test_room_denylist_is_scoped() {
        let policy = DenyListPolicy::new().deny_user_in_room("r1", "7");
        assert!(!policy.admit(&RoomId::from("r1"), &UserId::from("7")).is_allowed());
        assert!(policy.admit(&RoomId::from("r2"), &UserId::from("7")).is_allowed());
    }

    #[test]
    fn test_from_config() {
        let mut config = AdmissionConfig {
            denied_users: vec!["5".to_string()],
            ..Default::default()
        };
        config
            .room_denylist
            .insert("lobby".to_string(), vec!["9".to_string()]);

        let policy = DenyListPolicy::from(&config);
        assert!(!policy.admit(&RoomId::from("any"), &UserId::from("5")).is_allowed());
        assert!(!policy.admit(&RoomId::from("lobby"), &UserId::from("9")).is_allowed());
        assert!(policy.admit(&RoomId::from("other"), &UserId::from("9")).is_allowed());
    }
}
