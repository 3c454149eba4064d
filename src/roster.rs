use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
}

pub trait RosterEntry: Clone + PartialEq {
    fn entry_id(&self) -> &str;

    /// Copies presence flags from the previous entry where this one leaves them unset.
    fn inherit_presence(&mut self, _previous: &Self) {}
}

impl RosterEntry for Friend {
    fn entry_id(&self) -> &str {
        &self.id
    }

    fn inherit_presence(&mut self, previous: &Self) {
        self.is_online = self.is_online.or(previous.is_online);
    }
}

impl RosterEntry for Group {
    fn entry_id(&self) -> &str {
        &self.id
    }
}

impl RosterEntry for GroupMember {
    fn entry_id(&self) -> &str {
        &self.id
    }

    fn inherit_presence(&mut self, previous: &Self) {
        self.is_online = self.is_online.or(previous.is_online);
        self.is_connected = self.is_connected.or(previous.is_connected);
    }
}

/// Replaces `previous` with `fresh`, keeping known presence for entries the
/// fresh list does not describe. Returns the merged list and whether it differs.
pub fn merge_roster<T: RosterEntry>(previous: &[T], fresh: Vec<T>) -> (Vec<T>, bool) {
    let by_id: HashMap<&str, &T> = previous.iter().map(|entry| (entry.entry_id(), entry)).collect();

    let merged: Vec<T> = fresh
        .into_iter()
        .map(|mut entry| {
            if let Some(previous_entry) = by_id.get(entry.entry_id()) {
                entry.inherit_presence(previous_entry);
            }
            entry
        })
        .collect();

    let changed = merged.as_slice() != previous;
    (merged, changed)
}

#[derive(Debug, Default)]
pub struct RosterState {
    friends: Vec<Friend>,
    groups: Vec<Group>,
    members: HashMap<String, Vec<GroupMember>>,
}

impl RosterState {
    pub fn friends(&self) -> &[Friend] {
        &self.friends
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn members(&self, group_id: &str) -> &[GroupMember] {
        self.members.get(group_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.iter().map(|group| group.id.clone()).collect()
    }

    pub fn apply_friends(&mut self, fresh: Vec<Friend>) -> bool {
        let (merged, changed) = merge_roster(&self.friends, fresh);
        self.friends = merged;
        changed
    }

    pub fn apply_groups(&mut self, fresh: Vec<Group>) -> bool {
        let (merged, changed) = merge_roster(&self.groups, fresh);
        self.groups = merged;
        let groups = &self.groups;
        self.members
            .retain(|group_id, _| groups.iter().any(|group| &group.id == group_id));
        changed
    }

    pub fn apply_group_members(&mut self, group_id: &str, fresh: Vec<GroupMember>) -> bool {
        let previous = self.members.remove(group_id).unwrap_or_default();
        let (merged, changed) = merge_roster(&previous, fresh);
        self.members.insert(group_id.to_string(), merged);
        changed
    }

    /// Applies a peer online/offline push to every place that user appears.
    pub fn set_presence(&mut self, user_id: &str, online: bool) -> bool {
        let mut changed = false;

        for friend in self.friends.iter_mut().filter(|friend| friend.id == user_id) {
            changed |= friend.is_online != Some(online);
            friend.is_online = Some(online);
        }

        for member in self
            .members
            .values_mut()
            .flat_map(|members| members.iter_mut())
            .filter(|member| member.id == user_id)
        {
            changed |= member.is_online != Some(online) || member.is_connected != Some(online);
            member.is_online = Some(online);
            member.is_connected = Some(online);
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::{merge_roster, Friend, Group, GroupMember, RosterState};

    fn friend(id: &str, is_online: Option<bool>) -> Friend {
        Friend {
            id: id.to_string(),
            display_name: format!("Friend {id}"),
            player_name: None,
            friend_code: None,
            is_online,
        }
    }

    fn member(id: &str, is_connected: Option<bool>) -> GroupMember {
        GroupMember {
            id: id.to_string(),
            display_name: format!("Member {id}"),
            player_name: None,
            role: None,
            is_online: None,
            is_connected,
        }
    }

    #[test]
    fn unspecified_presence_falls_back_to_previous() {
        let previous = vec![friend("a", Some(true)), friend("b", Some(true)), friend("gone", Some(true))];
        let fresh = vec![friend("a", None), friend("b", Some(false)), friend("new", None)];

        let (merged, changed) = merge_roster(&previous, fresh);

        assert!(changed);
        assert_eq!(merged.len(), 3, "Entries only in the old list are dropped");
        assert_eq!(merged[0].is_online, Some(true), "Unspecified presence carries over");
        assert_eq!(merged[1].is_online, Some(false), "Specified presence wins");
        assert_eq!(merged[2].is_online, None);
    }

    #[test]
    fn identical_roster_is_not_a_change() {
        let previous = vec![friend("a", Some(true))];
        let (_, changed) = merge_roster(&previous, vec![friend("a", None)]);
        assert!(!changed);

        let (_, renamed) = merge_roster(
            &previous,
            vec![Friend {
                display_name: "Renamed".to_string(),
                ..friend("a", None)
            }],
        );
        assert!(renamed);
    }

    #[test]
    fn presence_updates_friends_and_members() {
        let mut roster = RosterState::default();
        roster.apply_friends(vec![friend("u1", Some(false))]);
        roster.apply_groups(vec![Group {
            id: "g1".to_string(),
            name: "Squad".to_string(),
            owner_id: None,
            member_count: Some(1),
        }]);
        roster.apply_group_members("g1", vec![member("u1", Some(false))]);

        assert!(roster.set_presence("u1", true));
        assert_eq!(roster.friends()[0].is_online, Some(true));
        assert_eq!(roster.members("g1")[0].is_connected, Some(true));
        assert!(!roster.set_presence("u1", true), "Repeated push changes nothing");

        assert!(!roster.apply_group_members("g1", vec![member("u1", None)]));
        assert_eq!(roster.members("g1")[0].is_connected, Some(true));
    }

    #[test]
    fn dropping_a_group_forgets_its_members() {
        let mut roster = RosterState::default();
        roster.apply_groups(vec![Group {
            id: "g1".to_string(),
            name: "Squad".to_string(),
            owner_id: None,
            member_count: None,
        }]);
        roster.apply_group_members("g1", vec![member("u1", None)]);

        assert!(roster.apply_groups(Vec::new()));
        assert!(roster.members("g1").is_empty());
        assert!(roster.group_ids().is_empty());
    }
}
