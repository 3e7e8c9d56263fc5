//! Human-readable text for group membership and administration events
//!
//! One line per event, chosen by priority: members added, removed, left,
//! admins added, admins removed, then a generic fallback.

use crate::model::{InboxId, SystemEvent};

/// Names listed before collapsing into "and N others"
const MAX_LISTED: usize = 3;

fn actor(event: &SystemEvent) -> String {
    event
        .initiated_by
        .as_ref()
        .map(InboxId::short)
        .unwrap_or_else(|| "Someone".to_string())
}

fn list(ids: &[InboxId]) -> String {
    let names: Vec<String> = ids.iter().map(InboxId::short).collect();
    match names.len() {
        0 => String::new(),
        1 => names[0].clone(),
        n if n <= MAX_LISTED => {
            format!("{} and {}", names[..n - 1].join(", "), names[n - 1])
        }
        n => format!("{} and {} others", names[..MAX_LISTED - 1].join(", "), n - (MAX_LISTED - 1)),
    }
}

pub fn describe(event: &SystemEvent) -> String {
    if !event.added.is_empty() {
        format!("{} added {}", actor(event), list(&event.added))
    } else if !event.removed.is_empty() {
        format!("{} removed {}", actor(event), list(&event.removed))
    } else if !event.left.is_empty() {
        format!("{} left the group", list(&event.left))
    } else if !event.admins_added.is_empty() {
        format!("{} made {} an admin", actor(event), list(&event.admins_added))
    } else if !event.admins_removed.is_empty() {
        format!("{} removed {} as admin", actor(event), list(&event.admins_removed))
    } else if let Some((_, name)) = event.metadata_changes.iter().find(|(field, _)| field == "group_name") {
        format!("{} renamed the group to \"{}\"", actor(event), name)
    } else if !event.metadata_changes.is_empty() {
        "Group details updated".to_string()
    } else {
        "Group updated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<InboxId> {
        names.iter().map(|n| InboxId::new(*n)).collect()
    }

    #[test]
    fn test_added_takes_priority() {
        let event = SystemEvent {
            initiated_by: Some(InboxId::new("alice")),
            added: ids(&["bob"]),
            removed: ids(&["carol"]),
            left: ids(&["dave"]),
            ..Default::default()
        };
        assert_eq!(describe(&event), "alice added bob");
    }

    #[test]
    fn test_priority_order() {
        let event = SystemEvent {
            left: ids(&["dave"]),
            admins_added: ids(&["erin"]),
            ..Default::default()
        };
        assert_eq!(describe(&event), "dave left the group");

        let event = SystemEvent { admins_removed: ids(&["erin"]), ..Default::default() };
        assert_eq!(describe(&event), "Someone removed erin as admin");
    }

    #[test]
    fn test_long_names_are_shortened_and_lists_collapse() {
        let event = SystemEvent {
            initiated_by: Some(InboxId::new("0123456789abcdef")),
            removed: ids(&["a", "b", "c", "d", "e"]),
            ..Default::default()
        };
        assert_eq!(describe(&event), "012345…cdef removed a, b and 3 others");

        let event = SystemEvent { added: ids(&["a", "b", "c"]), ..Default::default() };
        assert_eq!(describe(&event), "Someone added a, b and c");
    }

    #[test]
    fn test_fallbacks() {
        let renamed = SystemEvent {
            metadata_changes: vec![("group_name".to_string(), "crew".to_string())],
            ..Default::default()
        };
        assert_eq!(describe(&renamed), "Someone renamed the group to \"crew\"");

        let other = SystemEvent {
            metadata_changes: vec![("description".to_string(), "x".to_string())],
            ..Default::default()
        };
        assert_eq!(describe(&other), "Group details updated");
        assert_eq!(describe(&SystemEvent::default()), "Group updated");
    }
}
