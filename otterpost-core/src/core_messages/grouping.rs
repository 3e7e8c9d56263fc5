//! Visual grouping of consecutive messages

use super::store::TimelineItem;
use crate::model::InboxId;
use std::time::Duration;

/// Default gap after which a new group starts
pub const DEFAULT_GROUP_GAP: Duration = Duration::from_secs(5 * 60);

/// Run of consecutive items rendered under one sender header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageGroup {
    pub sender_inbox_id: InboxId,
    pub is_system: bool,
    pub items: Vec<TimelineItem>,
}

/// Whether `next` continues the group whose last item is `prev`
pub fn continues_group(prev: &TimelineItem, next: &TimelineItem, gap: Duration) -> bool {
    let gap_ns = gap.as_nanos().min(u64::MAX as u128) as u64;
    prev.sender_inbox_id == next.sender_inbox_id
        && !prev.is_system
        && !next.is_system
        && next.sent_at_ns.saturating_sub(prev.sent_at_ns) < gap_ns
}

/// Group an ascending timeline
pub fn group_messages(timeline: &[TimelineItem], gap: Duration) -> Vec<MessageGroup> {
    let mut groups: Vec<MessageGroup> = Vec::new();
    for item in timeline {
        let joins = groups
            .last()
            .and_then(|g| g.items.last())
            .is_some_and(|prev| continues_group(prev, item, gap));
        match groups.last_mut() {
            Some(group) if joins => group.items.push(item.clone()),
            _ => groups.push(MessageGroup {
                sender_inbox_id: item.sender_inbox_id.clone(),
                is_system: item.is_system,
                items: vec![item.clone()],
            }),
        }
    }
    groups
}
