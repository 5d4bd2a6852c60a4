//! Stream and consumer-group routing.
//!
//! Stream keys and group names are the cross-service contract, so they are fixed strings.
//! Types that share a stream share ordering; types on different streams do not.

use crate::event::EventType;

/// Community stream.
pub const STREAM_COMMUNITY: &str = "cqrs:stream:community";
/// Task stream.
pub const STREAM_TASK: &str = "cqrs:stream:task";
/// Plan stream.
pub const STREAM_PLAN: &str = "cqrs:stream:plan";
/// Knowledge-graph stream.
pub const STREAM_GALAXY: &str = "cqrs:stream:galaxy";
/// Chat stream.
pub const STREAM_CHAT: &str = "cqrs:stream:chat";
/// User stream.
pub const STREAM_USER: &str = "cqrs:stream:user";
/// Push notification stream.
pub const STREAM_PUSH: &str = "cqrs:stream:push";
/// Fallback stream for unregistered types.
pub const STREAM_DEFAULT: &str = "cqrs:stream:default";
/// Dead-letter stream.
pub const STREAM_DLQ: &str = "cqrs:dlq";

/// Community projection group.
pub const GROUP_COMMUNITY: &str = "community_projection_group";
/// Task projection group.
pub const GROUP_TASK: &str = "task_projection_group";
/// Galaxy projection group.
pub const GROUP_GALAXY: &str = "galaxy_projection_group";
/// Group for every stream without a dedicated projection.
pub const GROUP_DEFAULT: &str = "default_projection_group";

/// Every event stream (the DLQ excluded).
pub const ALL_STREAMS: [&str; 8] = [
    STREAM_COMMUNITY,
    STREAM_TASK,
    STREAM_PLAN,
    STREAM_GALAXY,
    STREAM_CHAT,
    STREAM_USER,
    STREAM_PUSH,
    STREAM_DEFAULT,
];

/// Streams that feed a dedicated projection, paired with their group.
pub const PROJECTION_ROUTES: [(&str, &str); 3] = [
    (STREAM_COMMUNITY, GROUP_COMMUNITY),
    (STREAM_TASK, GROUP_TASK),
    (STREAM_GALAXY, GROUP_GALAXY),
];

fn known_stream(event_type: &EventType) -> Option<&'static str> {
    let stream = match event_type {
        EventType::PostCreated
        | EventType::PostUpdated
        | EventType::PostDeleted
        | EventType::PostLiked
        | EventType::PostUnliked => STREAM_COMMUNITY,
        EventType::TaskCreated
        | EventType::TaskUpdated
        | EventType::TaskStarted
        | EventType::TaskCompleted
        | EventType::TaskAbandoned
        | EventType::TaskDeleted => STREAM_TASK,
        EventType::PlanCreated
        | EventType::PlanUpdated
        | EventType::PlanCompleted
        | EventType::PlanDeleted => STREAM_PLAN,
        EventType::NodeCreated
        | EventType::NodeUnlocked
        | EventType::NodeExpanded
        | EventType::MasteryUpdated
        | EventType::RelationCreated
        | EventType::StudyRecorded => STREAM_GALAXY,
        EventType::ChatMessageSent
        | EventType::ChatMessageReceived
        | EventType::ChatSessionCreated
        | EventType::ChatSessionEnded => STREAM_CHAT,
        EventType::UserCreated
        | EventType::UserUpdated
        | EventType::UserDeleted
        | EventType::UserStatusChanged => STREAM_USER,
        EventType::PushScheduled
        | EventType::PushSent
        | EventType::PushDelivered
        | EventType::PushClicked => STREAM_PUSH,
        EventType::Other(_) => return None,
    };
    Some(stream)
}

/// Stream an event type is appended to.
///
/// Unregistered types fall back to [`STREAM_DEFAULT`] with a warning.
#[must_use]
pub fn stream_of(event_type: &EventType) -> &'static str {
    known_stream(event_type).unwrap_or_else(|| {
        tracing::warn!(
            event_type = %event_type,
            stream = STREAM_DEFAULT,
            "Unregistered event type routed to default stream"
        );
        STREAM_DEFAULT
    })
}

/// Consumer group that projects an event type.
///
/// Registered types without a dedicated projection use [`GROUP_DEFAULT`] silently;
/// unregistered types fall back to it with a warning.
#[must_use]
pub fn group_of(event_type: &EventType) -> &'static str {
    match known_stream(event_type) {
        Some(STREAM_COMMUNITY) => GROUP_COMMUNITY,
        Some(STREAM_TASK) => GROUP_TASK,
        Some(STREAM_GALAXY) => GROUP_GALAXY,
        Some(_) => GROUP_DEFAULT,
        None => {
            tracing::warn!(
                event_type = %event_type,
                group = GROUP_DEFAULT,
                "Unregistered event type routed to default group"
            );
            GROUP_DEFAULT
        }
    }
}

/// Consumer group for a stream key.
#[must_use]
pub fn group_for_stream(stream: &str) -> &'static str {
    PROJECTION_ROUTES
        .iter()
        .find(|(s, _)| *s == stream)
        .map_or(GROUP_DEFAULT, |(_, group)| *group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_types_route_to_their_stream() {
        assert_eq!(stream_of(&EventType::PostLiked), STREAM_COMMUNITY);
        assert_eq!(stream_of(&EventType::TaskAbandoned), STREAM_TASK);
        assert_eq!(stream_of(&EventType::PlanDeleted), STREAM_PLAN);
        assert_eq!(stream_of(&EventType::StudyRecorded), STREAM_GALAXY);
        assert_eq!(stream_of(&EventType::ChatSessionEnded), STREAM_CHAT);
        assert_eq!(stream_of(&EventType::UserStatusChanged), STREAM_USER);
        assert_eq!(stream_of(&EventType::PushClicked), STREAM_PUSH);
    }

    #[test]
    fn test_groups() {
        assert_eq!(group_of(&EventType::PostCreated), GROUP_COMMUNITY);
        assert_eq!(group_of(&EventType::TaskCreated), GROUP_TASK);
        assert_eq!(group_of(&EventType::NodeUnlocked), GROUP_GALAXY);
        assert_eq!(group_of(&EventType::PlanCreated), GROUP_DEFAULT);
        assert_eq!(group_of(&EventType::PushSent), GROUP_DEFAULT);
    }

    #[test]
    fn test_unknown_type_falls_back_to_default() {
        let unknown = EventType::parse("billing.invoice.paid");
        assert_eq!(stream_of(&unknown), STREAM_DEFAULT);
        assert_eq!(group_of(&unknown), GROUP_DEFAULT);
    }

    #[test]
    fn test_every_known_type_has_a_real_stream() {
        for event_type in EventType::KNOWN {
            assert_ne!(stream_of(&event_type), STREAM_DEFAULT, "{event_type}");
        }
    }

    #[test]
    fn test_group_for_stream() {
        assert_eq!(group_for_stream(STREAM_TASK), GROUP_TASK);
        assert_eq!(group_for_stream(STREAM_CHAT), GROUP_DEFAULT);
    }
}
