use super::*;
use crate::test_support::{sample_message, sample_room};
use shared::domain::OrganizationId;

fn seeded(room_id: RoomId) -> ChatSnapshot {
    reduce(&ChatSnapshot::default(), Action::SetActiveRoom(Some(room_id)))
}

#[test]
fn actions_for_unknown_rooms_leave_snapshot_unchanged() {
    let known = RoomId::new();
    let unknown = RoomId::new();
    let mut state = seeded(known);
    state = reduce(
        &state,
        Action::AppendMessage(sample_message(known, "kept")),
    );
    let before = state.clone();

    let actions = vec![
        Action::ReplaceMessages {
            room_id: unknown,
            messages: vec![sample_message(unknown, "x")],
        },
        Action::AppendMessage(sample_message(unknown, "x")),
        Action::UpdateMessage(sample_message(unknown, "x")),
        Action::RemoveMessage {
            room_id: unknown,
            message_id: MessageId::new(),
        },
        Action::RestoreMessage {
            index: 0,
            message: sample_message(unknown, "x"),
        },
        Action::MergeMessages {
            room_id: unknown,
            messages: vec![sample_message(unknown, "x")],
            position: MergePosition::Newer,
        },
        Action::AddTypingUser {
            room_id: unknown,
            user_id: UserId::new(),
        },
        Action::RemoveTypingUser {
            room_id: unknown,
            user_id: UserId::new(),
        },
        Action::SetUnreadCount {
            room_id: unknown,
            count: 4,
        },
        Action::SetMembers {
            room_id: unknown,
            members: Vec::new(),
        },
        Action::SetPagination {
            room_id: unknown,
            cursor: PaginationCursor {
                has_more: false,
                in_flight: true,
                oldest: None,
            },
        },
        Action::SetAttachments {
            message_id: MessageId::new(),
            attachments: Vec::new(),
        },
        Action::RemoveRoom(unknown),
    ];

    for action in actions {
        let name = action.name();
        state = reduce(&state, action);
        assert_eq!(state, before, "{name} must be a no-op for unknown rooms");
    }
}

#[test]
fn appending_n_messages_preserves_append_order() {
    let room_id = RoomId::new();
    let mut state = seeded(room_id);
    let messages: Vec<_> = (0..25)
        .map(|i| sample_message(room_id, &format!("message {i}")))
        .collect();
    for message in &messages {
        state = reduce(&state, Action::AppendMessage(message.clone()));
    }

    let stored = state.room_messages(room_id);
    assert_eq!(stored.len(), 25);
    let stored_ids: Vec<_> = stored.iter().map(|m| m.id).collect();
    let expected_ids: Vec<_> = messages.iter().map(|m| m.id).collect();
    assert_eq!(stored_ids, expected_ids);
}

#[test]
fn duplicate_append_replaces_in_place() {
    let room_id = RoomId::new();
    let mut state = seeded(room_id);
    let first = sample_message(room_id, "first");
    let mut pending = sample_message(room_id, "second");
    pending.pending = true;
    state = reduce(&state, Action::AppendMessage(first.clone()));
    state = reduce(&state, Action::AppendMessage(pending.clone()));

    let mut confirmed = pending.clone();
    confirmed.pending = false;
    state = reduce(&state, Action::AppendMessage(confirmed));
    state = reduce(&state, Action::AppendMessage(first.clone()));

    let stored = state.room_messages(room_id);
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].id, first.id);
    assert_eq!(stored[1].id, pending.id);
    assert!(!stored[1].pending);
}

#[test]
fn reduce_does_not_touch_its_input() {
    let room_id = RoomId::new();
    let state = seeded(room_id);
    let copy = state.clone();
    let next = reduce(&state, Action::AppendMessage(sample_message(room_id, "x")));
    assert_eq!(state, copy);
    assert_eq!(next.room_messages(room_id).len(), 1);
}

#[test]
fn switching_active_room_keeps_other_rooms_and_resets_cursor() {
    let first = RoomId::new();
    let second = RoomId::new();
    let mut state = seeded(first);
    state = reduce(&state, Action::AppendMessage(sample_message(first, "a")));
    state = reduce(
        &state,
        Action::SetPagination {
            room_id: first,
            cursor: PaginationCursor {
                has_more: false,
                in_flight: true,
                oldest: Some(Utc::now()),
            },
        },
    );

    state = reduce(&state, Action::SetActiveRoom(Some(second)));

    assert_eq!(state.active_room, Some(second));
    assert_eq!(state.room_messages(first).len(), 1);
    assert!(state.messages.contains_key(&second));
    assert!(state.room_messages(second).is_empty());
    assert_eq!(state.pagination, PaginationCursor::default());
}

#[test]
fn merge_older_prepends_only_unseen_messages() {
    let room_id = RoomId::new();
    let mut state = seeded(room_id);
    let m3 = sample_message(room_id, "m3");
    let m4 = sample_message(room_id, "m4");
    state = reduce(
        &state,
        Action::ReplaceMessages {
            room_id,
            messages: vec![m3.clone(), m4.clone()],
        },
    );
    let m1 = sample_message(room_id, "m1");
    let m2 = sample_message(room_id, "m2");
    state = reduce(
        &state,
        Action::MergeMessages {
            room_id,
            messages: vec![m1.clone(), m2.clone(), m3.clone()],
            position: MergePosition::Older,
        },
    );

    let ids: Vec<_> = state.room_messages(room_id).iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![m1.id, m2.id, m3.id, m4.id]);
}

#[test]
fn merge_newer_has_no_duplicate_ids() {
    let room_id = RoomId::new();
    let mut state = seeded(room_id);
    let m1 = sample_message(room_id, "m1");
    let m2 = sample_message(room_id, "m2");
    let m3 = sample_message(room_id, "m3");
    state = reduce(
        &state,
        Action::ReplaceMessages {
            room_id,
            messages: vec![m1.clone(), m2.clone()],
        },
    );
    state = reduce(
        &state,
        Action::MergeMessages {
            room_id,
            messages: vec![m1.clone(), m2.clone(), m3.clone(), m3.clone()],
            position: MergePosition::Newer,
        },
    );

    let ids: Vec<_> = state.room_messages(room_id).iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![m1.id, m2.id, m3.id]);
}

#[test]
fn local_user_never_enters_typing_set() {
    let room_id = RoomId::new();
    let me = UserId::new();
    let other = UserId::new();
    let mut state = seeded(room_id);
    state = reduce(&state, Action::SetLocalUser(me));
    state = reduce(&state, Action::AddTypingUser { room_id, user_id: me });
    state = reduce(
        &state,
        Action::AddTypingUser {
            room_id,
            user_id: other,
        },
    );

    let typers = state.typing.get(&room_id).expect("typing set");
    assert!(!typers.contains(&me));
    assert!(typers.contains(&other));

    state = reduce(
        &state,
        Action::RemoveTypingUser {
            room_id,
            user_id: other,
        },
    );
    assert!(!state.typing.contains_key(&room_id));
}

#[test]
fn removing_active_room_clears_its_state() {
    let org = OrganizationId::new();
    let room = sample_room(org);
    let mut state = reduce(&ChatSnapshot::default(), Action::UpsertRoom(room.clone()));
    state = reduce(&state, Action::SetActiveRoom(Some(room.id)));
    let message = sample_message(room.id, "bye");
    state = reduce(&state, Action::AppendMessage(message.clone()));
    state = reduce(
        &state,
        Action::SetMembers {
            room_id: room.id,
            members: Vec::new(),
        },
    );
    state = reduce(&state, Action::SetReplyTarget(Some(message.id)));
    assert_eq!(state.reply_target, Some(message.id));

    state = reduce(&state, Action::RemoveRoom(room.id));

    assert!(state.active_room.is_none());
    assert!(state.rooms.is_empty());
    assert!(!state.messages.contains_key(&room.id));
    assert!(!state.members.contains_key(&room.id));
    assert!(state.reply_target.is_none());
}

#[test]
fn restore_message_reinserts_at_original_index() {
    let room_id = RoomId::new();
    let mut state = seeded(room_id);
    let a = sample_message(room_id, "a");
    let b = sample_message(room_id, "b");
    let c = sample_message(room_id, "c");
    state = reduce(
        &state,
        Action::ReplaceMessages {
            room_id,
            messages: vec![a.clone(), b.clone(), c.clone()],
        },
    );
    state = reduce(
        &state,
        Action::RemoveMessage {
            room_id,
            message_id: b.id,
        },
    );
    state = reduce(
        &state,
        Action::RestoreMessage {
            index: 1,
            message: b.clone(),
        },
    );
    state = reduce(
        &state,
        Action::RestoreMessage {
            index: 0,
            message: b.clone(),
        },
    );

    let ids: Vec<_> = state.room_messages(room_id).iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![a.id, b.id, c.id]);
}

#[test]
fn reply_target_must_reference_a_loaded_message() {
    let room_id = RoomId::new();
    let mut state = seeded(room_id);
    state = reduce(&state, Action::SetReplyTarget(Some(MessageId::new())));
    assert!(state.reply_target.is_none());
}

#[tokio::test]
async fn begin_pagination_is_exclusive_until_cursor_is_released() {
    let store = StateStore::new();
    assert!(store.begin_pagination().is_none());

    let room_id = RoomId::new();
    store.dispatch(Action::SetActiveRoom(Some(room_id)));
    let mut rx = store.watch();

    let (started_room, oldest) = store.begin_pagination().expect("first call starts");
    assert_eq!(started_room, room_id);
    assert!(oldest.is_none());
    assert!(store.begin_pagination().is_none());
    assert!(rx.has_changed().expect("sender alive"));
    assert!(rx.borrow_and_update().pagination.in_flight);

    store.dispatch(Action::SetPagination {
        room_id,
        cursor: PaginationCursor {
            has_more: false,
            in_flight: false,
            oldest: None,
        },
    });
    assert!(store.begin_pagination().is_none());
}
