use super::*;
use crate::state::test_helpers;
use serde_json::json;

fn request(kind: &str, payload: serde_json::Value) -> Event {
    let data = match payload {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        serde_json::Value::Null => Data::new(),
        _ => panic!("test payload must be an object"),
    };
    Event::new(kind, data)
}

fn new_connection() -> (Connection, mpsc::Receiver<Event>) {
    let conn_id = ConnId::new();
    let (tx, rx) = mpsc::channel(32);
    (Connection::new(conn_id, tx), rx)
}

async fn join_deck(
    state: &AppState,
    conn: &mut Connection,
    presentation_id: Uuid,
    nickname: &str,
) -> Event {
    let req = request("join", json!({ "nickname": nickname })).with_presentation_id(presentation_id);
    let mut replies = process_event(state, conn, req).await;
    assert_eq!(replies.len(), 1);
    let reply = replies.remove(0);
    assert_eq!(reply.kind, "joined", "unexpected reply: {:?}", reply.data);
    reply
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn join_reply_carries_snapshot_session_and_roster() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");
    store.seed_slide(presentation_id);
    store.seed_slide(presentation_id);
    let (mut conn, _rx) = new_connection();

    let req = request("join", json!({ "nickname": "ada", "role": "owner" }))
        .with_presentation_id(presentation_id);
    let req_id = req.id;
    let replies = process_event(&state, &mut conn, req).await;

    let reply = &replies[0];
    assert_eq!(reply.kind, "joined");
    assert_eq!(reply.parent_id, Some(req_id));
    assert_eq!(reply.presentation_id, Some(presentation_id));
    assert_eq!(reply.data["slides"].as_array().map(Vec::len), Some(2));
    assert_eq!(reply.data["session"]["nickname"].as_str(), Some("ada"));
    assert_eq!(reply.data["session"]["role"].as_str(), Some("owner"));
    assert_eq!(reply.data["members"].as_array().map(Vec::len), Some(1));
    assert!(conn.joined().is_some());
}

#[tokio::test]
async fn join_accepts_presentation_id_from_payload() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");
    let (mut conn, _rx) = new_connection();

    let req = request(
        "join",
        json!({ "nickname": "ada", "presentation_id": presentation_id.to_string() }),
    );
    let replies = process_event(&state, &mut conn, req).await;
    assert_eq!(replies[0].kind, "joined");
}

#[tokio::test]
async fn join_validates_required_fields() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");
    let (mut conn, _rx) = new_connection();

    let replies = process_event(&state, &mut conn, request("join", json!({ "nickname": "ada" }))).await;
    assert_eq!(replies[0].kind, KIND_ERROR);

    let req = request("join", json!({})).with_presentation_id(presentation_id);
    let replies = process_event(&state, &mut conn, req).await;
    assert_eq!(replies[0].kind, KIND_ERROR);
    assert!(conn.joined().is_none(), "failed joins must not bind");
}

#[tokio::test]
async fn join_unknown_presentation_returns_scoped_error() {
    let (state, _store) = test_helpers::test_app_state();
    let (mut conn, _rx) = new_connection();

    let req = request("join", json!({ "nickname": "ada" })).with_presentation_id(Uuid::new_v4());
    let req_id = req.id;
    let replies = process_event(&state, &mut conn, req).await;

    let err = &replies[0];
    assert_eq!(err.kind, KIND_ERROR);
    assert_eq!(err.parent_id, Some(req_id));
    assert_eq!(err.data["code"].as_str(), Some("E_PRESENTATION_NOT_FOUND"));
    assert_eq!(err.data["retryable"].as_bool(), Some(false));
}

#[tokio::test]
async fn join_announces_member_joined_to_peers_only() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");

    let (mut conn_a, mut rx_a) = new_connection();
    join_deck(&state, &mut conn_a, presentation_id, "ada").await;

    let (mut conn_b, mut rx_b) = new_connection();
    join_deck(&state, &mut conn_b, presentation_id, "grace").await;

    let notices = drain(&mut rx_a);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, "member-joined");
    assert_eq!(notices[0].data["session"]["nickname"].as_str(), Some("grace"));
    assert!(notices[0].parent_id.is_none(), "notices carry no request correlation");
    assert!(drain(&mut rx_b).is_empty(), "joiner gets the reply, not the notice");
}

// =============================================================================
// DECK ACTIONS
// =============================================================================

#[tokio::test]
async fn action_replies_applied_and_fans_out_a_peer_copy() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");

    let (mut conn_a, _rx_a) = new_connection();
    let (mut conn_b, mut rx_b) = new_connection();
    join_deck(&state, &mut conn_a, presentation_id, "ada").await;
    join_deck(&state, &mut conn_b, presentation_id, "grace").await;

    let req = request("add-slide", json!({}));
    let req_id = req.id;
    let replies = process_event(&state, &mut conn_a, req).await;

    let reply = &replies[0];
    assert_eq!(reply.kind, "add-slide-applied");
    assert_eq!(reply.parent_id, Some(req_id));
    assert!(reply.data["slide"]["id"].as_str().is_some());

    let peer = drain(&mut rx_b).pop().expect("peer copy delivered");
    assert_eq!(peer.kind, "add-slide-applied");
    assert!(peer.parent_id.is_none());
    assert_ne!(peer.id, reply.id);
    assert_eq!(peer.data["slide"]["id"], reply.data["slide"]["id"]);
}

#[tokio::test]
async fn action_before_join_is_refused() {
    let (state, _store) = test_helpers::test_app_state();
    let (mut conn, _rx) = new_connection();

    let replies = process_event(&state, &mut conn, request("add-slide", json!({}))).await;
    assert_eq!(replies[0].kind, KIND_ERROR);
}

#[tokio::test]
async fn malformed_action_payload_errors_to_sender_only() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");

    let (mut conn_a, _rx_a) = new_connection();
    let (mut conn_b, mut rx_b) = new_connection();
    join_deck(&state, &mut conn_a, presentation_id, "ada").await;
    join_deck(&state, &mut conn_b, presentation_id, "grace").await;
    drain(&mut rx_b);

    // remove-slide without a slide_id.
    let replies = process_event(&state, &mut conn_a, request("remove-slide", json!({}))).await;
    assert_eq!(replies[0].kind, KIND_ERROR);
    assert!(drain(&mut rx_b).is_empty(), "errors are never broadcast");
}

#[tokio::test]
async fn store_outage_during_action_is_retryable_and_not_broadcast() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");

    let (mut conn_a, _rx_a) = new_connection();
    let (mut conn_b, mut rx_b) = new_connection();
    join_deck(&state, &mut conn_a, presentation_id, "ada").await;
    join_deck(&state, &mut conn_b, presentation_id, "grace").await;
    drain(&mut rx_b);

    store.set_unavailable(true);
    let replies = process_event(&state, &mut conn_a, request("add-slide", json!({}))).await;

    let err = &replies[0];
    assert_eq!(err.kind, KIND_ERROR);
    assert_eq!(err.data["code"].as_str(), Some("E_STORE_UNAVAILABLE"));
    assert_eq!(err.data["retryable"].as_bool(), Some(true));
    assert!(drain(&mut rx_b).is_empty(), "nothing commits, nothing fans out");
}

#[tokio::test]
async fn unknown_kind_is_an_error() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");
    let (mut conn, _rx) = new_connection();
    join_deck(&state, &mut conn, presentation_id, "ada").await;

    let replies = process_event(&state, &mut conn, request("cursor-wiggle", json!({}))).await;
    assert_eq!(replies[0].kind, KIND_ERROR);
    assert!(
        replies[0].data["message"]
            .as_str()
            .is_some_and(|m| m.contains("cursor-wiggle"))
    );
}

// =============================================================================
// LEAVE
// =============================================================================

#[tokio::test]
async fn leave_replies_left_and_notifies_peers() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");

    let (mut conn_a, mut rx_a) = new_connection();
    let (mut conn_b, mut rx_b) = new_connection();
    let joined = join_deck(&state, &mut conn_a, presentation_id, "ada").await;
    join_deck(&state, &mut conn_b, presentation_id, "grace").await;
    drain(&mut rx_a);

    let replies = process_event(&state, &mut conn_a, request("leave", json!({}))).await;
    assert_eq!(replies[0].kind, "left");
    assert_eq!(conn_a.phase, Phase::Closed);

    let notice = drain(&mut rx_b).pop().expect("member-left delivered");
    assert_eq!(notice.kind, "member-left");
    assert_eq!(
        notice.data["session_id"].as_str(),
        joined.data["session"]["session_id"].as_str()
    );
}

#[tokio::test]
async fn leave_without_joining_is_an_error() {
    let (state, _store) = test_helpers::test_app_state();
    let (mut conn, _rx) = new_connection();

    let replies = process_event(&state, &mut conn, request("leave", json!({}))).await;
    assert_eq!(replies[0].kind, KIND_ERROR);
    assert_eq!(replies[0].data["code"].as_str(), Some("E_NOT_JOINED"));
}

// =============================================================================
// RAW TEXT
// =============================================================================

#[tokio::test]
async fn invalid_json_produces_an_error_event() {
    let (state, _store) = test_helpers::test_app_state();
    let (mut conn, _rx) = new_connection();

    let replies = process_event_text(&state, &mut conn, "{not json").await;
    assert_eq!(replies[0].kind, KIND_ERROR);
    assert!(
        replies[0].data["message"]
            .as_str()
            .is_some_and(|m| m.contains("invalid json"))
    );
}

#[tokio::test]
async fn rejoin_over_new_connection_displaces_the_old_socket() {
    let (state, store) = test_helpers::test_app_state();
    let presentation_id = store.seed_presentation("Deck");

    let (mut conn_old, mut rx_old) = new_connection();
    join_deck(&state, &mut conn_old, presentation_id, "ada").await;

    let (mut conn_new, _rx_new) = new_connection();
    join_deck(&state, &mut conn_new, presentation_id, "ada").await;

    let events = drain(&mut rx_old);
    assert!(
        events.iter().any(|e| e.kind == "session-replaced"),
        "old socket must learn it was displaced, got {:?}",
        events.iter().map(|e| e.kind.clone()).collect::<Vec<_>>()
    );

    let presence = state.presence.read().await;
    assert_eq!(presence.members_of(presentation_id), vec![conn_new.conn_id]);
    assert!(presence.is_consistent());
}
