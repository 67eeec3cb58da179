mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use mesh_call::error::MediaAccessKind;
use mesh_call::transport::TransportEvent;
use mesh_call::{
    MediaError, MeshConfig, MeshError, NegotiationState, PeerId, RemoteMediaEvent, Role, RoomId,
    SignalingMessage,
};

#[tokio::test]
async fn test_join_sends_join_with_default_devices() {
    let mut h = Harness::new();
    h.coordinator.join(RoomId::from(ROOM)).await.unwrap();

    assert!(h.coordinator.is_ready());
    assert_eq!(
        h.relay.sent(),
        vec![SignalingMessage::Join {
            room_id: RoomId::from(ROOM)
        }]
    );
    let selection = h.coordinator.media().selection().clone();
    assert_eq!(selection.video_input.as_deref(), Some("cam0"));
    assert_eq!(selection.audio_input.as_deref(), Some("mic0"));

    let stream = h.coordinator.media().current().unwrap();
    assert!(stream.has_video() && stream.has_audio());
}

#[tokio::test]
async fn test_roster_creates_one_initiator_per_existing_participant() {
    let mut h = Harness::joined().await;
    h.deliver(roster(&["A", "B"])).await;

    let peers = h.coordinator.roster();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers.count_by_role(Role::Initiator), 2);
    assert_eq!(peers.count_by_role(Role::Responder), 0);

    let mut targets = h.relay.offer_targets();
    targets.sort();
    assert_eq!(targets, vec!["A", "B"]);
    for msg in h.relay.sent() {
        if let SignalingMessage::Offer { sender_id, offer, .. } = msg {
            assert_eq!(sender_id.as_str(), LOCAL_ID);
            assert_eq!(offer, "offer-sdp");
        }
    }
    assert_eq!(h.state_of("A"), Some(NegotiationState::OfferSent));
    assert_eq!(h.state_of("B"), Some(NegotiationState::OfferSent));
}

#[tokio::test]
async fn test_roster_skips_local_id() {
    let mut h = Harness::joined().await;
    h.deliver(roster(&[LOCAL_ID, "A"])).await;

    assert_eq!(h.coordinator.roster().len(), 1);
    assert!(!h.coordinator.roster().contains(&PeerId::from(LOCAL_ID)));
    assert_eq!(h.relay.offer_targets(), vec!["A"]);
}

#[tokio::test]
async fn test_arrival_creates_responder_and_duplicate_is_ignored() {
    let mut h = Harness::joined().await;
    h.deliver(arrival("C")).await;

    assert_eq!(h.coordinator.roster().len(), 1);
    assert_eq!(h.coordinator.roster().count_by_role(Role::Responder), 1);
    assert_eq!(h.state_of("C"), Some(NegotiationState::AnswerSent));
    assert_eq!(h.relay.answer_targets(), vec!["C"]);

    h.deliver(arrival("C")).await;
    assert_eq!(h.coordinator.roster().len(), 1);
    assert_eq!(h.relay.answer_targets(), vec!["C"]);
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.factory.transport("C").answers.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_answer_completes_initiator_handshake() {
    let mut h = Harness::joined().await;
    h.deliver(roster(&["A"])).await;
    h.deliver(answer_delivery("A")).await;

    assert_eq!(h.state_of("A"), Some(NegotiationState::AnswerReceived));
    assert_eq!(h.factory.transport("A").applied_answers.load(Ordering::SeqCst), 1);

    h.emit("A", TransportEvent::Established).await;
    assert_eq!(h.state_of("A"), Some(NegotiationState::Connected));

    // Repeated answer for a finished handshake is stale
    h.deliver(answer_delivery("A")).await;
    assert_eq!(h.factory.transport("A").applied_answers.load(Ordering::SeqCst), 1);
    assert_eq!(h.state_of("A"), Some(NegotiationState::Connected));
}

#[tokio::test]
async fn test_early_transport_up_connects_on_answer() {
    let mut h = Harness::joined().await;
    h.deliver(roster(&["A"])).await;

    h.emit("A", TransportEvent::Established).await;
    assert_eq!(h.state_of("A"), Some(NegotiationState::OfferSent));

    h.deliver(answer_delivery("A")).await;
    assert_eq!(h.state_of("A"), Some(NegotiationState::Connected));
}

#[tokio::test]
async fn test_answer_for_unknown_peer_is_dropped() {
    let mut h = Harness::joined().await;
    h.deliver(answer_delivery("Z")).await;

    assert!(h.coordinator.roster().is_empty());
    assert!(h.relay.sent().is_empty());
}

#[tokio::test]
async fn test_departure_during_offer_releases_connection() {
    let mut h = Harness::joined().await;
    h.deliver(roster(&["A"])).await;
    assert_eq!(h.state_of("A"), Some(NegotiationState::OfferSent));
    let transport = h.factory.transport("A");

    h.deliver(departure("A")).await;
    assert!(h.coordinator.roster().is_empty());
    assert_eq!(transport.detached.load(Ordering::SeqCst), 1);
    assert_eq!(transport.closed.load(Ordering::SeqCst), 1);

    h.deliver(answer_delivery("A")).await;
    assert!(h.coordinator.roster().is_empty());
    assert_eq!(transport.applied_answers.load(Ordering::SeqCst), 0);

    // Unknown departure is a no-op
    h.deliver(departure("A")).await;
    assert!(h.coordinator.roster().is_empty());
}

#[tokio::test]
async fn test_messages_before_join_are_queued() {
    let mut h = Harness::new();
    h.deliver(roster(&["A"])).await;
    h.deliver(arrival("C")).await;

    assert_eq!(h.coordinator.pending_len(), 2);
    assert!(h.coordinator.roster().is_empty());
    assert!(h.relay.sent().is_empty());

    h.coordinator.join(RoomId::from(ROOM)).await.unwrap();
    h.coordinator.settle().await;

    assert_eq!(h.coordinator.pending_len(), 0);
    assert_eq!(h.relay.sent()[0].kind(), "join");
    assert_eq!(h.relay.offer_targets(), vec!["A"]);
    assert_eq!(h.relay.answer_targets(), vec!["C"]);
    assert_eq!(h.coordinator.roster().len(), 2);
}

#[tokio::test]
async fn test_device_switch_while_connected_replaces_track_only() {
    let mut h = Harness::joined().await;
    h.deliver(arrival("C")).await;
    h.emit("C", TransportEvent::Established).await;
    assert_eq!(h.state_of("C"), Some(NegotiationState::Connected));
    h.relay.clear();

    h.coordinator.switch_video_device("cam1").await.unwrap();

    let transport = h.factory.transport("C");
    let current = h.coordinator.media().current().unwrap();
    assert_eq!(h.state_of("C"), Some(NegotiationState::Connected));
    assert_eq!(transport.replaced.load(Ordering::SeqCst), 1);
    assert_eq!(transport.outbound.lock().as_deref(), Some(current.id()));
    assert_eq!(transport.offers.load(Ordering::SeqCst), 0);
    assert_eq!(transport.answers.load(Ordering::SeqCst), 1);

    assert_eq!(h.relay.count_kind("offer"), 0);
    assert_eq!(h.relay.count_kind("answer"), 0);
    assert_eq!(
        h.relay.sent(),
        vec![SignalingMessage::StreamUpdated {
            sender_id: Some(PeerId::from(LOCAL_ID))
        }]
    );
    assert_eq!(h.devices.live_streams(), 1);
}

#[tokio::test]
async fn test_switch_during_negotiation_is_applied_once_connected() {
    let mut h = Harness::joined().await;
    h.deliver(roster(&["A"])).await;
    let transport = h.factory.transport("A");
    let old_stream = transport.outbound.lock().clone();

    h.coordinator.switch_audio_input("mic0").await.unwrap();
    assert_eq!(transport.replaced.load(Ordering::SeqCst), 0);
    assert_eq!(transport.outbound.lock().clone(), old_stream);

    h.deliver(answer_delivery("A")).await;
    h.emit("A", TransportEvent::Established).await;

    let current = h.coordinator.media().current().unwrap();
    assert_eq!(h.state_of("A"), Some(NegotiationState::Connected));
    assert_eq!(transport.replaced.load(Ordering::SeqCst), 1);
    assert_eq!(transport.outbound.lock().as_deref(), Some(current.id()));
}

#[tokio::test]
async fn test_new_peer_gets_most_recent_stream() {
    let mut h = Harness::joined().await;
    h.coordinator.switch_video_device("cam1").await.unwrap();
    h.deliver(arrival("C")).await;

    let current = h.coordinator.media().current().unwrap();
    let transport = h.factory.transport("C");
    assert_eq!(transport.outbound.lock().as_deref(), Some(current.id()));
}

#[tokio::test]
async fn test_failed_switch_keeps_session() {
    let mut h = Harness::joined().await;
    h.deliver(arrival("C")).await;
    h.emit("C", TransportEvent::Established).await;

    let err = h.coordinator.switch_video_device("cam-busy").await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::Media(MediaError::MediaAccess {
            kind: MediaAccessKind::DeviceBusy,
            ..
        })
    ));

    assert!(h.coordinator.is_ready());
    assert_eq!(
        h.coordinator.media().selection().video_input.as_deref(),
        Some("cam0")
    );
    assert_eq!(h.devices.live_streams(), 1);
    assert_eq!(h.state_of("C"), Some(NegotiationState::Connected));

    // Peers follow the restored stream
    let current = h.coordinator.media().current().unwrap();
    let transport = h.factory.transport("C");
    assert_eq!(transport.outbound.lock().as_deref(), Some(current.id()));
}

#[tokio::test]
async fn test_room_traffic_waits_for_a_stream_after_failed_restore() {
    let mut h = Harness::joined().await;
    h.devices.fail_open.store(true, Ordering::SeqCst);

    assert!(h.coordinator.switch_video_device("cam1").await.is_err());
    assert!(h.coordinator.media().current().is_none());
    assert!(h.coordinator.is_ready());

    // Nothing to attach yet, so the arrival is held rather than dropped
    h.deliver(arrival("C")).await;
    assert_eq!(h.coordinator.pending_len(), 1);
    assert!(h.coordinator.roster().is_empty());
    assert!(h.relay.answer_targets().is_empty());

    h.devices.fail_open.store(false, Ordering::SeqCst);
    h.coordinator.switch_video_device("cam0").await.unwrap();
    h.coordinator.settle().await;

    assert_eq!(h.coordinator.pending_len(), 0);
    assert_eq!(h.relay.answer_targets(), vec!["C"]);
    assert_eq!(h.state_of("C"), Some(NegotiationState::AnswerSent));
    let current = h.coordinator.media().current().unwrap();
    assert_eq!(
        h.factory.transport("C").outbound.lock().as_deref(),
        Some(current.id())
    );
}

#[tokio::test]
async fn test_audio_output_failure_is_not_fatal() {
    let mut h = Harness::joined().await;
    h.coordinator.set_audio_output("spk0").await.unwrap();
    let err = h.coordinator.set_audio_output("hdmi").await.unwrap_err();
    assert!(matches!(err, MeshError::Media(MediaError::OutputRouting(_))));
    assert!(h.coordinator.is_ready());
    assert_eq!(
        h.coordinator.media().selection().audio_output.as_deref(),
        Some("spk0")
    );
}

#[tokio::test]
async fn test_negotiation_failure_is_isolated() {
    let mut h = Harness::joined().await;
    h.factory.fail_for("B");
    h.deliver(roster(&["A", "B"])).await;

    assert_eq!(h.coordinator.roster().len(), 1);
    assert_eq!(h.state_of("A"), Some(NegotiationState::OfferSent));
    assert_eq!(h.factory.transport("B").closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.offer_targets(), vec!["A"]);

    h.deliver(arrival("C")).await;
    h.emit("A", TransportEvent::Failed("ice disconnected".to_string()))
        .await;
    assert!(h.state_of("A").is_none());
    assert_eq!(h.state_of("C"), Some(NegotiationState::AnswerSent));
    assert!(h.coordinator.is_ready());
}

#[tokio::test]
async fn test_panicking_negotiation_fails_only_that_peer() {
    let mut h = Harness::joined().await;
    h.factory.panic_for("B");

    h.coordinator.handle_relay_message(roster(&["A", "B"])).await;
    tokio::time::timeout(Duration::from_secs(5), h.coordinator.settle())
        .await
        .expect("settle returns after a panicked negotiation");

    assert_eq!(h.coordinator.roster().len(), 1);
    assert_eq!(h.state_of("A"), Some(NegotiationState::OfferSent));
    assert!(h.state_of("B").is_none());
    assert_eq!(h.factory.transport("B").closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.offer_targets(), vec!["A"]);
    assert!(h.coordinator.is_ready());
}

#[tokio::test]
async fn test_transport_close_removes_peer() {
    let mut h = Harness::joined().await;
    h.deliver(arrival("C")).await;
    h.emit("C", TransportEvent::Established).await;
    h.emit("C", TransportEvent::Closed).await;

    assert!(h.coordinator.roster().is_empty());
    assert_eq!(h.factory.transport("C").closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stalled_negotiations_are_reaped() {
    let config = MeshConfig {
        negotiation_timeout_secs: 0,
        ..MeshConfig::default()
    };
    let mut h = Harness::with_config(config);
    h.coordinator.join(RoomId::from(ROOM)).await.unwrap();

    h.deliver(arrival("C")).await;
    h.emit("C", TransportEvent::Established).await;
    h.deliver(roster(&["A"])).await;

    h.coordinator.reap_stalled().await;

    assert!(h.state_of("A").is_none());
    assert_eq!(h.factory.transport("A").closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.state_of("C"), Some(NegotiationState::Connected));
}

#[tokio::test]
async fn test_leave_tears_down_everything() {
    let mut h = Harness::joined().await;
    h.deliver(roster(&["A"])).await;
    h.deliver(arrival("C")).await;
    h.emit("C", TransportEvent::Established).await;

    h.coordinator.leave().await.unwrap();

    assert!(h.coordinator.roster().is_empty());
    assert!(!h.coordinator.is_ready());
    assert!(h.coordinator.media().current().is_none());
    assert_eq!(h.devices.live_streams(), 0);
    for id in ["A", "C"] {
        let transport = h.factory.transport(id);
        assert_eq!(transport.detached.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }
    assert_eq!(h.relay.count_kind("leave"), 1);

    assert!(matches!(h.coordinator.leave().await, Err(MeshError::NotJoined)));

    // Not joined anymore, so room traffic waits again
    h.deliver(arrival("D")).await;
    assert!(h.coordinator.roster().is_empty());
    assert_eq!(h.coordinator.pending_len(), 1);
}

#[tokio::test]
async fn test_join_failure_allows_retry() {
    let mut h = Harness::new();
    h.devices.fail_open.store(true, Ordering::SeqCst);

    let err = h.coordinator.join(RoomId::from(ROOM)).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::JoinFailed(MediaError::MediaAccess {
            kind: MediaAccessKind::PermissionDenied,
            ..
        })
    ));
    assert!(!h.coordinator.is_ready());
    assert!(h.relay.sent().is_empty());

    h.devices.fail_open.store(false, Ordering::SeqCst);
    h.coordinator.join(RoomId::from(ROOM)).await.unwrap();
    assert!(h.coordinator.is_ready());

    let again = h.coordinator.join(RoomId::from(ROOM)).await;
    assert!(matches!(again, Err(MeshError::AlreadyJoined)));
}

#[tokio::test]
async fn test_roster_size_tracks_joins_and_departures() {
    let mut h = Harness::joined().await;
    for msg in [
        arrival("A"),
        arrival("B"),
        arrival("C"),
        arrival("B"),
        departure("A"),
        arrival("D"),
        departure("X"),
        roster(&["C", "E"]),
    ] {
        h.deliver(msg).await;
    }

    let ids: Vec<String> = h
        .coordinator
        .roster()
        .snapshot()
        .into_iter()
        .map(|p| p.remote_id.to_string())
        .collect();
    assert_eq!(ids, vec!["B", "C", "D", "E"]);
}

#[tokio::test]
async fn test_roster_snapshots_are_published() {
    let mut h = Harness::joined().await;
    let mut rx = h.coordinator.monitor().subscribe_roster();

    h.deliver(roster(&["B", "A"])).await;

    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.room, Some(RoomId::from(ROOM)));
    let ids: Vec<&str> = snapshot.peers.iter().map(|p| p.remote_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);
    assert_eq!(snapshot.state_of(&PeerId::from("A")), Some(NegotiationState::OfferSent));

    h.coordinator.leave().await.unwrap();
    assert_eq!(h.coordinator.monitor().roster().room, None);
    assert!(h.coordinator.monitor().roster().peers.is_empty());
}

#[tokio::test]
async fn test_remote_media_events() {
    let mut h = Harness::joined().await;
    let mut rx = h.coordinator.monitor().subscribe_media();

    h.deliver(arrival("C")).await;
    h.deliver(SignalingMessage::StreamUpdated {
        sender_id: Some(PeerId::from("C")),
    })
    .await;
    h.deliver(departure("C")).await;

    match rx.recv().await.unwrap() {
        RemoteMediaEvent::Refreshed { remote } => assert_eq!(remote, Some(PeerId::from("C"))),
        other => panic!("unexpected {other:?}"),
    }
    match rx.recv().await.unwrap() {
        RemoteMediaEvent::Removed { remote } => assert_eq!(remote.as_str(), "C"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_spawned_coordinator_round_trip() {
    let h = Harness::new();
    let inbound = h.inbound.clone();
    let relay = h.relay.clone();
    let (handle, task) = h.coordinator.spawn();

    let devices = handle.list_devices().await.unwrap();
    assert_eq!(devices.video_inputs.len(), 3);
    assert_eq!(devices.audio_outputs.len(), 1);

    handle.join(RoomId::from(ROOM)).await.unwrap();
    let mut rx = handle.subscribe_roster();
    inbound.send(roster(&["A"])).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.state_of(&PeerId::from("A")) == Some(NegotiationState::OfferSent)),
    )
    .await
    .expect("offer in time")
    .unwrap();
    assert_eq!(relay.offer_targets(), vec!["A"]);

    handle.switch_video("cam1").await.unwrap();
    handle.leave().await.unwrap();
    assert!(handle.roster().peers.is_empty());
    assert_eq!(relay.count_kind("leave"), 1);

    handle.shutdown().await;
    task.await.unwrap();
    assert!(matches!(
        handle.join(RoomId::from(ROOM)).await,
        Err(MeshError::Stopped)
    ));
}
