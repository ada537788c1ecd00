use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use update_engine::audit::AuditEventType;
use update_engine::config::{EcuConfig, EcuRole};
use update_engine::crypto::EcuKey;
use update_engine::director::Director;
use update_engine::error::UpdateError;
use update_engine::manifest::Signable;
use update_engine::orchestrator::{PrimaryEcu, SecondaryEcu, SecondaryState};
use update_engine::registry::RegistrationPolicy;
use update_engine::repository::MemoryRepository;
use update_engine::rpc::{
    FaultKind, PayloadKind, RelayPayload, RpcRequest, RpcResponse, Transport, call_expecting_ack,
};
use update_engine::timeserver::{LocalTimeServer, TimeServer, build_time_request};
use update_engine::types::{EcuSerial, FileInfo, Nonce, TargetInfo};
use update_server::{
    DirectorService, InProcessTransport, PrimaryService, RpcListener, SecondaryService,
    StartOutcome, TcpTransport, frame_codec,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn any_port() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

struct Network {
    _dir: TempDir,
    director: Arc<Director>,
    primary: Arc<PrimaryEcu>,
    secondary: Arc<SecondaryEcu>,
    director_listener: RpcListener,
    primary_listener: RpcListener,
    secondary_listener: RpcListener,
    to_director: TcpTransport,
    to_primary: TcpTransport,
    to_secondary: TcpTransport,
}

async fn network() -> Network {
    let dir = tempfile::tempdir().unwrap();
    let director_repo = Arc::new(MemoryRepository::new("director"));
    let image_repo = Arc::new(MemoryRepository::new("imagerepo"));
    let timeserver = LocalTimeServer::new(EcuKey::generate());
    let timeserver_key = timeserver.public_key();

    let director = Arc::new(Director::new(RegistrationPolicy::FirstWins));

    let mut primary_config = EcuConfig::defaults(EcuRole::Primary);
    primary_config.client_dir = dir.path().join("primary");
    let primary = Arc::new(PrimaryEcu::new(
        primary_config,
        EcuKey::generate(),
        director_repo.clone(),
        image_repo.clone(),
        Arc::new(timeserver),
    ));

    let mut secondary_config = EcuConfig::defaults(EcuRole::Secondary);
    secondary_config.client_dir = dir.path().join("secondary");
    let secondary = Arc::new(SecondaryEcu::new(
        secondary_config,
        EcuKey::generate(),
        timeserver_key,
        director_repo,
        image_repo,
        TargetInfo::new("/secondary_firmware.txt", FileInfo::from_bytes(b"factory firmware")),
    ));

    let director_listener = RpcListener::new(any_port(), Arc::new(DirectorService::new(director.clone())));
    let primary_listener = RpcListener::new(any_port(), Arc::new(PrimaryService::new(primary.clone())));
    let secondary_listener = RpcListener::new(any_port(), Arc::new(SecondaryService::new(secondary.clone())));

    let to_director = TcpTransport::new(director_listener.start().await.unwrap().local_addr(), TIMEOUT);
    let to_primary = TcpTransport::new(primary_listener.start().await.unwrap().local_addr(), TIMEOUT);
    let to_secondary = TcpTransport::new(secondary_listener.start().await.unwrap().local_addr(), TIMEOUT);

    Network {
        _dir: dir,
        director,
        primary,
        secondary,
        director_listener,
        primary_listener,
        secondary_listener,
        to_director,
        to_primary,
        to_secondary,
    }
}

#[tokio::test]
async fn test_manifest_chain_over_tcp() {
    let net = network().await;

    net.primary.register_with_director(&net.to_director).await.unwrap();
    net.secondary.clean_slate(&net.to_primary, &net.to_director).await.unwrap();
    net.secondary.update_time(&net.to_primary).await.unwrap();
    net.secondary.generate_and_submit(&net.to_primary).await.unwrap();
    assert_eq!(net.secondary.state().await, SecondaryState::Submitted);

    net.primary.generate_signed_vehicle_manifest().await.unwrap();
    net.primary.submit_vehicle_manifest(&net.to_director).await.unwrap();

    let stored = net.director.latest_vehicle_manifest(net.primary.vin()).unwrap().unwrap();
    assert_eq!(stored.signed.ecu_manifest_count(), 1);
    assert!(stored.signed.ecu_version_manifests.contains_key(net.secondary.serial()));
}

#[tokio::test]
async fn test_tampered_manifest_is_a_distinguishable_fault() {
    let net = network().await;
    net.secondary.clean_slate(&net.to_primary, &net.to_director).await.unwrap();
    net.secondary.update_time(&net.to_primary).await.unwrap();
    let manifest = net.secondary.generate_signed_ecu_manifest().await.unwrap();

    let mut tampered = manifest.to_value().unwrap();
    tampered["signed"]["attacks_detected"] = "Everything is great, I PROMISE!".into();

    let response = net
        .to_primary
        .call(RpcRequest::SubmitEcuManifest {
            vin: net.primary.vin().clone(),
            serial: net.secondary.serial().clone(),
            nonce: manifest.signed.nonce,
            signed_manifest: tampered,
        })
        .await
        .unwrap();
    match response {
        RpcResponse::Fault(fault) => assert_eq!(fault.kind, FaultKind::Signature),
        other => panic!("expected a signature fault, got {other:?}"),
    }
    assert_eq!(net.primary.audit().count(AuditEventType::ManifestRejected), 1);

    // The legitimate manifest still goes through under the same nonce.
    net.secondary.submit_ecu_manifest(&net.to_primary).await.unwrap();
}

#[tokio::test]
async fn test_wrong_key_manifest_is_rejected_over_tcp() {
    let net = network().await;
    net.secondary.clean_slate(&net.to_primary, &net.to_director).await.unwrap();
    net.secondary.update_time(&net.to_primary).await.unwrap();
    let mut body = net.secondary.generate_signed_ecu_manifest().await.unwrap().signed;
    body.installed_image = TargetInfo::new("/secondary_firmware.txt", FileInfo::from_bytes(b"evil"));
    let forged = Signable::sign(body, &EcuKey::generate()).unwrap();

    let err = net
        .secondary
        .submit_signed_manifest(&net.to_primary, forged.to_value().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::Signature(_)));
    assert_eq!(net.secondary.state().await, SecondaryState::ManifestReady);
}

#[tokio::test]
async fn test_identity_conflict_reaches_caller() {
    let net = network().await;
    net.secondary.clean_slate(&net.to_primary, &net.to_director).await.unwrap();

    let err = call_expecting_ack(
        &net.to_director,
        RpcRequest::RegisterEcuSerial {
            serial: net.secondary.serial().clone(),
            public_key: EcuKey::generate().public_key(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, UpdateError::IdentityConflict(_)));
}

#[tokio::test]
async fn test_forged_time_request_is_refused_over_tcp() {
    let net = network().await;
    net.secondary.clean_slate(&net.to_primary, &net.to_director).await.unwrap();
    net.secondary.update_time(&net.to_primary).await.unwrap();
    net.secondary.generate_signed_ecu_manifest().await.unwrap();

    let forged = build_time_request(net.secondary.serial(), Nonce(424242), &EcuKey::generate()).unwrap();
    let response = net
        .to_primary
        .call(RpcRequest::RequestTimeAttestation {
            serial: net.secondary.serial().clone(),
            signed_request: forged.to_value().unwrap(),
        })
        .await
        .unwrap();
    match response {
        RpcResponse::Fault(fault) => assert_eq!(fault.kind, FaultKind::Signature),
        other => panic!("expected a signature fault, got {other:?}"),
    }

    net.secondary.submit_ecu_manifest(&net.to_primary).await.unwrap();
    assert_eq!(net.primary.pending_ecu_manifests().await, 1);
}

#[tokio::test]
async fn test_roles_expose_only_their_operations() {
    let net = network().await;
    let payload = RelayPayload {
        kind: PayloadKind::Metadata,
        filepath: "director/root.json".into(),
        content: b"{}".to_vec(),
    };

    let err = call_expecting_ack(&net.to_director, RpcRequest::RelayFromPrimary { payload: payload.clone() })
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::Transport(_)));

    let response = net
        .to_secondary
        .call(RpcRequest::RegisterNewSecondary {
            serial: EcuSerial::from("33333"),
            public_key: None,
        })
        .await
        .unwrap();
    assert!(matches!(response, RpcResponse::Fault(ref fault) if fault.kind == FaultKind::Unsupported));

    call_expecting_ack(&net.to_secondary, RpcRequest::RelayFromPrimary { payload: payload.clone() })
        .await
        .unwrap();
    assert_eq!(net.secondary.inbox().unwrap(), vec![payload]);
}

#[tokio::test]
async fn test_primary_relays_image_to_secondary() {
    let net = network().await;
    net.secondary.clean_slate(&net.to_primary, &net.to_director).await.unwrap();
    let payload = RelayPayload {
        kind: PayloadKind::Image,
        filepath: "/secondary_firmware.txt".into(),
        content: vec![0, 159, 146, 150, 255],
    };

    net.primary
        .relay_to_secondary(net.secondary.serial(), &net.to_secondary, payload.clone())
        .await
        .unwrap();
    assert_eq!(net.secondary.inbox().unwrap(), vec![payload]);
}

#[tokio::test]
async fn test_malformed_frame_gets_schema_fault() {
    let net = network().await;
    let stream = TcpStream::connect(net.to_primary.addr()).await.unwrap();
    let mut framed = Framed::new(stream, frame_codec());

    framed.send(Bytes::from_static(b"{\"method\":\"format_disk\"}")).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let response: RpcResponse = serde_json::from_slice(&frame).unwrap();
    assert!(matches!(response, RpcResponse::Fault(ref fault) if fault.kind == FaultKind::Schema));
}

#[tokio::test]
async fn test_second_start_is_benign_and_stop_is_explicit() {
    let net = network().await;
    let addr = net.primary_listener.local_addr().await.unwrap();

    assert_eq!(net.primary_listener.start().await.unwrap(), StartOutcome::AlreadyRunning(addr));
    assert!(net.primary_listener.is_running().await);

    assert!(net.primary_listener.stop().await);
    assert!(!net.primary_listener.is_running().await);
    assert!(!net.primary_listener.stop().await);

    let err = net
        .to_primary
        .call(RpcRequest::RegisterNewSecondary {
            serial: EcuSerial::from("33333"),
            public_key: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::Transport(_)));

    assert!(net.director_listener.stop().await);
    assert!(net.secondary_listener.stop().await);
}

#[tokio::test]
async fn test_unresponsive_peer_times_out_without_rotating_nonce() {
    let net = network().await;
    net.secondary.clean_slate(&net.to_primary, &net.to_director).await.unwrap();
    net.secondary.update_time(&net.to_primary).await.unwrap();
    net.secondary.generate_signed_ecu_manifest().await.unwrap();
    let before = net.secondary.nonce_pair().await;

    // Accepts connections but never answers.
    let silent = TcpListener::bind(any_port()).await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let _hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let slow = TcpTransport::new(silent_addr, Duration::from_millis(200));
    let err = net.secondary.submit_ecu_manifest(&slow).await.unwrap_err();
    assert!(matches!(err, UpdateError::Timeout(_)));
    assert_eq!(net.secondary.nonce_pair().await, before);

    net.secondary.submit_ecu_manifest(&net.to_primary).await.unwrap();
}

#[tokio::test]
async fn test_in_process_transport_matches_wire_behaviour() {
    let director = Arc::new(Director::new(RegistrationPolicy::FirstWins));
    let transport = InProcessTransport::new(Arc::new(DirectorService::new(director.clone())));
    let key = EcuKey::generate().public_key();

    call_expecting_ack(
        &transport,
        RpcRequest::RegisterEcuSerial {
            serial: EcuSerial::from("11111"),
            public_key: key,
        },
    )
    .await
    .unwrap();
    assert_eq!(director.registry().public_key(&EcuSerial::from("11111")).unwrap(), key);

    let err = call_expecting_ack(
        &transport,
        RpcRequest::SubmitVehicleManifest {
            vin: "111".into(),
            serial: EcuSerial::from("11111"),
            signed_manifest: serde_json::json!({"signed": {}, "signatures": []}),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, UpdateError::Schema(_)));
}
