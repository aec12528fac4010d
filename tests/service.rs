mod common;

use std::sync::atomic::Ordering;

use base64::{engine::general_purpose::STANDARD, Engine};
use common::{BrokenKeys, Fixture};
use uuid::Uuid;
use vpn_control::{
    allocator::{AllocError, Pool},
    keys::KeyError,
    reconcile::{ReconcileError, ReconcileState},
    render::RenderError,
    service::{NewPeer, PeerRequest, ServiceError},
    traits::PeerStore,
};

fn request(owner: &str, name: &str) -> PeerRequest {
    PeerRequest {
        owner: owner.to_owned(),
        name: name.to_owned(),
        ..Default::default()
    }
}

#[tokio::test]
async fn allocates_from_pool_start_and_reloads() {
    let fx = Fixture::new().await;
    let controller = fx.controller();

    let first = controller.create_peer(request("alice", "laptop")).await.unwrap();
    assert_eq!(first.peer.address.to_string(), "10.99.0.100/32");
    assert!(first.reconciled.changed);
    assert_eq!(first.reconciled.peers, 1);

    let client = first.client_config.unwrap();
    assert!(client.starts_with("[Interface]\nPrivateKey = "));
    assert!(client.contains("Address = 10.99.0.100/32\n"));
    assert!(client.contains("DNS = 1.1.1.1\n"));
    assert!(client.contains("PublicKey = server-public\n"));

    let second = controller.create_peer(request("alice", "phone")).await.unwrap();
    assert_eq!(second.peer.address.to_string(), "10.99.0.101/32");

    let config = fx.config();
    assert!(config.contains(&format!(
        "[Peer]\nPublicKey = {}\nAllowedIPs = 10.99.0.100/32\n",
        first.peer.public_key
    )));
    assert!(config.contains("AllowedIPs = 10.99.0.101/32\n"));
    assert_eq!(controller.state().await, ReconcileState::Applied);

    let up = format!("up wg0 {}", fx.config_path().display());
    assert_eq!(
        fx.control.calls(),
        vec!["down wg0".to_owned(), up.clone(), "down wg0".to_owned(), up]
    );
}

#[tokio::test]
async fn revoked_address_stays_retired() {
    let fx = Fixture::new().await;
    let controller = fx.controller();

    let alice = controller.create_peer(request("alice", "laptop")).await.unwrap().peer;
    controller.create_peer(request("bob", "laptop")).await.unwrap();

    controller.revoke_peer(alice.id).await.unwrap();
    assert!(!fx.config().contains(&alice.public_key));

    let carol = controller.create_peer(request("carol", "laptop")).await.unwrap().peer;
    assert_eq!(carol.address.to_string(), "10.99.0.102/32");

    let usage = controller.usage().await.unwrap();
    assert_eq!((usage.capacity, usage.used, usage.free), (101, 3, 98));

    controller.restore_peer(alice.id).await.unwrap();
    assert!(fx.config().contains(&alice.public_key));
}

#[tokio::test]
async fn revoking_twice_is_harmless() {
    let fx = Fixture::new().await;
    let controller = fx.controller();
    let alice = controller.create_peer(request("alice", "laptop")).await.unwrap().peer;

    controller.revoke_peer(alice.id).await.unwrap();
    let again = controller.revoke_peer(alice.id).await.unwrap();
    assert!(!again.changed);
    assert_eq!(again.peers, 0);
}

#[tokio::test]
async fn unknown_and_revoked_peers() {
    let fx = Fixture::new().await;
    let controller = fx.controller();

    let missing = Uuid::new_v4();
    assert!(matches!(
        controller.revoke_peer(missing).await,
        Err(ServiceError::NotFound(id)) if id == missing
    ));

    let alice = controller.create_peer(request("alice", "laptop")).await.unwrap().peer;
    assert!(controller.client_config(alice.id).await.is_ok());

    controller.revoke_peer(alice.id).await.unwrap();
    assert!(matches!(
        controller.client_config(alice.id).await,
        Err(ServiceError::Revoked(_))
    ));
}

#[tokio::test]
async fn key_failure_creates_nothing() {
    let fx = Fixture::new().await;
    let controller = fx.build(
        Pool::new("10.99.0.0/24".parse().unwrap(), 100, 200).unwrap(),
        Box::new(BrokenKeys),
    );

    let err = controller.create_peer(request("alice", "laptop")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Keys(KeyError::KeyGenUnavailable(_))));

    assert!(controller.peers().await.unwrap().is_empty());
    assert!(!fx.config_path().exists());
    assert!(fx.control.calls().is_empty());
    assert_eq!(controller.state().await, ReconcileState::NoFile);
}

#[tokio::test]
async fn missing_endpoint_creates_nothing() {
    let mut fx = Fixture::new().await;
    fx.settings.endpoint = None;
    let controller = fx.controller();

    let err = controller.create_peer(request("alice", "laptop")).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Render(RenderError::MissingField { field: "endpoint", .. })
    ));
    assert!(controller.peers().await.unwrap().is_empty());
    assert!(!fx.config_path().exists());
}

#[tokio::test]
async fn missing_template_creates_nothing() {
    let fx = Fixture::new().await;
    std::fs::remove_file(&fx.settings.template_path).unwrap();
    let controller = fx.controller();

    let err = controller.create_peer(request("alice", "laptop")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Reconcile(_)));
    assert!(!err.is_divergent());
    assert!(controller.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_pool() {
    let fx = Fixture::new().await;
    let pool = Pool::new("10.99.0.0/24".parse().unwrap(), 100, 101).unwrap();
    let controller = fx.controller_with(pool);

    controller.create_peer(request("alice", "a")).await.unwrap();
    controller.create_peer(request("alice", "b")).await.unwrap();

    let err = controller.create_peer(request("alice", "c")).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Alloc(AllocError::PoolExhausted { start: 100, end: 101 })
    ));
    assert_eq!(controller.peers().await.unwrap().len(), 2);
}

#[tokio::test]
async fn removing_an_owner_frees_addresses() {
    let fx = Fixture::new().await;
    let controller = fx.controller();

    controller.create_peer(request("alice", "laptop")).await.unwrap();
    controller.create_peer(request("alice", "phone")).await.unwrap();
    let bob = controller.create_peer(request("bob", "laptop")).await.unwrap().peer;

    let (removed, reconciled) = controller.remove_owner("alice").await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(reconciled.peers, 1);
    assert!(fx.config().contains(&bob.public_key));

    let carol = controller.create_peer(request("carol", "laptop")).await.unwrap().peer;
    assert_eq!(carol.address.to_string(), "10.99.0.100/32");
}

#[tokio::test]
async fn supplied_public_key() {
    let fx = Fixture::new().await;
    let controller = fx.controller();
    let key = STANDARD.encode([7u8; 32]);

    let created = controller
        .create_peer(PeerRequest {
            public_key: Some(key.clone()),
            ..request("alice", "router")
        })
        .await
        .unwrap();
    assert_eq!(created.peer.public_key, key);
    assert!(created.peer.private_key.is_none());
    assert!(created.client_config.is_none());

    let err = controller
        .create_peer(PeerRequest {
            public_key: Some(key),
            ..request("bob", "router")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PeerAlreadyExists));

    let err = controller
        .create_peer(PeerRequest {
            public_key: Some("not a key".to_owned()),
            ..request("bob", "router")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Keys(KeyError::InvalidKey)));
    assert_eq!(controller.peers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn blank_names_are_rejected() {
    let fx = Fixture::new().await;
    let controller = fx.controller();

    assert!(matches!(
        controller.create_peer(request("  ", "laptop")).await,
        Err(ServiceError::InvalidName("owner"))
    ));
    assert!(matches!(
        controller.create_peer(request("alice", "")).await,
        Err(ServiceError::InvalidName("name"))
    ));
}

#[tokio::test]
async fn reload_failure_is_divergent() {
    let fx = Fixture::new().await;
    let controller = fx.controller();
    fx.control.fail_up.store(true, Ordering::SeqCst);

    let err = controller.create_peer(request("alice", "laptop")).await.unwrap_err();
    assert!(err.is_divergent());
    let (peer, client_config, source) = match err {
        ServiceError::Diverged {
            peer,
            client_config,
            source,
        } => (peer, client_config, source),
        other => panic!("expected a divergence, got {other:?}"),
    };
    assert!(source.is_divergent());
    assert_eq!(peer.address.to_string(), "10.99.0.100/32");
    assert!(client_config.unwrap().contains("Address = 10.99.0.100/32\n"));
    assert_eq!(controller.state().await, ReconcileState::Staged);

    // the record and the staged file both hold the new peer
    let peers = controller.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, peer.id);
    assert!(fx.config().contains(&peers[0].public_key));

    fx.control.fail_up.store(false, Ordering::SeqCst);
    let reconciled = controller.reconcile().await.unwrap();
    assert!(!reconciled.changed);
    assert_eq!(controller.state().await, ReconcileState::Applied);
}

#[tokio::test]
async fn failed_staging_drops_the_new_peer() {
    let fx = Fixture::new().await;
    // a directory where the live file should go makes the final rename fail
    std::fs::create_dir(fx.config_path()).unwrap();
    let controller = fx.controller();

    let err = controller.create_peer(request("alice", "laptop")).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Reconcile(ReconcileError::Stage { .. })
    ));
    assert!(!err.is_divergent());
    assert!(controller.peers().await.unwrap().is_empty());
    assert!(fx.control.calls().is_empty());
    assert_eq!(controller.state().await, ReconcileState::Applied);
}

#[tokio::test]
async fn failed_staging_keeps_the_revocation_flag() {
    let fx = Fixture::new().await;
    let controller = fx.controller();
    let alice = controller.create_peer(request("alice", "laptop")).await.unwrap().peer;

    std::fs::remove_file(fx.config_path()).unwrap();
    std::fs::create_dir(fx.config_path()).unwrap();

    let err = controller.revoke_peer(alice.id).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Reconcile(ReconcileError::Stage { .. })
    ));
    assert!(!controller.peers().await.unwrap()[0].revoked);
}

#[tokio::test]
async fn peers_of_other_interfaces_are_invisible() {
    let fx = Fixture::new().await;
    let controller = fx.controller();
    let foreign = fx
        .store
        .create_peer(
            "wg1",
            NewPeer {
                owner: "carol".to_owned(),
                name: "tablet".to_owned(),
                address: "10.99.0.100".parse().unwrap(),
                public_key: STANDARD.encode([3u8; 32]),
                private_key: Some(STANDARD.encode([4u8; 32])),
                dns: vec![],
                client_allowed_ips: vec![],
                persistent_keepalive: None,
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        controller.revoke_peer(foreign.id).await,
        Err(ServiceError::NotFound(id)) if id == foreign.id
    ));
    assert!(matches!(
        controller.client_config(foreign.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(!fx.store.peer("wg1", foreign.id).await.unwrap().unwrap().revoked);
    assert!(controller.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_creates_get_distinct_addresses() {
    let fx = Fixture::new().await;
    let controller = fx.controller();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .create_peer(request("load", &format!("dev{i}")))
                    .await
            })
        })
        .collect();

    let mut addresses = Vec::new();
    for task in tasks {
        addresses.push(task.await.unwrap().unwrap().peer.address.to_string());
    }
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 8);
    assert_eq!(controller.usage().await.unwrap().used, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_controllers_share_one_interface() {
    let fx = Fixture::new().await;
    // two independent controllers stand in for two CLI processes
    let first = fx.controller();
    let second = fx.controller();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let controller = if i % 2 == 0 { first.clone() } else { second.clone() };
            tokio::spawn(async move {
                controller
                    .create_peer(request("load", &format!("dev{i}")))
                    .await
            })
        })
        .collect();

    let mut created = Vec::new();
    for task in tasks {
        created.push(task.await.unwrap().unwrap().peer);
    }

    let mut addresses: Vec<_> = created.iter().map(|p| p.address.to_string()).collect();
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 10);

    // whichever controller wrote last saw every peer
    let config = fx.config();
    for peer in &created {
        assert!(config.contains(&peer.public_key), "{} missing", peer.identity());
    }
}
