//! Black-box tests for the jar receipt log: append pipeline, sequence
//! assignment under concurrency, membership materialization, and backfill.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ciborium::cbor;
use ed25519_dalek::{Signer, SigningKey};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use buds_relay::blobstore::FsBlobStore;
use buds_relay::crypto::PhoneCipher;
use buds_relay::encoding::compute_cid;
use buds_relay::receipts::rebuild_members;
use buds_relay::storage::Storage;
use buds_relay::web::auth::{make_caller_token, SignedTokenVerifier};
use buds_relay::web::router::build_router;
use buds_relay::web::state::{AppState, SharedState};

struct TestServer {
    base_url: String,
    auth_key: SigningKey,
    state: SharedState,
    _shutdown_tx: oneshot::Sender<()>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

async fn start_server(seed: u8) -> TestServer {
    let auth_key = SigningKey::generate(&mut ChaCha20Rng::from_seed([seed; 32]));
    let verifier = SignedTokenVerifier::from_base64(
        &STANDARD.encode(auth_key.verifying_key().to_bytes()),
    )
    .unwrap();
    let blob_dir = std::env::temp_dir().join(format!(
        "buds-receipt-test-{}-{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));
    let state = Arc::new(tokio::sync::Mutex::new(AppState::new(
        Storage::open_in_memory().unwrap(),
        Arc::new(FsBlobStore::open(&blob_dir).unwrap()),
        PhoneCipher::new([seed; 32]),
        Arc::new(verifier),
        None,
    )));

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        auth_key,
        state,
        _shutdown_tx: shutdown_tx,
    }
}

fn post_json(url: &str, token: &str, body: Value) -> (u16, Value) {
    let result = ureq::post(url)
        .set("Authorization", &format!("Bearer {token}"))
        .send_json(body);
    match result {
        Ok(response) => {
            let status = response.status();
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(e) => panic!("transport error: {e}"),
    }
}

fn get_json(url: &str, token: &str) -> (u16, Value) {
    let result = ureq::get(url)
        .set("Authorization", &format!("Bearer {token}"))
        .call();
    match result {
        Ok(response) => {
            let status = response.status();
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(e) => panic!("transport error: {e}"),
    }
}

/// A registered identity with its own signing key for receipts.
struct Member {
    did: String,
    token: String,
    signing_key: SigningKey,
}

async fn register_member(server: &TestServer, phone: &str, tag: u8, key_seed: u8) -> Member {
    let token = make_caller_token(&server.auth_key, phone, now_secs());
    let did = format!("did:phone:{}", format!("{tag:02x}").repeat(32));
    let signing_key = SigningKey::generate(&mut ChaCha20Rng::from_seed([key_seed; 32]));

    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/devices/register", server.base_url);
        let token = token.clone();
        let body = json!({
            "device_id": Uuid::new_v4().to_string(),
            "device_name": "receipt phone",
            "owner_did": did,
            "phone": phone,
            "pubkey_x25519": STANDARD.encode([1u8; 32]),
            "pubkey_ed25519": STANDARD.encode(signing_key.verifying_key().to_bytes()),
        });
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 201);

    Member {
        did,
        token,
        signing_key,
    }
}

fn receipt_bytes(receipt_type: &str, sender_did: &str, timestamp: u64, member: Option<&str>) -> Vec<u8> {
    let value = match member {
        Some(member) => cbor!({
            "receipt_type" => receipt_type,
            "sender_did" => sender_did,
            "timestamp" => timestamp,
            "payload" => { "member_did" => member },
        })
        .unwrap(),
        None => cbor!({
            "receipt_type" => receipt_type,
            "sender_did" => sender_did,
            "timestamp" => timestamp,
        })
        .unwrap(),
    };
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&value, &mut bytes).unwrap();
    bytes
}

fn receipt_request(bytes: &[u8], key: &SigningKey) -> Value {
    json!({
        "receipt_data": STANDARD.encode(bytes),
        "signature": STANDARD.encode(key.sign(bytes).to_bytes()),
    })
}

async fn append(server: &TestServer, jar: &str, member: &Member, bytes: Vec<u8>) -> (u16, Value) {
    let url = format!("{}/api/jars/{}/receipts", server.base_url, jar);
    let token = member.token.clone();
    let body = receipt_request(&bytes, &member.signing_key);
    tokio::task::spawn_blocking(move || post_json(&url, &token, body))
        .await
        .unwrap()
}

#[tokio::test]
async fn genesis_then_member_added_materializes_two_rows() {
    let server = start_server(30).await;
    let owner = register_member(&server, "+14155554001", 0xd1, 41).await;
    let member = register_member(&server, "+14155554002", 0xd2, 42).await;

    let (status, stored) = append(
        &server,
        "jar-alpha",
        &owner,
        receipt_bytes("jar.created", &owner.did, 1_700_000_000_000, None),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(stored["sequence_number"], json!(1));
    let genesis_cid = stored["receipt_cid"].as_str().unwrap().to_string();

    let (status, stored) = append(
        &server,
        "jar-alpha",
        &owner,
        receipt_bytes(
            "jar.member_added",
            &owner.did,
            1_700_000_000_001,
            Some(&member.did),
        ),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(stored["sequence_number"], json!(2));

    {
        let st = server.state.lock().await;
        let members = st.storage.list_members("jar-alpha").unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.status == "active"));
        let owner_row = members.iter().find(|m| m.member_did == owner.did).unwrap();
        assert_eq!(owner_row.role, "owner");
        assert_eq!(owner_row.added_by_receipt_cid.as_deref(), Some(genesis_cid.as_str()));
        let member_row = members.iter().find(|m| m.member_did == member.did).unwrap();
        assert_eq!(member_row.role, "member");
    }

    // Both identities see the jar with their role.
    let (status, jars) = tokio::task::spawn_blocking({
        let url = format!("{}/api/jars/list", server.base_url);
        let token = member.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    assert_eq!(
        jars["jars"],
        json!([{"jar_id": "jar-alpha", "role": "member"}])
    );
}

#[tokio::test]
async fn resubmission_is_idempotent() {
    let server = start_server(31).await;
    let owner = register_member(&server, "+14155554101", 0xd3, 43).await;

    let bytes = receipt_bytes("jar.created", &owner.did, 1_700_000_000_000, None);
    let (status, first) = append(&server, "jar-beta", &owner, bytes.clone()).await;
    assert_eq!(status, 201);
    let (status, second) = append(&server, "jar-beta", &owner, bytes.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(first["sequence_number"], second["sequence_number"]);
    assert_eq!(first["receipt_cid"], second["receipt_cid"]);

    // The stored bytes did not change on the second call.
    {
        let st = server.state.lock().await;
        let row = st
            .storage
            .get_receipt_by_cid(first["receipt_cid"].as_str().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(row.receipt_data, bytes);
    }
}

#[tokio::test]
async fn pipeline_rejections_are_precise() {
    let server = start_server(32).await;
    let owner = register_member(&server, "+14155554201", 0xd4, 44).await;
    let outsider = register_member(&server, "+14155554202", 0xd5, 45).await;

    let (status, _) = append(
        &server,
        "jar-gamma",
        &owner,
        receipt_bytes("jar.created", &owner.did, 1_700_000_000_000, None),
    )
    .await;
    assert_eq!(status, 201);

    // Malformed CBOR is a 400.
    let (status, body) = tokio::task::spawn_blocking({
        let url = format!("{}/api/jars/jar-gamma/receipts", server.base_url);
        let token = owner.token.clone();
        let body = json!({
            "receipt_data": STANDARD.encode(b"definitely not cbor"),
            "signature": STANDARD.encode([0u8; 64]),
        });
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], json!("VALIDATION_ERROR"));

    // A claimed CID that does not match the bytes is a 400.
    let bytes = receipt_bytes("jar.member_added", &owner.did, 1, Some(&outsider.did));
    let wrong_cid = compute_cid(b"other bytes");
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/jars/jar-gamma/receipts", server.base_url);
        let token = owner.token.clone();
        let mut body = receipt_request(&bytes, &owner.signing_key);
        body["receipt_cid"] = json!(wrong_cid);
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 400);

    // A signature from the wrong key is a 403.
    let (status, body) = tokio::task::spawn_blocking({
        let url = format!("{}/api/jars/jar-gamma/receipts", server.base_url);
        let token = owner.token.clone();
        let bytes = receipt_bytes("jar.member_added", &owner.did, 2, Some(&outsider.did));
        let body = receipt_request(&bytes, &outsider.signing_key);
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 403);
    assert_eq!(body["error"]["code"], json!("FORBIDDEN"));

    // A non-member writing to a non-empty jar is a 403, even self-signed.
    let (status, _) = append(
        &server,
        "jar-gamma",
        &outsider,
        receipt_bytes("jar.member_added", &outsider.did, 3, Some(&outsider.did)),
    )
    .await;
    assert_eq!(status, 403);

    // An unknown receipt type from a member is accepted and ignored.
    let (status, _) = append(
        &server,
        "jar-gamma",
        &owner,
        receipt_bytes("jar.topic_changed", &owner.did, 4, None),
    )
    .await;
    assert_eq!(status, 201);
    {
        let st = server.state.lock().await;
        assert_eq!(st.storage.list_members("jar-gamma").unwrap().len(), 1);
    }
}

#[tokio::test]
async fn concurrent_appends_produce_dense_sequences() {
    let server = start_server(33).await;
    let owner = register_member(&server, "+14155554301", 0xd6, 46).await;

    let (status, _) = append(
        &server,
        "jar-delta",
        &owner,
        receipt_bytes("jar.created", &owner.did, 1_700_000_000_000, None),
    )
    .await;
    assert_eq!(status, 201);

    // Ten distinct members join, then append concurrently.
    let mut members = Vec::new();
    for i in 0..10u8 {
        let member = register_member(
            &server,
            &format!("+1415555440{i}"),
            0xe0 + i,
            50 + i,
        )
        .await;
        let (status, _) = append(
            &server,
            "jar-delta",
            &owner,
            receipt_bytes(
                "jar.member_added",
                &owner.did,
                1_700_000_000_100 + u64::from(i),
                Some(&member.did),
            ),
        )
        .await;
        assert_eq!(status, 201);
        members.push(member);
    }

    let mut handles = Vec::new();
    for (i, member) in members.into_iter().enumerate() {
        let url = format!("{}/api/jars/jar-delta/receipts", server.base_url);
        let bytes = receipt_bytes(
            "jar.note_added",
            &member.did,
            1_800_000_000_000 + i as u64,
            None,
        );
        let body = receipt_request(&bytes, &member.signing_key);
        let token = member.token.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            post_json(&url, &token, body)
        }));
    }

    let mut sequences = Vec::new();
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, 201);
        sequences.push(body["sequence_number"].as_i64().unwrap());
    }
    sequences.sort_unstable();
    // 1 genesis + 10 adds landed first, so the concurrent batch is 12..=21,
    // dense, no duplicates.
    assert_eq!(sequences, (12..=21).collect::<Vec<i64>>());
}

#[tokio::test]
async fn backfill_modes_and_replay_rebuild() {
    let server = start_server(34).await;
    let owner = register_member(&server, "+14155554501", 0xd7, 60).await;
    let member = register_member(&server, "+14155554502", 0xd8, 61).await;

    append(
        &server,
        "jar-eps",
        &owner,
        receipt_bytes("jar.created", &owner.did, 100, None),
    )
    .await;
    append(
        &server,
        "jar-eps",
        &owner,
        receipt_bytes("jar.member_added", &owner.did, 200, Some(&member.did)),
    )
    .await;
    append(
        &server,
        "jar-eps",
        &owner,
        receipt_bytes("jar.member_removed", &owner.did, 300, Some(&member.did)),
    )
    .await;

    // after/limit mode, ascending, envelope fields round-trip through base64.
    let (status, page) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/jars/jar-eps/receipts?after=1&limit=10",
            server.base_url
        );
        let token = owner.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    let receipts = page["receipts"].as_array().unwrap();
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0]["sequence_number"], json!(2));
    assert_eq!(receipts[1]["sequence_number"], json!(3));
    let data = STANDARD
        .decode(receipts[0]["receipt_data"].as_str().unwrap())
        .unwrap();
    assert_eq!(
        compute_cid(&data),
        receipts[0]["receipt_cid"].as_str().unwrap()
    );
    assert_eq!(
        STANDARD
            .decode(receipts[0]["signature"].as_str().unwrap())
            .unwrap()
            .len(),
        64
    );

    // from/to mode.
    let (status, page) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/jars/jar-eps/receipts?from=1&to=2",
            server.base_url
        );
        let token = owner.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    assert_eq!(page["receipts"].as_array().unwrap().len(), 2);

    // from > to is rejected.
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/jars/jar-eps/receipts?from=3&to=1",
            server.base_url
        );
        let token = owner.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 400);

    // The removed member may no longer backfill.
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/jars/jar-eps/receipts?after=0",
            server.base_url
        );
        let token = member.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 403);

    // Replaying the log from scratch reproduces the live view exactly.
    {
        let st = server.state.lock().await;
        let live: Vec<_> = st
            .storage
            .list_members("jar-eps")
            .unwrap()
            .into_iter()
            .map(|m| (m.member_did, m.status, m.role, m.added_at, m.removed_at))
            .collect();
        rebuild_members(&st.storage, "jar-eps").unwrap();
        let rebuilt: Vec<_> = st
            .storage
            .list_members("jar-eps")
            .unwrap()
            .into_iter()
            .map(|m| (m.member_did, m.status, m.role, m.added_at, m.removed_at))
            .collect();
        assert_eq!(live, rebuilt);
    }
}
