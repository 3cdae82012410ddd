//! Black-box tests for the encrypted message lifecycle: send, inbox,
//! delivery acks, deletion, and the retention sweep.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use buds_relay::blobstore::{message_blob_key, BlobMetadata, BlobStore, FsBlobStore};
use buds_relay::cleanup::run_cleanup;
use buds_relay::crypto::PhoneCipher;
use buds_relay::encoding::compute_cid;
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
        "buds-message-test-{}-{}",
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

fn delete_json(url: &str, token: &str) -> (u16, Value) {
    let result = ureq::delete(url)
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

/// A registered test identity: DID, device, auth token.
struct Identity {
    did: String,
    device_id: String,
    token: String,
}

async fn register_identity(server: &TestServer, phone: &str, tag: u8) -> Identity {
    let token = make_caller_token(&server.auth_key, phone, now_secs());
    let did = format!("did:phone:{}", format!("{tag:02x}").repeat(32));
    let device_id = Uuid::new_v4().to_string();

    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/devices/register", server.base_url);
        let token = token.clone();
        let body = json!({
            "device_id": device_id,
            "device_name": "integration phone",
            "owner_did": did,
            "phone": phone,
            "pubkey_x25519": STANDARD.encode([1u8; 32]),
            "pubkey_ed25519": STANDARD.encode([2u8; 32]),
        });
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 201);

    Identity {
        did,
        device_id,
        token,
    }
}

fn send_body(sender: &Identity, message_id: &str, recipients: Vec<&str>, payload: &[u8]) -> Value {
    let mut body = json!({
        "message_id": message_id,
        "receipt_cid": compute_cid(payload),
        "sender_did": sender.did,
        "sender_device_id": sender.device_id,
        "recipient_dids": recipients,
        "encrypted_payload": STANDARD.encode(payload),
        "wrapped_keys": {},
        "signature": STANDARD.encode([0u8; 64]),
    });
    body["wrapped_keys"][sender.device_id.as_str()] = json!(STANDARD.encode([7u8; 32]));
    body
}

#[tokio::test]
async fn message_lifecycle_send_inbox_ack_delete() {
    let server = start_server(20).await;
    let sender = register_identity(&server, "+14155551001", 0xa1).await;
    let d1 = register_identity(&server, "+14155551002", 0xa2).await;
    let d2 = register_identity(&server, "+14155551003", 0xa3).await;

    // A 500 KB ciphertext exercises the blob offload path.
    let payload: Vec<u8> = (0..500 * 1024).map(|i| (i % 251) as u8).collect();
    let message_id = Uuid::new_v4().to_string();

    let (status, sent) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/send", server.base_url);
        let token = sender.token.clone();
        let body = send_body(&sender, &message_id, vec![&d1.did, &d2.did], &payload);
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 201);
    assert_eq!(sent["status"], json!("accepted"));
    let created_at = sent["created_at"].as_i64().unwrap();
    assert_eq!(
        sent["expires_at"].as_i64().unwrap(),
        created_at + 30 * 24 * 60 * 60 * 1000
    );

    // D1's inbox returns the blob-hydrated base64 body.
    let (status, inbox) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/messages/inbox?did={}",
            server.base_url, d1.did
        );
        let token = d1.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    assert_eq!(inbox["has_more"], json!(false));
    let messages = inbox["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["message_id"].as_str().unwrap(), message_id);
    assert_eq!(
        STANDARD
            .decode(messages[0]["encrypted_payload"].as_str().unwrap())
            .unwrap(),
        payload
    );

    // Another identity's inbox stays empty, and D1 cannot read D2's inbox.
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/messages/inbox?did={}",
            server.base_url, d2.did
        );
        let token = d1.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 403);

    // Delivery ack, once.
    let (status, acked) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/mark-delivered", server.base_url);
        let token = d1.token.clone();
        let body = json!({"message_id": message_id, "recipient_did": d1.did});
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    assert!(acked["delivered_at"].as_i64().unwrap() > 0);

    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/mark-delivered", server.base_url);
        let token = d1.token.clone();
        let body = json!({"message_id": message_id, "recipient_did": d1.did});
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 404);

    // Only the sender may delete before expiry.
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/{}", server.base_url, message_id);
        let token = d1.token.clone();
        move || delete_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 403);

    let (status, deleted) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/{}", server.base_url, message_id);
        let token = sender.token.clone();
        move || delete_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    assert_eq!(deleted["deleted"], json!(true));

    // Blob and rows are gone; the inbox is empty again.
    {
        let st = server.state.lock().await;
        assert!(!st.blobs.exists(&message_blob_key(&message_id)).unwrap());
        assert!(st.storage.get_message(&message_id).unwrap().is_none());
    }
    let (_, inbox) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/messages/inbox?did={}",
            server.base_url, d1.did
        );
        let token = d1.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(inbox["messages"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn send_rejects_duplicates_and_oversized_recipient_lists() {
    let server = start_server(21).await;
    let sender = register_identity(&server, "+14155552001", 0xb1).await;
    let recipient = register_identity(&server, "+14155552002", 0xb2).await;

    let message_id = Uuid::new_v4().to_string();
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/send", server.base_url);
        let token = sender.token.clone();
        let body = send_body(&sender, &message_id, vec![&recipient.did], b"ct");
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 201);

    // Same message id again is a 400.
    let (status, dup) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/send", server.base_url);
        let token = sender.token.clone();
        let body = send_body(&sender, &message_id, vec![&recipient.did], b"ct");
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 400);
    assert_eq!(dup["error"]["code"], json!("VALIDATION_ERROR"));

    // Thirteen recipients are rejected before any write.
    let extra_dids: Vec<String> = (0..13)
        .map(|i| format!("did:phone:{}", format!("{i:02x}").repeat(32)))
        .collect();
    let thirteen_id = Uuid::new_v4().to_string();
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/send", server.base_url);
        let token = sender.token.clone();
        let body = send_body(
            &sender,
            &thirteen_id,
            extra_dids.iter().map(String::as_str).collect(),
            b"ct",
        );
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 400);
    {
        let st = server.state.lock().await;
        assert!(st.storage.get_message(&thirteen_id).unwrap().is_none());
        assert!(!st.blobs.exists(&message_blob_key(&thirteen_id)).unwrap());
    }

    // A sender spoofing someone else's DID is refused.
    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/send", server.base_url);
        let token = recipient.token.clone();
        let body = send_body(&sender, &Uuid::new_v4().to_string(), vec![&recipient.did], b"ct");
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 403);
}

#[tokio::test]
async fn cleanup_sweeps_expired_messages_and_blobs() {
    let server = start_server(22).await;
    let sender = register_identity(&server, "+14155553001", 0xc1).await;
    let recipient = register_identity(&server, "+14155553002", 0xc2).await;

    let message_id = Uuid::new_v4().to_string();
    let (status, sent) = tokio::task::spawn_blocking({
        let url = format!("{}/api/messages/send", server.base_url);
        let token = sender.token.clone();
        let body = send_body(&sender, &message_id, vec![&recipient.did], b"doomed");
        move || post_json(&url, &token, body)
    })
    .await
    .unwrap();
    assert_eq!(status, 201);
    let expires_at = sent["expires_at"].as_i64().unwrap();

    // A sweep before expiry is a no-op.
    let report = run_cleanup(&server.state, expires_at - 1).await;
    assert_eq!(report.messages_deleted, 0);

    // Past expiry the message, blob, and delivery rows all go.
    let report = run_cleanup(&server.state, expires_at + 1).await;
    assert_eq!(report.messages_deleted, 1);
    assert_eq!(report.blobs_deleted, 1);
    {
        let st = server.state.lock().await;
        assert!(st.storage.get_message(&message_id).unwrap().is_none());
        assert!(!st.blobs.exists(&message_blob_key(&message_id)).unwrap());
        assert!(!st
            .storage
            .has_pending_delivery(&message_id, &recipient.did)
            .unwrap());
    }

    // Idempotent rerun.
    let report = run_cleanup(&server.state, expires_at + 2).await;
    assert_eq!(report, Default::default());

    // The recipient's inbox no longer shows the message.
    let (_, inbox) = tokio::task::spawn_blocking({
        let url = format!(
            "{}/api/messages/inbox?did={}",
            server.base_url, recipient.did
        );
        let token = recipient.token.clone();
        move || get_json(&url, &token)
    })
    .await
    .unwrap();
    assert_eq!(inbox["messages"].as_array().unwrap().len(), 0);

    // A blob with no metadata row (a send that died mid-way) is reclaimed
    // once it outlives the grace window.
    let orphan_id = Uuid::new_v4().to_string();
    {
        let st = server.state.lock().await;
        st.blobs
            .put(
                &message_blob_key(&orphan_id),
                b"orphan",
                &BlobMetadata {
                    message_id: orphan_id.clone(),
                    receipt_cid: "bcid".to_string(),
                    sender_did: sender.did.clone(),
                    uploaded_at: 0,
                },
            )
            .unwrap();
    }
    let report = run_cleanup(&server.state, buds_relay::logging::now_ms()).await;
    assert_eq!(report.orphan_blobs_deleted, 1);
    {
        let st = server.state.lock().await;
        assert!(!st.blobs.exists(&message_blob_key(&orphan_id)).unwrap());
    }

    // Devices idle past the 90-day window are collected too.
    let report = run_cleanup(
        &server.state,
        buds_relay::logging::now_ms() + buds_relay::cleanup::DEVICE_IDLE_MS + 1,
    )
    .await;
    assert_eq!(report.devices_deleted, 2);
}
