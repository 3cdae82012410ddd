//! HTTP server assembly: config, state, middleware, routes, startup.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod router;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::oneshot;

use crate::blobstore::FsBlobStore;
use crate::crypto::PhoneCipher;
use crate::push::{HttpPushProvider, JwtMinter, PushService};
use crate::rlog;
use crate::storage::Storage;
use crate::web::auth::SignedTokenVerifier;
use crate::web::config::{Cli, Config};
use crate::web::state::{AppState, SharedState};

/// Entry point: parse CLI, load secrets, open storage, start serving.
pub async fn run() {
    let cli = Cli::parse();
    let config = match Config::from_cli_and_env(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    rlog!(Info, "buds-relay starting");
    rlog!(Info, "data directory: {}", config.data_dir.display());

    let cipher = match PhoneCipher::from_base64(&config.phone_key_base64) {
        Ok(cipher) => cipher,
        Err(e) => {
            eprintln!("configuration error: BUDS_PHONE_KEY: {e}");
            std::process::exit(1);
        }
    };
    let verifier = match SignedTokenVerifier::from_base64(&config.auth_pubkey_base64) {
        Ok(verifier) => verifier,
        Err(e) => {
            eprintln!("configuration error: BUDS_AUTH_PUBKEY: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        eprintln!("cannot create data directory: {e}");
        std::process::exit(1);
    }
    let storage = match Storage::open(&config.db_path()) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("cannot open database: {e}");
            std::process::exit(1);
        }
    };
    let blobs = match FsBlobStore::open(&config.blob_dir()) {
        Ok(blobs) => Arc::new(blobs),
        Err(e) => {
            eprintln!("cannot open blob directory: {e}");
            std::process::exit(1);
        }
    };

    // Push is optional: without credentials, sends still work and devices
    // simply poll.
    let push = match &config.push {
        Some(settings) => match JwtMinter::new(
            &settings.key_base64,
            &settings.key_id,
            &settings.team_id,
        ) {
            Ok(minter) => {
                rlog!(Info, "push: enabled via {}", settings.gateway_url);
                Some(Arc::new(PushService::new(
                    Arc::new(HttpPushProvider::new(&settings.gateway_url, &settings.topic)),
                    Box::new(minter),
                )))
            }
            Err(e) => {
                rlog!(Warn, "push: disabled, credentials rejected: {e}");
                None
            }
        },
        None => {
            rlog!(Warn, "push: disabled, no credentials configured");
            None
        }
    };

    let state: SharedState = Arc::new(tokio::sync::Mutex::new(AppState::new(
        storage,
        blobs,
        cipher,
        Arc::new(verifier),
        push,
    )));

    let (cleanup_shutdown_tx, cleanup_shutdown_rx) = oneshot::channel();
    crate::cleanup::start_cleanup_task(state.clone(), cleanup_shutdown_rx);

    let app = router::build_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("cannot bind {}: {e}", config.bind_addr);
            std::process::exit(1);
        }
    };
    rlog!(Info, "listening on {}", config.bind_addr);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        rlog!(Info, "shutdown signal received");
    });

    if let Err(e) = server.await {
        rlog!(Error, "server error: {e}");
    }
    let _ = cleanup_shutdown_tx.send(());
}
