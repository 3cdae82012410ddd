//! Configuration for the relay server.
//!
//! CLI arguments take precedence over environment variables. Secrets come
//! from the environment only: the phone-encryption key and the caller-auth
//! public key are required (startup fails loudly without them); push
//! credentials are optional and their absence disables push without touching
//! message ingest.

use std::path::PathBuf;

use clap::Parser;

/// Default port matches the platform deployment manifests.
const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Zero-trust message and receipt relay for buds.
///
/// Stores encrypted message envelopes and signed jar receipts, resolves
/// phone-addressed identities, and wakes recipient devices with silent
/// pushes. Persists to SQLite; payload bodies go to the blob directory.
#[derive(Parser, Debug)]
#[command(name = "buds-relay", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: BUDS_RELAY_BIND] [default: 127.0.0.1:8080]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for database and blobs [env: BUDS_RELAY_HOME] [default: ~/.buds-relay]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,
}

/// Push provider credentials; all-or-nothing.
#[derive(Clone)]
pub struct PushSettings {
    pub key_base64: String,
    pub key_id: String,
    pub team_id: String,
    pub topic: String,
    pub gateway_url: String,
}

pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Base64 256-bit AES key for phone encryption.
    pub phone_key_base64: String,
    /// Base64 Ed25519 public key of the caller-auth service.
    pub auth_pubkey_base64: String,
    pub push: Option<PushSettings>,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, String> {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("BUDS_RELAY_BIND").ok())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("BUDS_RELAY_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".buds-relay"))
                    .unwrap_or_else(|_| PathBuf::from(".buds-relay"))
            });

        let phone_key_base64 = std::env::var("BUDS_PHONE_KEY")
            .map_err(|_| "BUDS_PHONE_KEY is not set; refusing to run without the phone encryption key".to_string())?;

        let auth_pubkey_base64 = std::env::var("BUDS_AUTH_PUBKEY")
            .map_err(|_| "BUDS_AUTH_PUBKEY is not set; refusing to run without the caller-auth key".to_string())?;

        let push = match (
            std::env::var("BUDS_PUSH_KEY"),
            std::env::var("BUDS_PUSH_KEY_ID"),
            std::env::var("BUDS_PUSH_TEAM_ID"),
            std::env::var("BUDS_PUSH_TOPIC"),
        ) {
            (Ok(key_base64), Ok(key_id), Ok(team_id), Ok(topic)) => Some(PushSettings {
                key_base64,
                key_id,
                team_id,
                topic,
                gateway_url: std::env::var("BUDS_PUSH_URL")
                    .unwrap_or_else(|_| "https://api.push.apple.com".to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            bind_addr,
            data_dir,
            phone_key_base64,
            auth_pubkey_base64,
            push,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("relay.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}
