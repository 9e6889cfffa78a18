//! Bulk import of pre-generated WireGuard configuration files.
//!
//! Each `*.conf` file in the import directory becomes one `available`
//! peer. The `Address` value of the `[Interface]` section is the dedup
//! key; re-running an import only picks up files not seen before.

use std::path::Path;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, EventType};
use crate::crypto::{ConfigCipher, CryptoError};
use crate::db::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to read import directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Outcome counters of one import run.
#[derive(Debug, Default, Clone)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Extract the `Address` value from the `[Interface]` section of a
/// WireGuard configuration.
pub fn extract_address(config: &str) -> Option<String> {
    let mut in_interface = false;

    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_interface = line.eq_ignore_ascii_case("[interface]");
            continue;
        }
        if !in_interface {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim().eq_ignore_ascii_case("address") {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    None
}

/// Scan a directory of `*.conf` files and import each as an encrypted,
/// available peer. Files without a usable address are skipped with a
/// warning; one `IMPORT` audit event summarizes the run.
pub async fn import_directory(
    store: &Store,
    cipher: &ConfigCipher,
    audit: &AuditTrail,
    dir: &Path,
    actor_id: Option<&str>,
) -> Result<ImportSummary, ImportError> {
    let mut summary = ImportSummary::default();

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
        .collect();
    entries.sort();

    for path in &entries {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config file");
                summary.failed += 1;
                continue;
            }
        };

        let Some(address) = extract_address(&content) else {
            warn!(path = %path.display(), "No interface address found, skipping");
            summary.failed += 1;
            continue;
        };

        let ciphertext = cipher.encrypt(&content)?;

        match store.insert_peer(&address, &ciphertext).await? {
            Some(peer) => {
                info!(peer_id = %peer.id, public_key = %address, "Imported peer");
                summary.imported += 1;
            }
            None => {
                summary.skipped += 1;
            }
        }
    }

    let batch_id = Uuid::new_v4().to_string();
    audit
        .record(
            EventType::Import,
            actor_id,
            "import_batch",
            &batch_id,
            json!({
                "directory": dir.display().to_string(),
                "imported": summary.imported,
                "skipped": summary.skipped,
                "failed": summary.failed,
            }),
        )
        .await;

    info!(
        imported = summary.imported,
        skipped = summary.skipped,
        failed = summary.failed,
        "Import complete"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONF: &str = "\
[Interface]
PrivateKey = cGxhY2Vob2xkZXIta2V5LW5vdC1yZWFs
Address = 10.8.0.2/24
DNS = 1.1.1.1

[Peer]
PublicKey = c2VydmVyLXB1YmxpYy1rZXk=
Endpoint = vpn.example.com:51820
AllowedIPs = 0.0.0.0/0
";

    #[test]
    fn test_extract_address() {
        assert_eq!(extract_address(SAMPLE_CONF).as_deref(), Some("10.8.0.2/24"));

        // address outside [Interface] is ignored
        let peer_only = "[Peer]\nAddress = 10.8.0.9/24\n";
        assert_eq!(extract_address(peer_only), None);

        // case-insensitive section and key
        let lowercase = "[interface]\naddress = 10.8.0.3/24\n";
        assert_eq!(extract_address(lowercase).as_deref(), Some("10.8.0.3/24"));

        assert_eq!(extract_address(""), None);
        assert_eq!(extract_address("[Interface]\nAddress =\n"), None);
    }

    #[tokio::test]
    async fn test_import_directory_dedups() {
        let store = Store::in_memory().await.unwrap();
        let cipher = ConfigCipher::from_key_str(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        )
        .unwrap();
        let audit = AuditTrail::new(store.clone());

        let dir = std::env::temp_dir().join(format!("wg-portal-import-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("peer1.conf"), SAMPLE_CONF).unwrap();
        std::fs::write(
            dir.join("peer2.conf"),
            SAMPLE_CONF.replace("10.8.0.2/24", "10.8.0.3/24"),
        )
        .unwrap();
        // not a .conf file, ignored entirely
        std::fs::write(dir.join("README.txt"), "not a config").unwrap();
        // unparseable config counts as failed
        std::fs::write(dir.join("broken.conf"), "[Peer]\nnothing here\n").unwrap();

        let summary = import_directory(&store, &cipher, &audit, &dir, None).await.unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.failed, 1);

        // second run: everything already known
        let summary = import_directory(&store, &cipher, &audit, &dir, None).await.unwrap();
        assert_eq!(summary.imported, 0);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 1);

        // stored ciphertext decrypts back to the file contents
        let row: (String,) =
            sqlx::query_as("SELECT config_ciphertext FROM peers WHERE public_key = '10.8.0.2/24'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(cipher.decrypt(&row.0).unwrap(), SAMPLE_CONF);

        let events = audit.recent(10).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.event_type == "IMPORT").count(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
