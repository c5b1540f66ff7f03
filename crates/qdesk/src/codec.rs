//! Persistence codec for the server list.
//!
//! The registry is serialized to TOML, gzip-compressed, base64-encoded, and
//! tagged with a format prefix. Payloads larger than the settings store's
//! per-value limit are split across numbered auxiliary keys (`servers.1` …
//! `servers.20`); a payload that still does not fit fails loudly instead of
//! truncating.
//!
//! Two legacy read-only formats are recognized: an encrypted format from
//! older releases (`enc1:` prefix, AES-256-GCM with a fixed embedded key)
//! and the original plaintext TOML with no prefix. Writing always uses the
//! current compressed format.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{QdeskError, Result};
use crate::server::ServerConfig;
use crate::store::SettingsStore;

/// Primary settings key holding the encoded server list.
pub const SERVERS_KEY: &str = "servers";

/// Maximum number of auxiliary continuation keys (`servers.1` …).
pub const MAX_EXTRA_SLOTS: usize = 20;

const GZIP_PREFIX: &str = "gz1:";
const LEGACY_ENC_PREFIX: &str = "enc1:";

/// Key baked into old releases for the legacy encrypted format. Retained
/// only so existing saved data can still be read.
const LEGACY_KEY: [u8; 32] = [
    0x71, 0x64, 0x65, 0x73, 0x6b, 0x2d, 0x73, 0x65, 0x72, 0x76, 0x65, 0x72, 0x2d, 0x6c, 0x69,
    0x73, 0x74, 0x2d, 0x6b, 0x65, 0x79, 0x2d, 0x76, 0x31, 0x00, 0x5a, 0x3c, 0x99, 0xe7, 0x42,
    0x1b, 0xd8,
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerList {
    #[serde(default, rename = "server")]
    servers: Vec<ServerConfig>,
}

/// Encode a server list into the current tagged format.
pub fn encode(servers: &[ServerConfig]) -> Result<String> {
    let list = ServerList {
        servers: servers.to_vec(),
    };
    let text = toml::to_string(&list)
        .map_err(|e| QdeskError::Store(format!("failed to serialize server list: {}", e)))?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(text.as_bytes())?;
    let compressed = gz.finish()?;

    Ok(format!("{}{}", GZIP_PREFIX, BASE64.encode(compressed)))
}

/// Decode a payload in any of the three supported formats.
pub fn decode(payload: &str) -> Result<Vec<ServerConfig>> {
    if let Some(body) = payload.strip_prefix(GZIP_PREFIX) {
        let compressed = BASE64
            .decode(body)
            .map_err(|e| QdeskError::Store(format!("corrupt server list: {}", e)))?;
        let mut text = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut text)
            .map_err(|e| QdeskError::Store(format!("corrupt server list: {}", e)))?;
        return parse_list(&text);
    }

    if let Some(body) = payload.strip_prefix(LEGACY_ENC_PREFIX) {
        let text = decrypt_legacy(body)?;
        return parse_list(&text);
    }

    // Oldest format: bare TOML with no prefix tag.
    parse_list(payload)
}

fn parse_list(text: &str) -> Result<Vec<ServerConfig>> {
    let list: ServerList = toml::from_str(text)
        .map_err(|e| QdeskError::Store(format!("corrupt server list: {}", e)))?;
    Ok(list.servers)
}

/// Decrypt the legacy format: base64 over `nonce || ciphertext || tag`.
fn decrypt_legacy(body: &str) -> Result<String> {
    let raw = BASE64
        .decode(body)
        .map_err(|e| QdeskError::Store(format!("corrupt legacy server list: {}", e)))?;
    if raw.len() <= NONCE_LEN {
        return Err(QdeskError::Store("corrupt legacy server list: too short".into()));
    }

    let key = UnboundKey::new(&AES_256_GCM, &LEGACY_KEY)
        .map_err(|_| QdeskError::Store("legacy cipher key rejected".into()))?;
    let key = LessSafeKey::new(key);
    let nonce = Nonce::try_assume_unique_for_key(&raw[..NONCE_LEN])
        .map_err(|_| QdeskError::Store("corrupt legacy server list: bad nonce".into()))?;

    let mut in_out = raw[NONCE_LEN..].to_vec();
    let plain = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| QdeskError::Store("corrupt legacy server list: decryption failed".into()))?;

    String::from_utf8(plain.to_vec())
        .map_err(|_| QdeskError::Store("corrupt legacy server list: not UTF-8".into()))
}

fn slot_key(index: usize) -> String {
    format!("{}.{}", SERVERS_KEY, index)
}

/// Save the server list to the store, splitting across auxiliary keys as
/// needed.
///
/// Fails with a capacity error — writing nothing — if the encoded payload
/// exceeds `max_value_len * 19`.
pub fn save_servers(store: &dyn SettingsStore, servers: &[ServerConfig]) -> Result<()> {
    let payload = encode(servers)?;
    let limit = store.max_value_len();

    if payload.len() > limit * 19 {
        return Err(QdeskError::Capacity("too many connections to save".into()));
    }

    // Payload is ASCII (prefix + base64), so slicing on byte boundaries is safe.
    let bytes = payload.as_bytes();
    let chunks: Vec<&str> = bytes
        .chunks(limit)
        .map(|c| std::str::from_utf8(c).expect("base64 payload is ASCII"))
        .collect();

    store.put(SERVERS_KEY, chunks[0])?;
    for (i, chunk) in chunks.iter().enumerate().skip(1) {
        store.put(&slot_key(i), chunk)?;
    }
    // Clear stale continuation slots from a previously larger list.
    for i in chunks.len().max(1)..=MAX_EXTRA_SLOTS {
        store.remove(&slot_key(i));
    }

    Ok(())
}

/// Load the server list from the store.
///
/// Returns `Ok(None)` when nothing has ever been saved; a present but
/// corrupt payload is an error (callers decide whether that is fatal).
pub fn load_servers(store: &dyn SettingsStore) -> Result<Option<Vec<ServerConfig>>> {
    let Some(mut payload) = store.get(SERVERS_KEY) else {
        return Ok(None);
    };

    // Reassemble continuation slots in order; the first gap ends the payload.
    for i in 1..=MAX_EXTRA_SLOTS {
        match store.get(&slot_key(i)) {
            Some(chunk) => payload.push_str(&chunk),
            None => break,
        }
    }

    decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{DialectTag, ServerColor};
    use crate::store::MemoryStore;

    fn sample(n: usize) -> Vec<ServerConfig> {
        (0..n)
            .map(|i| {
                ServerConfig::new(format!("folder{}/srv{}", i % 3, i), "host.example.com", 5000 + i as u16)
                    .with_credentials(format!("user{}", i), "hunter2")
                    .with_dialect(if i % 2 == 0 { DialectTag::Kq } else { DialectTag::Postgres })
                    .with_color(ServerColor::Blue)
                    .with_database(format!("db{}", i))
            })
            .collect()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let servers = sample(5);
        let payload = encode(&servers).unwrap();
        assert!(payload.starts_with("gz1:"));
        assert_eq!(decode(&payload).unwrap(), servers);
    }

    #[test]
    fn test_empty_list_round_trip() {
        let payload = encode(&[]).unwrap();
        assert!(decode(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_store_round_trip_single_slot() {
        let store = MemoryStore::new();
        let servers = sample(3);
        save_servers(&store, &servers).unwrap();
        assert!(store.get("servers.1").is_none());
        assert_eq!(load_servers(&store).unwrap(), Some(servers));
    }

    #[test]
    fn test_store_round_trip_spanning_slots() {
        // A tiny limit forces the payload across several auxiliary keys.
        let store = MemoryStore::with_limit(64);
        let servers = sample(8);
        save_servers(&store, &servers).unwrap();
        assert!(store.get("servers.1").is_some());
        assert_eq!(load_servers(&store).unwrap(), Some(servers));
    }

    #[test]
    fn test_resave_clears_stale_slots() {
        let store = MemoryStore::with_limit(64);
        save_servers(&store, &sample(8)).unwrap();
        assert!(store.get("servers.1").is_some());

        save_servers(&store, &sample(1)).unwrap();
        assert!(store.get("servers.1").is_none());
        assert_eq!(load_servers(&store).unwrap(), Some(sample(1)));
    }

    #[test]
    fn test_capacity_error_writes_nothing() {
        let store = MemoryStore::with_limit(16);
        let err = save_servers(&store, &sample(50)).unwrap_err();
        assert!(matches!(err, QdeskError::Capacity(_)));
        assert!(err.to_string().contains("too many connections to save"));
        assert!(store.get(SERVERS_KEY).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_key_is_no_configuration() {
        let store = MemoryStore::new();
        assert_eq!(load_servers(&store).unwrap(), None);
    }

    #[test]
    fn test_corrupt_payload_is_error() {
        let store = MemoryStore::new();
        store.put(SERVERS_KEY, "gz1:@@not-base64@@").unwrap();
        assert!(load_servers(&store).is_err());
    }

    #[test]
    fn test_legacy_plaintext_decode() {
        let servers = sample(2);
        let text = toml::to_string(&ServerList {
            servers: servers.clone(),
        })
        .unwrap();

        let store = MemoryStore::with_limit(64 * 1024);
        store.put(SERVERS_KEY, &text).unwrap();
        assert_eq!(load_servers(&store).unwrap(), Some(servers));
    }

    #[test]
    fn test_legacy_encrypted_decode() {
        let servers = sample(2);
        let text = toml::to_string(&ServerList {
            servers: servers.clone(),
        })
        .unwrap();

        // Seal the way old releases wrote it: nonce || ciphertext || tag.
        let key = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &LEGACY_KEY).unwrap());
        let nonce_bytes = [7u8; NONCE_LEN];
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = text.into_bytes();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .unwrap();
        let mut raw = nonce_bytes.to_vec();
        raw.extend_from_slice(&in_out);
        let payload = format!("enc1:{}", BASE64.encode(raw));

        assert_eq!(decode(&payload).unwrap(), servers);
    }

    #[test]
    fn test_legacy_encrypted_corrupt_is_error() {
        assert!(decode("enc1:AAAA").is_err());
        assert!(decode("enc1:!!!").is_err());
    }
}
