//! Rudder persistence: SQLite-backed audit records for applied policies.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use metrics::{counter, histogram};
use rudder_core::{AuditStore, ReconcileError};
use serde_json::Value as Json;
use tracing::{debug, info};

/// One stored audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub handle: String,
    pub key: String,
    pub written_at: DateTime<Utc>,
    pub body: Json,
}

impl AuditRecord {
    /// Serialized bodies longer than this are stored zstd-compressed when the
    /// `zstd` feature is on. Short records stay readable with the sqlite shell.
    pub const COMPRESS_ABOVE: usize = 4096;
}

const ENC_JSON: &str = "json";
#[cfg_attr(not(feature = "zstd"), allow(dead_code))]
const ENC_ZSTD: &str = "zstd";

fn encode_body(body: &Json) -> Result<(&'static str, Vec<u8>)> {
    let text = serde_json::to_vec(body)?;
    #[cfg(feature = "zstd")]
    if text.len() > AuditRecord::COMPRESS_ABOVE {
        return Ok((ENC_ZSTD, zstd::encode_all(text.as_slice(), 3).context("compressing audit body")?));
    }
    Ok((ENC_JSON, text))
}

fn decode_body(encoding: &str, blob: &[u8]) -> Result<Json> {
    match encoding {
        ENC_JSON => Ok(serde_json::from_slice(blob)?),
        #[cfg(feature = "zstd")]
        ENC_ZSTD => Ok(serde_json::from_slice(&zstd::decode_all(blob).context("decompressing audit body")?)?),
        other => bail!("unsupported audit body encoding {other:?}"),
    }
}

/// SQLite store keyed by `(handle, key)`. A handle's records are always
/// replaced as one set.
pub struct SqliteAuditStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let started = std::time::Instant::now();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS audit_records (
                handle     TEXT NOT NULL,
                key        TEXT NOT NULL,
                written_at INTEGER NOT NULL,
                encoding   TEXT NOT NULL,
                body       BLOB NOT NULL,
                PRIMARY KEY (handle, key)
            )",
            [],
        )
        .context("creating audit_records table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path.display(), "audit store opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Delete every record of `handle` and insert `records` in one transaction.
    pub fn replace_records(&self, handle: &str, records: &BTreeMap<String, Json>) -> Result<()> {
        let started = std::time::Instant::now();
        let now = Utc::now().timestamp_millis();
        let mut db = self.conn();
        let tx = db.transaction().context("starting audit transaction")?;
        let removed = tx.execute("DELETE FROM audit_records WHERE handle = ?1", [handle])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO audit_records(handle, key, written_at, encoding, body) VALUES (?1, ?2, ?3, ?4, ?5)")?;
            for (key, body) in records {
                let (encoding, blob) = encode_body(body)?;
                stmt.execute((handle, key, now, encoding, &blob))
                    .with_context(|| format!("writing audit record {handle}/{key}"))?;
            }
        }
        tx.commit().with_context(|| format!("committing audit records for {handle}"))?;
        histogram!("persist_replace_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_records_written_total", records.len() as u64);
        debug!(handle, removed, written = records.len(), "audit records replaced");
        Ok(())
    }

    /// Records for one handle in key order.
    pub fn records(&self, handle: &str) -> Result<Vec<AuditRecord>> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let mut stmt =
            db.prepare("SELECT key, written_at, encoding, body FROM audit_records WHERE handle = ?1 ORDER BY key ASC")?;
        let mut rows = stmt.query([handle])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let millis: i64 = row.get(1)?;
            let encoding: String = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            let body = decode_body(&encoding, &blob).with_context(|| format!("decoding record {key}"))?;
            let written_at = Utc.timestamp_millis_opt(millis).single().unwrap_or_default();
            out.push(AuditRecord { handle: handle.to_string(), key, written_at, body });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(handle, count = out.len(), "audit records loaded");
        Ok(out)
    }

    pub fn handles(&self) -> Result<Vec<String>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT DISTINCT handle FROM audit_records ORDER BY handle")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[async_trait::async_trait]
impl AuditStore for SqliteAuditStore {
    async fn replace_all(&self, handle: &str, records: &BTreeMap<String, Json>) -> rudder_core::Result<()> {
        self.replace_records(handle, records).map_err(store_err)
    }

    async fn get_all(&self, handle: &str) -> rudder_core::Result<BTreeMap<String, Json>> {
        let recs = self.records(handle).map_err(store_err)?;
        Ok(recs.into_iter().map(|r| (r.key, r.body)).collect())
    }
}

fn store_err(e: anyhow::Error) -> ReconcileError {
    ReconcileError::Store(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WEB: &str = "application-policies-default-web";

    fn set(entries: &[(&str, Json)]) -> BTreeMap<String, Json> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn replace_drops_keys_from_the_previous_pass() {
        let dir = tempfile::tempdir().unwrap();
        let s = SqliteAuditStore::open(dir.path().join("audit.db")).unwrap();
        s.replace_all(WEB, &set(&[("002-pb", json!({"v": 2})), ("001-pa", json!({"v": 1}))])).await.unwrap();
        s.replace_all("application-policies-default-api", &set(&[("001-pa", json!({}))])).await.unwrap();

        let first: Vec<_> = s.get_all(WEB).await.unwrap().into_keys().collect();
        assert_eq!(first, vec!["001-pa", "002-pb"]);

        s.replace_all(WEB, &set(&[("001-pb", json!({"v": 3}))])).await.unwrap();
        let all = s.get_all(WEB).await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["001-pb"]);
        assert_eq!(all["001-pb"], json!({"v": 3}));
        assert_eq!(s.handles().unwrap().len(), 2);

        s.replace_all(WEB, &BTreeMap::new()).await.unwrap();
        assert!(s.records(WEB).unwrap().is_empty());
        assert_eq!(s.handles().unwrap(), vec!["application-policies-default-api"]);
    }

    #[tokio::test]
    async fn large_bodies_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = SqliteAuditStore::open(dir.path().join("nested").join("audit.db")).unwrap();
        let big = json!({"diff": "x".repeat(AuditRecord::COMPRESS_ABOVE * 2)});
        s.replace_all(WEB, &set(&[("001-big", big.clone()), ("002-small", json!({"ok": true}))])).await.unwrap();

        let recs = s.records(WEB).unwrap();
        assert_eq!(recs[0].body, big);
        assert_eq!(recs[1].body, json!({"ok": true}));
        assert!(recs[0].written_at <= Utc::now());

        let encoding: String = s
            .conn()
            .query_row("SELECT encoding FROM audit_records WHERE key = '001-big'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(encoding, if cfg!(feature = "zstd") { ENC_ZSTD } else { ENC_JSON });
    }

    #[test]
    fn unknown_encoding_is_an_error() {
        assert!(decode_body("gzip", b"{}").is_err());
        assert_eq!(decode_body(ENC_JSON, br#"{"a":1}"#).unwrap(), json!({"a": 1}));
    }
}
