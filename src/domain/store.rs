//! ClusterStore — durable, encrypted-at-rest record of completed clusters.
//!
//! One JSON array of cluster records on disk. Writers serialize through a
//! single lock and perform one read-modify-write over the raw (encrypted)
//! records, so sibling records are never decrypted and re-encrypted and
//! concurrent upserts cannot silently drop each other's updates.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use super::crypto::SecretCipher;
use super::types::{Cluster, Node};

pub struct ClusterStore {
    path: PathBuf,
    cipher: SecretCipher,
    write_lock: Mutex<()>,
}

impl ClusterStore {
    pub fn new(path: PathBuf, cipher: SecretCipher) -> Self {
        Self {
            path,
            cipher,
            write_lock: Mutex::new(()),
        }
    }

    /// Load all records with node credentials decrypted. Records that fail to
    /// parse are skipped with a warning, never invented.
    pub async fn list(&self) -> Result<Vec<Cluster>> {
        let mut clusters = Vec::new();
        for mut record in self.read_raw().await? {
            transform_secrets(&mut record, &|s| self.cipher.decrypt(s));
            match serde_json::from_value::<Cluster>(record) {
                Ok(cluster) => clusters.push(cluster),
                Err(e) => warn!(error = %e, "skipping unparsable cluster record"),
            }
        }
        Ok(clusters)
    }

    /// Insert or update by cluster identity (id match OR first-master address
    /// match). The whole read-modify-write runs inside the write lock.
    pub async fn upsert(&self, cluster: &Cluster) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.read_raw().await?;
        let mut record = serde_json::to_value(cluster).context("serializing cluster")?;
        transform_secrets(&mut record, &|s| self.cipher.encrypt(s));
        record["updatedAt"] = json!(Utc::now());

        let first_ip = cluster.master_nodes.first().map(|n| n.ip.clone());
        let existing = records.iter().position(|r| {
            r["id"] == cluster.id.as_str()
                || first_ip
                    .as_deref()
                    .is_some_and(|ip| r["masterNodes"][0]["ip"] == ip)
        });

        match existing {
            Some(idx) => {
                // Shallow merge into the still-encrypted record; untouched
                // fields (createdAt in particular) survive as-is.
                if let (Some(target), Some(update)) =
                    (records[idx].as_object_mut(), record.as_object())
                {
                    for (key, value) in update {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            None => {
                record["createdAt"] = json!(Utc::now());
                records.push(record);
            }
        }

        self.write_raw(&records).await
    }

    /// Remove a record by id. Returns whether a record was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.read_raw().await?;
        let before = records.len();
        records.retain(|r| r["id"] != id);
        if records.len() == before {
            return Ok(false);
        }
        self.write_raw(&records).await?;
        Ok(true)
    }

    async fn read_raw(&self) -> Result<Vec<Value>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn write_raw(&self, records: &[Value]) -> Result<()> {
        let content =
            serde_json::to_string_pretty(records).context("serializing cluster records")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        // Write to a temporary file first, then atomically rename so readers
        // never observe a half-written store.
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .with_context(|| format!("writing temp file {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| {
                format!("renaming {} to {}", tmp_path.display(), self.path.display())
            })?;

        Ok(())
    }
}

/// Apply `f` to every node credential string in a raw cluster record.
fn transform_secrets(record: &mut Value, f: &dyn Fn(&str) -> String) {
    for key in ["masterNodes", "workerNodes"] {
        let Some(nodes) = record.get_mut(key).and_then(Value::as_array_mut) else {
            continue;
        };
        for node in nodes {
            let Some(secret) = node.get_mut("authSecret").and_then(Value::as_object_mut) else {
                continue;
            };
            for value in secret.values_mut() {
                if let Value::String(s) = value {
                    *s = f(s);
                }
            }
        }
    }
}

/// Union of node lists keyed by address; the incoming entry wins on conflict.
pub fn merge_nodes(existing: &[Node], incoming: &[Node]) -> Vec<Node> {
    let mut merged: Vec<Node> = existing.to_vec();
    for node in incoming {
        match merged.iter_mut().find(|n| n.ip == node.ip) {
            Some(slot) => *slot = node.clone(),
            None => merged.push(node.clone()),
        }
    }
    merged
}
