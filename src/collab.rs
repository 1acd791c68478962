//! External collaborators: object storage and usage limits.
//!
//! The pipeline only needs narrow interfaces to both. Storage internals,
//! signed-URL minting, plan accounting and billing live elsewhere; the
//! implementations here cover the CLI (a local directory, no limits) and
//! tests.

use crate::dispatch::PlanTier;
use crate::error::Zpl2PdfError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ── Storage ──────────────────────────────────────────────────────────────

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    pub size: u64,
}

/// A time-limited download link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Where finished documents and archives go.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under a fresh key.
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<StoredObject, Zpl2PdfError>;

    /// Mint a download URL valid for `ttl`.
    async fn sign(&self, object: &StoredObject, ttl: Duration) -> Result<SignedUrl, Zpl2PdfError>;
}

/// Stores objects as files in one directory; URLs are `file://` paths.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path of a stored object.
    pub fn path_of(&self, object: &StoredObject) -> PathBuf {
        self.root.join(&object.key)
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "application/pdf" => "pdf",
        "application/gzip" => "tar.gz",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        _ => "bin",
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<StoredObject, Zpl2PdfError> {
        let key = format!("{}.{}", uuid::Uuid::new_v4(), extension_for(content_type));
        let path = self.root.join(&key);
        let size = bytes.len() as u64;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Zpl2PdfError::StorageFailed(format!("{}: {e}", self.root.display())))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Zpl2PdfError::StorageFailed(format!("{}: {e}", path.display())))?;

        debug!("Stored {} ({} bytes)", path.display(), size);
        Ok(StoredObject {
            key,
            content_type: content_type.to_string(),
            size,
        })
    }

    async fn sign(&self, object: &StoredObject, ttl: Duration) -> Result<SignedUrl, Zpl2PdfError> {
        let path = self.path_of(object);
        if !path.exists() {
            return Err(Zpl2PdfError::StorageFailed(format!(
                "cannot sign missing object '{}'",
                object.key
            )));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Zpl2PdfError::StorageFailed(format!("invalid ttl: {e}")))?;
        Ok(SignedUrl {
            url: format!("file://{}", path.display()),
            expires_at: Utc::now() + ttl,
        })
    }
}

// ── Usage ────────────────────────────────────────────────────────────────

/// Why a conversion was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    MonthlyLimitReached,
    PlanDoesNotAllowFormat,
    AccountSuspended,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::MonthlyLimitReached => write!(f, "monthly label limit reached"),
            DenialReason::PlanDoesNotAllowFormat => write!(f, "plan does not allow this format"),
            DenialReason::AccountSuspended => write!(f, "account suspended"),
        }
    }
}

/// Outcome of a capability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageDecision {
    Allowed,
    Denied {
        reason: DenialReason,
        used: u64,
        limit: u64,
    },
}

/// One completed conversion, as reported to the usage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub tier: PlanTier,
    pub job_id: String,
    pub label_count: usize,
    pub output_format: crate::config::OutputFormat,
    pub completed_at: DateTime<Utc>,
}

/// Plan/usage accounting.
#[async_trait]
pub trait UsageGate: Send + Sync {
    /// Check before any render work is done.
    async fn can_convert(&self, user_id: &str, label_count: usize) -> Result<UsageDecision, Zpl2PdfError>;

    /// Report a finished conversion.
    async fn record_conversion(&self, record: UsageRecord) -> Result<(), Zpl2PdfError>;
}

/// Allows everything and records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedUsage;

#[async_trait]
impl UsageGate for UnlimitedUsage {
    async fn can_convert(&self, _user_id: &str, _label_count: usize) -> Result<UsageDecision, Zpl2PdfError> {
        Ok(UsageDecision::Allowed)
    }

    async fn record_conversion(&self, _record: UsageRecord) -> Result<(), Zpl2PdfError> {
        Ok(())
    }
}

/// Report usage without waiting; failures are logged and dropped.
pub fn record_in_background(gate: Arc<dyn UsageGate>, record: UsageRecord) {
    tokio::spawn(async move {
        let job_id = record.job_id.clone();
        if let Err(e) = gate.record_conversion(record).await {
            warn!(job_id = %job_id, "Failed to record usage: {}", e);
        }
    });
}
