//! Credential records and the store that holds them.
//!
//! Secrets are 32 random bytes rendered as 64 hex characters. Only a salted SHA-256 digest is
//! stored, next to the first [`PREFIX_LEN`] characters of the secret, which serve as a
//! non-secret lookup index. Verification hashes the presented secret with the stored salt and
//! compares digests in constant time.

use crate::clock::{Clock, SystemClock};
use crate::error::{Dependency, GatewayError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Random bytes per secret.
pub const SECRET_BYTES: usize = 32;
/// Length of the lookup prefix, in hex characters.
pub const PREFIX_LEN: usize = 8;

const DIGEST_VERSION: &str = "v1";
const SALT_BYTES: usize = 16;

/// Stored credential. Never carries the raw secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub secret_digest: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

impl Credential {
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            prefix: self.prefix.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            usage_count: self.usage_count,
        }
    }
}

/// Listing view of a credential, safe to return to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: String,
    pub name: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

/// Result of [`Keyring::issue`]. The only place the raw secret ever appears.
#[derive(Clone, Serialize)]
pub struct IssuedCredential {
    #[serde(flatten)]
    pub credential: CredentialSummary,
    #[serde(rename = "key")]
    pub secret: String,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("credential", &self.credential)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Fresh random secret.
pub fn generate_secret() -> String {
    hex::encode(rand::random::<[u8; SECRET_BYTES]>())
}

/// Lookup prefix of a presented secret, if it is long enough to have one.
pub fn secret_prefix(secret: &str) -> Option<&str> {
    secret.get(..PREFIX_LEN)
}

/// Salted one-way digest in the form `v1$<salt hex>$<sha256 hex>`.
pub fn digest_secret(secret: &str) -> String {
    let salt = rand::random::<[u8; SALT_BYTES]>();
    format!("{}${}${}", DIGEST_VERSION, hex::encode(salt), hex::encode(hash(&salt, secret)))
}

/// Check `secret` against a digest produced by [`digest_secret`].
pub fn verify_secret(secret: &str, digest: &str) -> bool {
    let mut parts = digest.splitn(3, '$');
    let (Some(DIGEST_VERSION), Some(salt), Some(expected)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(expected)) else {
        return false;
    };
    constant_time_eq(&hash(&salt, secret), &expected)
}

fn hash(salt: &[u8], secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Persistence for credential records.
///
/// Implementations must make `delete` visible to every later `find_by_prefix`.
#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    async fn insert(&self, credential: Credential) -> Result<(), StoreError>;

    /// Every record whose prefix equals `prefix`. Usually zero or one.
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Credential>, StoreError>;

    /// Bump usage count and set last-used time. Unknown ids are ignored.
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Credential>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Credential>, StoreError>;

    /// Hard delete. Returns whether a record existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Reachability check.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<String, Credential>,
    by_prefix: HashMap<String, Vec<String>>,
}

/// Process-local credential store with a prefix index.
#[derive(Debug, Clone)]
pub struct InMemoryCredentialStore {
    records: Arc<RwLock<Records>>,
    reachable: Arc<AtomicBool>,
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Records::default())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage; every operation fails with [`StoreError::Unavailable`] while false.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("credential store offline".into()))
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert(&self, credential: Credential) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.records.write().await;
        if records.by_id.contains_key(&credential.id) {
            return Err(StoreError::Backend(format!("duplicate credential id {}", credential.id)));
        }
        records.by_prefix.entry(credential.prefix.clone()).or_default().push(credential.id.clone());
        records.by_id.insert(credential.id.clone(), credential);
        Ok(())
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Credential>, StoreError> {
        self.check()?;
        let records = self.records.read().await;
        let found = records
            .by_prefix
            .get(prefix)
            .map(|ids| ids.iter().filter_map(|id| records.by_id.get(id).cloned()).collect())
            .unwrap_or_default();
        Ok(found)
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        if let Some(record) = self.records.write().await.by_id.get_mut(id) {
            record.usage_count = record.usage_count.saturating_add(1);
            record.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Credential>, StoreError> {
        self.check()?;
        Ok(self.records.read().await.by_id.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Credential>, StoreError> {
        self.check()?;
        Ok(self.records.read().await.by_id.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut records = self.records.write().await;
        let Some(removed) = records.by_id.remove(id) else {
            return Ok(false);
        };
        if let Some(ids) = records.by_prefix.get_mut(&removed.prefix) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                records.by_prefix.remove(&removed.prefix);
            }
        }
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// Credential lifecycle on top of a [`CredentialStore`]: issue, verify, list, revoke.
#[derive(Debug, Clone)]
pub struct Keyring {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl Keyring {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
    }

    /// Create a credential. The returned secret is not recoverable afterwards.
    pub async fn issue(&self, name: &str) -> Result<IssuedCredential, GatewayError> {
        let secret = generate_secret();
        let prefix = secret_prefix(&secret).unwrap_or_default().to_string();
        let credential = Credential {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            secret_digest: digest_secret(&secret),
            prefix,
            created_at: self.now(),
            last_used_at: None,
            usage_count: 0,
        };
        let summary = credential.summary();
        self.store.insert(credential).await.map_err(unavailable)?;
        tracing::info!(credential_id = %summary.id, prefix = %summary.prefix, "credential issued");
        Ok(IssuedCredential { credential: summary, secret })
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<CredentialSummary>, GatewayError> {
        let mut all = self.store.list().await.map_err(unavailable)?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all.iter().map(Credential::summary).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<CredentialSummary>, GatewayError> {
        Ok(self.store.get(id).await.map_err(unavailable)?.map(|c| c.summary()))
    }

    /// Hard-delete; affects every request admitted after this returns.
    pub async fn revoke(&self, id: &str) -> Result<bool, GatewayError> {
        let removed = self.store.delete(id).await.map_err(unavailable)?;
        if removed {
            tracing::info!(credential_id = %id, "credential revoked");
        }
        Ok(removed)
    }

    /// Resolve a presented secret to its stored record, if any.
    pub async fn verify(&self, secret: &str) -> Result<Option<Credential>, StoreError> {
        let Some(prefix) = secret_prefix(secret) else {
            return Ok(None);
        };
        let candidates = self.store.find_by_prefix(prefix).await?;
        Ok(candidates.into_iter().find(|c| verify_secret(secret, &c.secret_digest)))
    }

    /// Record a successful authentication.
    pub async fn record_use(&self, id: &str) -> Result<(), StoreError> {
        self.store.touch(id, self.now()).await
    }
}

fn unavailable(err: StoreError) -> GatewayError {
    GatewayError::dependency(Dependency::CredentialStore, err)
}
