//! Credential pool and failover router.
//!
//! For each (user, backend) pair the router picks the least recently used
//! healthy credential, dispatches through the matching adapter, and reacts
//! to the adapter's canonical failure kinds:
//!
//! - auth: quarantine with no reset, fail over to the next credential
//! - quota: quarantine until the backend's next reset hour, fail over
//! - transient: retry the same credential with backoff, then fail over
//!
//! Failover is bounded by `min(max_attempts, credentials held)`; transient
//! retries are bounded separately by [`RetryPolicy`].

mod retry;
mod sweeper;

pub use retry::RetryPolicy;
pub use sweeper::{QuotaSweeper, SweepReport, SweeperHandle};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use futures::StreamExt;
use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backends::{AdapterRegistry, Backend, ChunkStream, CompletionRequest, CompletionResponse};
use crate::config::RouterConfig;
use crate::error::{BackendError, DatabaseError, RouterError};
use crate::keys::parse_credentials;
use crate::store::{Credential, CredentialStatus, CredentialStore, QuarantineReason};

/// Next occurrence of `hour`:00:00 UTC strictly after `now`.
pub fn next_quota_reset(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// A credential picked for use, with its decrypted secret.
struct Selected {
    credential: Credential,
    secret: SecretString,
}

/// Outcome of importing one key from free text.
#[derive(Debug)]
pub struct ImportOutcome {
    pub label: String,
    pub backend: Backend,
    pub result: Result<i64, RouterError>,
}

type LockKey = (String, Backend);

/// Selects, validates, retries and quarantines per-user credentials.
pub struct CredentialRouter {
    store: Arc<dyn CredentialStore>,
    adapters: AdapterRegistry,
    config: RouterConfig,
    retry: RetryPolicy,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl CredentialRouter {
    pub fn new(store: Arc<dyn CredentialStore>, adapters: AdapterRegistry, config: RouterConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            store,
            adapters,
            config,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Store a new credential, enforcing the per-user cap.
    pub async fn add_credential(
        &self,
        user_id: &str,
        backend: Backend,
        secret: &SecretString,
    ) -> Result<i64, RouterError> {
        let held = self.store.list(user_id).await?.len();
        if held >= self.config.max_credentials_per_user {
            return Err(RouterError::CredentialLimit {
                user_id: user_id.to_string(),
                max: self.config.max_credentials_per_user,
            });
        }
        let id = self.store.create(user_id, backend, secret).await?;
        info!(user_id, backend = %backend, credential_id = id, "Credential added");
        Ok(id)
    }

    /// Parse `backend:key` pairs out of free text and store each one.
    pub async fn import(&self, user_id: &str, text: &str) -> Vec<ImportOutcome> {
        let mut outcomes = Vec::new();
        for key in parse_credentials(text) {
            let result = self
                .add_credential(user_id, key.backend, &SecretString::from(key.secret))
                .await;
            outcomes.push(ImportOutcome {
                label: key.label,
                backend: key.backend,
                result,
            });
        }
        outcomes
    }

    // ── Selection ───────────────────────────────────────────────────

    async fn lock_for(&self, key: &LockKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the map's entry once no other caller holds the lock, so the map
    /// only tracks pairs with a selection in flight.
    async fn release_lock(&self, key: &LockKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Pick a credential without reserving it.
    ///
    /// Pass 1 walks credentials in LRU order, skipping quarantined ones
    /// unless their quota reset has elapsed (those are restored first).
    /// Pass 2 falls back to the first credential quarantined without a
    /// reset time whose secret still decrypts. `None` when the user holds
    /// nothing usable.
    pub async fn select_credential(
        &self,
        user_id: &str,
        backend: Backend,
    ) -> Result<Option<Credential>, RouterError> {
        Ok(self
            .pick(user_id, backend, &HashSet::new(), false)
            .await?
            .map(|s| s.credential))
    }

    /// Selection under the (user, backend) lock. With `reserve`, the pick is
    /// marked used before the lock is released so concurrent callers move on
    /// to the next credential in LRU order.
    async fn pick(
        &self,
        user_id: &str,
        backend: Backend,
        exclude: &HashSet<i64>,
        reserve: bool,
    ) -> Result<Option<Selected>, RouterError> {
        let key = (user_id.to_string(), backend);
        let lock = self.lock_for(&key).await;
        let picked = {
            let _guard = lock.lock().await;
            self.pick_locked(user_id, backend, exclude, reserve).await
        };
        self.release_lock(&key, lock).await;
        picked
    }

    async fn pick_locked(
        &self,
        user_id: &str,
        backend: Backend,
        exclude: &HashSet<i64>,
        reserve: bool,
    ) -> Result<Option<Selected>, RouterError> {
        let mut credentials = self.store.list_for_backend(user_id, backend).await?;
        credentials.retain(|c| !exclude.contains(&c.id));
        credentials.sort_by_key(|c| (c.last_used_at, c.id));
        let now = Utc::now();

        for credential in &credentials {
            let mut credential = credential.clone();
            if credential.is_quarantined() {
                if !credential.quota_elapsed(now) {
                    continue;
                }
                self.store.restore(credential.id).await?;
                info!(user_id, backend = %backend, credential_id = credential.id, "Quota reset elapsed, credential restored");
                credential.status = CredentialStatus::Active;
                credential.quarantine_reason = None;
                credential.quota_reset_at = None;
            }
            if let Some(selected) = self.unlock(credential, reserve).await? {
                return Ok(Some(selected));
            }
        }

        let last_resort = credentials.iter().filter(|c| {
            c.is_quarantined()
                && c.quota_reset_at.is_none()
                && c.quarantine_reason != Some(QuarantineReason::DecryptionFailed)
        });
        for credential in last_resort {
            warn!(
                user_id,
                backend = %backend,
                credential_id = credential.id,
                reason = ?credential.quarantine_reason,
                "No healthy credential, using quarantined one as last resort"
            );
            if let Some(selected) = self.unlock(credential.clone(), reserve).await? {
                return Ok(Some(selected));
            }
        }

        Ok(None)
    }

    /// Decrypt the secret. A secret that no longer decrypts quarantines its
    /// credential and yields `None`.
    async fn unlock(&self, credential: Credential, reserve: bool) -> Result<Option<Selected>, RouterError> {
        match self.store.fetch_secret(credential.id).await {
            Ok(secret) => {
                if reserve {
                    self.store.touch_used(credential.id).await?;
                }
                Ok(Some(Selected { credential, secret }))
            }
            Err(DatabaseError::Crypto(e)) => {
                warn!(credential_id = credential.id, error = %e, "Credential secret failed to decrypt");
                self.store
                    .quarantine(credential.id, QuarantineReason::DecryptionFailed, None)
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Send `request` using one of the user's credentials for `backend`,
    /// failing over across credentials as needed.
    pub async fn dispatch(
        &self,
        user_id: &str,
        backend: Backend,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, RouterError> {
        let held = self.store.list_for_backend(user_id, backend).await?.len();
        let budget = self.config.max_attempts.min(held);
        let mut tried = HashSet::new();
        let mut attempts = 0;

        while attempts < budget {
            let Some(Selected { credential, secret }) =
                self.pick(user_id, backend, &tried, true).await?
            else {
                break;
            };
            attempts += 1;
            tried.insert(credential.id);

            let adapter = self
                .adapters
                .build(backend, secret)
                .ok_or(RouterError::UnsupportedBackend(backend))?;

            debug!(user_id, backend = %backend, credential_id = credential.id, attempt = attempts, "Dispatching");
            match self.retry.run(|| adapter.request(request)).await {
                Ok(response) => {
                    self.record_success(&credential, response.usage.total_tokens).await?;
                    return Ok(response);
                }
                Err(e) => {
                    warn!(user_id, backend = %backend, credential_id = credential.id, attempt = attempts, error = %e, "Dispatch attempt failed");
                    quarantine_for(self.store.as_ref(), credential.id, &e, self.config.reset_hour(backend)).await?;
                }
            }
        }

        Err(RouterError::CredentialsExhausted {
            user_id: user_id.to_string(),
            backend,
            attempts,
        })
    }

    async fn record_success(&self, credential: &Credential, tokens: u64) -> Result<(), RouterError> {
        if credential.is_quarantined() {
            self.store.restore(credential.id).await?;
            info!(credential_id = credential.id, "Last-resort credential succeeded, restored");
        }
        self.store.add_tokens(credential.id, tokens).await?;
        self.store.touch_used(credential.id).await?;
        Ok(())
    }

    /// Try each backend in the configured priority order, returning the first
    /// success with the backend that served it.
    pub async fn dispatch_any(
        &self,
        user_id: &str,
        request: &CompletionRequest,
    ) -> Result<(Backend, CompletionResponse), RouterError> {
        let mut failures = Vec::new();
        for &backend in &self.config.provider_priority {
            match self.dispatch(user_id, backend, request).await {
                Ok(response) => return Ok((backend, response)),
                Err(e @ RouterError::Store(_)) => return Err(e),
                Err(e) => {
                    debug!(user_id, backend = %backend, error = %e, "Backend failed, trying next");
                    failures.push((backend, e.to_string()));
                }
            }
        }
        Err(RouterError::AllBackendsFailed {
            user_id: user_id.to_string(),
            failures,
        })
    }

    /// Open a streaming completion on one credential. No failover happens
    /// once the stream is open; auth and quota errors surfaced mid-stream
    /// still quarantine the credential.
    pub async fn stream(
        &self,
        user_id: &str,
        backend: Backend,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, RouterError> {
        let Some(Selected { credential, secret }) =
            self.pick(user_id, backend, &HashSet::new(), true).await?
        else {
            return Err(RouterError::CredentialsExhausted {
                user_id: user_id.to_string(),
                backend,
                attempts: 0,
            });
        };
        let adapter = self
            .adapters
            .build(backend, secret)
            .ok_or(RouterError::UnsupportedBackend(backend))?;
        let reset_hour = self.config.reset_hour(backend);

        let inner = match self.retry.run(|| adapter.stream(request)).await {
            Ok(inner) => inner,
            Err(e) => {
                quarantine_for(self.store.as_ref(), credential.id, &e, reset_hour).await?;
                return Err(e.into());
            }
        };

        let state = StreamState {
            inner,
            store: Arc::clone(&self.store),
            credential_id: credential.id,
            reset_hour,
            finished: false,
        };
        Ok(Box::pin(futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), state)),
                Some(Err(e)) => {
                    state.finished = true;
                    if let Err(store_err) =
                        quarantine_for(state.store.as_ref(), state.credential_id, &e, state.reset_hour).await
                    {
                        warn!(credential_id = state.credential_id, error = %store_err, "Failed to record stream failure");
                    }
                    Some((Err(e), state))
                }
                None => {
                    if let Err(e) = state.store.touch_used(state.credential_id).await {
                        warn!(credential_id = state.credential_id, error = %e, "Failed to record stream completion");
                    }
                    None
                }
            }
        })))
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Probe the credential selection would pick. Auth and quota failures
    /// quarantine that credential and return `false`; transient failures
    /// propagate. Returns `false` when the user has no usable credential.
    pub async fn validate(&self, user_id: &str, backend: Backend) -> Result<bool, RouterError> {
        let Some(Selected { credential, secret }) =
            self.pick(user_id, backend, &HashSet::new(), false).await?
        else {
            return Ok(false);
        };
        let adapter = self
            .adapters
            .build(backend, secret)
            .ok_or(RouterError::UnsupportedBackend(backend))?;

        match adapter.test_credential().await {
            Ok(valid) => {
                if valid && credential.is_quarantined() {
                    self.store.restore(credential.id).await?;
                }
                Ok(valid)
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                quarantine_for(self.store.as_ref(), credential.id, &e, self.config.reset_hour(backend)).await?;
                Ok(false)
            }
        }
    }
}

struct StreamState {
    inner: ChunkStream,
    store: Arc<dyn CredentialStore>,
    credential_id: i64,
    reset_hour: u32,
    finished: bool,
}

/// Apply the quarantine rule for a failure kind. Transient failures never
/// quarantine.
async fn quarantine_for(
    store: &dyn CredentialStore,
    credential_id: i64,
    error: &BackendError,
    reset_hour: u32,
) -> Result<(), DatabaseError> {
    match error {
        BackendError::Auth { .. } => {
            store
                .quarantine(credential_id, QuarantineReason::Auth, None)
                .await
        }
        BackendError::Quota { .. } => {
            let reset_at = next_quota_reset(Utc::now(), reset_hour);
            store
                .quarantine(credential_id, QuarantineReason::Quota, Some(reset_at))
                .await
        }
        BackendError::Transient { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ChatMessage;
    use crate::backends::testing::{Script, Scripted};
    use crate::crypto::{AesGcmCipher, SecretCipher};
    use crate::error::CryptoError;
    use crate::store::LibSqlStore;
    use chrono::TimeZone;
    use secrecy::ExposeSecret;

    const USER: &str = "user-1";

    async fn store() -> Arc<LibSqlStore> {
        Arc::new(LibSqlStore::new_memory(Arc::new(AesGcmCipher::new(&[3u8; 32]).unwrap())).await.unwrap())
    }

    fn router(store: Arc<LibSqlStore>, script: &Arc<Script>) -> CredentialRouter {
        CredentialRouter::new(store, script.registry(&Backend::ALL), RouterConfig::default())
            .with_retry_policy(RetryPolicy::none())
    }

    async fn add(store: &LibSqlStore, backend: Backend, secret: &str) -> i64 {
        store.create(USER, backend, &SecretString::from(secret)).await.unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("llama-3.3-70b-versatile", vec![ChatMessage::user("hi")])
    }

    #[test]
    fn quota_reset_today_or_tomorrow() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 5, 30, 0).unwrap();
        assert_eq!(next_quota_reset(early, 8), Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap());

        let late = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(next_quota_reset(late, 8), Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());

        let exact = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(next_quota_reset(exact, 0), Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn select_prefers_least_recently_used() {
        let store = store().await;
        let a = add(&store, Backend::Groq, "key-a").await;
        let b = add(&store, Backend::Groq, "key-b").await;
        store.touch_used(a).await.unwrap();

        let router = router(store.clone(), &Script::new());
        let picked = router.select_credential(USER, Backend::Groq).await.unwrap().unwrap();
        assert_eq!(picked.id, b);
    }

    #[tokio::test]
    async fn select_none_without_credentials() {
        let store = store().await;
        add(&store, Backend::Gemini, "gemini-key").await;
        let router = router(store, &Script::new());
        assert!(router.select_credential(USER, Backend::Groq).await.unwrap().is_none());
        assert!(router.select_credential("someone-else", Backend::Gemini).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn select_skips_future_quota_reset() {
        let store = store().await;
        let id = add(&store, Backend::Groq, "key-a").await;
        store
            .quarantine(id, QuarantineReason::Quota, Some(Utc::now() + Duration::hours(2)))
            .await
            .unwrap();

        let router = router(store, &Script::new());
        assert!(router.select_credential(USER, Backend::Groq).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn select_restores_elapsed_quota() {
        let store = store().await;
        let id = add(&store, Backend::Groq, "key-a").await;
        store
            .quarantine(id, QuarantineReason::Quota, Some(Utc::now() - Duration::minutes(1)))
            .await
            .unwrap();

        let router = router(store.clone(), &Script::new());
        let picked = router.select_credential(USER, Backend::Groq).await.unwrap().unwrap();
        assert_eq!(picked.id, id);
        assert_eq!(picked.status, CredentialStatus::Active);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn select_falls_back_to_quarantined_without_reset() {
        let store = store().await;
        let auth = add(&store, Backend::Groq, "key-auth").await;
        let quota = add(&store, Backend::Groq, "key-quota").await;
        store.quarantine(auth, QuarantineReason::Auth, None).await.unwrap();
        store
            .quarantine(quota, QuarantineReason::Quota, Some(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        let router = router(store, &Script::new());
        let picked = router.select_credential(USER, Backend::Groq).await.unwrap().unwrap();
        assert_eq!(picked.id, auth);
        assert!(picked.is_quarantined());
    }

    #[tokio::test]
    async fn quota_failure_fails_over_to_second_credential() {
        let store = store().await;
        let c1 = add(&store, Backend::Groq, "key-1").await;
        let c2 = add(&store, Backend::Groq, "key-2").await;
        let script = Script::new();
        script.on("key-1", vec![Scripted::Quota]);
        script.on("key-2", vec![Scripted::Reply("from c2".into())]);

        let router = router(store.clone(), &script);
        let response = router.dispatch(USER, Backend::Groq, &request()).await.unwrap();
        assert_eq!(response.output, "from c2");

        let first = store.get(c1).await.unwrap().unwrap();
        assert_eq!(first.quarantine_reason, Some(QuarantineReason::Quota));
        assert!(first.quota_reset_at.unwrap() > Utc::now());

        let second = store.get(c2).await.unwrap().unwrap();
        assert_eq!(second.status, CredentialStatus::Active);
        assert_eq!(second.tokens_used_today, 10);
        assert!(second.last_used_at.is_some());
        assert_eq!(script.call_secrets(), vec!["key-1", "key-2"]);
    }

    #[tokio::test]
    async fn all_auth_failures_exhaust_after_n_attempts() {
        let store = store().await;
        let script = Script::new();
        for secret in ["k1", "k2", "k3"] {
            add(&store, Backend::Groq, secret).await;
            script.on(secret, vec![Scripted::Auth]);
        }

        let router = router(store.clone(), &script);
        let err = router.dispatch(USER, Backend::Groq, &request()).await.unwrap_err();
        assert!(matches!(err, RouterError::CredentialsExhausted { attempts: 3, .. }));
        assert_eq!(script.calls().len(), 3);
        for credential in store.list(USER).await.unwrap() {
            assert_eq!(credential.quarantine_reason, Some(QuarantineReason::Auth));
            assert!(credential.quota_reset_at.is_none());
        }
    }

    #[tokio::test]
    async fn attempts_capped_by_configured_ceiling() {
        let store = store().await;
        let script = Script::new();
        for i in 0..7 {
            let secret = format!("key-{i}");
            add(&store, Backend::Groq, &secret).await;
            script.on(&secret, vec![Scripted::Auth]);
        }
        let router = router(store, &script);
        let err = router.dispatch(USER, Backend::Groq, &request()).await.unwrap_err();
        assert!(matches!(err, RouterError::CredentialsExhausted { attempts: 5, .. }));
        assert_eq!(script.calls().len(), 5);
    }

    #[tokio::test]
    async fn zero_credentials_exhaust_immediately() {
        let store = store().await;
        let script = Script::new();
        let router = router(store, &script);
        let err = router.dispatch(USER, Backend::Groq, &request()).await.unwrap_err();
        assert!(matches!(err, RouterError::CredentialsExhausted { attempts: 0, .. }));
        assert!(script.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_retries_same_credential_without_quarantine() {
        let store = store().await;
        let id = add(&store, Backend::Groq, "key-1").await;
        let script = Script::new();
        script.on(
            "key-1",
            vec![Scripted::Transient, Scripted::Transient, Scripted::Reply("third time".into())],
        );

        let router = CredentialRouter::new(store.clone(), script.registry(&[Backend::Groq]), RouterConfig::default());
        let response = router.dispatch(USER, Backend::Groq, &request()).await.unwrap();
        assert_eq!(response.output, "third time");
        assert_eq!(script.calls().len(), 3);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, CredentialStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_fails_over_without_quarantine() {
        let store = store().await;
        let c1 = add(&store, Backend::Groq, "key-1").await;
        add(&store, Backend::Groq, "key-2").await;
        let script = Script::new();
        script.on("key-1", vec![Scripted::Transient]);

        let router = CredentialRouter::new(store.clone(), script.registry(&[Backend::Groq]), RouterConfig::default());
        let response = router.dispatch(USER, Backend::Groq, &request()).await.unwrap();
        assert_eq!(response.output, "ok");
        // 1 + transient_retries on key-1, then one call on key-2.
        assert_eq!(script.call_secrets(), vec!["key-1", "key-1", "key-1", "key-2"]);
        assert_eq!(store.get(c1).await.unwrap().unwrap().status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn last_resort_success_restores_credential() {
        let store = store().await;
        let id = add(&store, Backend::Groq, "key-1").await;
        store.quarantine(id, QuarantineReason::Auth, None).await.unwrap();

        let router = router(store.clone(), &Script::new());
        router.dispatch(USER, Backend::Groq, &request()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().status, CredentialStatus::Active);
    }

    /// Refuses to decrypt one particular secret.
    struct FailsOn(AesGcmCipher, &'static [u8]);

    impl SecretCipher for FailsOn {
        fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            self.0.encrypt(plaintext)
        }
        fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
            let plain = self.0.decrypt(blob)?;
            if plain == self.1 {
                return Err(CryptoError::Decrypt("bad tag".into()));
            }
            Ok(plain)
        }
    }

    async fn store_failing_on(secret: &'static [u8]) -> Arc<LibSqlStore> {
        Arc::new(
            LibSqlStore::new_memory(Arc::new(FailsOn(AesGcmCipher::new(&[9u8; 32]).unwrap(), secret)))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn undecryptable_secret_is_quarantined_and_skipped() {
        let store = store_failing_on(b"broken-key").await;
        let broken = add(&store, Backend::Groq, "broken-key").await;
        let good = add(&store, Backend::Groq, "good-key").await;

        let router = router(store.clone(), &Script::new());
        let picked = router.select_credential(USER, Backend::Groq).await.unwrap().unwrap();
        assert_eq!(picked.id, good);
        let broken = store.get(broken).await.unwrap().unwrap();
        assert_eq!(broken.quarantine_reason, Some(QuarantineReason::DecryptionFailed));
    }

    #[tokio::test]
    async fn last_resort_moves_past_undecryptable_secret() {
        let store = store_failing_on(b"broken-key").await;
        let broken = add(&store, Backend::Groq, "broken-key").await;
        let good = add(&store, Backend::Groq, "good-key").await;
        store.quarantine(broken, QuarantineReason::Auth, None).await.unwrap();
        store.quarantine(good, QuarantineReason::Auth, None).await.unwrap();

        let script = Script::new();
        let router = router(store.clone(), &script);
        let picked = router.select_credential(USER, Backend::Groq).await.unwrap().unwrap();
        assert_eq!(picked.id, good);
        assert_eq!(
            store.get(broken).await.unwrap().unwrap().quarantine_reason,
            Some(QuarantineReason::DecryptionFailed)
        );

        router.dispatch(USER, Backend::Groq, &request()).await.unwrap();
        assert_eq!(script.call_secrets(), vec!["good-key"]);
        assert_eq!(store.get(good).await.unwrap().unwrap().status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn lock_map_is_pruned_after_use() {
        let store = store().await;
        add(&store, Backend::Groq, "key-1").await;
        let router = router(store, &Script::new());

        router.dispatch(USER, Backend::Groq, &request()).await.unwrap();
        router.select_credential("someone-else", Backend::Gemini).await.unwrap();
        assert!(router.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_dispatches_spread_across_credentials() {
        let store = store().await;
        add(&store, Backend::Groq, "key-1").await;
        add(&store, Backend::Groq, "key-2").await;
        let script = Script::new();
        let router = router(store, &script);

        let (req_a, req_b) = (request(), request());
        let (a, b) = tokio::join!(
            router.dispatch(USER, Backend::Groq, &req_a),
            router.dispatch(USER, Backend::Groq, &req_b)
        );
        a.unwrap();
        b.unwrap();
        let mut secrets = script.call_secrets();
        secrets.sort();
        assert_eq!(secrets, vec!["key-1", "key-2"]);
    }

    #[tokio::test]
    async fn validate_quarantines_on_auth() {
        let store = store().await;
        let id = add(&store, Backend::OpenRouter, "sk-or-bad").await;
        let script = Script::new();
        script.on("sk-or-bad", vec![Scripted::Auth]);

        let router = router(store.clone(), &script);
        assert!(!router.validate(USER, Backend::OpenRouter).await.unwrap());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().quarantine_reason,
            Some(QuarantineReason::Auth)
        );
    }

    #[tokio::test]
    async fn validate_quarantines_on_quota() {
        let store = store().await;
        let id = add(&store, Backend::Groq, "gsk-spent").await;
        let script = Script::new();
        script.on("gsk-spent", vec![Scripted::Quota]);

        let router = router(store.clone(), &script);
        assert!(!router.validate(USER, Backend::Groq).await.unwrap());
        let credential = store.get(id).await.unwrap().unwrap();
        assert_eq!(credential.status, CredentialStatus::Quarantined);
        assert_eq!(credential.quarantine_reason, Some(QuarantineReason::Quota));
        assert!(credential.quota_reset_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn validate_leaves_other_credentials_alone() {
        let store = store().await;
        let checked = add(&store, Backend::Groq, "gsk-bad").await;
        let sibling = add(&store, Backend::Groq, "gsk-other").await;
        let elsewhere = add(&store, Backend::Gemini, "AIza-other").await;
        store.touch_used(sibling).await.unwrap();
        let script = Script::new();
        script.on("gsk-bad", vec![Scripted::Auth]);

        let before: Vec<Credential> = vec![
            store.get(sibling).await.unwrap().unwrap(),
            store.get(elsewhere).await.unwrap().unwrap(),
        ];
        let router = router(store.clone(), &script);
        assert!(!router.validate(USER, Backend::Groq).await.unwrap());

        assert_eq!(script.call_secrets(), vec!["gsk-bad"]);
        assert!(store.get(checked).await.unwrap().unwrap().is_quarantined());
        let after: Vec<Credential> = vec![
            store.get(sibling).await.unwrap().unwrap(),
            store.get(elsewhere).await.unwrap().unwrap(),
        ];
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn validate_success_and_transient() {
        let store = store().await;
        add(&store, Backend::Gemini, "AIza-good").await;
        add(&store, Backend::Groq, "gsk-flaky").await;
        let script = Script::new();
        script.on("gsk-flaky", vec![Scripted::Transient]);

        let router = router(store, &script);
        assert!(router.validate(USER, Backend::Gemini).await.unwrap());
        assert!(matches!(
            router.validate(USER, Backend::Groq).await,
            Err(RouterError::Backend(BackendError::Transient { .. }))
        ));
        assert!(!router.validate(USER, Backend::OpenAi).await.unwrap());
    }

    #[tokio::test]
    async fn dispatch_any_walks_priority_order() {
        let store = store().await;
        add(&store, Backend::Groq, "gsk-quota").await;
        add(&store, Backend::Gemini, "AIza-works").await;
        let script = Script::new();
        script.on("gsk-quota", vec![Scripted::Quota]);
        script.on("AIza-works", vec![Scripted::Reply("gemini says hi".into())]);

        let router = router(store, &script);
        let (backend, response) = router.dispatch_any(USER, &request()).await.unwrap();
        assert_eq!(backend, Backend::Gemini);
        assert_eq!(response.output, "gemini says hi");
    }

    #[tokio::test]
    async fn dispatch_any_reports_every_failure() {
        let store = store().await;
        let router = router(store, &Script::new());
        match router.dispatch_any(USER, &request()).await {
            Err(RouterError::AllBackendsFailed { failures, .. }) => {
                let backends: Vec<Backend> = failures.iter().map(|(b, _)| *b).collect();
                assert_eq!(backends, vec![Backend::Groq, Backend::OpenRouter, Backend::Gemini]);
            }
            other => panic!("expected AllBackendsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_yields_chunks_and_marks_used() {
        let store = store().await;
        let id = add(&store, Backend::Groq, "key-1").await;
        let script = Script::new();
        script.on("key-1", vec![Scripted::Reply("abc".into())]);

        let router = router(store.clone(), &script);
        let chunks: Vec<String> = router
            .stream(USER, Backend::Groq, &request())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.concat(), "abc");
        assert!(store.get(id).await.unwrap().unwrap().last_used_at.is_some());
    }

    #[tokio::test]
    async fn stream_open_quota_quarantines() {
        let store = store().await;
        let id = add(&store, Backend::Groq, "key-1").await;
        let script = Script::new();
        script.on("key-1", vec![Scripted::Quota]);

        let router = router(store.clone(), &script);
        assert!(router.stream(USER, Backend::Groq, &request()).await.is_err());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().quarantine_reason,
            Some(QuarantineReason::Quota)
        );
    }

    #[tokio::test]
    async fn credential_cap_and_import() {
        let store = store().await;
        let config = RouterConfig {
            max_credentials_per_user: 2,
            ..RouterConfig::default()
        };
        let router = CredentialRouter::new(store.clone(), Script::new().registry(&Backend::ALL), config);

        let outcomes = router
            .import(USER, "groq:gsk_aaaaaaaaaaaa openrouter:\"sk-or-bbbbbbbb\" google=AIzaCCCCCCCCCC")
            .await;
        assert_eq!(outcomes.len(), 3);
        let stored = outcomes.iter().filter(|o| o.result.is_ok()).count();
        assert_eq!(stored, 2);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o.result, Err(RouterError::CredentialLimit { max: 2, .. }))));

        let secrets: Vec<String> = {
            let mut out = Vec::new();
            for credential in store.list(USER).await.unwrap() {
                out.push(store.fetch_secret(credential.id).await.unwrap().expose_secret().to_string());
            }
            out
        };
        assert_eq!(secrets.len(), 2);
    }
}
