//! Request broker: pending user-approval requests, authorized origins and
//! known chain metadata.
//!
//! Pending requests live in memory only. Every mutation republishes the
//! affected queue through a `watch` channel and mirrors it to the local store
//! so the popup can render it.

pub mod queue;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ExtensionError, Result};
use crate::keyring::AccountJson;
use crate::messages::{InjectedMetadataKnown, MetadataDef, RequestAuthorizeTab, ResponseSigning};
use crate::ports::PortKey;
use crate::signing::{SignerPayloadJson, SigningPayload};
use crate::storage::{get_typed, put_typed, KvStore};
use crate::util::now_ms;

pub use queue::{Completion, RequestQueue, RequestView};

pub const AUTH_URLS_KEY: &str = "authUrls";
pub const CHAIN_METADATA_KEY: &str = "chainMetadata";
pub const AUTH_REQUESTS_KEY: &str = "authRequests";
pub const METADATA_REQUESTS_KEY: &str = "metadataRequests";
pub const SIGN_REQUESTS_KEY: &str = "signRequests";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthUrlInfo {
    pub id: String,
    pub count: u64,
    /// Display name the dapp announced.
    pub origin: String,
    pub url: String,
    pub authorized_accounts: Vec<String>,
    pub last_auth: u64,
}

pub type AuthUrls = BTreeMap<String, AuthUrlInfo>;

/// Account and payload of a pending signature.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SignRequest {
    pub account: AccountJson,
    pub request: SigningPayload,
}

pub type AuthorizeRequest = RequestView<RequestAuthorizeTab>;
pub type MetadataRequest = RequestView<MetadataDef>;
pub type SigningRequest = RequestView<SignRequest>;

/// Serialized origin of a page URL: lowercase scheme and host, no userinfo,
/// default ports dropped. Schemes without a tuple origin (extension pages)
/// keep `scheme://host`.
pub fn url_origin(raw: &str) -> Result<String> {
    let url = Url::parse(raw).map_err(|e| ExtensionError::InvalidRequest(format!("origin {}: {}", raw, e)))?;
    let origin = url.origin();
    if origin.is_tuple() {
        return Ok(origin.ascii_serialization());
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(format!("{}://{}", url.scheme(), host.to_ascii_lowercase())),
        _ => Err(ExtensionError::InvalidRequest(format!("origin {} has no host", raw))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn load_record<T: DeserializeOwned + Default>(store: &dyn KvStore, key: &str) -> Result<T> {
    match get_typed::<T>(store, key).await {
        Ok(value) => Ok(value.unwrap_or_default()),
        Err(ExtensionError::SchemaValidationFailure(_)) => {
            warn!("Stored {} failed schema validation, starting empty", key);
            Ok(T::default())
        }
        Err(e) => Err(e),
    }
}

pub struct State {
    store: Arc<dyn KvStore>,
    auth_urls: tokio::sync::Mutex<AuthUrls>,
    chain_metadata: tokio::sync::Mutex<BTreeMap<String, MetadataDef>>,
    auth_requests: Mutex<RequestQueue<RequestAuthorizeTab, Vec<String>>>,
    metadata_requests: Mutex<RequestQueue<MetadataDef, bool>>,
    sign_requests: Mutex<RequestQueue<SignRequest, ResponseSigning>>,
    auth_tx: watch::Sender<Vec<AuthorizeRequest>>,
    metadata_tx: watch::Sender<Vec<MetadataRequest>>,
    sign_tx: watch::Sender<Vec<SigningRequest>>,
    badge_tx: watch::Sender<String>,
    mirror_lock: tokio::sync::Mutex<()>,
}

impl State {
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let auth_urls: AuthUrls = load_record(store.as_ref(), AUTH_URLS_KEY).await?;
        let chain_metadata: BTreeMap<String, MetadataDef> = load_record(store.as_ref(), CHAIN_METADATA_KEY).await?;
        info!(
            "Broker loaded {} authorized origins, {} chains",
            auth_urls.len(),
            chain_metadata.len()
        );

        let state = Self {
            store,
            auth_urls: tokio::sync::Mutex::new(auth_urls),
            chain_metadata: tokio::sync::Mutex::new(chain_metadata),
            auth_requests: Mutex::new(RequestQueue::default()),
            metadata_requests: Mutex::new(RequestQueue::default()),
            sign_requests: Mutex::new(RequestQueue::default()),
            auth_tx: watch::channel(Vec::new()).0,
            metadata_tx: watch::channel(Vec::new()).0,
            sign_tx: watch::channel(Vec::new()).0,
            badge_tx: watch::channel(String::new()).0,
            mirror_lock: tokio::sync::Mutex::new(()),
        };
        // pending requests never survive a restart
        state.publish_authorize().await;
        state.publish_metadata().await;
        state.publish_signing().await;
        Ok(state)
    }

    //
    // === Snapshots ===
    //

    fn update_badge(&self) {
        let auth = lock(&self.auth_requests).len();
        let meta = lock(&self.metadata_requests).len();
        let sign = lock(&self.sign_requests).len();
        let total = auth + meta + sign;
        let text = if total == 0 { String::new() } else { total.to_string() };
        self.badge_tx.send_if_modified(|badge| {
            if *badge == text {
                false
            } else {
                *badge = text;
                true
            }
        });
    }

    async fn persist_mirror<T: Serialize>(&self, key: &str, tx: &watch::Sender<T>) {
        let _guard = self.mirror_lock.lock().await;
        let value = serde_json::to_value(&*tx.borrow());
        match value {
            Ok(value) => {
                if let Err(e) = self.store.set(key, value).await {
                    warn!("Failed to mirror {}: {}", key, e);
                }
            }
            Err(e) => warn!("Failed to serialize {}: {}", key, e),
        }
    }

    async fn publish_authorize(&self) {
        let views = lock(&self.auth_requests).views();
        self.auth_tx.send_replace(views);
        self.update_badge();
        self.persist_mirror(AUTH_REQUESTS_KEY, &self.auth_tx).await;
    }

    async fn publish_metadata(&self) {
        let views = lock(&self.metadata_requests).views();
        self.metadata_tx.send_replace(views);
        self.update_badge();
        self.persist_mirror(METADATA_REQUESTS_KEY, &self.metadata_tx).await;
    }

    async fn publish_signing(&self) {
        let views = lock(&self.sign_requests).views();
        self.sign_tx.send_replace(views);
        self.update_badge();
        self.persist_mirror(SIGN_REQUESTS_KEY, &self.sign_tx).await;
    }

    pub fn authorize_requests(&self) -> Vec<AuthorizeRequest> {
        self.auth_tx.borrow().clone()
    }

    pub fn metadata_requests(&self) -> Vec<MetadataRequest> {
        self.metadata_tx.borrow().clone()
    }

    pub fn signing_requests(&self) -> Vec<SigningRequest> {
        self.sign_tx.borrow().clone()
    }

    pub fn subscribe_authorize_requests(&self) -> watch::Receiver<Vec<AuthorizeRequest>> {
        self.auth_tx.subscribe()
    }

    pub fn subscribe_metadata_requests(&self) -> watch::Receiver<Vec<MetadataRequest>> {
        self.metadata_tx.subscribe()
    }

    pub fn subscribe_signing_requests(&self) -> watch::Receiver<Vec<SigningRequest>> {
        self.sign_tx.subscribe()
    }

    pub fn badge(&self) -> String {
        self.badge_tx.borrow().clone()
    }

    //
    // === Enqueue / resolve ===
    //

    /// Queue an authorization prompt for `url`. A second call for the same
    /// url while one is pending shares the first request.
    pub async fn enqueue_authorize(&self, url: &str, port: PortKey, request: RequestAuthorizeTab) -> Completion<Vec<String>> {
        let (completion, created) = {
            let mut queue = lock(&self.auth_requests);
            match queue.attach(url) {
                Some(completion) => (completion, false),
                None => (queue.push(url, port, request), true),
            }
        };
        if created {
            info!("Authorize request {} queued for {}", completion.id(), url);
            self.publish_authorize().await;
        } else {
            debug!("Authorize request for {} coalesced into {}", url, completion.id());
        }
        completion
    }

    pub async fn enqueue_metadata(&self, url: &str, port: PortKey, request: MetadataDef) -> Completion<bool> {
        let completion = lock(&self.metadata_requests).push(url, port, request);
        info!("Metadata request {} queued for {}", completion.id(), url);
        self.publish_metadata().await;
        completion
    }

    pub async fn enqueue_signing(
        &self,
        url: &str,
        port: PortKey,
        account: AccountJson,
        request: SigningPayload,
    ) -> Completion<ResponseSigning> {
        let completion = lock(&self.sign_requests).push(url, port, SignRequest { account, request });
        info!("Signing request {} queued for {}", completion.id(), url);
        self.publish_signing().await;
        completion
    }

    pub async fn resolve_authorize(&self, id: &str, outcome: Result<Vec<String>>) -> Result<()> {
        let pending = lock(&self.auth_requests).take(id)?;
        let delivered = pending.complete(outcome);
        debug!("Authorize request {} resolved for {} waiters", id, delivered);
        self.publish_authorize().await;
        Ok(())
    }

    pub async fn resolve_metadata(&self, id: &str, outcome: Result<bool>) -> Result<()> {
        let pending = lock(&self.metadata_requests).take(id)?;
        pending.complete(outcome);
        debug!("Metadata request {} resolved", id);
        self.publish_metadata().await;
        Ok(())
    }

    pub async fn resolve_signing(&self, id: &str, outcome: Result<ResponseSigning>) -> Result<()> {
        let pending = lock(&self.sign_requests).take(id)?;
        if pending.complete(outcome) == 0 {
            debug!("Signing request {} resolved with nobody waiting", id);
        }
        self.publish_signing().await;
        Ok(())
    }

    /// Look at a pending signing request without consuming it.
    pub fn signing_request(&self, id: &str) -> Result<SigningRequest> {
        let queue = lock(&self.sign_requests);
        let pending = queue.get(id)?;
        Ok(RequestView {
            id: pending.id.clone(),
            url: pending.url.clone(),
            request: pending.payload.clone(),
            created_at: pending.created_at,
        })
    }

    //
    // === Authorized origins ===
    //

    async fn persist_auth_urls(&self, urls: &AuthUrls) -> Result<()> {
        put_typed(self.store.as_ref(), AUTH_URLS_KEY, urls).await
    }

    /// Grant `accounts` to `url` (union), bumping count and lastAuth.
    pub async fn authorize(&self, url: &str, origin: &str, accounts: &[String]) -> Result<AuthUrlInfo> {
        let mut urls = self.auth_urls.lock().await;
        let now = now_ms();
        let entry = urls.entry(url.to_string()).or_insert_with(|| AuthUrlInfo {
            id: uuid::Uuid::new_v4().to_string(),
            count: 0,
            origin: origin.to_string(),
            url: url.to_string(),
            authorized_accounts: Vec::new(),
            last_auth: now,
        });
        for account in accounts {
            if !entry.authorized_accounts.contains(account) {
                entry.authorized_accounts.push(account.clone());
            }
        }
        entry.count += 1;
        entry.last_auth = now;
        let info = entry.clone();
        self.persist_auth_urls(&urls).await?;
        info!("Authorized {} for {} accounts", url, info.authorized_accounts.len());
        Ok(info)
    }

    /// Make sure `url` has a row, without granting anything.
    pub async fn ensure_origin(&self, url: &str, origin: &str) -> Result<()> {
        let mut urls = self.auth_urls.lock().await;
        if urls.contains_key(url) {
            return Ok(());
        }
        urls.insert(
            url.to_string(),
            AuthUrlInfo {
                id: uuid::Uuid::new_v4().to_string(),
                count: 0,
                origin: origin.to_string(),
                url: url.to_string(),
                authorized_accounts: Vec::new(),
                last_auth: 0,
            },
        );
        self.persist_auth_urls(&urls).await
    }

    pub async fn is_authorized(&self, url: &str, account: &str) -> bool {
        self.auth_urls
            .lock()
            .await
            .get(url)
            .is_some_and(|info| info.authorized_accounts.iter().any(|a| a == account))
    }

    pub async fn auth_url(&self, url: &str) -> Option<AuthUrlInfo> {
        self.auth_urls.lock().await.get(url).cloned()
    }

    pub async fn auth_urls(&self) -> AuthUrls {
        self.auth_urls.lock().await.clone()
    }

    /// Replace the account set of an existing origin.
    pub async fn update_authorized_accounts(&self, url: &str, accounts: Vec<String>) -> Result<()> {
        let mut urls = self.auth_urls.lock().await;
        let entry = urls
            .get_mut(url)
            .ok_or_else(|| ExtensionError::OriginNotAuthorized(url.to_string()))?;
        entry.authorized_accounts = accounts;
        self.persist_auth_urls(&urls).await
    }

    /// Revoke an origin entirely. Returns what is left.
    pub async fn remove_auth_url(&self, url: &str) -> Result<AuthUrls> {
        let mut urls = self.auth_urls.lock().await;
        if urls.remove(url).is_none() {
            return Err(ExtensionError::OriginNotAuthorized(url.to_string()));
        }
        self.persist_auth_urls(&urls).await?;
        info!("Revoked {}", url);
        Ok(urls.clone())
    }

    pub async fn touch_auth_url(&self, url: &str) -> Result<()> {
        let mut urls = self.auth_urls.lock().await;
        if let Some(entry) = urls.get_mut(url) {
            entry.last_auth = now_ms();
            self.persist_auth_urls(&urls).await?;
        }
        Ok(())
    }

    //
    // === Chain metadata ===
    //

    pub async fn save_metadata(&self, def: MetadataDef) -> Result<()> {
        let mut chains = self.chain_metadata.lock().await;
        info!("Storing metadata for {} (spec {})", def.chain, def.spec_version);
        chains.insert(def.genesis_hash.clone(), def);
        put_typed(self.store.as_ref(), CHAIN_METADATA_KEY, &*chains).await
    }

    pub async fn get_metadata(&self, genesis_hash: &str) -> Option<MetadataDef> {
        self.chain_metadata.lock().await.get(genesis_hash).cloned()
    }

    pub async fn metadata_list(&self) -> Vec<MetadataDef> {
        self.chain_metadata.lock().await.values().cloned().collect()
    }

    pub async fn known_metadata(&self) -> Vec<InjectedMetadataKnown> {
        self.chain_metadata
            .lock()
            .await
            .values()
            .map(|def| InjectedMetadataKnown {
                genesis_hash: def.genesis_hash.clone(),
                spec_version: def.spec_version,
            })
            .collect()
    }

    pub async fn check_signed_extensions(&self, payload: &SignerPayloadJson) -> Result<()> {
        let metadata = self.get_metadata(&payload.genesis_hash).await;
        payload.check_signed_extensions(metadata.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::{AccountMeta, KeypairType};
    use crate::signing::SignerPayloadRaw;
    use crate::storage::MemoryStore;

    const URL: &str = "http://localhost:3000";

    async fn state() -> (State, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (State::load(store.clone()).await.unwrap(), store)
    }

    fn account(address: &str) -> AccountJson {
        AccountJson {
            address: address.to_string(),
            kind: KeypairType::Sr25519,
            meta: AccountMeta::default(),
        }
    }

    fn raw(address: &str) -> SigningPayload {
        SigningPayload::Bytes(SignerPayloadRaw {
            address: address.to_string(),
            data: "0x01".into(),
            kind: "bytes".into(),
        })
    }

    fn dapp() -> RequestAuthorizeTab {
        RequestAuthorizeTab { origin: "dapp".into() }
    }

    #[test]
    fn test_url_origin() {
        assert_eq!(url_origin("http://localhost:3000/path?x=1").unwrap(), "http://localhost:3000");
        assert_eq!(url_origin("https://app.test#frag").unwrap(), "https://app.test");
        assert_eq!(url_origin("https://app.test:443/x").unwrap(), "https://app.test");
        assert_eq!(url_origin("HTTPS://App.Test/x").unwrap(), "https://app.test");
        assert_eq!(url_origin("https://user:pw@app.test/x").unwrap(), "https://app.test");
        assert_eq!(url_origin("chrome-extension://AbC/popup.html").unwrap(), "chrome-extension://abc");
        assert!(matches!(url_origin("extension"), Err(ExtensionError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_authorize_coalesces_per_url() {
        let (state, store) = state().await;
        let first = state.enqueue_authorize(URL, PortKey::Content(1), dapp()).await;
        let second = state.enqueue_authorize(URL, PortKey::Content(2), dapp()).await;
        let other = state.enqueue_authorize("https://other.test", PortKey::Content(3), dapp()).await;

        assert_eq!(first.id(), second.id());
        assert_eq!(state.authorize_requests().len(), 2);
        assert_eq!(state.badge(), "2");
        assert_eq!(store.get(AUTH_REQUESTS_KEY).await.unwrap().unwrap().as_array().unwrap().len(), 2);

        let id = first.id().to_string();
        state.resolve_authorize(&id, Ok(vec!["0xaa".into()])).await.unwrap();
        assert_eq!(first.wait().await, Ok(vec!["0xaa".to_string()]));
        assert_eq!(second.wait().await, Ok(vec!["0xaa".to_string()]));

        assert_eq!(state.authorize_requests().len(), 1);
        assert_eq!(state.authorize_requests()[0].id, other.id());
        assert_eq!(state.badge(), "1");
    }

    #[tokio::test]
    async fn test_resolve_twice_is_not_found() {
        let (state, _) = state().await;
        let a = state.enqueue_signing(URL, PortKey::Content(1), account("0xaa"), raw("0xaa")).await;
        let b = state.enqueue_signing(URL, PortKey::Content(1), account("0xaa"), raw("0xaa")).await;
        let a_id = a.id().to_string();

        state.resolve_signing(&a_id, Err(ExtensionError::cancelled())).await.unwrap();
        assert_eq!(
            state.resolve_signing(&a_id, Err(ExtensionError::cancelled())).await,
            Err(ExtensionError::RequestNotFound(a_id.clone()))
        );
        assert_eq!(a.wait().await, Err(ExtensionError::cancelled()));

        assert_eq!(state.signing_requests().len(), 1);
        assert_eq!(state.signing_request(b.id()).unwrap().request.account.address, "0xaa");
    }

    #[tokio::test]
    async fn test_resolve_without_waiter_is_contained() {
        let (state, _) = state().await;
        let completion = state.enqueue_metadata(URL, PortKey::Content(4), sample_metadata()).await;
        let id = completion.id().to_string();
        drop(completion);
        assert!(state.resolve_metadata(&id, Ok(true)).await.is_ok());
        assert_eq!(state.badge(), "");
    }

    #[tokio::test]
    async fn test_authorize_unions_and_counts() {
        let (state, store) = state().await;
        state.authorize(URL, "dapp", &["0xaa".into()]).await.unwrap();
        let info = state.authorize(URL, "dapp", &["0xbb".into(), "0xaa".into()]).await.unwrap();

        assert_eq!(info.count, 2);
        assert_eq!(info.authorized_accounts, vec!["0xaa".to_string(), "0xbb".to_string()]);
        assert!(state.is_authorized(URL, "0xbb").await);
        assert!(!state.is_authorized(URL, "0xcc").await);
        assert!(!state.is_authorized("https://other.test", "0xaa").await);

        // survives a reload
        let reloaded = State::load(store).await.unwrap();
        assert_eq!(reloaded.auth_url(URL).await.unwrap().id, info.id);
    }

    #[tokio::test]
    async fn test_update_and_remove_origin() {
        let (state, _) = state().await;
        state.ensure_origin(URL, "dapp").await.unwrap();
        assert!(state.auth_url(URL).await.unwrap().authorized_accounts.is_empty());

        state.update_authorized_accounts(URL, vec!["0xcc".into()]).await.unwrap();
        assert!(state.is_authorized(URL, "0xcc").await);

        assert!(state.remove_auth_url(URL).await.unwrap().is_empty());
        assert_eq!(
            state.remove_auth_url(URL).await,
            Err(ExtensionError::OriginNotAuthorized(URL.into()))
        );
    }

    fn sample_metadata() -> MetadataDef {
        MetadataDef {
            chain: "Development".into(),
            genesis_hash: "0x242a".into(),
            icon: "substrate".into(),
            ss58_format: 42,
            spec_version: 38,
            token_decimals: 12,
            token_symbol: "UNIT".into(),
            color: None,
            types: serde_json::json!({}),
            user_extensions: None,
        }
    }

    #[tokio::test]
    async fn test_metadata_store() {
        let (state, store) = state().await;
        state.save_metadata(sample_metadata()).await.unwrap();
        assert_eq!(state.get_metadata("0x242a").await.unwrap().spec_version, 38);
        assert_eq!(
            state.known_metadata().await,
            vec![InjectedMetadataKnown {
                genesis_hash: "0x242a".into(),
                spec_version: 38
            }]
        );

        store.set(CHAIN_METADATA_KEY, serde_json::json!("garbage")).await.unwrap();
        let reloaded = State::load(store).await.unwrap();
        assert!(reloaded.metadata_list().await.is_empty());
    }
}
