//! Handler for the page namespace (`pub(...)`).

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::SubscriptionSink;
use crate::error::{ExtensionError, Result};
use crate::keyring::{AccountJson, KeypairType, Keyring};
use crate::messages::{
    parse_params, to_json, InjectedAccount, MetadataDef, PubMethod, RequestAccountList, RequestAuthorizeTab,
    ResponseSigning,
};
use crate::ports::{PortKey, PortRegistry};
use crate::signing::{SignerPayloadJson, SignerPayloadRaw, SigningPayload};
use crate::state::State;

pub struct Tabs {
    state: Arc<State>,
    keyring: Arc<Keyring>,
    ports: Arc<PortRegistry>,
}

/// Accounts of `accounts` that `url` may see. Without `any_type` only the
/// substrate key types are returned.
async fn injected_accounts(state: &State, url: &str, accounts: &[AccountJson], any_type: bool) -> Vec<InjectedAccount> {
    let authorized = match state.auth_url(url).await {
        Some(info) => info.authorized_accounts,
        None => return Vec::new(),
    };
    accounts
        .iter()
        .filter(|account| !account.meta.is_hidden)
        .filter(|account| authorized.contains(&account.address))
        .filter(|account| any_type || account.kind != KeypairType::Ethereum)
        .map(InjectedAccount::from)
        .collect()
}

impl Tabs {
    pub fn new(state: Arc<State>, keyring: Arc<Keyring>, ports: Arc<PortRegistry>) -> Self {
        Self { state, keyring, ports }
    }

    /// Dispatch one page request. `url` is the page origin.
    pub async fn handle(&self, id: &str, method: PubMethod, url: &str, port: PortKey, request: Value) -> Result<Value> {
        debug!("Tabs request {} {:?} from {}", id, method, url);
        match method {
            PubMethod::Connect => {
                let request: RequestAuthorizeTab = parse_params(request)?;
                self.ensure_authorized(url, port, request).await?;
                to_json(&self.accounts(url, true).await)
            }
            PubMethod::AccountsList => {
                let request: RequestAccountList = parse_params(request)?;
                let prompt = RequestAuthorizeTab { origin: url.to_string() };
                self.ensure_authorized(url, port, prompt).await?;
                to_json(&self.accounts(url, request.any_type).await)
            }
            PubMethod::AccountsSubscribe => self.accounts_subscribe(id, url, port).await,
            PubMethod::ExtrinsicSign => {
                let payload: SignerPayloadJson = parse_params(request)?;
                to_json(&self.sign(url, port, SigningPayload::Extrinsic(payload)).await?)
            }
            PubMethod::BytesSign => {
                let payload: SignerPayloadRaw = parse_params(request)?;
                to_json(&self.sign(url, port, SigningPayload::Bytes(payload)).await?)
            }
            PubMethod::MetadataList => to_json(&self.state.known_metadata().await),
            PubMethod::MetadataProvide => {
                let def: MetadataDef = parse_params(request)?;
                to_json(&self.metadata_provide(url, port, def).await?)
            }
        }
    }

    async fn accounts(&self, url: &str, any_type: bool) -> Vec<InjectedAccount> {
        injected_accounts(&self.state, url, &self.keyring.accounts(), any_type).await
    }

    /// Prompt the user unless `url` already holds at least one live account.
    async fn ensure_authorized(&self, url: &str, port: PortKey, request: RequestAuthorizeTab) -> Result<()> {
        if let Some(info) = self.state.auth_url(url).await {
            if info.authorized_accounts.iter().any(|a| self.keyring.contains(a)) {
                return Ok(());
            }
        }

        let origin = request.origin.clone();
        let completion = self.state.enqueue_authorize(url, port, request).await;
        match completion.wait().await {
            Ok(granted) => {
                self.state.authorize(url, &origin, &granted).await?;
                Ok(())
            }
            Err(e) => {
                info!("Authorization of {} rejected: {}", url, e);
                self.state.ensure_origin(url, &origin).await?;
                Err(e)
            }
        }
    }

    async fn accounts_subscribe(&self, id: &str, url: &str, port: PortKey) -> Result<Value> {
        if self.state.auth_url(url).await.is_none() {
            return Err(ExtensionError::OriginNotAuthorized(url.to_string()));
        }
        let sink = SubscriptionSink::new(self.ports.clone(), port, id)?;
        let mut rx: watch::Receiver<Vec<AccountJson>> = self.keyring.subscribe();
        let current = rx.borrow_and_update().clone();

        let state = self.state.clone();
        let url_owned = url.to_string();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let accounts = rx.borrow_and_update().clone();
                let visible = injected_accounts(&state, &url_owned, &accounts, true).await;
                if !sink.push(&visible) {
                    break;
                }
            }
        });

        to_json(&injected_accounts(&self.state, url, &current, true).await)
    }

    async fn sign(&self, url: &str, port: PortKey, payload: SigningPayload) -> Result<ResponseSigning> {
        let address = payload.address().to_string();
        if !self.state.is_authorized(url, &address).await {
            return Err(ExtensionError::OriginNotAuthorized(url.to_string()));
        }
        let account = self.keyring.account(&address)?;
        if let SigningPayload::Extrinsic(extrinsic) = &payload {
            self.state.check_signed_extensions(extrinsic).await?;
        }

        let completion = self.state.enqueue_signing(url, port, account, payload).await;
        let response = completion.wait().await?;
        self.state.touch_auth_url(url).await?;
        Ok(response)
    }

    async fn metadata_provide(&self, url: &str, port: PortKey, def: MetadataDef) -> Result<bool> {
        let completion = self.state.enqueue_metadata(url, port, def.clone()).await;
        let accepted = completion.wait().await?;
        if accepted {
            self.state.save_metadata(def).await?;
            self.state.touch_auth_url(url).await?;
        }
        Ok(accepted)
    }
}
