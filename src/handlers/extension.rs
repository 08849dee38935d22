//! Handler for the popup namespace (`pri(...)`). Account lifecycle goes
//! straight to the keyring; approvals resolve pending broker requests.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{forward, SubscriptionSink};
use crate::error::{ExtensionError, Result};
use crate::keyring::pair::generate_mnemonic;
use crate::keyring::suri::parse_path;
use crate::keyring::{AccountMeta, KeyPair, Keyring};
use crate::messages::*;
use crate::password_cache::{CachedPassword, PasswordCache};
use crate::ports::{PortKey, PortRegistry};
use crate::state::{SignRequest, State};
use crate::util::now_ms;

const DEFAULT_SEED_LENGTH: usize = 12;

pub struct Extension {
    state: Arc<State>,
    keyring: Arc<Keyring>,
    ports: Arc<PortRegistry>,
    password_cache: PasswordCache,
    password_ttl_ms: u64,
}

/// Anything wrong with a seed that is not already a more specific error.
fn seed_error(e: ExtensionError) -> ExtensionError {
    match e {
        ExtensionError::InvalidSeedOrPath(_) | ExtensionError::UnsupportedSoftDerivation(_) => e,
        other => ExtensionError::InvalidSeedOrPath(other.to_string()),
    }
}

impl Extension {
    pub fn new(
        state: Arc<State>,
        keyring: Arc<Keyring>,
        ports: Arc<PortRegistry>,
        password_cache: PasswordCache,
        password_ttl_ms: u64,
    ) -> Self {
        Self {
            state,
            keyring,
            ports,
            password_cache,
            password_ttl_ms,
        }
    }

    pub async fn handle(&self, id: &str, method: PriMethod, port: PortKey, request: Value) -> Result<Value> {
        debug!("Extension request {} {:?}", id, method);
        match method {
            PriMethod::AccountsCreateSuri => self.accounts_create_suri(parse_params(request)?).await,
            PriMethod::AccountsCreateExternal => {
                let req: RequestAccountCreateExternal = parse_params(request)?;
                self.keyring.add_external(req.address, req.name, req.genesis_hash).await?;
                to_json(&true)
            }
            PriMethod::AccountsCreateHardware => {
                let req: RequestAccountCreateHardware = parse_params(request)?;
                self.keyring
                    .add_hardware(
                        req.address,
                        req.hardware_type,
                        req.account_index,
                        req.address_offset,
                        req.name,
                        req.genesis_hash,
                    )
                    .await?;
                to_json(&true)
            }
            PriMethod::AccountsEdit => {
                let req: RequestAccountEdit = parse_params(request)?;
                self.keyring.rename(&req.address, req.name).await?;
                to_json(&true)
            }
            PriMethod::AccountsExport => {
                let req: RequestAccountExport = parse_params(request)?;
                let exported_json = self.keyring.export(&req.address, &req.password)?;
                to_json(&ResponseAccountExport { exported_json })
            }
            PriMethod::AccountsBatchExport => {
                let req: RequestAccountBatchExport = parse_params(request)?;
                let exported_json = self.keyring.batch_export(&req.addresses, &req.password)?;
                to_json(&ResponseAccountsExport { exported_json })
            }
            PriMethod::AccountsForget => {
                let req: RequestAccountForget = parse_params(request)?;
                self.keyring.forget(&req.address).await?;
                self.password_cache.remove(&req.address).await?;
                to_json(&true)
            }
            PriMethod::AccountsShow => {
                let req: RequestAccountShow = parse_params(request)?;
                self.keyring.set_hidden(&req.address, !req.is_showing).await?;
                to_json(&true)
            }
            PriMethod::AccountsTie => {
                let req: RequestAccountTie = parse_params(request)?;
                self.keyring.tie(&req.address, req.genesis_hash).await?;
                to_json(&true)
            }
            PriMethod::AccountsChangePassword => {
                let req: RequestAccountChangePassword = parse_params(request)?;
                self.keyring.change_password(&req.address, &req.old_pass, &req.new_pass).await?;
                self.password_cache.remove(&req.address).await?;
                to_json(&true)
            }
            PriMethod::AccountsValidate => {
                let req: RequestAccountValidate = parse_params(request)?;
                to_json(&self.keyring.check_password(&req.address, &req.password)?)
            }
            PriMethod::AccountsSubscribe => {
                let sink = SubscriptionSink::new(self.ports.clone(), port, id)?;
                let rx = self.keyring.subscribe();
                let current = rx.borrow().clone();
                forward(sink, rx);
                to_json(&current)
            }
            PriMethod::JsonRestore => {
                let req: RequestJsonRestore = parse_params(request)?;
                self.keyring.restore(req.file, &req.password).await?;
                to_json(&true)
            }
            PriMethod::JsonBatchRestore => {
                let req: RequestBatchRestore = parse_params(request)?;
                self.keyring.batch_restore(req.file, &req.password).await?;
                to_json(&true)
            }
            PriMethod::SeedCreate => to_json(&self.seed_create(parse_params(request)?)?),
            PriMethod::SeedValidate => to_json(&self.seed_validate(parse_params(request)?)?),
            PriMethod::DerivationValidate => {
                let req: RequestDeriveValidate = parse_params(request)?;
                let child = self.derive(&req.parent_address, &req.parent_password, &req.suri)?;
                to_json(&ResponseSuriValidate {
                    address: child.address(),
                    suri: req.suri,
                })
            }
            PriMethod::DerivationCreate => self.derivation_create(parse_params(request)?).await,
            PriMethod::AuthorizeList => to_json(&json!({ "list": self.state.auth_urls().await })),
            PriMethod::AuthorizeUpdate => {
                let req: RequestAuthorizeUpdate = parse_params(request)?;
                self.state.update_authorized_accounts(&req.url, req.authorized_accounts).await?;
                to_json(&true)
            }
            PriMethod::AuthorizeRemove => {
                let req: RequestAuthorizeRemove = parse_params(request)?;
                let list = self.state.remove_auth_url(&req.url).await?;
                to_json(&json!({ "list": list }))
            }
            PriMethod::AuthorizeRequests => {
                let sink = SubscriptionSink::new(self.ports.clone(), port, id)?;
                forward(sink, self.state.subscribe_authorize_requests());
                to_json(&self.state.authorize_requests())
            }
            PriMethod::AuthorizeApprove => {
                let req: RequestAuthorizeApprove = parse_params(request)?;
                self.state.resolve_authorize(&req.id, Ok(req.authorized_accounts)).await?;
                to_json(&true)
            }
            PriMethod::AuthorizeReject => {
                let req: RequestById = parse_params(request)?;
                self.state
                    .resolve_authorize(&req.id, Err(ExtensionError::Rejected("Rejected".to_string())))
                    .await?;
                to_json(&true)
            }
            PriMethod::MetadataApprove => {
                let req: RequestById = parse_params(request)?;
                self.state.resolve_metadata(&req.id, Ok(true)).await?;
                to_json(&true)
            }
            PriMethod::MetadataReject => {
                let req: RequestById = parse_params(request)?;
                self.state
                    .resolve_metadata(&req.id, Err(ExtensionError::Rejected("Rejected".to_string())))
                    .await?;
                to_json(&true)
            }
            PriMethod::MetadataGet => {
                let req: RequestMetadataGet = parse_params(request)?;
                to_json(&self.state.get_metadata(&req.genesis_hash).await)
            }
            PriMethod::MetadataList => to_json(&self.state.metadata_list().await),
            PriMethod::MetadataRequests => {
                let sink = SubscriptionSink::new(self.ports.clone(), port, id)?;
                forward(sink, self.state.subscribe_metadata_requests());
                to_json(&self.state.metadata_requests())
            }
            PriMethod::SigningApprovePassword => self.signing_approve_password(parse_params(request)?).await,
            PriMethod::SigningApproveSignature => {
                let req: RequestSigningApproveSignature = parse_params(request)?;
                let response = ResponseSigning {
                    id: req.id.clone(),
                    signature: req.signature,
                };
                self.state.resolve_signing(&req.id, Ok(response)).await?;
                to_json(&true)
            }
            PriMethod::SigningCancel => {
                let req: RequestById = parse_params(request)?;
                self.state.resolve_signing(&req.id, Err(ExtensionError::cancelled())).await?;
                to_json(&true)
            }
            PriMethod::SigningIsLocked => {
                let req: RequestById = parse_params(request)?;
                to_json(&self.signing_is_locked(&req.id).await?)
            }
            PriMethod::SigningRequests => {
                let sink = SubscriptionSink::new(self.ports.clone(), port, id)?;
                forward(sink, self.state.subscribe_signing_requests());
                to_json(&self.state.signing_requests())
            }
        }
    }

    async fn accounts_create_suri(&self, req: RequestAccountCreateSuri) -> Result<Value> {
        let pair = KeyPair::from_suri(req.kind, &req.suri).map_err(seed_error)?;
        let meta = AccountMeta {
            name: Some(req.name),
            genesis_hash: req.genesis_hash,
            ..AccountMeta::default()
        };
        self.keyring.add_pair(&pair, &req.password, meta).await?;
        to_json(&true)
    }

    fn seed_create(&self, req: RequestSeedCreate) -> Result<ResponseSeedCreate> {
        let seed = match req.seed {
            Some(seed) => seed,
            None => generate_mnemonic(req.length.unwrap_or(DEFAULT_SEED_LENGTH))?,
        };
        let address = KeyPair::from_suri(req.kind, &seed).map_err(seed_error)?.address();
        Ok(ResponseSeedCreate { address, seed })
    }

    fn seed_validate(&self, req: RequestSeedValidate) -> Result<ResponseSuriValidate> {
        let pair = KeyPair::from_suri(req.kind, &req.suri).map_err(seed_error)?;
        Ok(ResponseSuriValidate {
            address: pair.address(),
            suri: req.suri,
        })
    }

    /// Unlock the parent, then derive `suri` from it. Nothing is persisted.
    fn derive(&self, parent_address: &str, parent_password: &str, suri: &str) -> Result<KeyPair> {
        let parent = self.keyring.unlock(parent_address, parent_password)?;

        if suri.contains("///") {
            return Err(ExtensionError::UnsupportedDerivationSyntax);
        }
        let path = parse_path(suri)?;
        if path.has_soft() && !parent.kind().supports_soft_derivation() {
            return Err(ExtensionError::UnsupportedSoftDerivation(parent.kind().to_string()));
        }
        parent.derive(&path.junctions)
    }

    async fn derivation_create(&self, req: RequestDeriveCreate) -> Result<Value> {
        let child = self.derive(&req.parent_address, &req.parent_password, &req.suri)?;
        let meta = AccountMeta {
            name: Some(req.name),
            genesis_hash: req.genesis_hash,
            parent_address: Some(req.parent_address),
            suri: Some(req.suri),
            ..AccountMeta::default()
        };
        self.keyring.add_pair(&child, &req.password, meta).await?;
        to_json(&true)
    }

    /// Sign a pending request. A wrong or missing password leaves the request
    /// pending so the popup can ask again.
    async fn signing_approve_password(&self, req: RequestSigningApprovePassword) -> Result<Value> {
        let view = self.state.signing_request(&req.id)?;
        let SignRequest { account, request } = view.request;

        let password = match req.password {
            Some(password) => password,
            None => match self.password_cache.get(&account.address).await {
                Some(cached) if !cached.is_expired(now_ms()) => cached.password,
                _ => return Err(ExtensionError::InvalidPassword("Password required".to_string())),
            },
        };
        let pair = self.keyring.unlock(&account.address, &password)?;
        let signature = request.sign(&pair)?;

        if req.save_pass {
            let entry = CachedPassword::new(password, now_ms(), self.password_ttl_ms);
            self.password_cache.set(&account.address, entry).await?;
        }

        self.state
            .resolve_signing(
                &req.id,
                Ok(ResponseSigning {
                    id: req.id.clone(),
                    signature,
                }),
            )
            .await?;
        info!("Signing request {} approved", req.id);
        to_json(&true)
    }

    async fn signing_is_locked(&self, id: &str) -> Result<ResponseSigningIsLocked> {
        let view = self.state.signing_request(id)?;
        let now = now_ms();
        let cached = self.password_cache.get(&view.request.account.address).await;
        Ok(match cached {
            Some(entry) if !entry.is_expired(now) && !view.request.account.meta.is_external => ResponseSigningIsLocked {
                is_locked: false,
                remaining_time: entry.remaining_ms(now),
            },
            _ => ResponseSigningIsLocked {
                is_locked: true,
                remaining_time: 0,
            },
        })
    }
}
