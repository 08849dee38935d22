//! Keyring: persisted account records and the decrypt/sign capability.
//!
//! Each account is stored as one `KeyringJson` record under
//! `account:<address>`. Secrets are only ever decrypted on demand for a single
//! operation and are never cached here.

pub mod encryption;
pub mod pair;
pub mod suri;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::KeyringConfig;
use crate::error::{ExtensionError, Result};
use crate::storage::{get_typed, put_typed, KvStore};
use crate::util::now_ms;

pub use pair::{KeyPair, KeypairType};

const ACCOUNT_PREFIX: &str = "account:";
const ENCODING_VERSION: &str = "3";

fn account_key(address: &str) -> String {
    format!("{}{}", ACCOUNT_PREFIX, address)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suri: Option<String>,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub is_hardware: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_offset: Option<u32>,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub is_testing: bool,
    #[serde(default)]
    pub when_created: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KeyringJsonEncoding {
    /// `["pkcs8", "<key type>"]`
    pub content: Vec<String>,
    /// `["pbkdf2", "aes-256-gcm"]`, or `["none"]` for external accounts.
    #[serde(rename = "type")]
    pub kind: Vec<String>,
    pub version: String,
    #[serde(default)]
    pub rounds: u32,
}

/// Persisted account record, also the export format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KeyringJson {
    pub address: String,
    /// Hex of the encrypted secret; empty for external accounts.
    pub encoded: String,
    pub encoding: KeyringJsonEncoding,
    pub meta: AccountMeta,
}

impl KeyringJson {
    pub fn key_type(&self) -> Result<KeypairType> {
        let name = self
            .encoding
            .content
            .get(1)
            .ok_or_else(|| ExtensionError::SchemaValidationFailure(account_key(&self.address)))?;
        serde_json::from_value(serde_json::Value::String(name.clone()))
            .map_err(|_| ExtensionError::SchemaValidationFailure(account_key(&self.address)))
    }

    pub fn is_external(&self) -> bool {
        self.meta.is_external || self.encoded.is_empty()
    }

    fn decrypt(&self, password: &str) -> Result<KeyPair> {
        if self.is_external() {
            return Err(ExtensionError::ExternalAccount(self.address.clone()));
        }
        let blob = hex::decode(&self.encoded).map_err(|e| ExtensionError::Crypto(e.to_string()))?;
        let secret = encryption::decrypt_data(&blob, password, self.encoding.rounds)?;
        let pair = KeyPair::from_secret(self.key_type()?, &secret)?;
        if pair.address() != self.address {
            return Err(ExtensionError::Crypto(format!("decrypted key does not match {}", self.address)));
        }
        Ok(pair)
    }
}

/// What the popup sees for each account.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountJson {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: KeypairType,
    #[serde(flatten)]
    pub meta: AccountMeta,
}

/// Password-encrypted bundle of several account records.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchJson {
    pub encoded: String,
    pub encoding: KeyringJsonEncoding,
    pub accounts: Vec<BatchAccount>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchAccount {
    pub address: String,
    pub meta: AccountMeta,
}

pub struct Keyring {
    store: Arc<dyn KvStore>,
    config: KeyringConfig,
    accounts: RwLock<BTreeMap<String, KeyringJson>>,
    accounts_tx: watch::Sender<Vec<AccountJson>>,
}

impl Keyring {
    /// Load every `account:*` record. Records that fail to parse are skipped.
    pub async fn load(store: Arc<dyn KvStore>, config: KeyringConfig) -> Result<Self> {
        let mut accounts = BTreeMap::new();
        for key in store.keys(ACCOUNT_PREFIX).await? {
            match get_typed::<KeyringJson>(store.as_ref(), &key).await {
                Ok(Some(json)) => {
                    accounts.insert(json.address.clone(), json);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable account record {}: {}", key, e),
            }
        }
        info!("Keyring loaded with {} accounts", accounts.len());

        let (accounts_tx, _) = watch::channel(Vec::new());
        let keyring = Self {
            store,
            config,
            accounts: RwLock::new(accounts),
            accounts_tx,
        };
        keyring.publish();
        Ok(keyring)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, KeyringJson>> {
        self.accounts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, KeyringJson>> {
        self.accounts.write().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self) {
        let list = self.accounts();
        self.accounts_tx.send_replace(list);
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<AccountJson>> {
        self.accounts_tx.subscribe()
    }

    /// All accounts, oldest first.
    pub fn accounts(&self) -> Vec<AccountJson> {
        let mut list: Vec<AccountJson> = self
            .read()
            .values()
            .filter_map(|json| {
                let kind = json.key_type().ok()?;
                Some(AccountJson {
                    address: json.address.clone(),
                    kind,
                    meta: json.meta.clone(),
                })
            })
            .collect();
        list.sort_by(|a, b| {
            a.meta
                .when_created
                .cmp(&b.meta.when_created)
                .then_with(|| a.address.cmp(&b.address))
        });
        list
    }

    pub fn contains(&self, address: &str) -> bool {
        self.read().contains_key(address)
    }

    pub fn get(&self, address: &str) -> Result<KeyringJson> {
        self.read()
            .get(address)
            .cloned()
            .ok_or_else(|| ExtensionError::AccountNotFound(address.to_string()))
    }

    pub fn account(&self, address: &str) -> Result<AccountJson> {
        let json = self.get(address)?;
        Ok(AccountJson {
            address: json.address.clone(),
            kind: json.key_type()?,
            meta: json.meta,
        })
    }

    async fn save(&self, json: KeyringJson) -> Result<()> {
        let persist = !json.meta.is_testing || self.config.store_testing_accounts;
        if persist {
            put_typed(self.store.as_ref(), &account_key(&json.address), &json).await?;
        } else {
            debug!("Keeping testing account {} in memory only", json.address);
        }
        self.write().insert(json.address.clone(), json);
        self.publish();
        Ok(())
    }

    fn encode_pair(&self, pair: &KeyPair, password: &str, meta: AccountMeta) -> Result<KeyringJson> {
        let encrypted = encryption::encrypt_data(&pair.secret_bytes(), password, self.config.kdf_rounds)?;
        Ok(KeyringJson {
            address: pair.address(),
            encoded: hex::encode(encrypted),
            encoding: KeyringJsonEncoding {
                content: vec!["pkcs8".to_string(), pair.kind().to_string()],
                kind: vec!["pbkdf2".to_string(), "aes-256-gcm".to_string()],
                version: ENCODING_VERSION.to_string(),
                rounds: self.config.kdf_rounds,
            },
            meta,
        })
    }

    /// Encrypt `pair` under `password` and persist it. Fails if the address
    /// is already present.
    pub async fn add_pair(&self, pair: &KeyPair, password: &str, mut meta: AccountMeta) -> Result<AccountJson> {
        let address = pair.address();
        if self.contains(&address) {
            return Err(ExtensionError::AccountExists(address));
        }
        if meta.when_created == 0 {
            meta.when_created = now_ms();
        }
        let json = self.encode_pair(pair, password, meta)?;
        let account = AccountJson {
            address: address.clone(),
            kind: pair.kind(),
            meta: json.meta.clone(),
        };
        self.save(json).await?;
        info!("Added {} account {}", pair.kind(), address);
        Ok(account)
    }

    async fn add_watch_only(&self, address: String, kind: KeypairType, mut meta: AccountMeta) -> Result<AccountJson> {
        if self.contains(&address) {
            return Err(ExtensionError::AccountExists(address));
        }
        meta.when_created = now_ms();
        let json = KeyringJson {
            address: address.clone(),
            encoded: String::new(),
            encoding: KeyringJsonEncoding {
                content: vec!["pkcs8".to_string(), kind.to_string()],
                kind: vec!["none".to_string()],
                version: ENCODING_VERSION.to_string(),
                rounds: 0,
            },
            meta: meta.clone(),
        };
        self.save(json).await?;
        info!("Added external account {}", address);
        Ok(AccountJson { address, kind, meta })
    }

    pub async fn add_external(&self, address: String, name: String, genesis_hash: Option<String>) -> Result<AccountJson> {
        let meta = AccountMeta {
            name: Some(name),
            genesis_hash,
            is_external: true,
            ..AccountMeta::default()
        };
        self.add_watch_only(address, KeypairType::Sr25519, meta).await
    }

    pub async fn add_hardware(
        &self,
        address: String,
        hardware_type: String,
        account_index: u32,
        address_offset: u32,
        name: String,
        genesis_hash: Option<String>,
    ) -> Result<AccountJson> {
        let meta = AccountMeta {
            name: Some(name),
            genesis_hash,
            is_external: true,
            is_hardware: true,
            hardware_type: Some(hardware_type),
            account_index: Some(account_index),
            address_offset: Some(address_offset),
            ..AccountMeta::default()
        };
        self.add_watch_only(address, KeypairType::Ed25519, meta).await
    }

    /// Decrypt the keypair of `address`.
    pub fn unlock(&self, address: &str, password: &str) -> Result<KeyPair> {
        self.get(address)?.decrypt(password)
    }

    pub fn check_password(&self, address: &str, password: &str) -> Result<bool> {
        match self.unlock(address, password) {
            Ok(_) => Ok(true),
            Err(ExtensionError::InvalidPassword(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn update_meta<F>(&self, address: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut AccountMeta),
    {
        let mut json = self.get(address)?;
        f(&mut json.meta);
        self.save(json).await
    }

    pub async fn rename(&self, address: &str, name: String) -> Result<()> {
        self.update_meta(address, |meta| meta.name = Some(name)).await
    }

    pub async fn set_hidden(&self, address: &str, is_hidden: bool) -> Result<()> {
        self.update_meta(address, |meta| meta.is_hidden = is_hidden).await
    }

    pub async fn tie(&self, address: &str, genesis_hash: Option<String>) -> Result<()> {
        self.update_meta(address, |meta| meta.genesis_hash = genesis_hash).await
    }

    pub async fn forget(&self, address: &str) -> Result<()> {
        let removed = self.write().remove(address);
        if removed.is_none() {
            return Err(ExtensionError::AccountNotFound(address.to_string()));
        }
        self.store.remove(&account_key(address)).await?;
        self.publish();
        info!("Forgot account {}", address);
        Ok(())
    }

    pub async fn change_password(&self, address: &str, old_pass: &str, new_pass: &str) -> Result<()> {
        let json = self.get(address)?;
        let pair = json.decrypt(old_pass).map_err(|e| match e {
            ExtensionError::InvalidPassword(_) => ExtensionError::InvalidPassword("oldPass is invalid".to_string()),
            other => other,
        })?;
        let updated = self.encode_pair(&pair, new_pass, json.meta)?;
        self.save(updated).await?;
        info!("Changed password of {}", address);
        Ok(())
    }

    /// The stored record, after proving knowledge of its password.
    pub fn export(&self, address: &str, password: &str) -> Result<KeyringJson> {
        let json = self.get(address)?;
        json.decrypt(password)?;
        Ok(json)
    }

    pub fn batch_export(&self, addresses: &[String], password: &str) -> Result<BatchJson> {
        let records = addresses
            .iter()
            .map(|address| self.get(address))
            .collect::<Result<Vec<_>>>()?;
        let plain = serde_json::to_vec(&records).map_err(|e| ExtensionError::Storage(e.to_string()))?;
        let encrypted = encryption::encrypt_data(&plain, password, self.config.kdf_rounds)?;

        Ok(BatchJson {
            encoded: hex::encode(encrypted),
            encoding: KeyringJsonEncoding {
                content: vec!["batch-pkcs8".to_string()],
                kind: vec!["pbkdf2".to_string(), "aes-256-gcm".to_string()],
                version: ENCODING_VERSION.to_string(),
                rounds: self.config.kdf_rounds,
            },
            accounts: records
                .into_iter()
                .map(|json| BatchAccount {
                    address: json.address,
                    meta: json.meta,
                })
                .collect(),
        })
    }

    /// Restore an exported record. Overwrites an existing account with the
    /// same address.
    pub async fn restore(&self, json: KeyringJson, password: &str) -> Result<AccountJson> {
        json.decrypt(password)?;
        let account = AccountJson {
            address: json.address.clone(),
            kind: json.key_type()?,
            meta: json.meta.clone(),
        };
        self.save(json).await?;
        info!("Restored account {}", account.address);
        Ok(account)
    }

    pub async fn batch_restore(&self, batch: BatchJson, password: &str) -> Result<Vec<AccountJson>> {
        let blob = hex::decode(&batch.encoded).map_err(|e| ExtensionError::Crypto(e.to_string()))?;
        let plain = encryption::decrypt_data(&blob, password, batch.encoding.rounds)?;
        let records: Vec<KeyringJson> =
            serde_json::from_slice(&plain).map_err(|e| ExtensionError::InvalidRequest(e.to_string()))?;

        let mut restored = Vec::with_capacity(records.len());
        for json in records {
            // the batch password proves ownership of every record in it
            let account = AccountJson {
                address: json.address.clone(),
                kind: json.key_type()?,
                meta: json.meta.clone(),
            };
            self.save(json).await?;
            restored.push(account);
        }
        info!("Restored {} accounts from batch", restored.len());
        Ok(restored)
    }
}
