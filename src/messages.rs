// Message types for the page and popup channels
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ExtensionError, Result};
use crate::keyring::{AccountJson, BatchJson, KeyringJson, KeypairType};

pub const PORT_CONTENT: &str = "compass-extension/content";
pub const PORT_EXTENSION: &str = "compass-extension/extension";

/// Inbound frame. `origin` is the page URL and is only set on page frames.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportRequest {
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub request: Value,
}

/// Outbound frame: exactly one of `response`, `error` or `subscription`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
}

impl TransportResponse {
    pub fn from_result(id: String, result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                response: Some(value),
                error: None,
                subscription: None,
            },
            Err(e) => Self {
                id,
                response: None,
                error: Some(e.to_string()),
                subscription: None,
            },
        }
    }

    pub fn subscription(id: String, value: Value) -> Self {
        Self {
            id,
            response: None,
            error: None,
            subscription: Some(value),
        }
    }
}

/// Parse a request payload; `null` counts as an empty object.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    let params = if params.is_null() { Value::Object(Default::default()) } else { params };
    serde_json::from_value(params).map_err(|e| ExtensionError::InvalidRequest(e.to_string()))
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ExtensionError::InvalidRequest(format!("Serialization error: {}", e)))
}

/// Methods a page may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubMethod {
    Connect,
    AccountsList,
    AccountsSubscribe,
    ExtrinsicSign,
    BytesSign,
    MetadataList,
    MetadataProvide,
}

impl PubMethod {
    pub fn from_message(message: &str) -> Result<Self> {
        Ok(match message {
            "pub(connect)" | "pub(authorize.tab)" => PubMethod::Connect,
            "pub(accounts.list)" => PubMethod::AccountsList,
            "pub(accounts.subscribe)" => PubMethod::AccountsSubscribe,
            "pub(extrinsic.sign)" => PubMethod::ExtrinsicSign,
            "pub(bytes.sign)" => PubMethod::BytesSign,
            "pub(metadata.list)" => PubMethod::MetadataList,
            "pub(metadata.provide)" => PubMethod::MetadataProvide,
            other => return Err(ExtensionError::UnknownMessage(other.to_string())),
        })
    }
}

/// Methods only the popup may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriMethod {
    AccountsCreateSuri,
    AccountsCreateExternal,
    AccountsCreateHardware,
    AccountsEdit,
    AccountsExport,
    AccountsBatchExport,
    AccountsForget,
    AccountsShow,
    AccountsTie,
    AccountsChangePassword,
    AccountsValidate,
    AccountsSubscribe,
    JsonRestore,
    JsonBatchRestore,
    SeedCreate,
    SeedValidate,
    DerivationValidate,
    DerivationCreate,
    AuthorizeList,
    AuthorizeUpdate,
    AuthorizeRemove,
    AuthorizeRequests,
    AuthorizeApprove,
    AuthorizeReject,
    MetadataApprove,
    MetadataReject,
    MetadataGet,
    MetadataList,
    MetadataRequests,
    SigningApprovePassword,
    SigningApproveSignature,
    SigningCancel,
    SigningIsLocked,
    SigningRequests,
}

impl PriMethod {
    pub fn from_message(message: &str) -> Result<Self> {
        Ok(match message {
            "pri(accounts.create.suri)" => PriMethod::AccountsCreateSuri,
            "pri(accounts.create.external)" => PriMethod::AccountsCreateExternal,
            "pri(accounts.create.hardware)" => PriMethod::AccountsCreateHardware,
            "pri(accounts.edit)" => PriMethod::AccountsEdit,
            "pri(accounts.export)" => PriMethod::AccountsExport,
            "pri(accounts.batchExport)" => PriMethod::AccountsBatchExport,
            "pri(accounts.forget)" => PriMethod::AccountsForget,
            "pri(accounts.show)" => PriMethod::AccountsShow,
            "pri(accounts.tie)" => PriMethod::AccountsTie,
            "pri(accounts.changePassword)" => PriMethod::AccountsChangePassword,
            "pri(accounts.validate)" => PriMethod::AccountsValidate,
            "pri(accounts.subscribe)" => PriMethod::AccountsSubscribe,
            "pri(json.restore)" => PriMethod::JsonRestore,
            "pri(json.batchRestore)" => PriMethod::JsonBatchRestore,
            "pri(seed.create)" => PriMethod::SeedCreate,
            "pri(seed.validate)" => PriMethod::SeedValidate,
            "pri(derivation.validate)" => PriMethod::DerivationValidate,
            "pri(derivation.create)" => PriMethod::DerivationCreate,
            "pri(authorize.list)" => PriMethod::AuthorizeList,
            "pri(authorize.update)" => PriMethod::AuthorizeUpdate,
            "pri(authorize.remove)" => PriMethod::AuthorizeRemove,
            "pri(authorize.requests)" => PriMethod::AuthorizeRequests,
            "pri(authorize.approve)" => PriMethod::AuthorizeApprove,
            "pri(authorize.reject)" => PriMethod::AuthorizeReject,
            "pri(metadata.approve)" => PriMethod::MetadataApprove,
            "pri(metadata.reject)" => PriMethod::MetadataReject,
            "pri(metadata.get)" => PriMethod::MetadataGet,
            "pri(metadata.list)" => PriMethod::MetadataList,
            "pri(metadata.requests)" => PriMethod::MetadataRequests,
            "pri(signing.approve.password)" => PriMethod::SigningApprovePassword,
            "pri(signing.approve.signature)" => PriMethod::SigningApproveSignature,
            "pri(signing.cancel)" | "pri(signing.reject)" => PriMethod::SigningCancel,
            "pri(signing.isLocked)" => PriMethod::SigningIsLocked,
            "pri(signing.requests)" => PriMethod::SigningRequests,
            other => return Err(ExtensionError::UnknownMessage(other.to_string())),
        })
    }
}

//
// === Page requests ===
//

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RequestAuthorizeTab {
    /// Display name of the requesting dapp.
    pub origin: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccountList {
    #[serde(default)]
    pub any_type: bool,
}

/// Account as exposed to pages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InjectedAccount {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genesis_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: KeypairType,
}

impl From<&AccountJson> for InjectedAccount {
    fn from(account: &AccountJson) -> Self {
        Self {
            address: account.address.clone(),
            genesis_hash: account.meta.genesis_hash.clone(),
            name: account.meta.name.clone(),
            kind: account.kind,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseSigning {
    pub id: String,
    pub signature: String,
}

/// Chain description a page may offer for storage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDef {
    pub chain: String,
    pub genesis_hash: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub ss58_format: u16,
    pub spec_version: u32,
    #[serde(default)]
    pub token_decimals: u32,
    #[serde(default)]
    pub token_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub types: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_extensions: Option<BTreeMap<String, Value>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InjectedMetadataKnown {
    pub genesis_hash: String,
    pub spec_version: u32,
}

//
// === Popup requests ===
//

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccountCreateSuri {
    pub name: String,
    #[serde(default)]
    pub genesis_hash: Option<String>,
    pub password: String,
    pub suri: String,
    #[serde(default, rename = "type")]
    pub kind: KeypairType,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccountCreateExternal {
    pub address: String,
    #[serde(default)]
    pub genesis_hash: Option<String>,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccountCreateHardware {
    pub account_index: u32,
    pub address: String,
    pub address_offset: u32,
    #[serde(default)]
    pub genesis_hash: Option<String>,
    pub hardware_type: String,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestAccountEdit {
    pub address: String,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestAccountExport {
    pub address: String,
    pub password: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResponseAccountExport {
    pub exported_json: KeyringJson,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestAccountBatchExport {
    pub addresses: Vec<String>,
    pub password: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResponseAccountsExport {
    pub exported_json: BatchJson,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestAccountForget {
    pub address: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccountShow {
    pub address: String,
    pub is_showing: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccountTie {
    pub address: String,
    #[serde(default)]
    pub genesis_hash: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccountChangePassword {
    pub address: String,
    pub old_pass: String,
    pub new_pass: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestAccountValidate {
    pub address: String,
    pub password: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestJsonRestore {
    pub file: KeyringJson,
    pub password: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestBatchRestore {
    pub file: BatchJson,
    pub password: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestSeedCreate {
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: KeypairType,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseSeedCreate {
    pub address: String,
    pub seed: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestSeedValidate {
    pub suri: String,
    #[serde(default, rename = "type")]
    pub kind: KeypairType,
}

/// Result of validating a seed or a derivation: the address it produces.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseSuriValidate {
    pub address: String,
    pub suri: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestDeriveValidate {
    pub parent_address: String,
    pub parent_password: String,
    pub suri: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestDeriveCreate {
    pub name: String,
    #[serde(default)]
    pub genesis_hash: Option<String>,
    pub parent_address: String,
    pub parent_password: String,
    pub password: String,
    pub suri: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAuthorizeApprove {
    pub id: String,
    #[serde(default)]
    pub authorized_accounts: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestAuthorizeUpdate {
    pub url: String,
    pub authorized_accounts: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestAuthorizeRemove {
    pub url: String,
}

/// Any request addressed by the id of a pending request.
#[derive(Deserialize, Debug, Clone)]
pub struct RequestById {
    pub id: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadataGet {
    pub genesis_hash: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestSigningApprovePassword {
    pub id: String,
    /// `None` signs with the cached password.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub save_pass: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RequestSigningApproveSignature {
    pub id: String,
    pub signature: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSigningIsLocked {
    pub is_locked: bool,
    pub remaining_time: u64,
}
