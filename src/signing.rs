//! Signing payloads handed in by pages and the bytes that actually get signed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ExtensionError, Result};
use crate::keyring::KeyPair;
use crate::messages::MetadataDef;

/// Extensions every runtime understands without extra type information.
pub const DEFAULT_SIGNED_EXTENSIONS: &[&str] = &[
    "ChargeAssetTxPayment",
    "ChargeTransactionPayment",
    "CheckBlockGasLimit",
    "CheckEra",
    "CheckGenesis",
    "CheckMetadataHash",
    "CheckMortality",
    "CheckNonZeroSender",
    "CheckNonce",
    "CheckSpecVersion",
    "CheckTxVersion",
    "CheckVersion",
    "CheckWeight",
    "LimitParathreadCommits",
    "PrevalidateAttests",
    "RestrictFunctionality",
    "ValidateEquivocationReport",
];

/// Above this size the encoded payload is hashed before signing.
const MAX_UNHASHED_PAYLOAD: usize = 256;

const BYTES_PREFIX: &[u8] = b"<Bytes>";
const BYTES_POSTFIX: &[u8] = b"</Bytes>";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignerPayloadJson {
    pub address: String,
    pub block_hash: String,
    pub block_number: String,
    pub era: String,
    pub genesis_hash: String,
    pub method: String,
    pub nonce: String,
    pub spec_version: String,
    pub tip: String,
    pub transaction_version: String,
    #[serde(default)]
    pub signed_extensions: Vec<String>,
    pub version: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SignerPayloadRaw {
    pub address: String,
    pub data: String,
    #[serde(rename = "type", default = "default_raw_type")]
    pub kind: String,
}

fn default_raw_type() -> String {
    "bytes".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "signType", rename_all = "lowercase")]
pub enum SigningPayload {
    Extrinsic(SignerPayloadJson),
    Bytes(SignerPayloadRaw),
}

fn strip_hex(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

fn hex_bytes(field: &str, s: &str) -> Result<Vec<u8>> {
    hex::decode(strip_hex(s)).map_err(|_| ExtensionError::InvalidRequest(format!("{} is not valid hex", field)))
}

fn hex_number(field: &str, s: &str) -> Result<u128> {
    let digits = strip_hex(s);
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|_| ExtensionError::InvalidRequest(format!("{} is not a hex number", field)))
}

/// [`hex_number`] narrowed to the field's width.
fn hex_int<T: TryFrom<u128>>(field: &str, s: &str) -> Result<T> {
    T::try_from(hex_number(field, s)?).map_err(|_| ExtensionError::InvalidRequest(format!("{} is out of range", field)))
}

impl SignerPayloadJson {
    /// method ‖ era ‖ nonce ‖ tip ‖ specVersion ‖ transactionVersion ‖
    /// genesisHash ‖ blockHash, integers little-endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = hex_bytes("method", &self.method)?;
        out.extend(hex_bytes("era", &self.era)?);
        out.extend(hex_int::<u64>("nonce", &self.nonce)?.to_le_bytes());
        out.extend(hex_number("tip", &self.tip)?.to_le_bytes());
        out.extend(hex_int::<u32>("specVersion", &self.spec_version)?.to_le_bytes());
        out.extend(hex_int::<u32>("transactionVersion", &self.transaction_version)?.to_le_bytes());
        out.extend(hex_bytes("genesisHash", &self.genesis_hash)?);
        out.extend(hex_bytes("blockHash", &self.block_hash)?);
        Ok(out)
    }

    pub fn signing_message(&self) -> Result<Vec<u8>> {
        let encoded = self.encode()?;
        if encoded.len() > MAX_UNHASHED_PAYLOAD {
            Ok(Sha256::digest(&encoded).to_vec())
        } else {
            Ok(encoded)
        }
    }

    /// Every extension must be a default one or declared by the stored
    /// metadata of the target chain.
    pub fn check_signed_extensions(&self, metadata: Option<&MetadataDef>) -> Result<()> {
        for name in &self.signed_extensions {
            let known = DEFAULT_SIGNED_EXTENSIONS.contains(&name.as_str())
                || metadata
                    .and_then(|m| m.user_extensions.as_ref())
                    .is_some_and(|ext| ext.contains_key(name));
            if !known {
                return Err(ExtensionError::UnsupportedSignedExtension(name.clone()));
            }
        }
        Ok(())
    }
}

impl SignerPayloadRaw {
    /// Message bytes wrapped in `<Bytes>…</Bytes>` unless already wrapped.
    pub fn wrapped_data(&self) -> Result<Vec<u8>> {
        let data = if self.data.starts_with("0x") {
            hex_bytes("data", &self.data)?
        } else {
            self.data.as_bytes().to_vec()
        };
        if data.starts_with(BYTES_PREFIX) && data.ends_with(BYTES_POSTFIX) {
            return Ok(data);
        }
        let mut out = Vec::with_capacity(data.len() + BYTES_PREFIX.len() + BYTES_POSTFIX.len());
        out.extend_from_slice(BYTES_PREFIX);
        out.extend_from_slice(&data);
        out.extend_from_slice(BYTES_POSTFIX);
        Ok(out)
    }
}

impl SigningPayload {
    pub fn address(&self) -> &str {
        match self {
            SigningPayload::Extrinsic(p) => &p.address,
            SigningPayload::Bytes(p) => &p.address,
        }
    }

    /// Sign with `pair`, returning a `0x` hex signature. Extrinsic signatures
    /// carry the key-type byte, raw ones do not.
    pub fn sign(&self, pair: &KeyPair) -> Result<String> {
        let signature = match self {
            SigningPayload::Extrinsic(p) => pair.sign_with_type(&p.signing_message()?)?,
            SigningPayload::Bytes(p) => pair.sign(&p.wrapped_data()?)?,
        };
        Ok(format!("0x{}", hex::encode(signature)))
    }
}
