use bip39::{Language, Mnemonic};
use ed25519_dalek::Signer;
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::rngs::OsRng;
use rand::RngCore;
use schnorrkel::derive::{ChainCode, Derivation};
use schnorrkel::{ExpansionMode, MiniSecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use sha3::Keccak256;

use super::suri::{parse_suri, DeriveJunction};
use crate::error::{ExtensionError, Result};

const SIGNING_CTX: &[u8] = b"substrate";

/// Key algorithm of an account.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeypairType {
    #[default]
    Sr25519,
    Ed25519,
    Ecdsa,
    Ethereum,
}

impl KeypairType {
    /// Only the sr25519 family supports soft (`/`) junctions.
    pub fn supports_soft_derivation(self) -> bool {
        matches!(self, KeypairType::Sr25519)
    }

    /// Leading byte of a multi-signature.
    pub fn signature_prefix(self) -> u8 {
        match self {
            KeypairType::Ed25519 => 0,
            KeypairType::Sr25519 => 1,
            KeypairType::Ecdsa | KeypairType::Ethereum => 2,
        }
    }

    fn hdkd_tag(self) -> &'static [u8] {
        match self {
            KeypairType::Sr25519 => b"Sr25519HDKD",
            KeypairType::Ed25519 => b"Ed25519HDKD",
            KeypairType::Ecdsa => b"Secp256k1HDKD",
            KeypairType::Ethereum => b"EthereumHDKD",
        }
    }
}

impl std::fmt::Display for KeypairType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeypairType::Sr25519 => write!(f, "sr25519"),
            KeypairType::Ed25519 => write!(f, "ed25519"),
            KeypairType::Ecdsa => write!(f, "ecdsa"),
            KeypairType::Ethereum => write!(f, "ethereum"),
        }
    }
}

/// An unlocked keypair. Only ever held in memory for the duration of one
/// operation.
#[derive(Clone)]
pub enum KeyPair {
    Sr25519(schnorrkel::Keypair),
    Ed25519(ed25519_dalek::SigningKey),
    Ecdsa(k256::ecdsa::SigningKey),
    Ethereum(k256::ecdsa::SigningKey),
}

fn crypto_err<E: std::fmt::Display>(e: E) -> ExtensionError {
    ExtensionError::Crypto(e.to_string())
}

fn k256_key(seed: &[u8]) -> Result<k256::ecdsa::SigningKey> {
    k256::ecdsa::SigningKey::from_slice(seed).map_err(crypto_err)
}

/// Generate a new mnemonic of 12, 15, 18, 21 or 24 words.
pub fn generate_mnemonic(words: usize) -> Result<String> {
    if !matches!(words, 12 | 15 | 18 | 21 | 24) {
        return Err(ExtensionError::InvalidRequest(format!("unsupported mnemonic length {}", words)));
    }
    // 32 bits of entropy per 3 words
    let mut entropy = vec![0u8; words / 3 * 4];
    OsRng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy).map_err(crypto_err)?;
    Ok(mnemonic.to_string())
}

/// Mini-secret from a BIP-39 phrase: PBKDF2-HMAC-SHA512 over the entropy.
pub fn mini_secret_from_phrase(phrase: &str, password: &str) -> Result<[u8; 32]> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| ExtensionError::InvalidSeedOrPath(e.to_string()))?;
    let entropy = mnemonic.to_entropy();
    let salt = format!("mnemonic{}", password);

    let mut seed = [0u8; 64];
    pbkdf2::<Hmac<Sha512>>(&entropy, salt.as_bytes(), 2048, &mut seed);

    let mut mini = [0u8; 32];
    mini.copy_from_slice(&seed[..32]);
    Ok(mini)
}

fn seed_from_phrase_or_hex(phrase: &str, password: &str) -> Result<[u8; 32]> {
    if let Some(hex_seed) = phrase.strip_prefix("0x") {
        let bytes = hex::decode(hex_seed).map_err(|e| ExtensionError::InvalidSeedOrPath(e.to_string()))?;
        return bytes
            .try_into()
            .map_err(|_| ExtensionError::InvalidSeedOrPath("hex seed must be 32 bytes".to_string()));
    }
    mini_secret_from_phrase(phrase, password)
}

impl KeyPair {
    pub fn from_seed(kind: KeypairType, seed: &[u8; 32]) -> Result<Self> {
        Ok(match kind {
            KeypairType::Sr25519 => {
                let mini = MiniSecretKey::from_bytes(seed).map_err(crypto_err)?;
                KeyPair::Sr25519(mini.expand_to_keypair(ExpansionMode::Ed25519))
            }
            KeypairType::Ed25519 => KeyPair::Ed25519(ed25519_dalek::SigningKey::from_bytes(seed)),
            KeypairType::Ecdsa => KeyPair::Ecdsa(k256_key(seed)?),
            KeypairType::Ethereum => KeyPair::Ethereum(k256_key(seed)?),
        })
    }

    /// Restore from the bytes returned by [`KeyPair::secret_bytes`].
    pub fn from_secret(kind: KeypairType, bytes: &[u8]) -> Result<Self> {
        match kind {
            KeypairType::Sr25519 => {
                let secret = schnorrkel::SecretKey::from_bytes(bytes).map_err(crypto_err)?;
                Ok(KeyPair::Sr25519(secret.to_keypair()))
            }
            _ => {
                let seed: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| ExtensionError::Crypto("secret must be 32 bytes".to_string()))?;
                Self::from_seed(kind, &seed)
            }
        }
    }

    /// Build from a full suri, applying every junction in the path.
    pub fn from_suri(kind: KeypairType, suri: &str) -> Result<Self> {
        let parsed = parse_suri(suri)?;
        let password = parsed.path.password.as_deref().unwrap_or("");
        let seed = seed_from_phrase_or_hex(&parsed.phrase, password)?;
        let root = Self::from_seed(kind, &seed)?;
        root.derive(&parsed.path.junctions)
    }

    pub fn kind(&self) -> KeypairType {
        match self {
            KeyPair::Sr25519(_) => KeypairType::Sr25519,
            KeyPair::Ed25519(_) => KeypairType::Ed25519,
            KeyPair::Ecdsa(_) => KeypairType::Ecdsa,
            KeyPair::Ethereum(_) => KeypairType::Ethereum,
        }
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        match self {
            KeyPair::Sr25519(kp) => kp.secret.to_bytes().to_vec(),
            KeyPair::Ed25519(sk) => sk.to_bytes().to_vec(),
            KeyPair::Ecdsa(sk) | KeyPair::Ethereum(sk) => sk.to_bytes().to_vec(),
        }
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        match self {
            KeyPair::Sr25519(kp) => kp.public.to_bytes().to_vec(),
            KeyPair::Ed25519(sk) => sk.verifying_key().to_bytes().to_vec(),
            KeyPair::Ecdsa(sk) | KeyPair::Ethereum(sk) => {
                sk.verifying_key().to_encoded_point(true).as_bytes().to_vec()
            }
        }
    }

    pub fn address(&self) -> String {
        match self {
            KeyPair::Ethereum(sk) => {
                let uncompressed = sk.verifying_key().to_encoded_point(false);
                let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
                format!("0x{}", hex::encode(&hash[12..]))
            }
            _ => format!("0x{}", hex::encode(self.public_bytes())),
        }
    }

    fn hard_derive_seed(&self, cc: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().hdkd_tag());
        hasher.update(self.secret_bytes());
        hasher.update(cc);
        hasher.finalize().into()
    }

    /// Apply junctions in order. Soft junctions fail on non-sr25519 keys.
    pub fn derive(&self, junctions: &[DeriveJunction]) -> Result<Self> {
        let mut current = self.clone();
        for junction in junctions {
            current = match (&current, junction) {
                (KeyPair::Sr25519(kp), DeriveJunction::Hard(cc)) => {
                    let (mini, _) = kp.secret.hard_derive_mini_secret_key(Some(ChainCode(*cc)), b"");
                    KeyPair::Sr25519(mini.expand_to_keypair(ExpansionMode::Ed25519))
                }
                (KeyPair::Sr25519(kp), DeriveJunction::Soft(cc)) => {
                    let (child, _) = kp.derived_key_simple(ChainCode(*cc), b"");
                    KeyPair::Sr25519(child)
                }
                (other, DeriveJunction::Hard(cc)) => {
                    let seed = other.hard_derive_seed(cc);
                    Self::from_seed(other.kind(), &seed)?
                }
                (other, DeriveJunction::Soft(_)) => {
                    return Err(ExtensionError::UnsupportedSoftDerivation(other.kind().to_string()))
                }
            };
        }
        Ok(current)
    }

    /// Raw signature over `message` (ecdsa variants prehash, then append the
    /// recovery id).
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            KeyPair::Sr25519(kp) => Ok(kp.sign_simple(SIGNING_CTX, message).to_bytes().to_vec()),
            KeyPair::Ed25519(sk) => Ok(sk.sign(message).to_bytes().to_vec()),
            KeyPair::Ecdsa(sk) => sign_recoverable(sk, &Sha256::digest(message)),
            KeyPair::Ethereum(sk) => sign_recoverable(sk, &Keccak256::digest(message)),
        }
    }

    /// Signature prefixed with the key-type byte.
    pub fn sign_with_type(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![self.kind().signature_prefix()];
        out.extend(self.sign(message)?);
        Ok(out)
    }
}

fn sign_recoverable(sk: &k256::ecdsa::SigningKey, prehash: &[u8]) -> Result<Vec<u8>> {
    let (sig, recid) = sk.sign_prehash_recoverable(prehash).map_err(crypto_err)?;
    let mut out = sig.to_bytes().to_vec();
    out.push(recid.to_byte());
    Ok(out)
}
