//! Secret URI parsing: `<phrase | 0xseed>[/soft|//hard]*[///password]`

use sha2::{Digest, Sha256};

use crate::error::{ExtensionError, Result};

pub const JUNCTION_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeriveJunction {
    Soft([u8; JUNCTION_ID_LEN]),
    Hard([u8; JUNCTION_ID_LEN]),
}

impl DeriveJunction {
    fn parse(segment: &str, hard: bool) -> Self {
        let mut cc = [0u8; JUNCTION_ID_LEN];
        if let Ok(n) = segment.parse::<u64>() {
            cc[..8].copy_from_slice(&n.to_le_bytes());
        } else if segment.len() > JUNCTION_ID_LEN {
            cc.copy_from_slice(&Sha256::digest(segment.as_bytes()));
        } else {
            cc[..segment.len()].copy_from_slice(segment.as_bytes());
        }
        if hard {
            DeriveJunction::Hard(cc)
        } else {
            DeriveJunction::Soft(cc)
        }
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, DeriveJunction::Soft(_))
    }

    pub fn chain_code(&self) -> &[u8; JUNCTION_ID_LEN] {
        match self {
            DeriveJunction::Soft(cc) | DeriveJunction::Hard(cc) => cc,
        }
    }
}

/// A parsed derivation path, e.g. `//polkadot/0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    pub junctions: Vec<DeriveJunction>,
    pub password: Option<String>,
}

impl DerivationPath {
    pub fn has_soft(&self) -> bool {
        self.junctions.iter().any(DeriveJunction::is_soft)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretUri {
    pub phrase: String,
    pub path: DerivationPath,
}

/// Parse the path part of a suri. `path` must be empty or start with `/`.
pub fn parse_path(path: &str) -> Result<DerivationPath> {
    let (path, password) = match path.find("///") {
        Some(idx) => (&path[..idx], Some(path[idx + 3..].to_string())),
        None => (path, None),
    };

    let mut junctions = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        let hard = rest.starts_with("//");
        rest = match (hard, rest.strip_prefix('/')) {
            (true, _) => &rest[2..],
            (false, Some(r)) => r,
            (false, None) => return Err(ExtensionError::InvalidDerivationPath(path.to_string())),
        };
        let end = rest.find('/').unwrap_or(rest.len());
        junctions.push(DeriveJunction::parse(&rest[..end], hard));
        rest = &rest[end..];
    }

    Ok(DerivationPath { junctions, password })
}

/// Split a full suri into phrase and derivation path.
pub fn parse_suri(suri: &str) -> Result<SecretUri> {
    let suri = suri.trim();
    let split = suri.find('/').unwrap_or(suri.len());
    let phrase = suri[..split].trim();
    if phrase.is_empty() {
        return Err(ExtensionError::InvalidSeedOrPath("missing seed phrase".to_string()));
    }
    let path = parse_path(&suri[split..])
        .map_err(|_| ExtensionError::InvalidSeedOrPath(suri[split..].to_string()))?;

    Ok(SecretUri {
        phrase: phrase.to_string(),
        path,
    })
}
