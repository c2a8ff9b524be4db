use ed25519_dalek::{Signer, SigningKey};
use std::fmt;
use stellar_xdr::curr::{BytesM, DecoratedSignature, Signature, SignatureHint};

use crate::error::SigningError;

/// Ed25519 keypair with Stellar strkey encoding.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    public_key: String,
}

impl KeyPair {
    pub fn from_secret_seed(seed: &str) -> Result<Self, SigningError> {
        let secret = stellar_strkey::ed25519::PrivateKey::from_string(seed)
            .map_err(|_| SigningError::InvalidKey("distribution seed is invalid".into()))?;
        Ok(Self::from_bytes(&secret.0))
    }

    pub fn random() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self::from_bytes(&bytes)
    }

    fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let public_key =
            stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string();
        Self {
            signing_key,
            public_key,
        }
    }

    /// G... address.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// S... seed. Only leaves this type on its way into the encrypted store.
    pub fn secret_seed(&self) -> String {
        stellar_strkey::ed25519::PrivateKey(self.signing_key.to_bytes()).to_string()
    }

    /// Last four bytes of the public key.
    pub fn hint(&self) -> [u8; 4] {
        let pk = self.public_key_bytes();
        [pk[28], pk[29], pk[30], pk[31]]
    }

    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<DecoratedSignature, SigningError> {
        let signature = self.signing_key.sign(hash);
        let bytes = BytesM::<64>::try_from(signature.to_bytes().to_vec())
            .map_err(|e| SigningError::InvalidKey(format!("signature encoding failed: {:?}", e)))?;
        Ok(DecoratedSignature {
            hint: SignatureHint(self.hint()),
            signature: Signature(bytes),
        })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

pub fn decode_public_key(account: &str) -> Result<[u8; 32], SigningError> {
    stellar_strkey::ed25519::PublicKey::from_string(account)
        .map(|pk| pk.0)
        .map_err(|_| SigningError::InvalidKey(format!("invalid public key {:?}", account)))
}

pub fn is_valid_public_key(account: &str) -> bool {
    decode_public_key(account).is_ok()
}
