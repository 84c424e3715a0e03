use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Ed25519 keypair backing a node or wallet identity
#[derive(Clone)]
pub struct SigningKeypair {
    pub signing_key: SigningKey,
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

impl SigningKeypair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Rebuild from a stored secret; `None` unless it is exactly 32 bytes
    pub fn from_secret_slice(secret: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = secret.try_into().ok()?;
        Some(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }
}

pub(crate) fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_restores_keypair() {
        let kp = SigningKeypair::generate();
        let restored = SigningKeypair::from_secret_slice(&kp.secret_key_bytes()).unwrap();
        assert_eq!(restored.public_key_bytes(), kp.public_key_bytes());
        assert!(SigningKeypair::from_secret_slice(&[1u8; 16]).is_none());
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = SigningKeypair::generate();
        let dbg = format!("{:?}", kp);
        assert!(!dbg.contains(&hex::encode(kp.secret_key_bytes())));
        assert!(dbg.contains(&hex::encode(kp.public_key_bytes())));
    }
}
