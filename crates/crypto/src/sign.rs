use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use mumblechat_core::MessageEnvelope;

use crate::identity::NodeIdentity;
use crate::keys::SigningKeypair;

/// Sign data with a signing keypair
pub fn sign_data(keypair: &SigningKeypair, data: &[u8]) -> [u8; 64] {
    let signature: Signature = keypair.signing_key.sign(data);
    signature.to_bytes()
}

/// Verify a signature
pub fn verify_signature(pubkey: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
    let verifying_key = match VerifyingKey::from_bytes(pubkey) {
        Ok(vk) => vk,
        Err(_) => return false,
    };

    let signature = Signature::from_bytes(signature);

    verifying_key.verify(data, &signature).is_ok()
}

/// Verify a hex-encoded signature; malformed hex fails verification
pub fn verify_hex_signature(pubkey: &[u8; 32], data: &[u8], signature_hex: &str) -> bool {
    let Ok(bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    verify_signature(pubkey, data, &sig)
}

/// Build and sign an envelope from this identity to `recipient`
pub fn sign_envelope(
    identity: &NodeIdentity,
    message_id: &str,
    recipient: &str,
    encrypted_blob: Vec<u8>,
    timestamp: u64,
) -> MessageEnvelope {
    let data = MessageEnvelope::signable_data(
        message_id,
        &identity.wallet_address,
        recipient,
        timestamp,
    );
    let signature = sign_data(&identity.keypair, &data);
    MessageEnvelope {
        message_id: message_id.to_string(),
        sender_address: identity.wallet_address.clone(),
        recipient_address: recipient.to_lowercase(),
        encrypted_blob,
        timestamp,
        signature: hex::encode(signature),
    }
}

/// Verify an envelope's signature against the sender's public key
pub fn verify_envelope(envelope: &MessageEnvelope, sender_pubkey: &[u8; 32]) -> bool {
    let data = MessageEnvelope::signable_data(
        &envelope.message_id,
        &envelope.sender_address,
        &envelope.recipient_address,
        envelope.timestamp,
    );
    verify_hex_signature(sender_pubkey, &data, &envelope.signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = SigningKeypair::generate();
        let data = b"Hello, MumbleChat!";

        let signature = sign_data(&keypair, data);
        assert!(verify_signature(
            &keypair.public_key_bytes(),
            data,
            &signature
        ));

        // Wrong data should fail
        assert!(!verify_signature(
            &keypair.public_key_bytes(),
            b"Wrong data",
            &signature
        ));
    }

    #[test]
    fn test_wrong_pubkey_fails() {
        let keypair1 = SigningKeypair::generate();
        let keypair2 = SigningKeypair::generate();
        let data = b"Test data";

        let signature = sign_data(&keypair1, data);

        assert!(!verify_signature(
            &keypair2.public_key_bytes(),
            data,
            &signature
        ));
    }

    #[test]
    fn test_hex_signature_malformed() {
        let keypair = SigningKeypair::generate();
        assert!(!verify_hex_signature(&keypair.public_key_bytes(), b"x", "zz"));
        assert!(!verify_hex_signature(&keypair.public_key_bytes(), b"x", "abcd"));
    }

    #[test]
    fn test_envelope_sign_verify() {
        let sender = NodeIdentity::generate();
        let recipient = NodeIdentity::generate();
        let env = sign_envelope(&sender, "msg-1", &recipient.wallet_address, vec![1, 2, 3], 42);

        assert!(verify_envelope(&env, &sender.public_key()));
        assert!(!verify_envelope(&env, &recipient.public_key()));

        let mut tampered = env.clone();
        tampered.timestamp = 43;
        assert!(!verify_envelope(&tampered, &sender.public_key()));
    }
}
