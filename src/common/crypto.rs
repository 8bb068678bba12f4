use ed25519_dalek::{ed25519::{self, signature::Signer}, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest as ShaDigest, Sha256};

pub type Digest = [u8; 32];

/// Digest of the null request used to fill gaps in a new-view O set.
pub const NULL_DIGEST: Digest = [0u8; 32];

pub trait Hashable {
    fn hash(&self) -> Digest;
}

/// Thin wrapper so every message hashes its fields the same way.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new(domain: &[u8]) -> Self {
        let mut inner = Sha256::new();
        inner.update(domain);
        Hasher { inner }
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.inner.update((value.len() as u64).to_be_bytes());
        self.inner.update(value);
        self
    }

    pub fn digest(&mut self, value: &Digest) -> &mut Self {
        self.inner.update(value);
        self
    }

    pub fn finish(self) -> Digest {
        let result = self.inner.finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

/// Short hex prefix of a digest, for log fields.
pub fn short(digest: &Digest) -> String {
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// A replica's ed25519 signing identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    pubkey: Pubkey,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Pubkey {
    pub key: [u8; 32],
}

/// Signature over a digest, tagged with the key that produced it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature {
    pub signer: Pubkey,
    pub sig: [u8; 64],
}

impl Keypair {
    pub fn new_pair() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey = Pubkey::from(&signing_key.verifying_key());
        Keypair { signing_key, pubkey }
    }

    pub fn sign(&self, digest: &Digest) -> Signature {
        Signature { signer: self.pubkey.clone(), sig: self.signing_key.sign(digest).to_bytes() }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey.clone()
    }
}

impl From<&VerifyingKey> for Pubkey {
    fn from(key: &VerifyingKey) -> Self {
        Pubkey { key: key.to_bytes() }
    }
}

impl Signature {
    /// Strict ed25519 verification against the embedded signer.
    pub fn verify(&self, digest: &Digest) -> bool {
        let sig = ed25519::Signature::from_bytes(&self.sig);
        VerifyingKey::from_bytes(&self.signer.key)
            .and_then(|key| key.verify_strict(digest, &sig))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::new_pair();
        let digest: Digest = [4; 32];
        let signature = keypair.sign(&digest);
        assert_eq!(signature.signer, keypair.pubkey());
        assert!(signature.verify(&digest));
        assert!(!signature.verify(&[5; 32]));

        let mut tampered = signature.clone();
        tampered.signer = Keypair::new_pair().pubkey();
        assert!(!tampered.verify(&digest));
    }

    #[test]
    fn test_hasher_separates_fields() {
        let mut a = Hasher::new(b"t");
        a.bytes(b"ab").bytes(b"c");
        let mut b = Hasher::new(b"t");
        b.bytes(b"a").bytes(b"bc");
        assert_ne!(a.finish(), b.finish());
    }
}
