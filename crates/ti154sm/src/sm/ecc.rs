//! Elliptic-curve key agreement for the commissioning handshake
//!
//! Key material for one run lives in [`EccKeyMaterial`], which wipes itself
//! when cleared or dropped. The curve arithmetic sits behind
//! [`CryptoProvider`] so a hardware engine can stand in for [`SoftwareCrypto`].

use super::constants::*;
use super::crypto::{AesBlockCipher, SoftwareAes};
use super::error::{SmError, SmResult};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{AffinePoint, ProjectivePoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Uncompressed SEC1 point: 0x04 || X || Y
pub type PublicKeyBytes = [u8; SM_ECC_PUBLIC_KEY_LEN];

/// Cryptographic services used by the handshake
pub trait CryptoProvider: AesBlockCipher {
    /// Generate a fresh P-256 key pair
    fn gen_key_pair(&mut self) -> SmResult<([u8; SM_ECC_KEY_LEN], PublicKeyBytes)>;

    /// Multiply the foreign public point by our private scalar
    fn shared_secret(
        &mut self,
        private_key: &[u8; SM_ECC_KEY_LEN],
        foreign_public_key: &PublicKeyBytes,
    ) -> SmResult<PublicKeyBytes>;

    /// Fill `buf` with cryptographically secure random bytes
    fn random_bytes(&mut self, buf: &mut [u8]) -> SmResult<()>;
}

/// Software provider: p256 for the curve, aes for the block cipher
pub struct SoftwareCrypto<R = OsRng> {
    rng: R,
}

impl SoftwareCrypto<OsRng> {
    /// Create a provider drawing from the operating system RNG
    pub fn new() -> Self {
        Self { rng: OsRng }
    }
}

impl Default for SoftwareCrypto<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore + CryptoRng> SoftwareCrypto<R> {
    /// Create a provider over a caller-supplied RNG
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }
}

impl<R> AesBlockCipher for SoftwareCrypto<R> {
    fn aes_ecb_encrypt_block(&self, key: &[u8; 16], block: &[u8; 16]) -> SmResult<[u8; 16]> {
        SoftwareAes.aes_ecb_encrypt_block(key, block)
    }
}

fn encode_point(point: &AffinePoint) -> SmResult<PublicKeyBytes> {
    let encoded = point.to_encoded_point(false);
    encoded
        .as_bytes()
        .try_into()
        .map_err(|_| SmError::Crypto("point is not an uncompressed SEC1 encoding".into()))
}

impl<R: RngCore + CryptoRng> CryptoProvider for SoftwareCrypto<R> {
    fn gen_key_pair(&mut self) -> SmResult<([u8; SM_ECC_KEY_LEN], PublicKeyBytes)> {
        let secret = SecretKey::random(&mut self.rng);
        let public = encode_point(secret.public_key().as_affine())?;

        let mut private = [0u8; SM_ECC_KEY_LEN];
        private.copy_from_slice(&secret.to_bytes());
        Ok((private, public))
    }

    fn shared_secret(
        &mut self,
        private_key: &[u8; SM_ECC_KEY_LEN],
        foreign_public_key: &PublicKeyBytes,
    ) -> SmResult<PublicKeyBytes> {
        let secret = SecretKey::from_slice(private_key)
            .map_err(|_| SmError::Crypto("invalid private key".into()))?;
        let foreign = PublicKey::from_sec1_bytes(foreign_public_key)
            .map_err(|_| SmError::Crypto("invalid foreign public key".into()))?;

        let point = ProjectivePoint::from(*foreign.as_affine()) * *secret.to_nonzero_scalar();
        encode_point(&AffinePoint::from(point))
    }

    fn random_bytes(&mut self, buf: &mut [u8]) -> SmResult<()> {
        self.rng
            .try_fill_bytes(buf)
            .map_err(|e| SmError::Crypto(e.to_string()))
    }
}

/// ECDH key material for a single handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EccKeyMaterial {
    /// Local private scalar
    pub private_key: [u8; SM_ECC_KEY_LEN],
    /// Local public point
    pub local_public_key: PublicKeyBytes,
    /// Peer public point
    pub foreign_public_key: PublicKeyBytes,
    /// Raw ECDH output point (or the stored seed during key refresh)
    pub shared_secret: PublicKeyBytes,
}

impl Default for EccKeyMaterial {
    fn default() -> Self {
        Self {
            private_key: [0; SM_ECC_KEY_LEN],
            local_public_key: [0; SM_ECC_PUBLIC_KEY_LEN],
            foreign_public_key: [0; SM_ECC_PUBLIC_KEY_LEN],
            shared_secret: [0; SM_ECC_PUBLIC_KEY_LEN],
        }
    }
}

impl std::fmt::Debug for EccKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EccKeyMaterial")
            .field("local_public_key", &hex::encode(&self.local_public_key[..9]))
            .field("foreign_public_key", &hex::encode(&self.foreign_public_key[..9]))
            .finish_non_exhaustive()
    }
}

/// Little-endian x-coordinate of an uncompressed point
pub fn x_coordinate(point: &PublicKeyBytes) -> [u8; SM_ECC_KEY_LEN] {
    let mut x = [0u8; SM_ECC_KEY_LEN];
    x.copy_from_slice(&point[1..1 + SM_ECC_KEY_LEN]);
    x.reverse();
    x
}

impl EccKeyMaterial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the local key pair
    pub fn generate_local<P: CryptoProvider + ?Sized>(&mut self, provider: &mut P) -> SmResult<()> {
        let (private_key, public_key) = provider.gen_key_pair()?;
        self.private_key = private_key;
        self.local_public_key = public_key;
        trace!(public = %hex::encode(&public_key[..9]), "generated local key pair");
        Ok(())
    }

    /// Record the public key received from the peer
    pub fn set_foreign(&mut self, public_key: &[u8]) -> SmResult<()> {
        if public_key.len() < SM_ECC_PUBLIC_KEY_LEN {
            return Err(SmError::InvalidMessage(format!(
                "public key is {} bytes, expected {}",
                public_key.len(),
                SM_ECC_PUBLIC_KEY_LEN
            )));
        }
        self.foreign_public_key
            .copy_from_slice(&public_key[..SM_ECC_PUBLIC_KEY_LEN]);
        Ok(())
    }

    /// Compute the shared secret from our private key and the foreign key
    pub fn compute_shared_secret<P: CryptoProvider + ?Sized>(
        &mut self,
        provider: &mut P,
    ) -> SmResult<()> {
        self.shared_secret = provider.shared_secret(&self.private_key, &self.foreign_public_key)?;
        trace!(secret = %hex::encode(&self.shared_secret[..9]), "computed shared secret");
        Ok(())
    }

    /// Seed the shared secret from a stored seed key (key refresh)
    pub fn load_seed(&mut self, seed: &PublicKeyBytes) {
        self.shared_secret = *seed;
    }

    /// Local public-key x-coordinate as fed to f1
    pub fn local_x(&self) -> [u8; SM_ECC_KEY_LEN] {
        x_coordinate(&self.local_public_key)
    }

    /// Foreign public-key x-coordinate as fed to f1
    pub fn foreign_x(&self) -> [u8; SM_ECC_KEY_LEN] {
        x_coordinate(&self.foreign_public_key)
    }

    /// Shared-secret x-coordinate as fed to f2
    pub fn secret_x(&self) -> [u8; SM_ECC_KEY_LEN] {
        x_coordinate(&self.shared_secret)
    }

    /// Wipe everything
    pub fn clear(&mut self) {
        self.zeroize();
    }
}
