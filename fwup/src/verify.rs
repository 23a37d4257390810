// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Image verification: streaming SHA-256 and the signature check.

use core::cell::Cell;

use consts::{SIG_SIZE_MAX, SIG_TYPE_MAX_LEN};
use constant_time_eq::constant_time_eq_32;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest as _, Sha256};

use crate::board::GuardConfig;
use crate::cert::Certificate;
use crate::error::{Error, ResourceError, VerificationError};
use crate::flash::{FlashAccessLayer, FlashController};
use crate::guard::ResourceGuard;

/// The signature is the bare SHA-256 of the image.
pub const HASH_SHA256: &str = "hash-sha256";
/// The signature is a raw `r || s` ECDSA P-256 signature over the image's SHA-256.
pub const SIG_SHA256_ECDSA: &str = "sig-sha256-ecdsa";

/// Largest PEM blob read back from flash.
pub const PEM_MAX: usize = 256;

pub type Digest = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SignatureType {
    HashSha256,
    SigSha256Ecdsa,
}

impl SignatureType {
    pub fn parse(tag: &str) -> Result<Self, VerificationError> {
        if tag.len() > SIG_TYPE_MAX_LEN {
            return Err(VerificationError::UnknownSignatureType);
        }
        match tag {
            HASH_SHA256 => Ok(Self::HashSha256),
            SIG_SHA256_ECDSA => Ok(Self::SigSha256Ecdsa),
            _ => Err(VerificationError::UnknownSignatureType),
        }
    }
}

/// Running SHA-256 of the image bytes accepted so far.
#[derive(Clone, Default)]
pub struct ImageDigest(Sha256);

impl ImageDigest {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        self.0.finalize().into()
    }
}

/// Signature checker holding the public key in the crypto core.
pub struct Verifier {
    guard: ResourceGuard,
    key: Mutex<CriticalSectionRawMutex, Cell<Option<[u8; 64]>>>,
}

impl Verifier {
    pub const fn new(guard: GuardConfig) -> Self {
        Self {
            guard: ResourceGuard::new(guard),
            key: Mutex::new(Cell::new(None)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.guard.is_open()
    }

    /// Load the public key from a PEM blob into the crypto core.
    pub async fn open(&self, pem: &[u8]) -> Result<(), Error> {
        self.guard
            .open(move || async move {
                let cert = Certificate::from_pem(pem)?;
                let key = *cert.public_key();
                self.key.lock(|k| k.set(Some(key)));
                info!("signing key loaded");
                Ok::<_, Error>(())
            })
            .await
    }

    /// Load the PEM blob stored at `src` in data or code flash.
    pub async fn open_from_flash<C: FlashController>(
        &self,
        flash: &FlashAccessLayer<C>,
        src: u32,
        len: usize,
    ) -> Result<(), Error> {
        let mut pem = [0u8; PEM_MAX];
        let pem = pem.get_mut(..len).ok_or(VerificationError::MalformedCertificate)?;
        flash.read(pem, src).await?;
        self.open(pem).await
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.guard
            .close(move || async move {
                self.key.lock(|k| k.set(None));
                Ok::<_, Error>(())
            })
            .await
    }

    /// `Ok(())` if `signature` authenticates the image with SHA-256 `digest`.
    pub fn verify(&self, digest: &Digest, signature_type: &str, signature: &[u8]) -> Result<(), Error> {
        if signature.len() > SIG_SIZE_MAX {
            return Err(VerificationError::InvalidSignatureLength.into());
        }

        match SignatureType::parse(signature_type)? {
            SignatureType::HashSha256 => {
                let expected: &Digest = signature
                    .try_into()
                    .map_err(|_| VerificationError::InvalidSignatureLength)?;
                if !constant_time_eq_32(expected, digest) {
                    return Err(VerificationError::DigestMismatch.into());
                }
            }
            SignatureType::SigSha256Ecdsa => {
                if !self.guard.is_open() {
                    return Err(ResourceError::NotOpen.into());
                }
                let key = self.key.lock(|k| k.get()).ok_or(VerificationError::KeyNotFound)?;
                verify_ecdsa(&key, digest, signature)?;
            }
        }
        Ok(())
    }
}

fn verify_ecdsa(key: &[u8; 64], digest: &Digest, signature: &[u8]) -> Result<(), VerificationError> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(key);
    let key = VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| VerificationError::InvalidPublicKey)?;

    if signature.len() != 64 {
        return Err(VerificationError::InvalidSignatureLength);
    }
    let signature = Signature::from_slice(signature).map_err(|_| VerificationError::InvalidSignature)?;
    key.verify_prehash(digest, &signature)
        .map_err(|_| VerificationError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, public_key_pem, sha256, sign, Sim, TEST_BOARD};
    use futures::executor::block_on;

    const IMAGE: &[u8] = b"dual bank image payload that is long enough to chunk in a few ways";

    fn verifier_with_key() -> Verifier {
        let verifier = Verifier::new(TEST_BOARD.guard);
        block_on(verifier.open(public_key_pem().as_bytes())).unwrap();
        verifier
    }

    #[test]
    fn chunked_digest_matches_one_shot() {
        let expected = sha256(IMAGE);
        for chunk in [1, 3, 16, 64, IMAGE.len()] {
            let mut digest = ImageDigest::new();
            for c in IMAGE.chunks(chunk) {
                digest.update(c);
            }
            assert_eq!(digest.finalize(), expected, "chunk size {chunk}");
        }
    }

    #[test]
    fn hash_mode() {
        let verifier = Verifier::new(TEST_BOARD.guard);
        let digest = sha256(IMAGE);
        assert_eq!(verifier.verify(&digest, HASH_SHA256, &digest), Ok(()));

        let mut flipped = digest;
        flipped[31] ^= 0x01;
        assert_eq!(
            verifier.verify(&digest, HASH_SHA256, &flipped),
            Err(Error::Verification(VerificationError::DigestMismatch))
        );
        assert_eq!(
            verifier.verify(&digest, HASH_SHA256, &digest[..31]),
            Err(Error::Verification(VerificationError::InvalidSignatureLength))
        );
    }

    #[test]
    fn tags_and_lengths() {
        let verifier = Verifier::new(TEST_BOARD.guard);
        let digest = sha256(IMAGE);
        assert_eq!(
            verifier.verify(&digest, "hash-sha512", &digest),
            Err(Error::Verification(VerificationError::UnknownSignatureType))
        );
        assert_eq!(
            verifier.verify(&digest, "HASH-SHA256", &digest),
            Err(Error::Verification(VerificationError::UnknownSignatureType))
        );
        let long_tag = "hash-sha256".repeat(4);
        assert_eq!(
            verifier.verify(&digest, &long_tag, &digest),
            Err(Error::Verification(VerificationError::UnknownSignatureType))
        );
        assert_eq!(
            verifier.verify(&digest, SIG_SHA256_ECDSA, &[0; 65]),
            Err(Error::Verification(VerificationError::InvalidSignatureLength))
        );
    }

    #[test]
    fn ecdsa_mode() {
        let verifier = verifier_with_key();
        let digest = sha256(IMAGE);
        let signature = sign(IMAGE);
        assert_eq!(verifier.verify(&digest, SIG_SHA256_ECDSA, &signature), Ok(()));

        let other = sha256(b"another image");
        assert_eq!(
            verifier.verify(&other, SIG_SHA256_ECDSA, &signature),
            Err(Error::Verification(VerificationError::InvalidSignature))
        );
        assert_eq!(
            verifier.verify(&digest, SIG_SHA256_ECDSA, &signature[..63]),
            Err(Error::Verification(VerificationError::InvalidSignatureLength))
        );
    }

    #[test]
    fn ecdsa_needs_open_core() {
        let verifier = verifier_with_key();
        block_on(verifier.close()).unwrap();
        let digest = sha256(IMAGE);
        assert_eq!(
            verifier.verify(&digest, SIG_SHA256_ECDSA, &sign(IMAGE)),
            Err(Error::Resource(ResourceError::NotOpen))
        );
        // Hash mode keeps working without the core.
        assert_eq!(verifier.verify(&digest, HASH_SHA256, &digest), Ok(()));
    }

    #[test]
    fn open_rejects_bad_pem_and_double_open() {
        let verifier = Verifier::new(TEST_BOARD.guard);
        assert_eq!(
            block_on(verifier.open(b"not a pem")),
            Err(Error::Verification(VerificationError::MalformedCertificate))
        );
        assert!(!verifier.is_open());

        block_on(verifier.open(public_key_pem().as_bytes())).unwrap();
        assert_eq!(
            block_on(verifier.open(public_key_pem().as_bytes())),
            Err(Error::Resource(ResourceError::AlreadyOpen))
        );
    }

    #[test]
    fn key_from_data_flash() {
        let sim = Sim::new(&TEST_BOARD);
        let flash = FlashAccessLayer::new(sim.clone(), TEST_BOARD);
        let df = TEST_BOARD.data_flash.unwrap();
        let pem = public_key_pem();
        sim.load(df.base + 64, pem.as_bytes());

        let verifier = Verifier::new(TEST_BOARD.guard);
        sim::run(&flash, &sim, async {
            flash.open().await.unwrap();
            verifier.open_from_flash(&flash, df.base + 64, pem.len()).await.unwrap();
        });
        assert_eq!(verifier.verify(&sha256(IMAGE), SIG_SHA256_ECDSA, &sign(IMAGE)), Ok(()));
    }

    #[test]
    fn error_codes_are_distinct_and_nonzero() {
        let all = [
            VerificationError::UnknownSignatureType,
            VerificationError::InvalidSignatureLength,
            VerificationError::MalformedCertificate,
            VerificationError::KeyNotFound,
            VerificationError::InvalidPublicKey,
            VerificationError::DigestMismatch,
            VerificationError::InvalidSignature,
        ];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(a.code(), 0);
            assert!(all[i + 1..].iter().all(|b| b.code() != a.code()));
        }
    }
}
