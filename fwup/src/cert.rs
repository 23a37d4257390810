// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Public key extraction from a PEM `SubjectPublicKeyInfo` blob.
//!
//! Only uncompressed P-256 points are understood. The DER is not parsed as a
//! tree; the first BIT STRING of the right length inside the outer SEQUENCE is
//! taken as the key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use heapless::Vec;

use crate::error::VerificationError;

const PEM_BEGIN: &[u8] = b"-----BEGIN PUBLIC KEY-----";
const PEM_END: &[u8] = b"-----END PUBLIC KEY-----";

/// Decoded DER never exceeds this.
pub const DER_MAX: usize = 128;
const B64_MAX: usize = DER_MAX / 3 * 4 + 4;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_BIT_STRING: u8 = 0x03;
/// Unused-bits byte, point format byte and two 32 byte coordinates.
const BIT_STRING_LEN: u8 = 0x42;
const POINT_UNCOMPRESSED: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Certificate {
    public_key: [u8; 64],
}

impl Certificate {
    pub fn from_pem(pem: &[u8]) -> Result<Self, VerificationError> {
        let mut der = [0u8; DER_MAX];
        let len = decode_pem(pem, &mut der)?;
        let key = find_point(&der[..len])?;
        Ok(Self { public_key: key })
    }

    /// `x || y` of the public point.
    pub fn public_key(&self) -> &[u8; 64] {
        &self.public_key
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn decode_pem(pem: &[u8], der: &mut [u8; DER_MAX]) -> Result<usize, VerificationError> {
    let start = find(pem, PEM_BEGIN).ok_or(VerificationError::MalformedCertificate)? + PEM_BEGIN.len();
    let end = start + find(&pem[start..], PEM_END).ok_or(VerificationError::MalformedCertificate)?;

    let mut b64: Vec<u8, B64_MAX> = Vec::new();
    for &c in pem[start..end].iter().filter(|c| !c.is_ascii_whitespace()) {
        b64.push(c).map_err(|_| VerificationError::MalformedCertificate)?;
    }

    STANDARD
        .decode_slice(&b64, der)
        .map_err(|_| VerificationError::MalformedCertificate)
}

fn find_point(der: &[u8]) -> Result<[u8; 64], VerificationError> {
    if der.first() != Some(&TAG_SEQUENCE) {
        return Err(VerificationError::MalformedCertificate);
    }
    let outer = usize::from(*der.get(1).ok_or(VerificationError::MalformedCertificate)?);
    // Short form length only, and the whole SEQUENCE must be present.
    if outer >= 0x80 || der.len() < outer + 2 {
        return Err(VerificationError::MalformedCertificate);
    }

    let mut pos = 1;
    while pos <= outer {
        if der[pos] == TAG_BIT_STRING && der.get(pos + 1) == Some(&BIT_STRING_LEN) {
            let body = der
                .get(pos + 2..pos + 2 + usize::from(BIT_STRING_LEN))
                .ok_or(VerificationError::MalformedCertificate)?;
            if body[0] != 0 || body[1] != POINT_UNCOMPRESSED {
                return Err(VerificationError::MalformedCertificate);
            }
            let mut key = [0u8; 64];
            key.copy_from_slice(&body[2..]);
            return Ok(key);
        }
        pos += 1;
    }
    Err(VerificationError::KeyNotFound)
}
