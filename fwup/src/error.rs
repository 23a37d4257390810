// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

/// Opening or closing a guarded hardware resource failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResourceError {
    AlreadyOpen,
    NotOpen,
    OpenFailed,
    CloseFailed,
    Timeout,
}

/// Flash controller failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    Erase,
    Write,
    Read,
    BankToggle,
    BankQuery,
    /// The completion interrupt reported something other than success.
    Completion,
    /// No completion interrupt before the board's flash timeout.
    Timeout,
    OutOfBounds,
    Misaligned,
}

/// The image or the key material was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerificationError {
    UnknownSignatureType,
    InvalidSignatureLength,
    MalformedCertificate,
    KeyNotFound,
    InvalidPublicKey,
    DigestMismatch,
    InvalidSignature,
}

impl VerificationError {
    /// Nonzero status code, `0` being reserved for a verified image.
    pub fn code(&self) -> i32 {
        match self {
            Self::UnknownSignatureType => -1,
            Self::InvalidSignatureLength => -2,
            Self::MalformedCertificate => -3,
            Self::KeyNotFound => -4,
            Self::InvalidPublicKey => -5,
            Self::DigestMismatch => -6,
            Self::InvalidSignature => -7,
        }
    }
}

/// Misuse of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    /// Operation not allowed in the session's current state.
    InvalidState,
    /// Data must continue at `expected`.
    OutOfSequence { expected: u32 },
    /// Data runs past the announced image size.
    Overrun,
    /// `finish` called before the whole image was written.
    Incomplete,
    /// Image size is zero or does not fit the target bank.
    InvalidSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Resource(ResourceError),
    Flash(FlashError),
    Verification(VerificationError),
    Session(SessionError),
}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        Self::Resource(e)
    }
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl From<VerificationError> for Error {
    fn from(e: VerificationError) -> Self {
        Self::Verification(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl core::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyOpen => write!(f, "resource already open"),
            Self::NotOpen => write!(f, "resource not open"),
            Self::OpenFailed => write!(f, "resource open failed"),
            Self::CloseFailed => write!(f, "resource close failed"),
            Self::Timeout => write!(f, "timed out waiting for resource transition"),
        }
    }
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Erase => write!(f, "flash erase failed"),
            Self::Write => write!(f, "flash write failed"),
            Self::Read => write!(f, "flash read failed"),
            Self::BankToggle => write!(f, "bank toggle failed"),
            Self::BankQuery => write!(f, "bank query failed"),
            Self::Completion => write!(f, "flash operation completed with an error"),
            Self::Timeout => write!(f, "flash operation did not complete in time"),
            Self::OutOfBounds => write!(f, "flash access out of bounds"),
            Self::Misaligned => write!(f, "flash access misaligned"),
        }
    }
}

impl core::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnknownSignatureType => write!(f, "unknown signature type"),
            Self::InvalidSignatureLength => write!(f, "invalid signature length"),
            Self::MalformedCertificate => write!(f, "malformed certificate"),
            Self::KeyNotFound => write!(f, "no public key in certificate"),
            Self::InvalidPublicKey => write!(f, "invalid public key"),
            Self::DigestMismatch => write!(f, "image digest mismatch"),
            Self::InvalidSignature => write!(f, "invalid image signature"),
        }
    }
}

impl core::fmt::Display for SessionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidState => write!(f, "operation invalid in current update state"),
            Self::OutOfSequence { expected } => write!(f, "out of sequence data, expected offset {expected:#x}"),
            Self::Overrun => write!(f, "data past the end of the image"),
            Self::Incomplete => write!(f, "image incomplete"),
            Self::InvalidSize => write!(f, "invalid image size"),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Resource(e) => write!(f, "{e}"),
            Self::Flash(e) => write!(f, "{e}"),
            Self::Verification(e) => write!(f, "{e}"),
            Self::Session(e) => write!(f, "{e}"),
        }
    }
}
