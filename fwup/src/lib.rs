// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Secure dual-bank firmware update engine.
//!
//! A new image is streamed into the inactive flash bank through an
//! [`UpdateSession`], checked against a SHA-256 digest or an ECDSA P-256
//! signature, and activated by toggling the boot bank and resetting. A
//! rejected or interrupted update leaves the running bank untouched.
//!
//! The board supplies a [`FlashController`] whose long operations complete
//! through the flash interrupt (forwarded to [`FlashAccessLayer::on_interrupt`]),
//! a [`SystemControl`] reset line and a [`BoardConfig`].

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bank;
pub mod board;
pub mod cert;
pub mod error;
pub mod flash;
pub mod guard;
pub mod service;
pub mod session;
pub mod verify;

#[cfg(test)]
mod sim;

pub use bank::SystemControl;
pub use board::{Bank, BoardConfig, FlashRegion};
pub use error::Error;
pub use flash::{FlashAccessLayer, FlashController, FlashEvent};
pub use service::{SerialLink, UpdateService};
pub use session::{FirmwareUpdater, UpdateSession};
pub use verify::Verifier;
