// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host to target firmware update protocol.
//! The host streams a firmware image over a serial link and the target
//! writes it into its inactive flash bank.
//! Messages are `postcard` encoded and COBS framed.

#![no_std]
use serde::{Deserialize, Serialize};

/// Maximum supported message size to be serialized or deserialized by `postcard`.
/// Messages larger than this will be rejected.
pub const COBS_MAX_MSG_SIZE: usize = 512;

/// Largest image block carried by a single [`Update::WriteBlock`].
/// Leaves room for the offset and framing overhead inside [`COBS_MAX_MSG_SIZE`].
pub const MAX_BLOCK_SIZE: usize = 256;

/// Firmware update messages.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum Update<'a> {
    /// Start a new update of `total_size` bytes. Erases the inactive bank.
    Begin { total_size: u32 },
    /// Update started, image goes to `bank`
    AckBegin { bank: u8 },
    /// Image bytes starting at `offset`
    WriteBlock { offset: u32, data: &'a [u8] },
    /// Block accepted, with the CRC-32/ISCSI of its data
    AckWithOffsetCrc { offset: u32, crc: u32 },
    /// Block refused
    NackWithOffset { offset: u32, reason: NackReason },
    /// All bytes sent, verify and switch banks
    Finish { signature_type: &'a str, signature: &'a [u8] },
    /// The image failed verification, running firmware kept
    VerifyFailed,
    /// Drop the current update
    Abort,
    /// Update dropped
    Aborted,
    /// Request the running bank
    GetActiveBank,
    /// Running bank
    ActiveBank { bank: u8 },
}

/// Reasons a block or command was refused.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum NackReason {
    /// No update in progress, or the update is not accepting data
    InvalidState,
    /// Offset does not continue the image
    OutOfSequence,
    /// Block runs past the announced image size
    Overrun,
    /// Not every byte of the image was received
    Incomplete,
    /// Image size is zero or larger than the bank
    InvalidSize,
    /// Flash erase, write or bank toggle failed
    Flash,
    /// A shared hardware resource could not be opened
    Resource,
}

/// Current state of the update engine
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum State {
    /// No update in progress
    Idle,
    /// Receiving image bytes
    Receiving { received: u32, total: u32 },
    /// Last update was abandoned
    Aborted,
}

/// Errors reported while decoding a frame
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum PostcardError {
    /// Frame larger than [`COBS_MAX_MSG_SIZE`]
    OverFull,
    /// Frame could not be decoded
    Deser,
}

/// Top-level message types for host-target communication
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum HostProtocolMessage<'a> {
    /// Firmware update messages
    Update(#[serde(borrow)] Update<'a>),
    /// Query current update state
    GetState,
    /// Response with current state
    AckState(State),
    /// Frame decoding failed
    PostcardError(PostcardError),
    /// Message not valid as a request, state attached
    InappropriateMessage(State),
}
