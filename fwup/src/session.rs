// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Streaming an image into the inactive bank.
//!
//! A session erases the target bank, programs the image as it arrives, checks
//! the signature and hands over to [`bank::swap`]. Any flash failure or a
//! rejected image aborts the session and leaves the running bank as it was.

use core::convert::Infallible;

use heapless::Vec;

use crate::bank::{self, SystemControl};
use crate::board::{Bank, FlashRegion};
use crate::error::{Error, FlashError, SessionError};
use crate::flash::{FlashAccessLayer, FlashController};
use crate::verify::{ImageDigest, Verifier};

/// Largest program unit a session can stage.
pub const STAGE_MAX: usize = 256;

const ERASED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Idle,
    Erasing,
    Writing,
    Verifying,
    Committing,
    Aborted,
}

/// Entry point for starting updates.
pub struct FirmwareUpdater<'a, C, S> {
    flash: &'a FlashAccessLayer<C>,
    verifier: &'a Verifier,
    system: &'a S,
}

impl<C, S> Clone for FirmwareUpdater<'_, C, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C, S> Copy for FirmwareUpdater<'_, C, S> {}

impl<'a, C: FlashController, S: SystemControl> FirmwareUpdater<'a, C, S> {
    pub const fn new(flash: &'a FlashAccessLayer<C>, verifier: &'a Verifier, system: &'a S) -> Self {
        Self {
            flash,
            verifier,
            system,
        }
    }

    pub fn flash(&self) -> &'a FlashAccessLayer<C> {
        self.flash
    }

    /// Open the flash, erase room for `total_size` bytes in the inactive bank
    /// and return a session ready to accept data.
    pub async fn begin(&self, total_size: u32) -> Result<UpdateSession<'a, C, S>, Error> {
        if total_size == 0 {
            return Err(SessionError::InvalidSize.into());
        }
        self.flash.open().await?;

        let mut session = UpdateSession {
            updater: *self,
            region: self.flash.board().banks[1],
            bank: Bank::Bank1,
            state: SessionState::Idle,
            total: total_size,
            received: 0,
            written: 0,
            staged: Vec::new(),
            digest: ImageDigest::new(),
        };
        match session.prepare().await {
            Ok(()) => Ok(session),
            Err(e) => Err(session.fail(e).await),
        }
    }
}

pub struct UpdateSession<'a, C, S> {
    updater: FirmwareUpdater<'a, C, S>,
    region: FlashRegion,
    bank: Bank,
    state: SessionState,
    total: u32,
    received: u32,
    /// Bytes already programmed, always a multiple of the program unit.
    written: u32,
    staged: Vec<u8, STAGE_MAX>,
    digest: ImageDigest,
}

impl<C: FlashController, S: SystemControl> UpdateSession<'_, C, S> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Bank the image is written to.
    pub fn bank(&self) -> Bank {
        self.bank
    }

    pub fn region(&self) -> &FlashRegion {
        &self.region
    }

    async fn prepare(&mut self) -> Result<(), Error> {
        let flash = self.updater.flash;
        let active = flash.active_bank().await?;
        self.bank = active.other();
        self.region = flash.board().target_region(active);

        if self.total > self.region.size() {
            return Err(SessionError::InvalidSize.into());
        }
        if self.region.program_unit as usize > STAGE_MAX {
            return Err(FlashError::Misaligned.into());
        }

        info!(
            "update of {} bytes into {:?} at {:#x}",
            self.total, self.bank, self.region.base
        );
        self.state = SessionState::Erasing;
        flash
            .erase(&self.region, 0, self.region.blocks_for(self.total))
            .await?;
        self.state = SessionState::Writing;
        Ok(())
    }

    /// Append `chunk` right after the bytes accepted so far.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.append_at(self.received, chunk).await
    }

    /// Accept `chunk` as the image bytes at `offset`.
    ///
    /// `offset` must continue the image exactly; gaps, overlaps and data past
    /// the announced size are refused without touching flash or the session.
    pub async fn append_at(&mut self, offset: u32, chunk: &[u8]) -> Result<(), Error> {
        if self.state != SessionState::Writing {
            return Err(SessionError::InvalidState.into());
        }
        if offset != self.received {
            return Err(SessionError::OutOfSequence {
                expected: self.received,
            }
            .into());
        }
        let len = u32::try_from(chunk.len()).map_err(|_| SessionError::Overrun)?;
        match self.received.checked_add(len) {
            Some(end) if end <= self.total => {}
            _ => return Err(SessionError::Overrun.into()),
        }
        if chunk.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.program(chunk).await {
            return Err(self.fail(e).await);
        }
        self.digest.update(chunk);
        self.received += len;
        Ok(())
    }

    async fn program(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let flash = self.updater.flash;
        let unit = self.region.program_unit as usize;
        let mut rest = chunk;

        if !self.staged.is_empty() {
            let take = (unit - self.staged.len()).min(rest.len());
            self.stage(&rest[..take])?;
            rest = &rest[take..];
            if self.staged.len() == unit {
                flash.write(&self.staged, self.region.base + self.written).await?;
                self.written += unit as u32;
                self.staged.clear();
            }
        }

        let whole = rest.len() - rest.len() % unit;
        if whole > 0 {
            flash.write(&rest[..whole], self.region.base + self.written).await?;
            self.written += whole as u32;
        }
        self.stage(&rest[whole..])
    }

    fn stage(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.staged
            .extend_from_slice(bytes)
            .map_err(|_| FlashError::Misaligned.into())
    }

    /// Program the staged tail, verify the image and switch banks.
    ///
    /// Never returns on success: the device restarts into the new image.
    pub async fn finish(&mut self, signature_type: &str, signature: &[u8]) -> Result<Infallible, Error> {
        if self.state != SessionState::Writing {
            return Err(SessionError::InvalidState.into());
        }
        if self.received != self.total {
            warn!("finish after {} of {} bytes", self.received, self.total);
            return Err(self.fail(SessionError::Incomplete.into()).await);
        }

        if !self.staged.is_empty() {
            let unit = self.region.program_unit as usize;
            if self.staged.resize(unit, ERASED).is_err() {
                return Err(self.fail(FlashError::Misaligned.into()).await);
            }
            let flash = self.updater.flash;
            if let Err(e) = flash.write(&self.staged, self.region.base + self.written).await {
                return Err(self.fail(e).await);
            }
            self.written += unit as u32;
            self.staged.clear();
        }

        self.state = SessionState::Verifying;
        let digest = core::mem::take(&mut self.digest).finalize();
        if let Err(e) = self.updater.verifier.verify(&digest, signature_type, signature) {
            warn!("image rejected: {}", e);
            return Err(self.fail(e).await);
        }

        info!("image verified, committing");
        self.state = SessionState::Committing;
        match bank::swap(self.updater.flash, self.updater.system).await {
            Ok(never) => match never {},
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Drop the update. The running bank is left as it was.
    pub async fn abort(&mut self) -> Result<(), Error> {
        if self.state == SessionState::Aborted {
            return Err(SessionError::InvalidState.into());
        }
        info!("update aborted after {} bytes", self.received);
        self.state = SessionState::Aborted;
        self.updater.flash.close().await
    }

    async fn fail(&mut self, e: Error) -> Error {
        error!("update failed: {}", e);
        self.state = SessionState::Aborted;
        if self.updater.flash.is_open() {
            if let Err(e) = self.updater.flash.close().await {
                warn!("flash close failed: {}", e);
            }
        }
        e
    }
}
