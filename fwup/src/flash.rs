// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serialized access to the flash controller.
//!
//! Erase, write and bank toggle requests are issued to the controller and, on
//! BGO boards, completed by the flash interrupt calling
//! [`FlashAccessLayer::on_interrupt`]. The controller lock is held until the
//! completion arrives so only one request is ever in flight.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};

use crate::board::{Bank, BoardConfig, EraseAddressing, FlashClass, FlashMode, FlashRegion};
use crate::error::{Error, FlashError, ResourceError};
use crate::guard::ResourceGuard;

/// Raw status code reported by the controller driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HwError(pub u32);

/// Board flash driver.
///
/// `erase`, `write` and `bank_toggle` only start the operation on BGO boards;
/// the outcome is delivered through the flash interrupt.
pub trait FlashController {
    fn open(&mut self) -> Result<(), HwError>;
    fn close(&mut self) -> Result<(), HwError>;
    /// Erase `blocks` code or data flash blocks. `addr` follows the board's
    /// [`EraseAddressing`].
    fn erase(&mut self, addr: u32, blocks: u32) -> Result<(), HwError>;
    fn write(&mut self, src: &[u8], dest: u32) -> Result<(), HwError>;
    fn read(&mut self, buf: &mut [u8], src: u32) -> Result<(), HwError>;
    fn bank_toggle(&mut self) -> Result<(), HwError>;
    fn bank_get(&mut self) -> Result<Bank, HwError>;
}

/// Event raised by the flash interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashEvent {
    ErasedOk,
    WrittenOk,
    BankToggledOk,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpKind {
    Erase,
    Write,
    BankToggle,
}

impl OpKind {
    fn success_event(self) -> FlashEvent {
        match self {
            Self::Erase => FlashEvent::ErasedOk,
            Self::Write => FlashEvent::WrittenOk,
            Self::BankToggle => FlashEvent::BankToggledOk,
        }
    }

    fn rejected(self) -> FlashError {
        match self {
            Self::Erase => FlashError::Erase,
            Self::Write => FlashError::Write,
            Self::BankToggle => FlashError::BankToggle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Idle,
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashOperation {
    pub kind: OpKind,
    pub addr: u32,
    pub len: u32,
    pub phase: Phase,
}

pub struct FlashAccessLayer<C> {
    board: BoardConfig,
    guard: ResourceGuard,
    ctrl: Mutex<CriticalSectionRawMutex, C>,
    pending: BlockingMutex<CriticalSectionRawMutex, Cell<Option<OpKind>>>,
    last: BlockingMutex<CriticalSectionRawMutex, Cell<Option<FlashOperation>>>,
    done: Signal<CriticalSectionRawMutex, Phase>,
}

impl<C: FlashController> FlashAccessLayer<C> {
    pub const fn new(ctrl: C, board: BoardConfig) -> Self {
        Self {
            guard: ResourceGuard::new(board.guard),
            board,
            ctrl: Mutex::new(ctrl),
            pending: BlockingMutex::new(Cell::new(None)),
            last: BlockingMutex::new(Cell::new(None)),
            done: Signal::new(),
        }
    }

    pub fn board(&self) -> &BoardConfig {
        &self.board
    }

    pub fn is_open(&self) -> bool {
        self.guard.is_open()
    }

    /// Most recent request and how it ended.
    pub fn last_operation(&self) -> Option<FlashOperation> {
        self.last.lock(|l| l.get())
    }

    pub async fn open(&self) -> Result<(), Error> {
        self.guard
            .open(move || async move {
                let mut ctrl = self.ctrl.lock().await;
                ctrl.open().map_err(|e| {
                    error!("flash open failed: {:#x}", e.0);
                    ResourceError::OpenFailed
                })?;
                self.pending.lock(|p| p.set(None));
                self.done.reset();
                Ok::<_, Error>(())
            })
            .await
    }

    /// Closes the controller once any in-flight request has completed.
    pub async fn close(&self) -> Result<(), Error> {
        self.guard
            .close(move || async move {
                let mut ctrl = self.ctrl.lock().await;
                ctrl.close().map_err(|e| {
                    error!("flash close failed: {:#x}", e.0);
                    ResourceError::CloseFailed
                })?;
                Ok::<_, Error>(())
            })
            .await
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.guard.is_open() {
            Ok(())
        } else {
            Err(ResourceError::NotOpen.into())
        }
    }

    /// Erase `count` blocks of `region` starting at block `first_block`.
    pub async fn erase(&self, region: &FlashRegion, first_block: u32, count: u32) -> Result<(), Error> {
        self.ensure_open()?;
        if count == 0 {
            return Ok(());
        }
        let last_block = first_block.checked_add(count).ok_or(FlashError::OutOfBounds)?;
        if last_block > region.block_count || self.board.region_of(region.base, region.size()) != Some(*region) {
            return Err(FlashError::OutOfBounds.into());
        }

        let start = region.block_address(first_block);
        let mut ctrl = self.ctrl.lock().await;

        // A code flash erase may not cross the board's erase boundary.
        let head = match (region.class, self.board.erase_boundary) {
            (FlashClass::Code, Some(boundary)) if boundary > start && boundary < region.block_address(last_block) => {
                if (boundary - region.base) % region.block_size != 0 {
                    return Err(FlashError::Misaligned.into());
                }
                (boundary - start) / region.block_size
            }
            _ => count,
        };

        for (addr, blocks) in [(start, head), (start + head * region.block_size, count - head)] {
            if blocks == 0 {
                continue;
            }
            let request = match (region.class, self.board.erase_addressing) {
                (FlashClass::Code, EraseAddressing::HighestBlock) => addr + (blocks - 1) * region.block_size,
                _ => addr,
            };
            debug!("erase {} blocks at {:#x}", blocks, addr);
            let timeout = self.board.erase_timeout(blocks);
            self.run(&mut ctrl, OpKind::Erase, addr, blocks * region.block_size, timeout, |c| {
                c.erase(request, blocks)
            })
            .await?;
        }
        Ok(())
    }

    /// Program `src` at `dest`. Both ends must sit on the region's program unit.
    pub async fn write(&self, src: &[u8], dest: u32) -> Result<(), Error> {
        self.ensure_open()?;
        if src.is_empty() {
            return Ok(());
        }
        let len = u32::try_from(src.len()).map_err(|_| FlashError::OutOfBounds)?;
        let region = self.board.region_of(dest, len).ok_or(FlashError::OutOfBounds)?;
        if dest % region.program_unit != 0 || len % region.program_unit != 0 {
            return Err(FlashError::Misaligned.into());
        }

        let mut ctrl = self.ctrl.lock().await;
        let timeout = self.board.write_timeout(len / region.program_unit);
        self.run(&mut ctrl, OpKind::Write, dest, len, timeout, |c| c.write(src, dest)).await?;
        Ok(())
    }

    /// Synchronous read, never waits on the flash interrupt.
    pub async fn read(&self, buf: &mut [u8], src: u32) -> Result<(), Error> {
        self.ensure_open()?;
        let len = u32::try_from(buf.len()).map_err(|_| FlashError::OutOfBounds)?;
        if self.board.region_of(src, len).is_none() {
            return Err(FlashError::OutOfBounds.into());
        }

        let mut ctrl = self.ctrl.lock().await;
        ctrl.read(buf, src).map_err(|e| {
            error!("flash read at {:#x} failed: {:#x}", src, e.0);
            FlashError::Read
        })?;
        Ok(())
    }

    /// Switch the bank the next boot runs from. The request goes out with
    /// interrupts disabled.
    pub async fn bank_toggle(&self) -> Result<(), Error> {
        self.ensure_open()?;
        let mut ctrl = self.ctrl.lock().await;
        let timeout = self.board.flash_timeout;
        self.run(&mut ctrl, OpKind::BankToggle, 0, 0, timeout, |c| {
            critical_section::with(|_| c.bank_toggle())
        })
        .await?;
        Ok(())
    }

    pub async fn active_bank(&self) -> Result<Bank, Error> {
        self.ensure_open()?;
        let mut ctrl = self.ctrl.lock().await;
        let bank = ctrl.bank_get().map_err(|e| {
            error!("bank query failed: {:#x}", e.0);
            FlashError::BankQuery
        })?;
        Ok(bank)
    }

    /// Flash interrupt entry point.
    pub fn on_interrupt(&self, event: FlashEvent) {
        let Some(kind) = self.pending.lock(|p| p.take()) else {
            debug!("flash event {:?} with nothing pending", event);
            return;
        };
        let phase = if event == kind.success_event() {
            Phase::Completed
        } else {
            warn!("flash {:?} completed with {:?}", kind, event);
            Phase::Failed
        };
        self.done.signal(phase);
    }

    async fn run(
        &self,
        ctrl: &mut C,
        kind: OpKind,
        addr: u32,
        len: u32,
        timeout: Duration,
        issue: impl FnOnce(&mut C) -> Result<(), HwError>,
    ) -> Result<(), FlashError> {
        let bgo = self.board.flash_mode == FlashMode::Bgo;
        let mut op = FlashOperation {
            kind,
            addr,
            len,
            phase: Phase::Idle,
        };

        // Armed before issuing, the interrupt may fire before `issue` returns.
        self.done.reset();
        if bgo {
            op.phase = Phase::Pending;
            self.pending.lock(|p| p.set(Some(kind)));
        }
        self.record(op);

        if let Err(e) = issue(ctrl) {
            error!("flash {:?} at {:#x} rejected: {:#x}", kind, addr, e.0);
            self.pending.lock(|p| p.set(None));
            op.phase = Phase::Failed;
            self.record(op);
            return Err(kind.rejected());
        }

        op.phase = if bgo {
            match with_timeout(timeout, self.done.wait()).await {
                Ok(phase) => phase,
                Err(_) => {
                    error!("flash {:?} at {:#x} timed out", kind, addr);
                    self.pending.lock(|p| p.set(None));
                    op.phase = Phase::Failed;
                    self.record(op);
                    return Err(FlashError::Timeout);
                }
            }
        } else {
            Phase::Completed
        };
        self.record(op);

        match op.phase {
            Phase::Completed => Ok(()),
            _ => Err(FlashError::Completion),
        }
    }

    fn record(&self, op: FlashOperation) {
        self.last.lock(|l| l.set(Some(op)));
    }
}
