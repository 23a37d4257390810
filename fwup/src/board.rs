// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Board description: flash geometry, bank layout and timing.
//!
//! One engine serves every board variant; everything that differs between
//! variants lives in a [`BoardConfig`] handed to the flash layer at startup.

use consts::{
    BANK_SWAP_SETTLE_MS, CODE_FLASH_BLOCK_COUNT, CODE_FLASH_BLOCK_SIZE, CODE_FLASH_BUFFER_ADDR, CODE_FLASH_ERASE_BOUNDARY,
    CODE_FLASH_MAIN_ADDR, CODE_FLASH_PROGRAM_UNIT, DATA_FLASH_ADDR, DATA_FLASH_BLOCK_COUNT, DATA_FLASH_BLOCK_SIZE,
    CODE_FLASH_BLOCK_ERASE_MS, CODE_FLASH_UNIT_WRITE_MS, DATA_FLASH_PROGRAM_UNIT, FLASH_OP_TIMEOUT_MS,
    GUARD_DEADLINE_MS, GUARD_POLL_MS,
};
use embassy_time::Duration;

/// One of the two firmware banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    Bank0,
    Bank1,
}

impl Bank {
    pub fn other(self) -> Self {
        match self {
            Self::Bank0 => Self::Bank1,
            Self::Bank1 => Self::Bank0,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Bank0 => 0,
            Self::Bank1 => 1,
        }
    }
}

impl From<Bank> for u8 {
    fn from(bank: Bank) -> Self {
        bank.index() as u8
    }
}

/// Code flash erases whole blocks only, data flash is byte addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashClass {
    Code,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    pub base: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub class: FlashClass,
    /// Writes must start and end on a multiple of this many bytes.
    pub program_unit: u32,
}

impl FlashRegion {
    pub const fn new(base: u32, block_size: u32, block_count: u32, class: FlashClass, program_unit: u32) -> Self {
        Self {
            base,
            block_size,
            block_count,
            class,
            program_unit,
        }
    }

    pub const fn size(&self) -> u32 {
        self.block_size * self.block_count
    }

    /// One past the last address of the region.
    pub const fn end(&self) -> u32 {
        self.base + self.size()
    }

    /// Whether `[addr, addr + len)` lies inside the region.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && u64::from(addr) + u64::from(len) <= u64::from(self.end())
    }

    pub fn block_address(&self, block: u32) -> u32 {
        self.base + block * self.block_size
    }

    /// Blocks needed to hold `len` bytes.
    pub fn blocks_for(&self, len: u32) -> u32 {
        len.div_ceil(self.block_size)
    }
}

/// How the two banks appear in the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BankMapping {
    /// `banks[n]` always holds bank `n`.
    Physical,
    /// The controller maps the running bank at `banks[0]` and the other bank
    /// at `banks[1]`, swapping on every bank toggle.
    Windowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashMode {
    /// Background operation: erase and write complete through the flash interrupt.
    Bgo,
    /// Erase and write return once the hardware is done.
    Blocking,
}

/// Which block address the controller expects for a multi-block code erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EraseAddressing {
    LowestBlock,
    /// Code flash block numbers run downwards from the top of the address
    /// space, so the request names the highest block of the range.
    HighestBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    pub poll: Duration,
    pub deadline: Duration,
}

impl GuardConfig {
    pub const DEFAULT: Self = Self {
        poll: Duration::from_millis(GUARD_POLL_MS),
        deadline: Duration::from_millis(GUARD_DEADLINE_MS),
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardConfig {
    pub banks: [FlashRegion; 2],
    pub bank_mapping: BankMapping,
    pub data_flash: Option<FlashRegion>,
    pub flash_mode: FlashMode,
    /// Code flash erase requests are split so that none crosses this address.
    pub erase_boundary: Option<u32>,
    pub erase_addressing: EraseAddressing,
    /// Completion budget every request gets.
    pub flash_timeout: Duration,
    /// Added to the budget for each block of an erase request.
    pub erase_block_timeout: Duration,
    /// Added to the budget for each program unit of a write request.
    pub write_unit_timeout: Duration,
    pub settle_delay: Duration,
    pub guard: GuardConfig,
}

impl BoardConfig {
    /// Dual-bank reference board: 960 KiB banks in 32 KiB blocks, remapped by
    /// the flash controller on every bank toggle.
    pub const REFERENCE: Self = Self {
        banks: [
            FlashRegion::new(
                CODE_FLASH_MAIN_ADDR,
                CODE_FLASH_BLOCK_SIZE,
                CODE_FLASH_BLOCK_COUNT,
                FlashClass::Code,
                CODE_FLASH_PROGRAM_UNIT,
            ),
            FlashRegion::new(
                CODE_FLASH_BUFFER_ADDR,
                CODE_FLASH_BLOCK_SIZE,
                CODE_FLASH_BLOCK_COUNT,
                FlashClass::Code,
                CODE_FLASH_PROGRAM_UNIT,
            ),
        ],
        bank_mapping: BankMapping::Windowed,
        data_flash: Some(FlashRegion::new(
            DATA_FLASH_ADDR,
            DATA_FLASH_BLOCK_SIZE,
            DATA_FLASH_BLOCK_COUNT,
            FlashClass::Data,
            DATA_FLASH_PROGRAM_UNIT,
        )),
        flash_mode: FlashMode::Bgo,
        erase_boundary: Some(CODE_FLASH_ERASE_BOUNDARY),
        erase_addressing: EraseAddressing::HighestBlock,
        flash_timeout: Duration::from_millis(FLASH_OP_TIMEOUT_MS),
        erase_block_timeout: Duration::from_millis(CODE_FLASH_BLOCK_ERASE_MS),
        write_unit_timeout: Duration::from_millis(CODE_FLASH_UNIT_WRITE_MS),
        settle_delay: Duration::from_millis(BANK_SWAP_SETTLE_MS),
        guard: GuardConfig::DEFAULT,
    };

    /// Region an update must be written to while `active` is running.
    pub fn target_region(&self, active: Bank) -> FlashRegion {
        match self.bank_mapping {
            BankMapping::Physical => self.banks[active.other().index()],
            BankMapping::Windowed => self.banks[1],
        }
    }

    /// Region the running firmware occupies.
    pub fn running_region(&self, active: Bank) -> FlashRegion {
        match self.bank_mapping {
            BankMapping::Physical => self.banks[active.index()],
            BankMapping::Windowed => self.banks[0],
        }
    }

    /// How long an erase of `blocks` blocks may take to complete.
    pub fn erase_timeout(&self, blocks: u32) -> Duration {
        self.flash_timeout + self.erase_block_timeout * blocks
    }

    /// How long a write of `units` program units may take to complete.
    pub fn write_timeout(&self, units: u32) -> Duration {
        self.flash_timeout + self.write_unit_timeout * units
    }

    /// Flash region holding `[addr, addr + len)`, if any.
    pub fn region_of(&self, addr: u32, len: u32) -> Option<FlashRegion> {
        self.banks
            .iter()
            .chain(self.data_flash.iter())
            .find(|r| r.contains(addr, len))
            .copied()
    }
}
