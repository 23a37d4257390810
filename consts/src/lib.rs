// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]

/// Address where the running firmware bank is mapped.
/// The flash controller remaps the banks on every bank toggle, so the code
/// executing after reset always lives at this address.
pub const CODE_FLASH_MAIN_ADDR: u32 = 0xFFF0_0000;

/// Address where the non-running bank is mapped.
/// Updates are always streamed into this window.
pub const CODE_FLASH_BUFFER_ADDR: u32 = 0xFFE0_0000;

/// Size of one firmware bank (960 KiB).
pub const CODE_FLASH_AREA_SIZE: u32 = 0xF_0000;

/// Code flash erase block size (32 KiB).
pub const CODE_FLASH_BLOCK_SIZE: u32 = 0x8000;

/// Number of erase blocks in one bank.
pub const CODE_FLASH_BLOCK_COUNT: u32 = CODE_FLASH_AREA_SIZE / CODE_FLASH_BLOCK_SIZE;

/// Code flash program unit. Writes are issued in multiples of this size.
pub const CODE_FLASH_PROGRAM_UNIT: u32 = 128;

/// Erase requests on code flash can't cross this address.
/// The controller rejects an erase or blank check spanning the 256 KiB sector.
pub const CODE_FLASH_ERASE_BOUNDARY: u32 = 0xFFE4_0000;

/// Base address of the data flash.
pub const DATA_FLASH_ADDR: u32 = 0x0010_0000;

/// Data flash erase block size.
pub const DATA_FLASH_BLOCK_SIZE: u32 = 64;

/// Number of data flash blocks.
pub const DATA_FLASH_BLOCK_COUNT: u32 = 512;

/// Data flash program unit.
pub const DATA_FLASH_PROGRAM_UNIT: u32 = 4;

/// Longest signature type tag accepted, in bytes.
pub const SIG_TYPE_MAX_LEN: usize = 32;

/// Largest signature block accepted, in bytes (raw P-256 `r || s`).
pub const SIG_SIZE_MAX: usize = 64;

/// Fixed completion budget for any flash request, on top of the per block
/// and per unit budgets below. Also bounds the bank toggle.
pub const FLASH_OP_TIMEOUT_MS: u64 = 2_000;

/// Worst case erase time of one 32 KiB code flash block.
pub const CODE_FLASH_BLOCK_ERASE_MS: u64 = 1_100;

/// Worst case programming time of one 128 byte code flash unit.
pub const CODE_FLASH_UNIT_WRITE_MS: u64 = 10;

/// Delay between confirming the new bank and resetting into it.
pub const BANK_SWAP_SETTLE_MS: u64 = 500;

/// Poll interval while another task opens or closes a shared resource.
pub const GUARD_POLL_MS: u64 = 1;

/// Give up waiting for another task's open/close after this long.
pub const GUARD_DEADLINE_MS: u64 = 1_000;
