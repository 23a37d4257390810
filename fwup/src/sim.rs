// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Simulated flash controller and board used by the unit tests.
//!
//! Requests take effect immediately; on BGO boards the completion event is
//! queued on a simulated interrupt line that [`run`] pumps into the flash
//! layer alongside the future under test.

use core::convert::Infallible;
use core::future::Future;
use core::pin::pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use futures::executor::block_on;
use futures::future::{select, Either};
use p256::ecdsa::SigningKey;
use sha2::{Digest as _, Sha256};

use crate::bank::SystemControl;
use crate::board::{
    Bank, BankMapping, BoardConfig, EraseAddressing, FlashClass, FlashMode, FlashRegion, GuardConfig,
};
use crate::flash::{FlashAccessLayer, FlashController, FlashEvent, HwError};
use crate::session::FirmwareUpdater;
use crate::verify::Verifier;

/// Two 16 KiB banks of 1 KiB blocks with an erase boundary two blocks into the
/// second bank, plus a small data flash.
pub const TEST_BOARD: BoardConfig = BoardConfig {
    banks: [
        FlashRegion::new(0x1000_0000, 0x400, 16, FlashClass::Code, 16),
        FlashRegion::new(0x1001_0000, 0x400, 16, FlashClass::Code, 16),
    ],
    bank_mapping: BankMapping::Physical,
    data_flash: Some(FlashRegion::new(0x2000_0000, 64, 32, FlashClass::Data, 4)),
    flash_mode: FlashMode::Bgo,
    erase_boundary: Some(0x1001_0800),
    erase_addressing: EraseAddressing::HighestBlock,
    flash_timeout: Duration::from_millis(50),
    erase_block_timeout: Duration::from_millis(20),
    write_unit_timeout: Duration::from_millis(1),
    settle_delay: Duration::from_millis(1),
    guard: GuardConfig {
        poll: Duration::from_millis(1),
        deadline: Duration::from_millis(100),
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    Erase { addr: u32, blocks: u32 },
    Write { dest: u32, len: u32 },
    Toggle,
}

pub struct SimState {
    regions: Vec<(FlashRegion, Vec<u8>)>,
    highest_block: bool,
    bgo: bool,
    pub active: Bank,
    pub fail_open: bool,
    pub fail_close: bool,
    pub fail_erase: bool,
    pub fail_write: bool,
    pub fail_toggle: bool,
    /// Accept the toggle request but keep running from the same bank.
    pub toggle_ignored: bool,
    pub event_override: Option<FlashEvent>,
    pub drop_completion: bool,
    /// How long each erased block holds back the completion interrupt.
    pub erase_latency: Duration,
    pub ops: Vec<SimOp>,
    pub in_flight: u32,
    pub max_in_flight: u32,
    pub opens: u32,
    pub closes: u32,
}

impl SimState {
    fn region_mut(&mut self, addr: u32, len: u32) -> Result<(FlashRegion, &mut [u8]), HwError> {
        let (region, mem) = self
            .regions
            .iter_mut()
            .find(|(r, _)| r.contains(addr, len))
            .ok_or(HwError(0xBAD))?;
        let off = (addr - region.base) as usize;
        Ok((*region, &mut mem[off..off + len as usize]))
    }
}

struct SimShared {
    state: Mutex<SimState>,
    irq: Signal<CriticalSectionRawMutex, (FlashEvent, Duration)>,
}

#[derive(Clone)]
pub struct Sim(Arc<SimShared>);

impl Sim {
    pub fn new(board: &BoardConfig) -> Self {
        let regions = board
            .banks
            .iter()
            .chain(board.data_flash.iter())
            .map(|r| (*r, vec![0xFF; r.size() as usize]))
            .collect();
        Self(Arc::new(SimShared {
            state: Mutex::new(SimState {
                regions,
                highest_block: board.erase_addressing == EraseAddressing::HighestBlock,
                bgo: board.flash_mode == FlashMode::Bgo,
                active: Bank::Bank0,
                fail_open: false,
                fail_close: false,
                fail_erase: false,
                fail_write: false,
                fail_toggle: false,
                toggle_ignored: false,
                event_override: None,
                drop_completion: false,
                erase_latency: Duration::from_ticks(0),
                ops: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
                opens: 0,
                closes: 0,
            }),
            irq: Signal::new(),
        }))
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.state.lock().unwrap()
    }

    pub fn mem(&self, addr: u32, len: u32) -> Vec<u8> {
        self.state().region_mut(addr, len).unwrap().1.to_vec()
    }

    pub fn load(&self, addr: u32, data: &[u8]) {
        self.state()
            .region_mut(addr, data.len() as u32)
            .unwrap()
            .1
            .copy_from_slice(data);
    }

    fn complete(&self, state: &mut SimState, event: FlashEvent, latency: Duration) {
        if !state.bgo {
            return;
        }
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        if state.drop_completion {
            return;
        }
        self.0.irq.signal((state.event_override.unwrap_or(event), latency));
    }
}

impl FlashController for Sim {
    fn open(&mut self) -> Result<(), HwError> {
        let mut state = self.state();
        if state.fail_open {
            return Err(HwError(1));
        }
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), HwError> {
        let mut state = self.state();
        if state.fail_close {
            return Err(HwError(5));
        }
        state.closes += 1;
        Ok(())
    }

    fn erase(&mut self, addr: u32, blocks: u32) -> Result<(), HwError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.fail_erase {
            return Err(HwError(2));
        }
        let (region, _) = state.region_mut(addr, 1)?;
        let start = if state.highest_block && region.class == FlashClass::Code {
            addr - (blocks - 1) * region.block_size
        } else {
            addr
        };
        state.region_mut(start, blocks * region.block_size)?.1.fill(0xFF);
        state.ops.push(SimOp::Erase { addr, blocks });
        let latency = state.erase_latency * blocks;
        self.complete(state, FlashEvent::ErasedOk, latency);
        Ok(())
    }

    fn write(&mut self, src: &[u8], dest: u32) -> Result<(), HwError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.fail_write {
            return Err(HwError(3));
        }
        state.region_mut(dest, src.len() as u32)?.1.copy_from_slice(src);
        state.ops.push(SimOp::Write {
            dest,
            len: src.len() as u32,
        });
        self.complete(state, FlashEvent::WrittenOk, Duration::from_ticks(0));
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], src: u32) -> Result<(), HwError> {
        buf.copy_from_slice(self.state().region_mut(src, buf.len() as u32)?.1);
        Ok(())
    }

    fn bank_toggle(&mut self) -> Result<(), HwError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.fail_toggle {
            return Err(HwError(4));
        }
        if !state.toggle_ignored {
            state.active = state.active.other();
        }
        state.ops.push(SimOp::Toggle);
        self.complete(state, FlashEvent::BankToggledOk, Duration::from_ticks(0));
        Ok(())
    }

    fn bank_get(&mut self) -> Result<Bank, HwError> {
        Ok(self.state().active)
    }
}

/// Delivers queued interrupt events to the flash layer, forever.
async fn pump<C: FlashController>(flash: &FlashAccessLayer<C>, sim: &Sim) -> Infallible {
    loop {
        let (event, latency) = sim.0.irq.wait().await;
        if latency.as_ticks() > 0 {
            Timer::after(latency).await;
        }
        sim.state().in_flight -= 1;
        flash.on_interrupt(event);
    }
}

/// Runs `fut` to completion with the simulated interrupt line attached.
pub fn run<C: FlashController, F: Future>(flash: &FlashAccessLayer<C>, sim: &Sim, fut: F) -> F::Output {
    let fut = pin!(fut);
    let pump = pin!(pump(flash, sim));
    match block_on(select(fut, pump)) {
        Either::Left((out, _)) => out,
        Either::Right((never, _)) => match never {},
    }
}

/// Reset line that unwinds out of the test instead of rebooting.
#[derive(Default)]
pub struct SimSystem {
    pub resets: AtomicU32,
}

impl SimSystem {
    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::Relaxed)
    }
}

impl SystemControl for SimSystem {
    fn reset(&self) -> ! {
        self.resets.fetch_add(1, Ordering::Relaxed);
        panic!("system reset");
    }
}

/// Key pair used to sign test images.
pub fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[0x11; 32]).unwrap()
}

/// SubjectPublicKeyInfo PEM for [`signing_key`].
pub fn public_key_pem() -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    const SPKI_PREFIX: [u8; 26] = [
        0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06, 0x08, 0x2A, 0x86, 0x48,
        0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
    ];
    let point = signing_key().verifying_key().to_encoded_point(false);
    let mut der = SPKI_PREFIX.to_vec();
    der.extend_from_slice(point.as_bytes());

    let b64 = STANDARD.encode(&der);
    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in b64.as_bytes().chunks(64) {
        pem.push_str(core::str::from_utf8(line).unwrap());
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    pem
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Raw `r || s` signature over the SHA-256 of `data`.
pub fn sign(data: &[u8]) -> [u8; 64] {
    use p256::ecdsa::signature::hazmat::PrehashSigner;

    let sig: p256::ecdsa::Signature = signing_key().sign_prehash(&sha256(data)).unwrap();
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&sig.to_bytes());
    raw
}

/// Simulated board with everything an update needs.
pub struct Rig {
    pub sim: Sim,
    pub flash: FlashAccessLayer<Sim>,
    pub verifier: Verifier,
    pub system: SimSystem,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_board(TEST_BOARD)
    }

    pub fn with_board(board: BoardConfig) -> Self {
        let sim = Sim::new(&board);
        Self {
            flash: FlashAccessLayer::new(sim.clone(), board),
            sim,
            verifier: Verifier::new(board.guard),
            system: SimSystem::default(),
        }
    }

    pub fn updater(&self) -> FirmwareUpdater<'_, Sim, SimSystem> {
        FirmwareUpdater::new(&self.flash, &self.verifier, &self.system)
    }

    pub fn run<F: Future>(&self, fut: F) -> F::Output {
        run(&self.flash, &self.sim, fut)
    }
}

/// Deterministic test image.
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}
