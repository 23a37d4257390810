// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::convert::Infallible;

use embassy_time::Timer;

use crate::error::{Error, FlashError};
use crate::flash::{FlashAccessLayer, FlashController};

/// Restart primitive of the board.
pub trait SystemControl {
    fn reset(&self) -> !;
}

#[cfg(feature = "cortex-m")]
pub struct CortexM;

#[cfg(feature = "cortex-m")]
impl SystemControl for CortexM {
    fn reset(&self) -> ! {
        cortex_m::peripheral::SCB::sys_reset()
    }
}

/// Make the other bank the boot bank and restart into it.
///
/// Only returns on failure, with the current bank still active.
pub async fn swap<C: FlashController, S: SystemControl>(
    flash: &FlashAccessLayer<C>,
    system: &S,
) -> Result<Infallible, Error> {
    let before = flash.active_bank().await?;
    flash.bank_toggle().await?;

    let after = flash.active_bank().await?;
    if after == before {
        error!("bank toggle did not take effect, still on {:?}", before);
        return Err(FlashError::BankToggle.into());
    }

    info!("boot bank now {:?}, restarting", after);
    Timer::after(flash.board().settle_delay).await;
    system.reset()
}
