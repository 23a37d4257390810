// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Open/close lifecycle shared by every hardware handle (flash controller,
//! crypto core, serial link).
//!
//! The state is flipped inside a critical section. Only the task that moved
//! the handle to [`ResourceState::Transitioning`] runs the init or teardown
//! callback; everybody else polls until the transition settles.

use core::cell::Cell;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Instant, Timer};

use crate::board::GuardConfig;
use crate::error::ResourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResourceState {
    Closed,
    Transitioning,
    Open,
}

enum Claim {
    /// The caller owns the transition and must run its callback.
    Owned,
    /// Another task completed the same transition while we waited.
    Settled,
}

pub struct ResourceGuard {
    state: Mutex<CriticalSectionRawMutex, Cell<ResourceState>>,
    config: GuardConfig,
}

/// Puts the state back if the callback future is dropped half way.
struct Revert<'a> {
    guard: &'a ResourceGuard,
    to: ResourceState,
}

impl Drop for Revert<'_> {
    fn drop(&mut self) {
        self.guard.set(self.to);
    }
}

impl ResourceGuard {
    pub const fn new(config: GuardConfig) -> Self {
        Self {
            state: Mutex::new(Cell::new(ResourceState::Closed)),
            config,
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state.lock(|s| s.get())
    }

    pub fn is_open(&self) -> bool {
        self.state() == ResourceState::Open
    }

    fn set(&self, state: ResourceState) {
        self.state.lock(|s| s.set(state));
    }

    /// Runs `init` if the handle is closed and marks it open on success.
    ///
    /// If another task is opening the handle concurrently this waits for it and
    /// succeeds without calling `init` once the handle is open.
    pub async fn open<F, Fut, E>(&self, init: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<ResourceError>,
    {
        match self.claim(ResourceState::Closed, ResourceState::Open).await? {
            Claim::Settled => return Ok(()),
            Claim::Owned => {}
        }

        let revert = Revert {
            guard: self,
            to: ResourceState::Closed,
        };
        init().await?;
        core::mem::forget(revert);
        self.set(ResourceState::Open);
        Ok(())
    }

    /// Runs `teardown` if the handle is open and marks it closed on success.
    /// A failed teardown leaves the handle open.
    pub async fn close<F, Fut, E>(&self, teardown: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<ResourceError>,
    {
        match self.claim(ResourceState::Open, ResourceState::Closed).await? {
            Claim::Settled => return Ok(()),
            Claim::Owned => {}
        }

        let revert = Revert {
            guard: self,
            to: ResourceState::Open,
        };
        teardown().await?;
        core::mem::forget(revert);
        self.set(ResourceState::Closed);
        Ok(())
    }

    async fn claim(&self, from: ResourceState, to: ResourceState) -> Result<Claim, ResourceError> {
        let deadline = Instant::now() + self.config.deadline;
        let mut waited = false;
        loop {
            let seen = self.state.lock(|s| {
                let current = s.get();
                if current == from && !waited {
                    s.set(ResourceState::Transitioning);
                }
                current
            });

            match seen {
                ResourceState::Transitioning => {
                    if Instant::now() >= deadline {
                        warn!("gave up waiting for resource transition");
                        return Err(ResourceError::Timeout);
                    }
                    waited = true;
                    Timer::after(self.config.poll).await;
                }
                state if waited => {
                    // Someone else finished a transition; accept it only if it
                    // landed where we were heading.
                    return if state == to {
                        Ok(Claim::Settled)
                    } else if to == ResourceState::Open {
                        Err(ResourceError::OpenFailed)
                    } else {
                        Err(ResourceError::CloseFailed)
                    };
                }
                state if state == from => return Ok(Claim::Owned),
                _ if to == ResourceState::Open => return Err(ResourceError::AlreadyOpen),
                _ => return Err(ResourceError::NotOpen),
            }
        }
    }
}
