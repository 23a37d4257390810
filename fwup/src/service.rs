// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serial front end: COBS framed [`HostProtocolMessage`]s mapped onto an
//! update session.

use crc::{Crc, CRC_32_ISCSI};
use embedded_io_async::{Read, Write};
use postcard::accumulator::{CobsAccumulator, FeedResult};
use update_protocol::{HostProtocolMessage, NackReason, PostcardError, State, Update, COBS_MAX_MSG_SIZE};

use crate::bank::SystemControl;
use crate::board::Bank;
use crate::error::{Error, ResourceError, SessionError};
use crate::flash::FlashController;
use crate::guard::ResourceGuard;
use crate::session::{FirmwareUpdater, SessionState, UpdateSession};

/// Byte stream to the update host.
pub trait SerialLink: Read + Write {
    fn open(&mut self) -> Result<(), Self::Error>;
    fn close(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError<E> {
    Resource(ResourceError),
    Io(E),
}

impl<E> From<ResourceError> for LinkError<E> {
    fn from(e: ResourceError) -> Self {
        Self::Resource(e)
    }
}

pub struct UpdateService<'a, C, S> {
    updater: FirmwareUpdater<'a, C, S>,
    session: Option<UpdateSession<'a, C, S>>,
    aborted: bool,
    link: ResourceGuard,
}

impl<'a, C: FlashController, S: SystemControl> UpdateService<'a, C, S> {
    pub fn new(updater: FirmwareUpdater<'a, C, S>) -> Self {
        Self {
            link: ResourceGuard::new(updater.flash().board().guard),
            updater,
            session: None,
            aborted: false,
        }
    }

    pub fn state(&self) -> State {
        match &self.session {
            Some(s) => State::Receiving {
                received: s.received(),
                total: s.total(),
            },
            None if self.aborted => State::Aborted,
            None => State::Idle,
        }
    }

    /// Answer one request. A `Finish` that commits never returns.
    pub async fn handle(&mut self, msg: HostProtocolMessage<'_>) -> HostProtocolMessage<'static> {
        match msg {
            HostProtocolMessage::Update(update) => HostProtocolMessage::Update(self.handle_update(update).await),
            HostProtocolMessage::GetState => HostProtocolMessage::AckState(self.state()),
            _ => HostProtocolMessage::InappropriateMessage(self.state()),
        }
    }

    async fn handle_update(&mut self, update: Update<'_>) -> Update<'static> {
        match update {
            Update::Begin { total_size } => {
                if let Some(old) = &self.session {
                    warn!("restarting update, dropping {} received bytes", old.received());
                }
                self.discard().await;
                match self.updater.begin(total_size).await {
                    Ok(session) => {
                        let bank = session.bank().into();
                        self.session = Some(session);
                        self.aborted = false;
                        Update::AckBegin { bank }
                    }
                    Err(e) => {
                        self.aborted = true;
                        refusal(0, e)
                    }
                }
            }
            Update::WriteBlock { offset, data } => {
                let Some(session) = self.session.as_mut() else {
                    return refusal(offset, SessionError::InvalidState.into());
                };
                match session.append_at(offset, data).await {
                    Ok(()) => Update::AckWithOffsetCrc {
                        offset,
                        crc: Crc::<u32>::new(&CRC_32_ISCSI).checksum(data),
                    },
                    Err(e) => {
                        self.reap();
                        refusal(offset, e)
                    }
                }
            }
            Update::Finish {
                signature_type,
                signature,
            } => {
                let Some(session) = self.session.as_mut() else {
                    return refusal(0, SessionError::InvalidState.into());
                };
                let offset = session.received();
                let e = match session.finish(signature_type, signature).await {
                    Ok(never) => match never {},
                    Err(e) => e,
                };
                self.reap();
                refusal(offset, e)
            }
            Update::Abort => {
                self.discard().await;
                Update::Aborted
            }
            Update::GetActiveBank => match self.active_bank().await {
                Ok(bank) => Update::ActiveBank { bank: bank.into() },
                Err(e) => refusal(0, e),
            },
            _ => Update::NackWithOffset {
                offset: 0,
                reason: NackReason::InvalidState,
            },
        }
    }

    /// Abort the current session and release the flash, also when an earlier
    /// close failed.
    async fn discard(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.abort().await {
                warn!("abort failed: {}", e);
            }
        }
        let flash = self.updater.flash();
        if flash.is_open() {
            if let Err(e) = flash.close().await {
                warn!("flash still open: {}", e);
            }
        }
        self.aborted = true;
    }

    /// Forget a session that aborted itself.
    fn reap(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Aborted)
        {
            self.session = None;
            self.aborted = true;
        }
    }

    async fn active_bank(&self) -> Result<Bank, Error> {
        let flash = self.updater.flash();
        if flash.is_open() {
            return flash.active_bank().await;
        }
        flash.open().await?;
        let bank = flash.active_bank().await;
        flash.close().await?;
        bank
    }

    /// Serve requests from `link` until the host goes away.
    pub async fn serve<L: SerialLink>(&mut self, link: &mut L) -> Result<(), LinkError<L::Error>> {
        let l = &mut *link;
        self.link
            .open(move || async move { l.open().map_err(LinkError::Io) })
            .await?;
        info!("update link open");

        let res = self.pump(link).await;

        let l = &mut *link;
        self.link
            .close(move || async move { l.close().map_err(LinkError::Io) })
            .await?;
        info!("update link closed");
        res
    }

    async fn pump<L: SerialLink>(&mut self, link: &mut L) -> Result<(), LinkError<L::Error>> {
        // Buffer for raw incoming data
        let mut raw_buf = [0u8; 64];
        let mut cobs_buf: CobsAccumulator<COBS_MAX_MSG_SIZE> = CobsAccumulator::new();

        loop {
            let n = match link.read(&mut raw_buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => {
                    warn!("update link read failed");
                    return Err(LinkError::Io(e));
                }
            };

            let mut window = &raw_buf[..n];
            'cobs: while !window.is_empty() {
                window = match cobs_buf.feed_ref::<HostProtocolMessage>(window) {
                    FeedResult::Consumed => break 'cobs,
                    FeedResult::OverFull(new_wind) => {
                        info!("overfull");
                        send(link, &HostProtocolMessage::PostcardError(PostcardError::OverFull)).await?;
                        new_wind
                    }
                    FeedResult::DeserError(new_wind) => {
                        info!("DeserError");
                        send(link, &HostProtocolMessage::PostcardError(PostcardError::Deser)).await?;
                        new_wind
                    }
                    FeedResult::Success { data, remaining } => {
                        let reply = self.handle(data).await;
                        send(link, &reply).await?;
                        remaining
                    }
                };
            }
        }
    }
}

fn refusal(offset: u32, e: Error) -> Update<'static> {
    let reason = match e {
        Error::Verification(_) => return Update::VerifyFailed,
        Error::Resource(_) => NackReason::Resource,
        Error::Flash(_) => NackReason::Flash,
        Error::Session(SessionError::InvalidState) => NackReason::InvalidState,
        Error::Session(SessionError::OutOfSequence { .. }) => NackReason::OutOfSequence,
        Error::Session(SessionError::Overrun) => NackReason::Overrun,
        Error::Session(SessionError::Incomplete) => NackReason::Incomplete,
        Error::Session(SessionError::InvalidSize) => NackReason::InvalidSize,
    };
    Update::NackWithOffset { offset, reason }
}

async fn send<L: SerialLink>(link: &mut L, msg: &HostProtocolMessage<'_>) -> Result<(), LinkError<L::Error>> {
    let mut buf = [0u8; COBS_MAX_MSG_SIZE];
    let Ok(frame) = postcard::to_slice_cobs(msg, &mut buf) else {
        error!("reply does not fit a frame");
        return Ok(());
    };
    link.write_all(frame).await.map_err(LinkError::Io)?;
    link.flush().await.map_err(LinkError::Io)
}
