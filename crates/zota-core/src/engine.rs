//! Transfer state machine.
//!
//! Runs one complete device-initiated update: notify the device, answer
//! its image query, serve block and page requests until the device
//! declares the transfer finished, then finalize and wait for it to come
//! back on the network with the new firmware.
//!
//! The whole flow is a blocking receive-dispatch loop. Each phase has its
//! own deadline; anything that arrives out of phase (a duplicate image
//! query while blocks are being served, for instance) is answered inline
//! without extending the running deadline.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::codec::Image;
use crate::events::{OtaEvent, OtaObserver};
use crate::fetch::{FetchError, ImageFetcher};
use crate::meta::{self, DeviceInfo, ImageInfo, ImageProvider, UpdateCheck};
use crate::protocol::{
    BlockRequest, Command, Incoming, PageRequest, QueryNextImageResponse, Response, Status,
    UPGRADE_END_REQUEST_COMMAND_ID, UpgradeEndRequest, manufacturer,
};
use crate::session::SessionConfig;
use crate::transport::{OtaTransport, TransportError};

/// Largest waiter window the engine hands to a transport, roughly 24
/// days. Used for devices that transfer firmware in the background at
/// their own pace.
const MAX_TIMEOUT: Duration = Duration::from_millis(2_147_483_647);

/// Minimum spacing between progress reports.
const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Device did not respond to image notification within {timeout_secs}s")]
    QueryTimeout { timeout_secs: u64 },

    #[error("Timeout. Device did not start/finish firmware download after being notified")]
    ProtocolTimeout,

    #[error("Update failed with reason: '{status}'")]
    DeviceRejected { status: Status },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

/// Internal state of the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AwaitingNextImageRequest,
    AwaitingBlockOrPageRequest,
    SendingBlock,
    AwaitingUpgradeEnd,
    Finalizing,
    Succeeded,
    Failed,
}

impl Default for TransferState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferState::Idle => write!(f, "IDLE"),
            TransferState::AwaitingNextImageRequest => write!(f, "AWAITING_NEXT_IMAGE_REQUEST"),
            TransferState::AwaitingBlockOrPageRequest => {
                write!(f, "AWAITING_BLOCK_OR_PAGE_REQUEST")
            }
            TransferState::SendingBlock => write!(f, "SENDING_BLOCK"),
            TransferState::AwaitingUpgradeEnd => write!(f, "AWAITING_UPGRADE_END"),
            TransferState::Finalizing => write!(f, "FINALIZING"),
            TransferState::Succeeded => write!(f, "SUCCEEDED"),
            TransferState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Byte accounting for one transfer.
#[derive(Debug)]
struct TransferProgress {
    total: u32,
    started: Instant,
    bytes_sent: u64,
    highest_end: u32,
    last_block_response: Option<Instant>,
    last_report: Option<Instant>,
}

impl TransferProgress {
    fn new(total: u32) -> Self {
        Self {
            total,
            started: Instant::now(),
            bytes_sent: 0,
            highest_end: 0,
            last_block_response: None,
            last_report: None,
        }
    }
}

/// Drives one device through the update protocol.
pub struct TransferEngine<'a> {
    config: &'a SessionConfig,
    device: &'a DeviceInfo,
    transport: &'a dyn OtaTransport,
    observer: &'a dyn OtaObserver,
    state: TransferState,
}

impl<'a> TransferEngine<'a> {
    pub fn new(
        config: &'a SessionConfig,
        device: &'a DeviceInfo,
        transport: &'a dyn OtaTransport,
        observer: &'a dyn OtaObserver,
    ) -> Self {
        Self {
            config,
            device,
            transport,
            observer,
            state: TransferState::Idle,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Check whether a newer image exists for the device without starting
    /// a transfer. When no live identity is supplied the device is asked
    /// for one via an image notification.
    pub fn is_update_available(
        &mut self,
        provider: &dyn ImageProvider,
        current: Option<ImageInfo>,
    ) -> Result<UpdateCheck, UpdateError> {
        let identity = match current {
            Some(identity) => identity,
            None => self.request_identity()?.1,
        };

        let meta = provider
            .image_meta(&identity, self.device)
            .map_err(FetchError::Provider)?;
        Ok(meta::check_availability(&identity, self.device, meta.as_ref()))
    }

    /// Run one complete update attempt.
    ///
    /// Returns `Ok(Some(file_version))` after a confirmed upgrade,
    /// `Ok(None)` when no image applies to the device (a normal outcome),
    /// and an error for everything that actually went wrong.
    #[instrument(skip(self, fetcher), fields(model_id = %self.device.model_id))]
    pub fn update_to_latest(
        &mut self,
        fetcher: &ImageFetcher<'_>,
    ) -> Result<Option<u32>, UpdateError> {
        self.observer.on_event(&OtaEvent::UpdateStarted {
            model_id: self.device.model_id.clone(),
        });

        match self.run_update(fetcher) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.goto_state(TransferState::Failed);
                self.observer.on_event(&OtaEvent::Failed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn run_update(&mut self, fetcher: &ImageFetcher<'_>) -> Result<Option<u32>, UpdateError> {
        self.goto_state(TransferState::AwaitingNextImageRequest);
        let (query_seq, identity) = self.request_identity()?;

        let image = match fetcher.get_new_image(&identity, self.device) {
            Ok(image) => image,
            Err(FetchError::MetadataUnavailable) | Err(FetchError::NoNewImage { .. }) => {
                info!(
                    file_version = identity.file_version,
                    "no image to offer, telling the device so"
                );
                self.transport
                    .send(
                        &Response::QueryNextImageResponse(QueryNextImageResponse::NoImageAvailable),
                        Some(query_seq),
                    )
                    .map_err(UpdateError::Transport)?;
                self.goto_state(TransferState::Idle);
                return Ok(None);
            }
            Err(err) => {
                // Tell the device to stand down before surfacing the failure,
                // otherwise it keeps the query pending until its own timeout.
                if let Err(send_err) = self.transport.send(
                    &Response::QueryNextImageResponse(QueryNextImageResponse::NoImageAvailable),
                    Some(query_seq),
                ) {
                    warn!(error = %send_err, "failed to answer image query while aborting");
                }
                return Err(err.into());
            }
        };

        info!(
            from = identity.file_version,
            to = image.header.file_version,
            size = image.header.total_image_size,
            "starting firmware transfer"
        );

        self.transport
            .send(
                &Response::QueryNextImageResponse(QueryNextImageResponse::Available {
                    manufacturer_code: image.header.manufacturer_code,
                    image_type: image.header.image_type,
                    file_version: image.header.file_version,
                    image_size: image.header.total_image_size,
                }),
                Some(query_seq),
            )
            .map_err(UpdateError::Transport)?;

        self.goto_state(TransferState::AwaitingBlockOrPageRequest);
        let (end_seq, end) = self.serve_image(&image)?;

        self.goto_state(TransferState::Finalizing);
        self.finalize(end_seq, &end)
    }

    /// Notify the device and wait for its query-next-image request, which
    /// carries the live identity (manufacturer, image type, running
    /// version) everything downstream keys on.
    fn request_identity(&self) -> Result<(u8, ImageInfo), UpdateError> {
        self.transport
            .send(
                &Response::ImageNotify {
                    payload_type: 0,
                    query_jitter: 100,
                },
                None,
            )
            .map_err(UpdateError::Transport)?;

        let timeout_secs = self.config.query_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UpdateError::QueryTimeout { timeout_secs });
            }

            match self.transport.recv(remaining) {
                Ok(Incoming {
                    transaction_seq,
                    command: Command::QueryNextImageRequest(identity),
                }) => {
                    debug!(
                        manufacturer_code = identity.manufacturer_code,
                        image_type = identity.image_type,
                        file_version = identity.file_version,
                        "device identified itself"
                    );
                    return Ok((transaction_seq, identity));
                }
                Ok(other) => {
                    debug!(command = ?other.command, "ignoring command while waiting for image query");
                }
                Err(TransportError::Timeout { .. }) => {
                    return Err(UpdateError::QueryTimeout { timeout_secs });
                }
                Err(err) => return Err(UpdateError::Transport(err)),
            }
        }
    }

    /// Serve block and page requests until the device sends its upgrade
    /// end request.
    fn serve_image(&mut self, image: &Image) -> Result<(u8, UpgradeEndRequest), UpdateError> {
        let mut progress = TransferProgress::new(image.header.total_image_size);
        let window = block_request_window(
            image.header.manufacturer_code,
            image.header.image_type,
            self.config,
        );
        let mut deadline = Instant::now() + window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UpdateError::ProtocolTimeout);
            }

            let incoming = match self.transport.recv(remaining) {
                Ok(incoming) => incoming,
                Err(TransportError::Timeout { .. }) => return Err(UpdateError::ProtocolTimeout),
                Err(err) => return Err(UpdateError::Transport(err)),
            };

            match incoming.command {
                Command::ImageBlockRequest(req) => {
                    if self.state != TransferState::SendingBlock {
                        self.goto_state(TransferState::SendingBlock);
                    }
                    self.serve_block(image, &req, None, incoming.transaction_seq, &mut progress)?;
                    deadline = Instant::now() + window;
                }
                Command::ImagePageRequest(page) => {
                    if self.state != TransferState::SendingBlock {
                        self.goto_state(TransferState::SendingBlock);
                    }
                    self.serve_page(image, &page, incoming.transaction_seq, &mut progress)?;
                    deadline = Instant::now() + window;
                }
                Command::UpgradeEndRequest(end) => {
                    return Ok((incoming.transaction_seq, end));
                }
                Command::QueryNextImageRequest(_) => {
                    // Some devices keep polling for images mid-transfer.
                    // Answer so they don't abort, but don't treat the poll
                    // as transfer progress.
                    debug!("answering duplicate image query during transfer");
                    self.transport
                        .send(
                            &Response::QueryNextImageResponse(QueryNextImageResponse::Available {
                                manufacturer_code: image.header.manufacturer_code,
                                image_type: image.header.image_type,
                                file_version: image.header.file_version,
                                image_size: image.header.total_image_size,
                            }),
                            Some(incoming.transaction_seq),
                        )
                        .map_err(UpdateError::Transport)?;
                }
                other => {
                    debug!(command = ?other, "ignoring unrelated command during transfer");
                }
            }

            if progress.highest_end >= progress.total
                && self.state != TransferState::AwaitingUpgradeEnd
            {
                self.goto_state(TransferState::AwaitingUpgradeEnd);
            }
        }
    }

    /// Serve one block response. Returns the number of payload bytes sent.
    fn serve_block(
        &mut self,
        image: &Image,
        req: &BlockRequest,
        page: Option<(u32, u16)>,
        transaction_seq: u8,
        progress: &mut TransferProgress,
    ) -> Result<u32, UpdateError> {
        let payload = block_response_payload(image, req, page, self.config);
        let file_offset = payload.file_offset;
        let data_size = payload.data.len();

        self.throttle(progress);
        // A lost block response is not fatal: the device re-requests the
        // same offset on its own schedule.
        if let Err(err) = self.transport.send(
            &Response::ImageBlockResponse(payload),
            Some(transaction_seq),
        ) {
            warn!(error = %err, offset = file_offset, "failed to send image block response");
            return Ok(data_size as u32);
        }

        progress.bytes_sent += data_size as u64;
        progress.highest_end = progress
            .highest_end
            .max(file_offset.saturating_add(data_size as u32));

        self.observer.on_event(&OtaEvent::BlockSent {
            file_offset,
            data_size,
        });
        self.report_progress(progress);

        Ok(data_size as u32)
    }

    /// Serve a whole page as consecutive block responses.
    fn serve_page(
        &mut self,
        image: &Image,
        page: &PageRequest,
        transaction_seq: u8,
        progress: &mut TransferProgress,
    ) -> Result<(), UpdateError> {
        let mut page_offset: u32 = 0;

        while page_offset < page.page_size as u32 {
            let sent = self.serve_block(
                image,
                &page.block,
                Some((page_offset, page.page_size)),
                transaction_seq,
                progress,
            )?;

            if sent == 0 {
                // The page runs past the end of the image.
                break;
            }
            page_offset += sent;
        }

        Ok(())
    }

    /// Enforce the minimum spacing between block responses. Some devices
    /// drop blocks when responses arrive back-to-back.
    fn throttle(&self, progress: &mut TransferProgress) {
        let delay = Duration::from_millis(self.config.image_block_response_delay_ms);

        if !delay.is_zero() {
            if let Some(last) = progress.last_block_response {
                let elapsed = last.elapsed();
                if elapsed < delay {
                    thread::sleep(delay - elapsed);
                }
            }
        }

        progress.last_block_response = Some(Instant::now());
    }

    fn report_progress(&self, progress: &mut TransferProgress) {
        let due = progress
            .last_report
            .is_none_or(|at| at.elapsed() >= PROGRESS_REPORT_INTERVAL);
        if !due {
            return;
        }

        let pct = percentage(progress.highest_end, progress.total);
        let elapsed = progress.started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            progress.bytes_sent as f64 / elapsed
        } else {
            0.0
        };
        let remaining_secs = if throughput > 0.0 {
            let remaining = progress.total.saturating_sub(progress.highest_end);
            Some((remaining as f64 / throughput) as f32)
        } else {
            None
        };

        info!(
            progress = %format!("{pct:.2}%"),
            remaining_secs = ?remaining_secs,
            "transfer progress"
        );
        self.observer.on_event(&OtaEvent::Progress {
            percentage: pct,
            remaining_secs,
        });
        progress.last_report = Some(Instant::now());
    }

    /// Answer the device's upgrade end request and wait for it to come
    /// back on the network.
    fn finalize(
        &mut self,
        transaction_seq: u8,
        end: &UpgradeEndRequest,
    ) -> Result<Option<u32>, UpdateError> {
        if end.status != Status::Success {
            // Acknowledge so the device stops retrying the request, then
            // surface the device's verdict.
            if let Err(err) = self.transport.send(
                &Response::DefaultResponse {
                    command: UPGRADE_END_REQUEST_COMMAND_ID,
                    status: Status::Success,
                },
                Some(transaction_seq),
            ) {
                warn!(error = %err, "failed to acknowledge rejected upgrade end");
            }
            return Err(UpdateError::DeviceRejected { status: end.status });
        }

        // Zero current time plus upgrade time one instructs the device to
        // activate the new firmware immediately.
        self.transport
            .send(
                &Response::UpgradeEndResponse {
                    manufacturer_code: end.manufacturer_code,
                    image_type: end.image_type,
                    file_version: end.file_version,
                    current_time: 0,
                    upgrade_time: 1,
                },
                Some(transaction_seq),
            )
            .map_err(UpdateError::Transport)?;

        self.observer.on_event(&OtaEvent::Progress {
            percentage: 100.0,
            remaining_secs: Some(0.0),
        });

        self.wait_for_announce();
        self.goto_state(TransferState::Succeeded);
        self.observer.on_event(&OtaEvent::Succeeded {
            file_version: end.file_version,
        });

        Ok(Some(end.file_version))
    }

    /// Wait for the post-reboot network announcement. Its absence is a
    /// warning, not a failure: plenty of firmwares skip it.
    fn wait_for_announce(&self) {
        let timeout_secs = self.config.announce_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match self.transport.recv(remaining) {
                Ok(Incoming {
                    command: Command::DeviceAnnounce,
                    ..
                }) => {
                    info!("device announced itself with the new firmware");
                    self.observer.on_event(&OtaEvent::DeviceAnnounced);
                    return;
                }
                Ok(other) => {
                    debug!(command = ?other.command, "ignoring command while waiting for announce");
                }
                Err(_) => break,
            }
        }

        warn!(
            timeout_secs,
            "device did not announce itself after the update, assuming success"
        );
    }

    fn goto_state(&mut self, next: TransferState) {
        if self.state == next {
            return;
        }

        debug!(from = %self.state, to = %next, "state transition");
        self.observer.on_event(&OtaEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;
    }
}

/// Round a byte position to a two-decimal completion percentage.
fn percentage(position: u32, total: u32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (((position as f64 / total as f64) * 10_000.0).round() / 100.0) as f32
}

/// Largest payload a manufacturer's devices actually accept, regardless
/// of what their block requests advertise.
fn manufacturer_cap(manufacturer_code: u16, default_cap: u8) -> u32 {
    match manufacturer_code {
        manufacturer::INSTA => 40,
        // Legrand devices require the full advertised size.
        manufacturer::LEGRAND => u32::MAX,
        _ => default_cap as u32,
    }
}

/// How long to wait for the next block or page request. Several vendors
/// stall far beyond the default window without having aborted.
fn block_request_window(manufacturer_code: u16, image_type: u16, config: &SessionConfig) -> Duration {
    match manufacturer_code {
        manufacturer::BOSCH => MAX_TIMEOUT,
        manufacturer::LEGRAND => Duration::from_secs(30 * 60),
        manufacturer::COOLKIT if image_type == 8199 => Duration::from_secs(3600),
        _ => Duration::from_secs(config.block_request_timeout_secs),
    }
}

/// Compute the byte window for one block response.
fn block_response_payload(
    image: &Image,
    req: &BlockRequest,
    page: Option<(u32, u16)>,
    config: &SessionConfig,
) -> crate::protocol::BlockResponse {
    let mut start = req.file_offset;
    let mut data_size = (req.maximum_data_size as u32).min(manufacturer_cap(
        req.manufacturer_code,
        config.default_maximum_data_size,
    ));

    // Legrand firmware wedges itself mid-transfer and restarts with this
    // exact degenerate request. Answering it literally bricks the
    // transfer; skipping ahead resumes it.
    if req.manufacturer_code == manufacturer::LEGRAND
        && req.file_offset == 50
        && req.maximum_data_size == 12
    {
        start = 78;
        data_size = 64;
    }

    if let Some((page_offset, page_size)) = page {
        start = start.saturating_add(page_offset);
        data_size = data_size.min((page_size as u32).saturating_sub(page_offset));
    }

    let raw = &image.raw;
    let begin = (start as usize).min(raw.len());
    let end = begin.saturating_add(data_size as usize).min(raw.len());

    crate::protocol::BlockResponse {
        status: Status::Success,
        manufacturer_code: req.manufacturer_code,
        image_type: req.image_type,
        file_version: req.file_version,
        file_offset: start,
        data: raw[begin..end].to_vec(),
    }
}
