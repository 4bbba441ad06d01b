//! Event system for UI decoupling.
//!
//! Allows callers (CLI, home-automation frontends) to observe update
//! progress without tight coupling to the engine.

use crate::engine::TransferState;

/// Events emitted during an update session.
#[derive(Debug, Clone)]
pub enum OtaEvent {
    /// Update attempt started for a device.
    UpdateStarted { model_id: String },
    /// Transfer state machine transition.
    StateChanged {
        from: TransferState,
        to: TransferState,
    },
    /// One block response went out.
    BlockSent { file_offset: u32, data_size: usize },
    /// Periodic progress report. `remaining_secs` is `None` while the
    /// observed throughput is zero.
    Progress {
        percentage: f32,
        remaining_secs: Option<f32>,
    },
    /// The device re-announced itself after rebooting into new firmware.
    DeviceAnnounced,
    /// Terminal success carrying the freshly installed file version.
    Succeeded { file_version: u32 },
    /// Terminal failure with a human-readable reason.
    Failed { reason: String },
}

/// Observer trait for receiving update events.
pub trait OtaObserver: Send + Sync {
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::UpdateStarted { model_id } => {
                tracing::info!(model_id = %model_id, "update started");
            }
            OtaEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "state changed");
            }
            OtaEvent::BlockSent {
                file_offset,
                data_size,
            } => {
                tracing::trace!(offset = file_offset, len = data_size, "block sent");
            }
            OtaEvent::Progress {
                percentage,
                remaining_secs,
            } => {
                tracing::info!(
                    progress = %format!("{percentage:.2}%"),
                    remaining_secs = ?remaining_secs,
                    "transfer progress"
                );
            }
            OtaEvent::DeviceAnnounced => {
                tracing::info!("device announced itself");
            }
            OtaEvent::Succeeded { file_version } => {
                tracing::info!(file_version, "update succeeded");
            }
            OtaEvent::Failed { reason } => {
                tracing::error!(reason = %reason, "update failed");
            }
        }
    }
}
