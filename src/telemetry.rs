//! Fire-and-forget metrics sink.
//!
//! The PID loop publishes one sample per control cycle; transport (HTTP,
//! InfluxDB, serial, ...) is the consumer's concern. Publishing never
//! blocks: a full channel drops the sample. The most recent samples are
//! also mirrored into a bounded history for diagnostics readout.

use crate::types::TelemetrySample;
use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use heapless::HistoryBuffer;
use log::debug;

pub const TELEMETRY_HISTORY: usize = 32;

pub type TelemetryChannel = Channel<CriticalSectionRawMutex, TelemetrySample, 8>;

pub struct TelemetrySink {
    channel: TelemetryChannel,
    history: Mutex<CriticalSectionRawMutex, RefCell<HistoryBuffer<TelemetrySample, TELEMETRY_HISTORY>>>,
}

impl TelemetrySink {
    pub fn new() -> Self {
        Self {
            channel: Channel::new(),
            history: Mutex::new(RefCell::new(HistoryBuffer::new())),
        }
    }

    pub fn publish(&self, sample: TelemetrySample) {
        self.history.lock(|history| history.borrow_mut().write(sample));
        if self.channel.try_send(sample).is_err() {
            debug!("telemetry channel full, dropping sample");
        }
    }

    /// Await the next published sample.
    pub async fn receive(&self) -> TelemetrySample {
        self.channel.receive().await
    }

    pub fn latest(&self) -> Option<TelemetrySample> {
        self.history
            .lock(|history| history.borrow().recent().copied())
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}
