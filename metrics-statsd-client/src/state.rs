use std::{
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    buffer::{DoubleBuffer, FlushToken},
    builder::OverflowPolicy,
    encoder::{Encoder, Metric, TagFormat},
    error::{Error, ErrorHandler},
    forwarder::{
        transport::{Dialer, Transport},
        RemoteAddr,
    },
};

// A drain flushes at most this many slots. Writers can keep refilling the active slot while a drain runs, so the drain
// has to stop somewhere, but it has to go around at least once more than there are slots to pick up a retained tail.
const MAX_DRAIN_PASSES: usize = 4;

// How many timeouts a close waits for slots that other threads are flushing. A flush dials and writes, and on stream
// transports may do both a second time.
const CLOSE_WAIT_TIMEOUTS: u32 = 4;

/// Client state configuration.
pub(crate) struct StateConfiguration {
    /// Remote address to forward metrics to.
    pub remote_addr: RemoteAddr,

    /// Dial and write timeout.
    pub timeout: Duration,

    /// Source of connections to the remote address.
    pub dialer: Arc<dyn Dialer>,

    /// Buffered bytes past which a slot is flushed.
    pub max_packet_size: usize,

    /// What writers do when both slots are waiting on the network.
    pub overflow: OverflowPolicy,

    /// Tag placement.
    pub tag_format: TagFormat,

    /// Sample rates to pre-format.
    pub known_rates: Vec<f32>,

    /// Receives errors from flushes nobody is waiting on.
    pub error_handler: ErrorHandler,
}

/// Client state, shared by every client handle and the forwarder.
pub(crate) struct State {
    buffers: DoubleBuffer,
    encoder: Encoder,
    transport: Mutex<Transport>,
    error_handler: ErrorHandler,
    dropped: AtomicU64,
    close_wait: Option<Duration>,
}

impl State {
    /// Creates a new `State` from the given configuration.
    pub fn new(config: StateConfiguration) -> Self {
        State {
            buffers: DoubleBuffer::new(config.max_packet_size, config.overflow),
            encoder: Encoder::new(config.tag_format, config.known_rates),
            transport: Mutex::new(Transport::new(config.remote_addr, config.timeout, config.dialer)),
            error_handler: config.error_handler,
            dropped: AtomicU64::new(0),
            close_wait: (!config.timeout.is_zero()).then(|| config.timeout.saturating_mul(CLOSE_WAIT_TIMEOUTS)),
        }
    }

    /// Returns the tag format of the connection.
    pub fn tag_format(&self) -> TagFormat {
        self.encoder.tag_format()
    }

    /// Returns the number of metrics shed because both slots were waiting on the network.
    pub fn dropped_metrics(&self) -> u64 {
        self.dropped.load(Relaxed)
    }

    /// Opens the connection ahead of the first flush.
    pub fn connect(&self) -> Result<(), Error> {
        self.transport.lock().dial()
    }

    /// Encodes a metric into the active slot.
    ///
    /// If this filled the slot up, it has been rotated out and the returned token must be flushed.
    pub fn record(&self, metric: &Metric<'_>) -> Option<FlushToken> {
        let Some(mut slot) = self.buffers.acquire_for_write() else {
            self.dropped.fetch_add(1, Relaxed);
            trace!(bucket = metric.bucket, "Both buffers are waiting on the network, dropping metric.");
            return None;
        };

        self.encoder.encode(&mut slot, metric);
        slot.release()
    }

    /// Writes out a slot and hands it back to writers.
    ///
    /// The slot is handed back even if the write fails, in which case its contents are lost.
    pub fn flush_slot(&self, token: FlushToken) -> Result<(), Error> {
        let result = {
            let mut transport = self.transport.lock();
            transport.write(self.buffers.contents(&token))
        };
        trace!(payload_len = token.len(), "Flushed buffer.");

        self.buffers.complete_flush(token);
        result
    }

    /// Flushes everything currently buffered, in both slots.
    ///
    /// Stops at the first failed write.
    pub fn drain(&self) -> Result<(), Error> {
        for _ in 0..MAX_DRAIN_PASSES {
            match self.buffers.force_flush_rotation().or_else(|| self.buffers.claim_inactive()) {
                Some(token) => self.flush_slot(token)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Drains both slots and closes the connection.
    ///
    /// The connection is closed even if the drain fails. Returns the first error encountered.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.shutdown_with(|| Ok(()))
    }

    /// Drains both slots and closes the connection, once every slot held by another thread has been flushed.
    ///
    /// `pending` is called while waiting, so that a caller which queues flush tokens can flush them. Waiting gives up
    /// after a few write timeouts, and never when the timeout is disabled.
    pub fn shutdown_with<F>(&self, mut pending: F) -> Result<(), Error>
    where
        F: FnMut() -> Result<(), Error>,
    {
        let mut result = self.drain();

        if self.buffers.in_flight() > 0 {
            let deadline = self.close_wait.map(|wait| Instant::now() + wait);
            let backoff = Backoff::new();
            while self.buffers.in_flight() > 0 {
                result = result.and(pending());
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    warn!(in_flight = self.buffers.in_flight(), "Closing while buffers are still being flushed.");
                    break;
                }

                if backoff.is_completed() {
                    thread::sleep(Duration::from_millis(1));
                } else {
                    backoff.snooze();
                }
            }

            // Whatever those flushes left behind goes out too.
            result = result.and(self.drain());
        }

        let closed = self.transport.lock().close();
        debug!("Closed connection to remote server.");

        result.and(closed)
    }

    /// Passes an error to the error handler.
    pub fn report(&self, error: &Error) {
        (self.error_handler)(error);
    }

    /// Reports the error of `result`, if any.
    pub fn report_result(&self, result: Result<(), Error>) {
        if let Err(e) = result {
            self.report(&e);
        }
    }
}
