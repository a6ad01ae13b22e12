use std::{sync::Arc, time::Duration};

use crossbeam_channel::{select, tick, Receiver};
use tracing::debug;

use super::FlushRequest;
use crate::{error::Error, state::State};

/// Background flusher.
///
/// Writes out slots as they fill up, and drains whatever is buffered on every tick so that metrics never sit in a
/// buffer for longer than the flush interval.
pub(crate) struct Forwarder {
    state: Arc<State>,
    requests: Receiver<FlushRequest>,
    flush_interval: Duration,
}

impl Forwarder {
    /// Create a new `Forwarder`.
    pub fn new(state: Arc<State>, requests: Receiver<FlushRequest>, flush_interval: Duration) -> Self {
        Forwarder { state, requests, flush_interval }
    }

    /// Run the forwarder until it is asked to close, or until every client handle is gone.
    pub fn run(self) {
        let ticker = tick(self.flush_interval);
        debug!(flush_interval = ?self.flush_interval, "Forwarder started.");

        loop {
            select! {
                recv(ticker) -> _ => self.state.report_result(self.state.drain()),
                recv(self.requests) -> request => match request {
                    Ok(FlushRequest::BufferFull(token)) => self.state.report_result(self.state.flush_slot(token)),
                    Ok(FlushRequest::Flush(reply)) => {
                        let _ = reply.send(self.state.drain());
                    }
                    Ok(FlushRequest::Close(reply)) => {
                        let result = self.close();
                        let _ = reply.send(result);
                        break;
                    }
                    Err(_) => {
                        // Every client handle has been dropped, so nothing will ever be recorded again.
                        self.state.report_result(self.state.shutdown());
                        break;
                    }
                },
            }
        }

        debug!("Forwarder stopped.");
    }

    fn close(&self) -> Result<(), Error> {
        // Slots that filled up before the close request, or while closing, still have to go out before the connection
        // is closed.
        let mut waiting = Vec::new();
        let mut pending = || {
            let mut result = Ok(());
            for request in self.requests.try_iter() {
                match request {
                    FlushRequest::BufferFull(token) => result = result.and(self.state.flush_slot(token)),
                    FlushRequest::Flush(reply) | FlushRequest::Close(reply) => waiting.push(reply),
                }
            }
            result
        };

        let result = pending().and(self.state.shutdown_with(&mut pending));

        // Anything that raced in behind the close only has its slot handed back.
        let _ = pending();

        for reply in waiting {
            let _ = reply.send(Ok(()));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use crossbeam_channel::bounded;

    use super::Forwarder;
    use crate::{
        builder::OverflowPolicy,
        encoder::{Metric, MetricKind, MetricValue, Number, TagFormat},
        error::default_error_handler,
        forwarder::{FlushRequest, RemoteAddr},
        state::{State, StateConfiguration},
        test_util::RecordingDialer,
    };

    fn state(dialer: &RecordingDialer, max_packet_size: usize) -> Arc<State> {
        Arc::new(State::new(StateConfiguration {
            remote_addr: RemoteAddr::try_from("tcp://127.0.0.1:8125").unwrap(),
            timeout: Duration::from_secs(1),
            dialer: Arc::new(dialer.clone()),
            max_packet_size,
            overflow: OverflowPolicy::Block,
            tag_format: TagFormat::None,
            known_rates: vec![1.0],
            error_handler: default_error_handler(),
        }))
    }

    fn count(bucket: &str) -> Metric<'_> {
        Metric {
            kind: MetricKind::Count,
            prefix: "",
            bucket,
            value: MetricValue::Number(Number::from(1u8)),
            rate: 1.0,
            tags: "",
        }
    }

    fn record(state: &State, bucket: &str) {
        assert!(state.record(&count(bucket)).is_none());
    }

    #[test]
    fn tick_flushes_buffered_metrics() {
        let dialer = RecordingDialer::new();
        let state = state(&dialer, 1024);
        let (tx, rx) = bounded(8);
        let forwarder = Forwarder::new(Arc::clone(&state), rx, Duration::from_millis(10));
        let handle = thread::spawn(move || forwarder.run());

        record(&state, "a");
        for _ in 0..500 {
            if !dialer.payloads().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(dialer.bytes(), b"a:1|c\n");

        drop(tx);
        handle.join().unwrap();
        assert_eq!(dialer.closes(), 1);
    }

    #[test]
    fn flush_and_close_requests_are_answered() {
        let dialer = RecordingDialer::new();
        let state = state(&dialer, 1024);
        let (tx, rx) = bounded(8);
        let forwarder = Forwarder::new(Arc::clone(&state), rx, Duration::from_secs(3600));
        let handle = thread::spawn(move || forwarder.run());

        record(&state, "a");
        let (reply_tx, reply_rx) = bounded(1);
        tx.send(FlushRequest::Flush(reply_tx)).unwrap();
        reply_rx.recv().unwrap().unwrap();
        assert_eq!(dialer.bytes(), b"a:1|c\n");

        record(&state, "b");
        let (reply_tx, reply_rx) = bounded(1);
        tx.send(FlushRequest::Close(reply_tx)).unwrap();
        reply_rx.recv().unwrap().unwrap();
        handle.join().unwrap();

        assert_eq!(dialer.bytes(), b"a:1|c\nb:1|c\n");
        assert_eq!(dialer.closes(), 1);
    }

    #[test]
    fn close_waits_for_buffers_queued_behind_it() {
        let dialer = RecordingDialer::new();
        let state = state(&dialer, 12);
        let (tx, rx) = bounded(8);
        let forwarder = Forwarder::new(Arc::clone(&state), rx, Duration::from_secs(3600));
        let handle = thread::spawn(move || forwarder.run());

        record(&state, "aaaa");
        let token = state.record(&count("bbbb")).expect("second metric should overflow the slot");

        let (reply_tx, reply_rx) = bounded(1);
        tx.send(FlushRequest::Close(reply_tx)).unwrap();
        thread::sleep(Duration::from_millis(20));
        tx.send(FlushRequest::BufferFull(token)).unwrap();

        reply_rx.recv().unwrap().unwrap();
        handle.join().unwrap();

        assert_eq!(dialer.bytes(), b"aaaa:1|c\nbbbb:1|c\n");
        assert_eq!(dialer.closes(), 1);
    }

    #[test]
    fn disconnect_drains_and_closes() {
        let dialer = RecordingDialer::new();
        let state = state(&dialer, 1024);
        let (tx, rx) = bounded(8);
        let forwarder = Forwarder::new(Arc::clone(&state), rx, Duration::from_secs(3600));
        let handle = thread::spawn(move || forwarder.run());

        record(&state, "a");
        drop(tx);
        handle.join().unwrap();

        assert_eq!(dialer.bytes(), b"a:1|c\n");
        assert_eq!(dialer.closes(), 1);
    }
}
