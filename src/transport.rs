//! Abstract duplex byte stream
//!
//! The engine never performs I/O itself. The host event loop supplies a
//! [`ByteStream`] for writing, shutdown and timers, and pushes incoming
//! notifications into the connection (`handle_data`, `handle_end`,
//! `handle_error`, `handle_closed`).
//!
//! # Contract
//!
//! - Everything happens on the thread that owns the connection.
//! - `write` returns immediately; `done` runs later with the same buffers
//!   handed back, so ownership always returns to the caller.
//! - Writes reach the peer in call order.
//! - `shutdown` takes effect after queued writes are flushed, then the
//!   stream closes itself.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

/// Completion of a write: the original buffers plus the outcome
pub type WriteCallback = Box<dyn FnOnce(Vec<Bytes>, io::Result<()>)>;

/// One-shot timer callback
pub type TimerCallback = Box<dyn FnOnce()>;

/// Callback-based duplex transport
pub trait ByteStream {
    /// Queue `bufs` for writing, in order
    fn write(&self, bufs: Vec<Bytes>, done: WriteCallback);

    /// Flush queued writes, shut down the write side, then close
    fn shutdown(&self);

    /// Close immediately
    fn close(&self);

    /// Resume delivering data notifications
    fn start_read(&self) {}

    /// Pause data notifications
    fn stop_read(&self) {}

    /// Run `callback` once after `after` elapses
    ///
    /// Streams without a timer facility drop the callback, which disables
    /// the client handshake timeout.
    fn set_timer(&self, after: Duration, callback: TimerCallback) {
        warn!(?after, "byte stream has no timer support; timeout ignored");
        drop(callback);
    }
}

/// Receiver of transport notifications
///
/// Implemented by [`WebSocket`](crate::WebSocket) and
/// [`HttpServerConnection`](crate::HttpServerConnection) so that one read
/// loop can drive either.
pub trait StreamHandler {
    /// Bytes arrived
    fn handle_data(&self, data: &[u8]);

    /// The peer finished sending
    fn handle_end(&self);

    /// The transport failed
    fn handle_error(&self, error: &io::Error);

    /// The transport closed
    fn handle_closed(&self);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    /// Recording stream with manual write completion and timers
    #[derive(Default)]
    pub(crate) struct MockStream {
        written: RefCell<Vec<u8>>,
        pending: RefCell<VecDeque<(Vec<Bytes>, WriteCallback)>>,
        timers: RefCell<Vec<(Duration, TimerCallback)>>,
        pub(crate) shutdown: Cell<bool>,
        pub(crate) closed: Cell<bool>,
        pub(crate) reading: Cell<bool>,
        pub(crate) read_restarts: Cell<usize>,
    }

    impl MockStream {
        pub(crate) fn new() -> Rc<Self> {
            Rc::new(Self::default())
        }

        /// Drain everything written so far
        pub(crate) fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut *self.written.borrow_mut())
        }

        pub(crate) fn pending_writes(&self) -> usize {
            self.pending.borrow().len()
        }

        /// Complete all queued writes successfully, including ones queued
        /// by completion callbacks
        pub(crate) fn complete_writes(&self) {
            loop {
                let next = self.pending.borrow_mut().pop_front();
                match next {
                    Some((bufs, done)) => done(bufs, Ok(())),
                    None => break,
                }
            }
        }

        /// Fail the oldest queued write
        pub(crate) fn fail_next_write(&self, kind: io::ErrorKind) {
            let next = self.pending.borrow_mut().pop_front();
            if let Some((bufs, done)) = next {
                done(bufs, Err(io::Error::from(kind)));
            }
        }

        pub(crate) fn timer_durations(&self) -> Vec<Duration> {
            self.timers.borrow().iter().map(|(d, _)| *d).collect()
        }

        /// Fire every armed timer
        pub(crate) fn fire_timers(&self) {
            let timers = std::mem::take(&mut *self.timers.borrow_mut());
            for (_, callback) in timers {
                callback();
            }
        }
    }

    impl ByteStream for MockStream {
        fn write(&self, bufs: Vec<Bytes>, done: WriteCallback) {
            {
                let mut written = self.written.borrow_mut();
                for buf in &bufs {
                    written.extend_from_slice(buf);
                }
            }
            self.pending.borrow_mut().push_back((bufs, done));
        }

        fn shutdown(&self) {
            self.shutdown.set(true);
        }

        fn close(&self) {
            self.closed.set(true);
        }

        fn start_read(&self) {
            self.reading.set(true);
            self.read_restarts.set(self.read_restarts.get() + 1);
        }

        fn stop_read(&self) {
            self.reading.set(false);
        }

        fn set_timer(&self, after: Duration, callback: TimerCallback) {
            self.timers.borrow_mut().push((after, callback));
        }
    }
}
