//! Tokio adapter for [`ByteStream`]
//!
//! [`TokioStream::spawn`] splits any `AsyncRead + AsyncWrite` into a
//! writer task and a [`StreamReader`]. The writer task drains queued
//! writes in order and hands each batch of buffers back through its
//! callback; the reader feeds incoming bytes to a [`StreamHandler`].
//!
//! Callbacks are not `Send`, so everything must run inside a
//! [`tokio::task::LocalSet`].
//!
//! # Example
//!
//! ```ignore
//! use tokio::task::LocalSet;
//! use sockudo_wire::{ClientOptions, TokioStream, WebSocket};
//!
//! LocalSet::new().run_until(async {
//!     let tcp = tokio::net::TcpStream::connect("127.0.0.1:8080").await?;
//!     let (stream, reader) = TokioStream::spawn(tcp);
//!     let ws = WebSocket::client(stream, "/", "localhost", &["chat"], ClientOptions::default());
//!     ws.on_text(|text, _| println!("{text}"));
//!     reader.run(&ws).await;
//! }).await;
//! ```

use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};

use crate::transport::{ByteStream, StreamHandler, TimerCallback, WriteCallback};

/// Read buffer size for the reader loop
const READ_BUFFER_SIZE: usize = 16 * 1024;

enum Command {
    Write(Vec<Bytes>, WriteCallback),
    Shutdown,
    Close,
}

/// State shared by the handle, the writer task and the reader
#[derive(Default)]
struct Control {
    reading: Cell<bool>,
    resume: Notify,
    closed: Cell<bool>,
    close_notify: Notify,
}

impl Control {
    fn mark_closed(&self) {
        if !self.closed.replace(true) {
            self.close_notify.notify_one();
            self.resume.notify_one();
        }
    }

    async fn wait_closed(&self) {
        while !self.closed.get() {
            self.close_notify.notified().await;
        }
    }
}

/// [`ByteStream`] over a tokio I/O object
pub struct TokioStream {
    commands: mpsc::UnboundedSender<Command>,
    control: Rc<Control>,
}

/// Read side of a [`TokioStream`]
pub struct StreamReader<R> {
    reader: R,
    control: Rc<Control>,
}

impl TokioStream {
    /// Split `io` and start its writer task on the current `LocalSet`
    pub fn spawn<S>(io: S) -> (Rc<Self>, StreamReader<ReadHalf<S>>)
    where
        S: AsyncRead + AsyncWrite + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Rc::new(Control {
            reading: Cell::new(true),
            ..Default::default()
        });

        tokio::task::spawn_local(write_loop(writer, rx, control.clone()));

        let stream = Rc::new(Self {
            commands: tx,
            control: control.clone(),
        });
        (stream, StreamReader { reader, control })
    }

    /// Whether the stream has been shut down or closed
    pub fn is_closed(&self) -> bool {
        self.control.closed.get()
    }
}

impl ByteStream for TokioStream {
    fn write(&self, bufs: Vec<Bytes>, done: WriteCallback) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Write(bufs, done)) {
            // Writer is gone; still complete asynchronously
            if let Command::Write(bufs, done) = command {
                tokio::task::spawn_local(async move {
                    done(bufs, Err(io::Error::from(io::ErrorKind::NotConnected)));
                });
            }
        }
    }

    fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn close(&self) {
        self.control.mark_closed();
        let _ = self.commands.send(Command::Close);
    }

    fn start_read(&self) {
        if !self.control.reading.replace(true) {
            self.control.resume.notify_one();
        }
    }

    fn stop_read(&self) {
        self.control.reading.set(false);
    }

    fn set_timer(&self, after: Duration, callback: TimerCallback) {
        tokio::task::spawn_local(async move {
            tokio::time::sleep(after).await;
            callback();
        });
    }
}

async fn write_loop<W>(
    mut writer: WriteHalf<W>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    control: Rc<Control>,
) where
    W: AsyncRead + AsyncWrite,
{
    while let Some(command) = commands.recv().await {
        match command {
            Command::Write(bufs, done) => {
                let result = if control.closed.get() {
                    Err(io::Error::from(io::ErrorKind::NotConnected))
                } else {
                    write_all(&mut writer, &bufs).await
                };
                if let Err(e) = &result {
                    debug!(error = %e, "transport write failed");
                }
                done(bufs, result);
            }
            Command::Shutdown => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "transport shutdown failed");
                }
                break;
            }
            Command::Close => break,
        }
    }

    control.mark_closed();

    // Hand remaining buffers back to their owners
    commands.close();
    while let Some(command) = commands.recv().await {
        if let Command::Write(bufs, done) = command {
            done(bufs, Err(io::Error::from(io::ErrorKind::NotConnected)));
        }
    }
    trace!("writer task finished");
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, bufs: &[Bytes]) -> io::Result<()> {
    for buf in bufs {
        writer.write_all(buf).await?;
    }
    writer.flush().await
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    /// Feed incoming bytes to `handler` until the stream closes
    ///
    /// EOF and read errors are reported once; the loop then waits for the
    /// handler to shut the stream down and finally reports `handle_closed`.
    pub async fn run<H: StreamHandler + ?Sized>(mut self, handler: &H) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if self.control.closed.get() {
                break;
            }
            if !self.control.reading.get() {
                self.control.resume.notified().await;
                continue;
            }

            tokio::select! {
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        trace!("peer finished sending");
                        handler.handle_end();
                        self.control.wait_closed().await;
                        break;
                    }
                    Ok(n) => handler.handle_data(&buf[..n]),
                    Err(e) => {
                        debug!(error = %e, "transport read failed");
                        handler.handle_error(&e);
                        self.control.wait_closed().await;
                        break;
                    }
                },
                _ = self.control.close_notify.notified() => {}
            }
        }
        handler.handle_closed();
    }
}
