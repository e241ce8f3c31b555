//! Request lifecycle objects: the bundle of role, params, and stream handles
//! a connection hands to (or builds for) the application.
//!
//! End/abort are mutually terminal: the first call wins via a flag shared
//! with the owning connection, and every later call is a no-op, so
//! END_REQUEST / ABORT_REQUEST goes out at most once per request id.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::Control;
use crate::error::Error;
use crate::protocol::{ProtocolStatus, RecordType, Role};
use crate::record::EndRequest;

/// Readable half of a request channel (stdin/data on the server side,
/// stdout/stderr on the client side). `None` from [`recv`](Self::recv) is
/// end-of-stream; nothing is delivered after it.
#[derive(Debug)]
pub struct ByteStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ByteStream {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> ByteStream {
        ByteStream { rx }
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Drain the stream into one buffer.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

impl Stream for ByteStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

/// Writable half of a request channel. Writes are framed as stream records
/// by the owning connection; [`finish`](Self::finish) emits the zero-length
/// end-of-stream record.
#[derive(Debug)]
pub struct StreamWriter {
    id: u16,
    record_type: RecordType,
    control: mpsc::Sender<Control>,
    done: Arc<AtomicBool>,
    finished: bool,
}

impl StreamWriter {
    pub(crate) fn new(
        id: u16,
        record_type: RecordType,
        control: mpsc::Sender<Control>,
        done: Arc<AtomicBool>,
    ) -> StreamWriter {
        StreamWriter {
            id,
            record_type,
            control,
            done,
            finished: false,
        }
    }

    /// Queue a payload for the peer. Empty input is a no-op: a zero-length
    /// record means end-of-stream on the wire, which only `finish` sends.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        if self.finished || self.done.load(Ordering::SeqCst) {
            return Err(Error::RequestEnded);
        }
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.control
            .send(Control::Write {
                id: self.id,
                record_type: self.record_type,
                data,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send the end-of-stream record. Idempotent; a no-op after the request
    /// already ended (the connection closes the stream itself then).
    pub async fn finish(&mut self) -> Result<(), Error> {
        if self.finished || self.done.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.finished = true;
        self.control
            .send(Control::Write {
                id: self.id,
                record_type: self.record_type,
                data: Bytes::new(),
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// A request accepted by an [`IncomingConnection`](crate::IncomingConnection):
/// finalized params plus readable stdin/data and writable stdout/stderr.
#[derive(Debug)]
pub struct IncomingRequest {
    id: u16,
    role: Role,
    params: HashMap<String, String>,
    stdin: ByteStream,
    data: ByteStream,
    stdout: StreamWriter,
    stderr: StreamWriter,
    control: mpsc::Sender<Control>,
    done: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl IncomingRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u16,
        role: Role,
        params: HashMap<String, String>,
        stdin: ByteStream,
        data: ByteStream,
        stdout: StreamWriter,
        stderr: StreamWriter,
        control: mpsc::Sender<Control>,
        done: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> IncomingRequest {
        IncomingRequest {
            id,
            role,
            params,
            stdin,
            data,
            stdout,
            stderr,
            control,
            done,
            cancel,
        }
    }

    pub fn request_id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn stdin(&mut self) -> &mut ByteStream {
        &mut self.stdin
    }

    /// The FCGI_DATA input stream (only the Filter role feeds it).
    pub fn data(&mut self) -> &mut ByteStream {
        &mut self.data
    }

    pub fn stdout(&mut self) -> &mut StreamWriter {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut StreamWriter {
        &mut self.stderr
    }

    /// All four stream handles at once, for use from separate await points.
    pub fn streams(
        &mut self,
    ) -> (&mut ByteStream, &mut ByteStream, &mut StreamWriter, &mut StreamWriter) {
        (&mut self.stdin, &mut self.data, &mut self.stdout, &mut self.stderr)
    }

    /// Fires when the request is aborted, by the peer or locally.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Complete the request: END_REQUEST{app_status, REQUEST_COMPLETE} after
    /// closing both output streams. No-op if already ended or aborted.
    pub async fn end(&mut self, app_status: u32) -> Result<(), Error> {
        self.end_with(app_status, ProtocolStatus::RequestComplete).await
    }

    pub async fn end_with(
        &mut self,
        app_status: u32,
        protocol_status: ProtocolStatus,
    ) -> Result<(), Error> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.control
            .send(Control::End {
                id: self.id,
                app_status,
                protocol_status,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Force the request closed without a normal completion: cancels the
    /// token and ends it with app status 0. No-op if already ended.
    pub async fn abort(&mut self) -> Result<(), Error> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.control
            .send(Control::End {
                id: self.id,
                app_status: 0,
                protocol_status: ProtocolStatus::RequestComplete,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// A request originated through an
/// [`OutgoingConnection`](crate::OutgoingConnection): writable stdin/data,
/// readable stdout/stderr, and the peer's END_REQUEST status via
/// [`wait`](Self::wait).
#[derive(Debug)]
pub struct OutgoingRequest {
    id: u16,
    params: HashMap<String, String>,
    stdin: StreamWriter,
    data: StreamWriter,
    stdout: ByteStream,
    stderr: ByteStream,
    control: mpsc::Sender<Control>,
    done: Arc<AtomicBool>,
    end_rx: Option<oneshot::Receiver<EndRequest>>,
}

impl OutgoingRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u16,
        params: HashMap<String, String>,
        stdin: StreamWriter,
        data: StreamWriter,
        stdout: ByteStream,
        stderr: ByteStream,
        control: mpsc::Sender<Control>,
        done: Arc<AtomicBool>,
        end_rx: oneshot::Receiver<EndRequest>,
    ) -> OutgoingRequest {
        OutgoingRequest {
            id,
            params,
            stdin,
            data,
            stdout,
            stderr,
            control,
            done,
            end_rx: Some(end_rx),
        }
    }

    pub fn request_id(&self) -> u16 {
        self.id
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn stdin(&mut self) -> &mut StreamWriter {
        &mut self.stdin
    }

    pub fn data(&mut self) -> &mut StreamWriter {
        &mut self.data
    }

    pub fn stdout(&mut self) -> &mut ByteStream {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut ByteStream {
        &mut self.stderr
    }

    /// All four stream handles at once, for use from separate await points.
    pub fn streams(
        &mut self,
    ) -> (&mut StreamWriter, &mut StreamWriter, &mut ByteStream, &mut ByteStream) {
        (&mut self.stdin, &mut self.data, &mut self.stdout, &mut self.stderr)
    }

    /// The peer's END_REQUEST status. Errors with `ConnectionClosed` if the
    /// connection goes away first, and `RequestEnded` on a second call.
    pub async fn wait(&mut self) -> Result<EndRequest, Error> {
        match self.end_rx.take() {
            Some(rx) => rx.await.map_err(|_| Error::ConnectionClosed),
            None => Err(Error::RequestEnded),
        }
    }

    /// Send ABORT_REQUEST and drop the request's bookkeeping. No-op if the
    /// request already completed or was already aborted.
    pub async fn abort(&mut self) -> Result<(), Error> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.control
            .send(Control::Abort { id: self.id })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}
