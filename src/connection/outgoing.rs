//! The client side of a connection: originates requests against an upstream
//! FastCGI responder. Split into a cloneable [`OutgoingConnection`] handle
//! and an [`OutgoingDriver`] task owning the framed transport, so every
//! caller funnels through one place that mutates the per-id bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::codec::{encoded_pair_len, FastcgiCodec};
use crate::connection::{Control, CONTROL_CAPACITY, INPUT_CAPACITY};
use crate::error::Error;
use crate::protocol::{
    Config, RecordType, Role, DEFAULT_PADDING_FIT, FCGI_MAX_CONNS, FCGI_MAX_REQS,
    FCGI_MPXS_CONNS, KEEP_CONN, MAX_CONTENT_LEN, NULL_REQUEST_ID,
};
use crate::record::{EndRequest, Record, RecordBody};
use crate::request::{ByteStream, OutgoingRequest, StreamWriter};

#[derive(Debug, Clone, Copy)]
pub struct OutgoingOptions {
    pub padding_fit: u8,
}

impl Default for OutgoingOptions {
    fn default() -> OutgoingOptions {
        OutgoingOptions {
            padding_fit: DEFAULT_PADDING_FIT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BeginRequestOptions {
    pub role: Role,
    /// Ask the peer to keep the transport open after this request; when
    /// false, the connection closes itself once the request completes.
    pub keep_alive: bool,
}

impl Default for BeginRequestOptions {
    fn default() -> BeginRequestOptions {
        BeginRequestOptions {
            role: Role::Responder,
            keep_alive: true,
        }
    }
}

enum Command {
    GetValues {
        reply: oneshot::Sender<Config>,
    },
    Begin {
        params: HashMap<String, String>,
        role: Role,
        keep_alive: bool,
        reply: oneshot::Sender<Result<OutgoingRequest, Error>>,
    },
    Close,
}

/// Handle for originating requests on one client connection. Cheap to clone;
/// all clones share the same driver task.
#[derive(Clone)]
pub struct OutgoingConnection {
    cmd_tx: mpsc::Sender<Command>,
}

impl OutgoingConnection {
    pub fn new<T: AsyncRead + AsyncWrite + Unpin>(
        transport: T,
        options: OutgoingOptions,
    ) -> Result<(OutgoingConnection, OutgoingDriver<T>), Error> {
        let codec = FastcgiCodec::with_padding_fit(options.padding_fit)?;
        let (cmd_tx, cmd_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let driver = OutgoingDriver {
            framed: Framed::new(transport, codec),
            cmd_rx,
            control_tx,
            control_rx,
            requests: HashMap::new(),
            config: None,
            get_values_waiters: Vec::new(),
            stalled: None,
            next_id: 0,
        };
        Ok((OutgoingConnection { cmd_tx }, driver))
    }

    /// The peer's capability set. The first caller triggers one GET_VALUES
    /// exchange; concurrent and later callers share the cached snapshot.
    pub async fn get_values(&self) -> Result<Config, Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetValues { reply })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Open a new logical request: sends BEGIN_REQUEST, the params mapping,
    /// and the end-of-params sentinel, and returns the request object.
    pub async fn begin_request(
        &self,
        params: HashMap<String, String>,
        options: BeginRequestOptions,
    ) -> Result<OutgoingRequest, Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Begin {
                params,
                role: options.role,
                keep_alive: options.keep_alive,
                reply,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Shut the connection down: every open request is dropped and the
    /// transport is destroyed. Idempotent; safe to call on a dead handle.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

/// Client-side bookkeeping for one open request id.
struct RequestEntry {
    stdout: Option<mpsc::Sender<Bytes>>,
    stderr: Option<mpsc::Sender<Bytes>>,
    end_tx: Option<oneshot::Sender<EndRequest>>,
    done: Arc<AtomicBool>,
    keep_alive: bool,
}

/// The task half of an [`OutgoingConnection`]; `run` it (usually spawned)
/// for as long as the connection lives.
pub struct OutgoingDriver<T> {
    framed: Framed<T, FastcgiCodec>,
    cmd_rx: mpsc::Receiver<Command>,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    requests: HashMap<u16, RequestEntry>,
    config: Option<Config>,
    get_values_waiters: Vec<oneshot::Sender<Config>>,
    /// A response chunk that did not fit its request's buffer. While one is
    /// parked the transport is not read, but commands and control messages
    /// still flow, so a request's writes never wait on its unread output.
    stalled: Option<(u16, RecordType, Bytes)>,
    next_id: u16,
}

impl<T: AsyncRead + AsyncWrite + Unpin> OutgoingDriver<T> {
    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.drive().await;
        self.teardown();
        result
    }

    async fn drive(&mut self) -> Result<(), Error> {
        loop {
            if self.stalled.is_some() {
                if self.flush_stalled().await? {
                    return Ok(());
                }
                continue;
            }
            tokio::select! {
                record = self.framed.next() => match record {
                    Some(Ok(record)) => {
                        if self.dispatch(record).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!("transport closed by peer");
                        return Ok(());
                    }
                },
                command = self.cmd_rx.recv() => match command {
                    Some(Command::GetValues { reply }) => self.handle_get_values(reply).await?,
                    Some(Command::Begin { params, role, keep_alive, reply }) => {
                        self.handle_begin(params, role, keep_alive, reply).await?;
                    }
                    Some(Command::Close) | None => {
                        debug!("connection closed locally");
                        self.abort_open_requests().await;
                        return Ok(());
                    }
                },
                control = self.control_rx.recv() => {
                    // We hold a control_tx ourselves, so this is never None.
                    if let Some(control) = control {
                        if self.handle_control(control).await? {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Returns true when the connection should close.
    async fn dispatch(&mut self, record: Record) -> Result<bool, Error> {
        let id = record.request_id;
        match record.body {
            RecordBody::GetValuesResult(values) => {
                if id != NULL_REQUEST_ID {
                    debug!("ignoring GetValuesResult for request id {}", id);
                    return Ok(false);
                }
                let config = Config::from_values(&values);
                self.config = Some(config);
                for waiter in self.get_values_waiters.drain(..) {
                    let _ = waiter.send(config);
                }
            }
            RecordBody::Stdout(data) => self.deliver(id, RecordType::Stdout, data),
            RecordBody::Stderr(data) => self.deliver(id, RecordType::Stderr, data),
            RecordBody::EndRequest(end) => {
                let Some(mut entry) = self.requests.remove(&id) else {
                    debug!("ignoring EndRequest for id {} (not open)", id);
                    return Ok(false);
                };
                info!(
                    "request {} ended: app status {}, {:?}",
                    id, end.app_status, end.protocol_status
                );
                entry.done.store(true, Ordering::SeqCst);
                if let Some(end_tx) = entry.end_tx.take() {
                    let _ = end_tx.send(end);
                }
                let keep_alive = entry.keep_alive;
                drop(entry); // ends the stdout/stderr streams
                if !keep_alive {
                    debug!("closing connection after request {}", id);
                    return Ok(true);
                }
            }
            other => {
                // Records only a client may send; tolerated, not fatal.
                debug!("ignoring {:?} record from server", Record { request_id: id, body: other }.record_type());
            }
        }
        Ok(false)
    }

    fn deliver(&mut self, id: u16, record_type: RecordType, data: Bytes) {
        let Some(entry) = self.requests.get_mut(&id) else {
            debug!("ignoring {:?} for id {} (not open)", record_type, id);
            return;
        };
        let slot = if record_type == RecordType::Stdout {
            &mut entry.stdout
        } else {
            &mut entry.stderr
        };
        if data.is_empty() {
            slot.take();
            return;
        }
        let Some(tx) = slot else {
            return;
        };
        // Full buffer: park the chunk and stop reading the transport until
        // the consumer catches up. A dropped reader discards its output.
        if let Err(TrySendError::Full(data)) = tx.try_send(data) {
            self.stalled = Some((id, record_type, data));
        }
    }

    /// Deliver the parked response chunk without blocking the command or
    /// control channels. Returns true when the connection closed meanwhile.
    async fn flush_stalled(&mut self) -> Result<bool, Error> {
        let Some((id, record_type, data)) = self.stalled.take() else {
            return Ok(false);
        };
        // The request may have completed while the chunk waited.
        let tx = match self.requests.get(&id) {
            Some(entry) => {
                let slot = if record_type == RecordType::Stdout {
                    &entry.stdout
                } else {
                    &entry.stderr
                };
                match slot {
                    Some(tx) => tx.clone(),
                    None => return Ok(false),
                }
            }
            None => return Ok(false),
        };
        tokio::select! {
            permit = tx.reserve() => {
                if let Ok(permit) = permit {
                    permit.send(data);
                }
            }
            command = self.cmd_rx.recv() => {
                self.stalled = Some((id, record_type, data));
                match command {
                    Some(Command::GetValues { reply }) => self.handle_get_values(reply).await?,
                    Some(Command::Begin { params, role, keep_alive, reply }) => {
                        self.handle_begin(params, role, keep_alive, reply).await?;
                    }
                    Some(Command::Close) | None => {
                        debug!("connection closed locally");
                        self.abort_open_requests().await;
                        return Ok(true);
                    }
                }
            }
            control = self.control_rx.recv() => {
                self.stalled = Some((id, record_type, data));
                if let Some(control) = control {
                    return self.handle_control(control).await;
                }
            }
        }
        Ok(false)
    }

    /// Local close with requests still open: tell the peer each one is
    /// abandoned before the transport goes away. Failures are moot here.
    async fn abort_open_requests(&mut self) {
        for (id, entry) in std::mem::take(&mut self.requests) {
            entry.done.store(true, Ordering::SeqCst);
            let _ = self.framed.send(Record::abort_request(id)).await;
        }
    }

    async fn handle_get_values(&mut self, reply: oneshot::Sender<Config>) -> Result<(), Error> {
        if let Some(config) = self.config {
            let _ = reply.send(config);
            return Ok(());
        }
        let first_waiter = self.get_values_waiters.is_empty();
        self.get_values_waiters.push(reply);
        if first_waiter {
            self.framed
                .send(Record::get_values(vec![
                    FCGI_MAX_CONNS.to_owned(),
                    FCGI_MAX_REQS.to_owned(),
                    FCGI_MPXS_CONNS.to_owned(),
                ]))
                .await?;
        }
        Ok(())
    }

    async fn handle_begin(
        &mut self,
        params: HashMap<String, String>,
        role: Role,
        keep_alive: bool,
        reply: oneshot::Sender<Result<OutgoingRequest, Error>>,
    ) -> Result<(), Error> {
        if self.requests.len() >= 0xffff {
            let _ = reply.send(Err(Error::TooManyRequests));
            return Ok(());
        }
        let param_chunks = match chunk_params(&params) {
            Ok(chunks) => chunks,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };

        // Cycle through [1, 65535], skipping ids still in use.
        let id = loop {
            let candidate = (self.next_id % 0xffff) + 1;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.requests.contains_key(&candidate) {
                break candidate;
            }
        };

        let (stdout_tx, stdout_rx) = mpsc::channel(INPUT_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(INPUT_CAPACITY);
        let (end_tx, end_rx) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));
        let request = OutgoingRequest::new(
            id,
            params,
            StreamWriter::new(id, RecordType::Stdin, self.control_tx.clone(), done.clone()),
            StreamWriter::new(id, RecordType::Data, self.control_tx.clone(), done.clone()),
            ByteStream::new(stdout_rx),
            ByteStream::new(stderr_rx),
            self.control_tx.clone(),
            done.clone(),
            end_rx,
        );
        self.requests.insert(
            id,
            RequestEntry {
                stdout: Some(stdout_tx),
                stderr: Some(stderr_tx),
                end_tx: Some(end_tx),
                done,
                keep_alive,
            },
        );
        info!("beginning {:?} request {}", role, id);

        let flags = if keep_alive { KEEP_CONN } else { 0 };
        self.framed.send(Record::begin_request(id, role, flags)).await?;
        for chunk in param_chunks {
            self.framed.send(Record::params(id, chunk)).await?;
        }
        self.framed.send(Record::params_done(id)).await?;

        let _ = reply.send(Ok(request));
        Ok(())
    }

    /// Returns true when the connection should close.
    async fn handle_control(&mut self, control: Control) -> Result<bool, Error> {
        match control {
            Control::Write {
                id,
                record_type,
                data,
            } => {
                if self.requests.contains_key(&id) {
                    self.framed.send(Record::stream(id, record_type, data)).await?;
                }
                Ok(false)
            }
            Control::Abort { id } => {
                let Some(entry) = self.requests.remove(&id) else {
                    return Ok(false);
                };
                info!("aborting request {}", id);
                entry.done.store(true, Ordering::SeqCst);
                let keep_alive = entry.keep_alive;
                drop(entry);
                self.framed.send(Record::abort_request(id)).await?;
                Ok(!keep_alive)
            }
            Control::End { .. } => Ok(false), // server-side message
        }
    }

    fn teardown(&mut self) {
        // Open requests observe the close: their streams end and their
        // completion waiters fail with ConnectionClosed.
        for (_, entry) in self.requests.drain() {
            entry.done.store(true, Ordering::SeqCst);
        }
        self.get_values_waiters.clear();
    }
}

/// Group params into record-sized chunks at pair boundaries. A single pair
/// too large for one record cannot be represented and is a caller error.
fn chunk_params(params: &HashMap<String, String>) -> Result<Vec<Vec<(String, String)>>, Error> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 0;
    for (name, value) in params {
        let pair_len = encoded_pair_len(name, value);
        if pair_len > MAX_CONTENT_LEN {
            return Err(Error::Oversize(pair_len));
        }
        if current_len + pair_len > MAX_CONTENT_LEN {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push((name.clone(), value.clone()));
        current_len += pair_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}
