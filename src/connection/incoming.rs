//! The server side of a connection: accepts BEGIN_REQUEST/PARAMS/STDIN/DATA
//! sequences from a FastCGI client (typically a web server), hands finalized
//! requests to the application, and writes its output and END_REQUEST
//! records back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::FastcgiCodec;
use crate::connection::{Control, CONTROL_CAPACITY, INPUT_CAPACITY, REQUEST_CAPACITY};
use crate::error::Error;
use crate::protocol::{Config, ProtocolStatus, RecordType, Role, DEFAULT_PADDING_FIT, NULL_REQUEST_ID};
use crate::record::{BeginRequest, Record, RecordBody};
use crate::request::{ByteStream, IncomingRequest, StreamWriter};

#[derive(Debug, Clone, Copy)]
pub struct IncomingOptions {
    /// Capability set answered to GET_VALUES; `mpxs_conns` also gates
    /// request admission.
    pub config: Config,
    pub padding_fit: u8,
}

impl Default for IncomingOptions {
    fn default() -> IncomingOptions {
        IncomingOptions {
            config: Config::default(),
            padding_fit: DEFAULT_PADDING_FIT,
        }
    }
}

/// Params accumulated for a request id whose param stream has not finished.
struct PendingRequest {
    role: Role,
    params: HashMap<String, String>,
}

/// Bookkeeping for a request the application is processing.
struct ActiveRequest {
    /// `None` once the peer ended the stream.
    stdin: Option<mpsc::Sender<Bytes>>,
    data: Option<mpsc::Sender<Bytes>>,
    done: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ActiveRequest {
    fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// One accepted transport connection, server side.
///
/// `new` returns the connection plus the channel on which finalized requests
/// arrive; `run` drives it until the peer disconnects, a fatal protocol
/// error occurs, or a non-keep-alive request completes. Dropping the request
/// receiver closes the connection.
pub struct IncomingConnection<T> {
    framed: Framed<T, FastcgiCodec>,
    config: Config,
    pending: HashMap<u16, PendingRequest>,
    active: HashMap<u16, ActiveRequest>,
    requests_tx: mpsc::Sender<IncomingRequest>,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    /// An input chunk that did not fit its request's buffer. While one is
    /// parked the transport is not read, but control messages still flow, so
    /// a request's output never waits on its own unread input.
    stalled: Option<(u16, RecordType, Bytes)>,
    close_after: bool,
}

impl<T: AsyncRead + AsyncWrite + Unpin> IncomingConnection<T> {
    pub fn new(
        transport: T,
        options: IncomingOptions,
    ) -> Result<(IncomingConnection<T>, mpsc::Receiver<IncomingRequest>), Error> {
        let codec = FastcgiCodec::with_padding_fit(options.padding_fit)?;
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let connection = IncomingConnection {
            framed: Framed::new(transport, codec),
            config: options.config,
            pending: HashMap::new(),
            active: HashMap::new(),
            requests_tx,
            control_tx,
            control_rx,
            stalled: None,
            close_after: false,
        };
        Ok((connection, requests_rx))
    }

    /// Drive the connection to completion. All request handles handed out by
    /// this connection stop working once this returns.
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
            RecordBody::BeginRequest(begin) => self.handle_begin(id, begin).await?,
            RecordBody::Params(pairs) => return self.handle_params(id, pairs).await,
            RecordBody::Stdin(data) => self.handle_input(id, RecordType::Stdin, data),
            RecordBody::Data(data) => self.handle_input(id, RecordType::Data, data),
            RecordBody::AbortRequest => self.handle_abort(id).await?,
            RecordBody::GetValues(keys) => {
                let values = self.config.matching_values(&keys);
                self.framed.send(Record::get_values_result(values)).await?;
            }
            other => {
                // Records only a server may send; tolerated, not fatal.
                debug!("ignoring {:?} record from client", Record { request_id: id, body: other }.record_type());
            }
        }
        Ok(false)
    }

    async fn handle_begin(&mut self, id: u16, begin: BeginRequest) -> Result<(), Error> {
        if id == NULL_REQUEST_ID
            || self.pending.contains_key(&id)
            || self.active.contains_key(&id)
        {
            debug!("ignoring BeginRequest for id {}", id);
            return Ok(());
        }
        let mpxs = self.config.mpxs_conns.unwrap_or(false);
        let occupied = !self.pending.is_empty() || !self.active.is_empty();
        if self.close_after || (occupied && !mpxs) {
            debug!("rejecting request {}: cannot multiplex", id);
            self.framed
                .send(Record::end_request(id, 0, ProtocolStatus::CantMultiplexConnections))
                .await?;
            return Ok(());
        }
        self.close_after = !begin.keep_conn() || !mpxs;
        self.pending.insert(
            id,
            PendingRequest {
                role: begin.role,
                params: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn handle_params(
        &mut self,
        id: u16,
        pairs: Vec<(String, String)>,
    ) -> Result<bool, Error> {
        let Some(mut pending) = self.pending.remove(&id) else {
            debug!("ignoring Params for id {} (not pending)", id);
            return Ok(false);
        };
        if !pairs.is_empty() {
            // Later keys overwrite earlier ones with the same name.
            pending.params.extend(pairs);
            self.pending.insert(id, pending);
            return Ok(false);
        }

        // Empty Params record: the param stream is done, promote to active.
        let (stdin_tx, stdin_rx) = mpsc::channel(INPUT_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(INPUT_CAPACITY);
        let done = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let request = IncomingRequest::new(
            id,
            pending.role,
            pending.params,
            ByteStream::new(stdin_rx),
            ByteStream::new(data_rx),
            StreamWriter::new(id, RecordType::Stdout, self.control_tx.clone(), done.clone()),
            StreamWriter::new(id, RecordType::Stderr, self.control_tx.clone(), done.clone()),
            self.control_tx.clone(),
            done.clone(),
            cancel.clone(),
        );
        self.active.insert(
            id,
            ActiveRequest {
                stdin: Some(stdin_tx),
                data: Some(data_tx),
                done,
                cancel,
            },
        );
        info!("new {:?} request {}", pending.role, id);

        if self.requests_tx.send(request).await.is_err() {
            warn!("request receiver dropped; closing connection");
            return Ok(true);
        }
        Ok(false)
    }

    fn handle_input(&mut self, id: u16, record_type: RecordType, data: Bytes) {
        let Some(active) = self.active.get_mut(&id) else {
            debug!("ignoring {:?} for id {} (not active)", record_type, id);
            return;
        };
        let slot = if record_type == RecordType::Stdin {
            &mut active.stdin
        } else {
            &mut active.data
        };
        if data.is_empty() {
            // End-of-stream: dropping the sender delivers None to the reader.
            slot.take();
            return;
        }
        let Some(tx) = slot else {
            return;
        };
        // Full buffer: park the chunk and stop reading the transport until
        // the consumer catches up. A dropped reader discards its input.
        if let Err(TrySendError::Full(data)) = tx.try_send(data) {
            self.stalled = Some((id, record_type, data));
        }
    }

    /// Deliver the parked input chunk without blocking the control channel.
    /// Returns true when a control message closed the connection meanwhile.
    async fn flush_stalled(&mut self) -> Result<bool, Error> {
        let Some((id, record_type, data)) = self.stalled.take() else {
            return Ok(false);
        };
        // The request may have ended while the chunk waited.
        let tx = match self.active.get(&id) {
            Some(active) => {
                let slot = if record_type == RecordType::Stdin {
                    &active.stdin
                } else {
                    &active.data
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
            control = self.control_rx.recv() => {
                self.stalled = Some((id, record_type, data));
                if let Some(control) = control {
                    return self.handle_control(control).await;
                }
            }
        }
        Ok(false)
    }

    async fn handle_abort(&mut self, id: u16) -> Result<(), Error> {
        let Some(active) = self.active.remove(&id) else {
            debug!("ignoring AbortRequest for id {} (not active)", id);
            return Ok(());
        };
        info!("request {} aborted by peer", id);
        active.finish();
        active.cancel.cancel();
        drop(active); // closes the input streams
        self.framed
            .send(Record::end_request(id, 0, ProtocolStatus::RequestComplete))
            .await?;
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
                // Output for a request that already ended is discarded.
                if self.active.contains_key(&id) {
                    self.framed.send(Record::stream(id, record_type, data)).await?;
                }
                Ok(false)
            }
            Control::End {
                id,
                app_status,
                protocol_status,
            } => {
                let Some(active) = self.active.remove(&id) else {
                    return Ok(false);
                };
                active.finish();
                drop(active);
                self.framed.send(Record::stdout(id, Bytes::new())).await?;
                self.framed.send(Record::stderr(id, Bytes::new())).await?;
                self.framed
                    .send(Record::end_request(id, app_status, protocol_status))
                    .await?;
                if self.close_after {
                    debug!("closing connection after request {}", id);
                    return Ok(true);
                }
                Ok(false)
            }
            Control::Abort { .. } => Ok(false), // client-side message
        }
    }

    fn teardown(&mut self) {
        for (_, active) in self.active.drain() {
            active.finish();
            active.cancel.cancel();
        }
        self.pending.clear();
        // Dropping requests_tx (with self) delivers the close to the
        // application's request receiver exactly once.
    }
}
