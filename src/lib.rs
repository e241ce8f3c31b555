//! A FastCGI protocol engine for tokio: the record codec, both connection
//! state machines, and the request objects they hand out.
//!
//! The crate is transport-agnostic. Hand [`IncomingConnection`] (server
//! side) or [`OutgoingConnection`] (client side) anything that implements
//! `AsyncRead + AsyncWrite`, spawn the connection's driver task, and talk to
//! requests through [`IncomingRequest`] / [`OutgoingRequest`] handles.
//!
//! ```no_run
//! use tokio::net::TcpListener;
//! use tokio_fcgi::{IncomingConnection, IncomingOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:9000").await?;
//!     loop {
//!         let (socket, _) = listener.accept().await?;
//!         let (connection, mut requests) =
//!             IncomingConnection::new(socket, IncomingOptions::default())?;
//!         tokio::spawn(connection.run());
//!         tokio::spawn(async move {
//!             while let Some(mut request) = requests.recv().await {
//!                 let body = request.stdin().read_to_end().await;
//!                 request.stdout().write(format!(
//!                     "Content-Type: text/plain\r\n\r\ngot {} bytes\n",
//!                     body.len(),
//!                 )).await?;
//!                 request.end(0).await?;
//!             }
//!             Ok::<_, tokio_fcgi::Error>(())
//!         });
//!     }
//! }
//! ```

mod codec;
mod connection;
mod error;
mod protocol;
mod record;
mod request;

pub use codec::FastcgiCodec;
pub use connection::incoming::{IncomingConnection, IncomingOptions};
pub use connection::outgoing::{
    BeginRequestOptions, OutgoingConnection, OutgoingDriver, OutgoingOptions,
};
pub use error::Error;
pub use protocol::{
    Config, ProtocolStatus, RecordType, Role, DEFAULT_PADDING_FIT, FASTCGI_VERSION,
    FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, HEADER_LEN, KEEP_CONN, MAX_CONTENT_LEN,
    NULL_REQUEST_ID,
};
pub use record::{BeginRequest, EndRequest, Record, RecordBody};
pub use request::{ByteStream, IncomingRequest, OutgoingRequest, StreamWriter};
