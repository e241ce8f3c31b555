//! Client-side connection tests: a raw framed peer plays the FastCGI
//! application and the crate under test plays the web server.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use tokio_fcgi::{
    BeginRequestOptions, FastcgiCodec, OutgoingConnection, OutgoingOptions, ProtocolStatus,
    Record, RecordBody, Role, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, KEEP_CONN,
};

type Peer = Framed<DuplexStream, FastcgiCodec>;

fn setup() -> (Peer, OutgoingConnection) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client, server) = tokio::io::duplex(65536);
    let (connection, driver) =
        OutgoingConnection::new(client, OutgoingOptions::default()).expect("connection setup");
    tokio::spawn(driver.run());
    (Framed::new(server, FastcgiCodec::new()), connection)
}

async fn next_record(peer: &mut Peer) -> Record {
    peer.next()
        .await
        .expect("peer saw unexpected end of connection")
        .expect("decode error")
}

/// Read Params records up to the end-of-params sentinel, merging the pairs.
async fn read_params(peer: &mut Peer, id: u16) -> HashMap<String, String> {
    let mut params = HashMap::new();
    loop {
        match next_record(peer).await {
            Record {
                request_id,
                body: RecordBody::Params(pairs),
            } if request_id == id => {
                if pairs.is_empty() {
                    return params;
                }
                params.extend(pairs);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }
}

fn sample_params() -> HashMap<String, String> {
    HashMap::from([
        ("REQUEST_METHOD".to_owned(), "POST".to_owned()),
        ("CONTENT_LENGTH".to_owned(), "4".to_owned()),
    ])
}

#[tokio::test]
async fn begin_request_sends_the_opening_sequence() {
    let (mut peer, connection) = setup();

    let mut request = connection
        .begin_request(sample_params(), BeginRequestOptions::default())
        .await
        .unwrap();
    let id = request.request_id();
    assert_ne!(id, 0);

    let begin = next_record(&mut peer).await;
    assert_eq!(begin.request_id, id);
    match begin.body {
        RecordBody::BeginRequest(begin) => {
            assert_eq!(begin.role, Role::Responder);
            assert_eq!(begin.flags & KEEP_CONN, KEEP_CONN);
        }
        other => panic!("expected BeginRequest, got {:?}", other),
    }
    assert_eq!(read_params(&mut peer, id).await, sample_params());

    request.stdin().write(&b"ping"[..]).await.unwrap();
    request.stdin().finish().await.unwrap();
    assert_eq!(next_record(&mut peer).await, Record::stdin(id, &b"ping"[..]));
    assert_eq!(next_record(&mut peer).await, Record::stdin(id, Bytes::new()));
}

#[tokio::test]
async fn response_streams_and_completion() {
    let (mut peer, connection) = setup();

    let mut request = connection
        .begin_request(sample_params(), BeginRequestOptions::default())
        .await
        .unwrap();
    let id = request.request_id();
    next_record(&mut peer).await; // BeginRequest
    read_params(&mut peer, id).await;

    peer.send(Record::stdout(id, &b"Status: 200\r\n\r\n"[..]))
        .await
        .unwrap();
    peer.send(Record::stdout(id, &b"body"[..])).await.unwrap();
    peer.send(Record::stdout(id, Bytes::new())).await.unwrap();
    peer.send(Record::stderr(id, &b"oops"[..])).await.unwrap();
    peer.send(Record::stderr(id, Bytes::new())).await.unwrap();
    peer.send(Record::end_request(id, 42, ProtocolStatus::RequestComplete))
        .await
        .unwrap();

    assert_eq!(request.stdout().read_to_end().await, b"Status: 200\r\n\r\nbody");
    assert_eq!(request.stderr().read_to_end().await, b"oops");

    let end = request.wait().await.unwrap();
    assert_eq!(end.app_status, 42);
    assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete);

    // A second wait has nothing left to report.
    assert!(request.wait().await.is_err());
}

#[tokio::test]
async fn concurrent_get_values_share_one_exchange() {
    let (mut peer, connection) = setup();

    let first = tokio::spawn({
        let connection = connection.clone();
        async move { connection.get_values().await }
    });
    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.get_values().await }
    });

    let record = next_record(&mut peer).await;
    assert_eq!(record.request_id, 0);
    match record.body {
        RecordBody::GetValues(keys) => {
            assert_eq!(keys, vec![FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS]);
        }
        other => panic!("expected GetValues, got {:?}", other),
    }
    peer.send(Record::get_values_result(vec![
        (FCGI_MAX_CONNS.to_owned(), "10".to_owned()),
        (FCGI_MPXS_CONNS.to_owned(), "1".to_owned()),
    ]))
    .await
    .unwrap();

    let config = first.await.unwrap().unwrap();
    assert_eq!(config, second.await.unwrap().unwrap());
    assert_eq!(config.max_conns, Some(10));
    assert_eq!(config.max_reqs, None);
    assert_eq!(config.mpxs_conns, Some(true));

    // A later call is served from the cache: the next record on the wire is
    // the request we open afterwards, not another GetValues.
    assert_eq!(connection.get_values().await.unwrap(), config);
    let request = connection
        .begin_request(HashMap::new(), BeginRequestOptions::default())
        .await
        .unwrap();
    let record = next_record(&mut peer).await;
    assert_eq!(record.request_id, request.request_id());
    assert!(matches!(record.body, RecordBody::BeginRequest(_)));
}

#[tokio::test]
async fn abort_sends_abort_request() {
    let (mut peer, connection) = setup();

    let mut request = connection
        .begin_request(HashMap::new(), BeginRequestOptions::default())
        .await
        .unwrap();
    let id = request.request_id();
    next_record(&mut peer).await; // BeginRequest
    read_params(&mut peer, id).await;

    request.abort().await.unwrap();
    assert_eq!(next_record(&mut peer).await, Record::abort_request(id));

    // Aborting again is a no-op.
    request.abort().await.unwrap();
    assert!(request.stdin().write(&b"late"[..]).await.is_err());
}

#[tokio::test]
async fn distinct_request_ids_for_concurrent_requests() {
    let (mut peer, connection) = setup();

    let first = connection
        .begin_request(HashMap::new(), BeginRequestOptions::default())
        .await
        .unwrap();
    let second = connection
        .begin_request(HashMap::new(), BeginRequestOptions::default())
        .await
        .unwrap();
    assert_ne!(first.request_id(), second.request_id());

    next_record(&mut peer).await; // BeginRequest
    read_params(&mut peer, first.request_id()).await;
    let record = next_record(&mut peer).await;
    assert_eq!(record.request_id, second.request_id());
}

#[tokio::test]
async fn writes_flow_while_responses_back_up() {
    let (mut peer, connection) = setup();

    let mut request = connection
        .begin_request(HashMap::new(), BeginRequestOptions::default())
        .await
        .unwrap();
    let id = request.request_id();
    next_record(&mut peer).await; // BeginRequest
    read_params(&mut peer, id).await;

    // The peer streams more response chunks than the buffer holds while the
    // caller is still busy writing the request body.
    for _ in 0..64 {
        peer.send(Record::stdout(id, vec![b'o'; 100])).await.unwrap();
    }
    peer.send(Record::stdout(id, Bytes::new())).await.unwrap();

    let writer = tokio::spawn(async move {
        for _ in 0..64 {
            request.stdin().write(vec![b'i'; 100]).await.unwrap();
        }
        request.stdin().finish().await.unwrap();
        let body = request.stdout().read_to_end().await;
        (request, body)
    });
    let (mut request, body) = tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("connection wedged against its own caller")
        .unwrap();
    assert_eq!(body.len(), 6400);

    let mut sent = 0;
    loop {
        match next_record(&mut peer).await {
            Record {
                body: RecordBody::Stdin(data),
                ..
            } if data.is_empty() => break,
            Record {
                body: RecordBody::Stdin(data),
                ..
            } => sent += data.len(),
            other => panic!("unexpected record {:?}", other),
        }
    }
    assert_eq!(sent, 6400);

    peer.send(Record::end_request(id, 0, ProtocolStatus::RequestComplete))
        .await
        .unwrap();
    assert_eq!(request.wait().await.unwrap().app_status, 0);
}

#[tokio::test]
async fn non_keep_alive_request_closes_the_connection() {
    let (mut peer, connection) = setup();

    let options = BeginRequestOptions {
        keep_alive: false,
        ..BeginRequestOptions::default()
    };
    let mut request = connection
        .begin_request(HashMap::new(), options)
        .await
        .unwrap();
    let id = request.request_id();

    let begin = next_record(&mut peer).await;
    match begin.body {
        RecordBody::BeginRequest(begin) => assert_eq!(begin.flags & KEEP_CONN, 0),
        other => panic!("expected BeginRequest, got {:?}", other),
    }
    read_params(&mut peer, id).await;

    peer.send(Record::stdout(id, Bytes::new())).await.unwrap();
    peer.send(Record::end_request(id, 0, ProtocolStatus::RequestComplete))
        .await
        .unwrap();

    assert_eq!(request.wait().await.unwrap().app_status, 0);
    assert!(peer.next().await.is_none(), "expected the connection to close");

    // Handles find out when they next talk to the connection.
    assert!(connection
        .begin_request(HashMap::new(), BeginRequestOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn close_aborts_open_requests() {
    let (mut peer, connection) = setup();

    let mut request = connection
        .begin_request(HashMap::new(), BeginRequestOptions::default())
        .await
        .unwrap();
    let id = request.request_id();
    next_record(&mut peer).await; // BeginRequest
    read_params(&mut peer, id).await;

    connection.close().await;

    // The peer hears about each abandoned request before the transport goes.
    assert_eq!(next_record(&mut peer).await, Record::abort_request(id));
    assert!(peer.next().await.is_none(), "expected the connection to close");
    assert_eq!(request.stdout().recv().await, None);
    assert!(request.wait().await.is_err());
    assert!(request.stdin().write(&b"late"[..]).await.is_err());
}
