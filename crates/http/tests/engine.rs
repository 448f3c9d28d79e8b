//! End-to-end engine tests against scripted servers on the loopback
//! interface.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use tether_http::connection::{HttpConnection, HttpOptions};
use tether_http::query::{QueryFlags, QueryStatus};
use tether_http::Response;
use tether_net::transport::Transport;

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Collects completion callbacks as (tag, status, body) triples.
#[derive(Default)]
struct Outcomes {
    completed: Mutex<Vec<(usize, QueryStatus, Vec<u8>)>>,
}

impl Outcomes {
    fn push(&self, tag: usize, status: QueryStatus, response: Option<Response>) {
        let body = response.map(|r| r.body().to_vec()).unwrap_or_default();
        self.completed.lock().expect("lock").push((tag, status, body));
    }

    fn len(&self) -> usize {
        self.completed.lock().expect("lock").len()
    }

    fn snapshot(&self) -> Vec<(usize, QueryStatus, Vec<u8>)> {
        self.completed.lock().expect("lock").clone()
    }
}

fn submit(connection: &HttpConnection, outcomes: &Arc<Outcomes>, tag: usize, flags: QueryFlags) {
    let outcomes = Arc::clone(outcomes);
    let request = format!("GET /{tag} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    connection.add_query(request.into_bytes(), flags, move |status, response| {
        outcomes.push(tag, status, response);
    });
}

/// Reads until one complete request (blank-line terminated) is buffered.
/// Returns the request bytes, or `None` on EOF.
async fn read_request(socket: &mut TcpStream, pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            let request: Vec<u8> = pending.drain(..end + 4).collect();
            return Some(request);
        }
        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

/// Drives the transport and engine until `pred` holds or the deadline
/// passes.
async fn drive_until(
    transport: &Transport,
    connection: &HttpConnection,
    millis: u64,
    pred: impl Fn() -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_millis(millis);
    loop {
        connection.process();
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return pred();
        }
        transport.wait(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn pipelined_callbacks_fire_in_submission_order() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();

        // answer the first request alone so keep-alive gets negotiated
        read_request(&mut socket, &mut pending).await.expect("first request");
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nKeep-Alive: max=99\r\nContent-Length: 1\r\n\r\nA",
            )
            .await
            .expect("write");

        // the rest arrive pipelined; answer them as one burst split at an
        // awkward boundary
        read_request(&mut socket, &mut pending).await.expect("second request");
        read_request(&mut socket, &mut pending).await.expect("third request");
        let burst = b"HTTP/1.1 200 OK\r\nKeep-Alive: max=98\r\nContent-Length: 1\r\n\r\nB\
                      HTTP/1.1 200 OK\r\nKeep-Alive: max=97\r\nContent-Length: 1\r\n\r\nC";
        socket.write_all(&burst[..30]).await.expect("write");
        socket.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(&burst[30..]).await.expect("write");
        // hold the socket open until the client is done
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    });

    let options = HttpOptions { pipeline: true, ..HttpOptions::default() };
    let connection = HttpConnection::open(&transport, "127.0.0.1", port, options);
    for tag in 0..3 {
        submit(&connection, &outcomes, tag, QueryFlags { retry: false, pipeline: true });
    }

    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 3).await);

    let completed = outcomes.snapshot();
    let tags: Vec<usize> = completed.iter().map(|(tag, _, _)| *tag).collect();
    assert_eq!(tags, vec![0, 1, 2], "callbacks must fire in submission order");
    let bodies: Vec<&[u8]> = completed.iter().map(|(_, _, body)| body.as_slice()).collect();
    assert_eq!(bodies, vec![b"A" as &[u8], b"B", b"C"]);
    for (_, status, _) in &completed {
        assert!(status.is_success());
    }

    connection.close();
    server.abort();
    transport.shutdown();
}

#[tokio::test]
async fn keep_alive_ceiling_is_never_exceeded() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());
    let max_outstanding = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let observed = Arc::clone(&max_outstanding);
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        let mut outstanding = 0usize;
        let mut answered = 0u32;

        while answered < 3 {
            if outstanding == 0 {
                if read_request(&mut socket, &mut pending).await.is_none() {
                    break;
                }
                outstanding += 1;
            }
            // opportunistically drain pipelined requests already buffered
            while pending.windows(4).any(|w| w == b"\r\n\r\n") {
                if read_request(&mut socket, &mut pending).await.is_none() {
                    break;
                }
                outstanding += 1;
            }
            observed.fetch_max(outstanding, Ordering::SeqCst);
            assert!(outstanding <= 2, "server-declared ceiling exceeded");

            let remaining = 2 - answered.min(2);
            let response = format!(
                "HTTP/1.1 200 OK\r\nKeep-Alive: max={remaining}\r\nContent-Length: 1\r\n\r\nX",
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            answered += 1;
            outstanding -= 1;
        }
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    });

    let options = HttpOptions { pipeline: true, ..HttpOptions::default() };
    let connection = HttpConnection::open(&transport, "127.0.0.1", port, options);
    for tag in 0..3 {
        submit(&connection, &outcomes, tag, QueryFlags { retry: false, pipeline: true });
    }

    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 3).await);
    for (_, status, _) in outcomes.snapshot() {
        assert!(status.is_success());
    }
    assert!(max_outstanding.load(Ordering::SeqCst) <= 2);

    connection.close();
    server.abort();
    transport.shutdown();
}

#[tokio::test]
async fn retry_reconnects_and_resends_identical_bytes() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        // first attempt: a partial header, then a hard close
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        let first = read_request(&mut socket, &mut pending).await.expect("request");
        socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Le").await.expect("write");
        socket.flush().await.expect("flush");
        drop(socket);

        // second attempt: the engine must resend the identical bytes
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        let second = read_request(&mut socket, &mut pending).await.expect("request");
        assert_eq!(first, second, "resent request must be byte-identical");
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .expect("write");
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    });

    let connection = HttpConnection::open(&transport, "127.0.0.1", port, HttpOptions::default());
    submit(&connection, &outcomes, 0, QueryFlags::retry());

    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 1).await);
    let completed = outcomes.snapshot();
    assert_eq!(completed[0].1, QueryStatus::Success);
    assert_eq!(completed[0].2, b"hello");

    server.await.expect("server assertions");
    connection.close();
    transport.shutdown();
}

#[tokio::test]
async fn retry_ceiling_fails_everything_and_resets() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());
    let accepted = Arc::new(AtomicU32::new(0));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let seen = Arc::clone(&accepted);
    let server = tokio::spawn(async move {
        // three sacrificial connections, dropped as soon as a request shows
        for _ in 0..3 {
            let (mut socket, _) = listener.accept().await.expect("accept");
            seen.fetch_add(1, Ordering::SeqCst);
            let mut pending = Vec::new();
            let _ = read_request(&mut socket, &mut pending).await;
        }
        // afterwards, behave: proves the failure counter was reset
        let (mut socket, _) = listener.accept().await.expect("accept");
        seen.fetch_add(1, Ordering::SeqCst);
        let mut pending = Vec::new();
        read_request(&mut socket, &mut pending).await.expect("request");
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .expect("write");
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    });

    let connection = HttpConnection::open(&transport, "127.0.0.1", port, HttpOptions::default());
    submit(&connection, &outcomes, 0, QueryFlags::retry());

    assert!(drive_until(&transport, &connection, 5_000, || outcomes.len() == 1).await);
    assert_eq!(outcomes.snapshot()[0].1, QueryStatus::ConnectError);
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert!(connection.take_error_count() >= 1);

    // the ceiling reset the counter, a fresh query succeeds
    submit(&connection, &outcomes, 1, QueryFlags::retry());
    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 2).await);
    assert_eq!(outcomes.snapshot()[1].1, QueryStatus::Success);

    connection.close();
    server.abort();
    transport.shutdown();
}

#[tokio::test]
async fn content_length_zero_completes_with_empty_body() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        read_request(&mut socket, &mut pending).await.expect("request");
        socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.expect("write");
        // keep the socket open: completion must not depend on a close
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    });

    let connection = HttpConnection::open(&transport, "127.0.0.1", port, HttpOptions::default());
    submit(&connection, &outcomes, 0, QueryFlags::default());

    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 1).await);
    let completed = outcomes.snapshot();
    assert_eq!(completed[0].1, QueryStatus::Success);
    assert!(completed[0].2.is_empty());

    connection.close();
    server.abort();
    transport.shutdown();
}

#[tokio::test]
async fn until_close_body_is_whatever_arrived() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        read_request(&mut socket, &mut pending).await.expect("request");
        socket.write_all(b"HTTP/1.0 200 OK\r\n\r\nfirst ").await.expect("write");
        socket.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(b"second").await.expect("write");
        // closing the socket is the end-of-body marker
    });

    let connection = HttpConnection::open(&transport, "127.0.0.1", port, HttpOptions::default());
    submit(&connection, &outcomes, 0, QueryFlags::default());

    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 1).await);
    let completed = outcomes.snapshot();
    assert_eq!(completed[0].1, QueryStatus::Success);
    assert_eq!(completed[0].2, b"first second");

    server.await.expect("server");
    connection.close();
    transport.shutdown();
}

#[tokio::test]
async fn chunked_response_reassembles_across_fragments() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        read_request(&mut socket, &mut pending).await.expect("request");

        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     7\r\nchunked\r\n9\r\n encoding\r\n0\r\nX-Trailer: yes\r\n\r\n";
        // trickle it out so every split point is exercised
        for byte in wire {
            socket.write_all(&[*byte]).await.expect("write");
            socket.flush().await.expect("flush");
        }
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    });

    let connection = HttpConnection::open(&transport, "127.0.0.1", port, HttpOptions::default());
    submit(&connection, &outcomes, 0, QueryFlags::default());

    assert!(drive_until(&transport, &connection, 5_000, || outcomes.len() == 1).await);
    let completed = outcomes.snapshot();
    assert_eq!(completed[0].1, QueryStatus::Success);
    assert_eq!(completed[0].2, b"chunked encoding");

    connection.close();
    server.abort();
    transport.shutdown();
}

#[tokio::test]
async fn malformed_response_fails_every_outstanding_query() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        read_request(&mut socket, &mut pending).await.expect("request");
        socket.write_all(b"NOT HTTP AT ALL\r\n\r\n").await.expect("write");
        let mut sink = [0u8; 64];
        let _ = socket.read(&mut sink).await;
    });

    let connection = HttpConnection::open(&transport, "127.0.0.1", port, HttpOptions::default());
    submit(&connection, &outcomes, 0, QueryFlags::default());
    submit(&connection, &outcomes, 1, QueryFlags::default());

    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 2).await);
    for (_, status, _) in outcomes.snapshot() {
        assert_eq!(status, QueryStatus::BadFormat);
    }
    assert_eq!(connection.take_error_count(), 2);

    connection.close();
    server.abort();
    transport.shutdown();
}

#[tokio::test]
async fn aborted_queries_fail_fast_as_no_reply() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let (aborted_tx, aborted_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut pending = Vec::new();
        let _ = read_request(&mut socket, &mut pending).await;
        // close without answering, but only once the queue is aborted
        let _ = aborted_rx.await;
    });

    let connection = HttpConnection::open(&transport, "127.0.0.1", port, HttpOptions::default());
    submit(&connection, &outcomes, 0, QueryFlags::retry());

    // let the query reach the wire, then mark the queue aborted
    assert!(drive_until(&transport, &connection, 2_000, || {
        connection.status() == tether_http::HttpStatus::Waiting
    })
    .await);
    connection.abort_queue();
    aborted_tx.send(()).expect("server alive");

    assert!(drive_until(&transport, &connection, 3_000, || outcomes.len() == 1).await);
    assert_eq!(outcomes.snapshot()[0].1, QueryStatus::NoReply);

    server.await.expect("server");
    connection.close();
    transport.shutdown();
}

#[tokio::test]
async fn close_fails_pending_queries_with_connect_error() {
    init_logs();
    let transport = Transport::builder().build();
    let outcomes = Arc::new(Outcomes::default());

    // no server at all: the queries never leave the wait queue
    let connection = HttpConnection::open(&transport, "127.0.0.1", 1, HttpOptions::default());
    let before = connection.status();
    assert_eq!(before, tether_http::HttpStatus::Idle);

    submit(&connection, &outcomes, 0, QueryFlags::default());
    submit(&connection, &outcomes, 1, QueryFlags::default());
    connection.close();

    assert_eq!(outcomes.len(), 2);
    for (_, status, _) in outcomes.snapshot() {
        assert_eq!(status, QueryStatus::ConnectError);
    }
    assert_eq!(connection.status(), tether_http::HttpStatus::Closed);
    assert_eq!(connection.query_count(), 0);
    transport.shutdown();
}
