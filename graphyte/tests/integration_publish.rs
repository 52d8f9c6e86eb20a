//! Integration tests for the export path.
//!
//! A loopback listener stands in for Carbon. Pickle frames are decoded with
//! a small stack-machine unpickler that understands the opcodes Carbon's
//! own loader sees from this crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use graphyte::client::TcpClient;
use graphyte::encode::Protocol;
use graphyte::error::{GraphyteError, PoolError};
use graphyte::event_loop::EventLoop;
use graphyte::pool::{ConnectionPool, PoolConfig};
use graphyte::{ClientConfig, GraphitePublisher, PublisherConfig, Record};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Test unpickler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Obj {
    Mark,
    Str(String),
    Long(i64),
    Tuple(Vec<Obj>),
    List(Vec<Obj>),
}

fn read_line<'a>(payload: &'a [u8], pos: &mut usize) -> &'a [u8] {
    let start = *pos;
    let end = start + payload[start..].iter().position(|&b| b == b'\n').unwrap();
    *pos = end + 1;
    &payload[start..end]
}

fn unescape(quoted: &[u8]) -> String {
    assert_eq!(quoted.first(), Some(&b'\''));
    assert_eq!(quoted.last(), Some(&b'\''));
    let inner = &quoted[1..quoted.len() - 1];

    let mut out = Vec::with_capacity(inner.len());
    let mut bytes = inner.iter();
    while let Some(&b) = bytes.next() {
        if b == b'\\' {
            match bytes.next() {
                Some(b'n') => out.push(b'\n'),
                Some(b'r') => out.push(b'\r'),
                Some(&other) => out.push(other),
                None => panic!("dangling escape"),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).unwrap()
}

fn pop_to_mark(stack: &mut Vec<Obj>) -> Vec<Obj> {
    let mark = stack.iter().rposition(|o| *o == Obj::Mark).unwrap();
    let items = stack.split_off(mark + 1);
    stack.pop();
    items
}

fn unpickle(payload: &[u8]) -> Obj {
    let mut stack = Vec::new();
    let mut pos = 0;

    loop {
        let op = payload[pos];
        pos += 1;
        match op {
            b'(' => stack.push(Obj::Mark),
            b'l' => {
                let items = pop_to_mark(&mut stack);
                stack.push(Obj::List(items));
            }
            b't' => {
                let items = pop_to_mark(&mut stack);
                stack.push(Obj::Tuple(items));
            }
            b'S' => stack.push(Obj::Str(unescape(read_line(payload, &mut pos)))),
            b'L' => {
                let line = std::str::from_utf8(read_line(payload, &mut pos)).unwrap();
                stack.push(Obj::Long(line.trim_end_matches('L').parse().unwrap()));
            }
            b'a' => {
                let item = stack.pop().unwrap();
                match stack.last_mut() {
                    Some(Obj::List(items)) => items.push(item),
                    other => panic!("append onto {other:?}"),
                }
            }
            b'.' => {
                assert_eq!(pos, payload.len(), "trailing bytes after STOP");
                return stack.pop().unwrap();
            }
            other => panic!("unsupported opcode {:?}", other as char),
        }
    }
}

/// Decodes a pickle payload into `(path, epoch_seconds, value)` triples.
fn metrics(payload: &[u8]) -> Vec<(String, i64, f64)> {
    let Obj::List(items) = unpickle(payload) else {
        panic!("top level is not a list");
    };
    items
        .into_iter()
        .map(|item| match item {
            Obj::Tuple(parts) => match parts.as_slice() {
                [Obj::Str(path), Obj::Tuple(point)] => match point.as_slice() {
                    [Obj::Long(ts), Obj::Str(value)] => (path.clone(), *ts, value.parse().unwrap()),
                    other => panic!("bad datapoint {other:?}"),
                },
                other => panic!("bad metric {other:?}"),
            },
            other => panic!("bad item {other:?}"),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Fake Carbon
// ---------------------------------------------------------------------------

/// Forwards every pickle frame received on any connection.
async fn pickle_listener() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; 4];
                    if socket.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
                    socket.read_exact(&mut payload).await.unwrap();
                    let _ = tx.send(payload);
                }
            });
        }
    });

    (port, rx)
}

/// Collects what each accepted connection writes into its own buffer.
async fn plaintext_listener() -> (u16, Arc<Mutex<Vec<Vec<u8>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let sink = Arc::clone(&sink);
            let slot = {
                let mut buffers = sink.lock().unwrap();
                buffers.push(Vec::new());
                buffers.len() - 1
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.lock().unwrap()[slot].extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    });

    (port, received)
}

/// Waits until `lines` lines arrived, then returns each connection's text.
async fn wait_for_lines(received: &Mutex<Vec<Vec<u8>>>, lines: usize) -> Vec<String> {
    let snapshot = || -> Vec<String> {
        received
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| String::from_utf8(bytes.clone()).unwrap())
            .collect()
    };
    for _ in 0..300 {
        let texts = snapshot();
        if texts.iter().map(|t| t.lines().count()).sum::<usize>() >= lines {
            return texts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    snapshot()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pickle_round_trip() {
    let (port, mut frames) = pickle_listener().await;
    let config = PublisherConfig::new(ClientConfig::new("127.0.0.1", Protocol::Pickle).with_port(port))
        .with_pool(PoolConfig::new(1));
    let mut publisher = GraphitePublisher::new(config);
    publisher.start().await.unwrap();

    let batch = [
        Record::at_epoch_seconds("Servers Web1.Load", 0.72, 1_700_000_000)
            .with_tag("DC", "US East")
            .with_tag("role", "web"),
        Record::at_epoch_seconds("boo", 543.0, 0),
        Record::at_epoch_seconds("neg", -1.25, -60),
    ];
    publisher.publish(&batch).await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        metrics(&payload),
        vec![
            ("servers-web1.load;dc=us-east;role=web".to_string(), 1_700_000_000, 0.72),
            ("boo".to_string(), 0, 543.0),
            ("neg".to_string(), -60, -1.25),
        ]
    );

    publisher.stop().await.unwrap();
}

#[test]
fn test_pickle_escapes_survive_unpickling() {
    let payload = graphyte::encode::pickle::encode_payload(&[Record::at_epoch_seconds(
        "it's\\odd",
        1.0,
        5,
    )]);
    assert_eq!(metrics(&payload), vec![("it's\\odd".to_string(), 5, 1.0)]);
}

#[tokio::test]
async fn test_plaintext_many_batches_over_pool() {
    let (port, received) = plaintext_listener().await;
    let config = PublisherConfig::new(ClientConfig::new("127.0.0.1", Protocol::Plaintext).with_port(port))
        .with_pool(PoolConfig::new(3));
    let mut publisher = GraphitePublisher::new(config);
    publisher.start().await.unwrap();

    let sends = (0..20i32).map(|i| {
        let publisher = &publisher;
        async move {
            let batch = [
                Record::at_epoch_seconds(format!("batch{i}.a"), f64::from(i), 100),
                Record::at_epoch_seconds(format!("batch{i}.b"), f64::from(i), 100),
            ];
            publisher.publish(&batch).await
        }
    });
    for result in futures::future::join_all(sends).await {
        result.unwrap();
    }

    let texts = wait_for_lines(&received, 40).await;
    assert_eq!(texts.iter().map(|t| t.lines().count()).sum::<usize>(), 40);
    // Each batch is written by one connection in one piece.
    for i in 0..20 {
        let pair = format!("batch{i}.a {i} 100\nbatch{i}.b {i} 100\n");
        assert!(
            texts.iter().any(|t| t.contains(&pair)),
            "batch {i} was split: {texts:?}"
        );
    }

    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_pool_rebuilds_connection_closed_by_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let event_loop = EventLoop::current().unwrap();
    let handle = event_loop.handle();
    let config = ClientConfig::new("127.0.0.1", Protocol::Plaintext).with_port(port);
    let pool = ConnectionPool::new(PoolConfig::new(1), move || {
        TcpClient::new(config.clone(), &handle)
    })
    .unwrap();

    let (ready, accepted) = tokio::join!(pool.await_readiness(), listener.accept());
    ready.unwrap();

    // Carbon hangs up on the first connection.
    let (first, _) = accepted.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let batch = [Record::at_epoch_seconds("after.rebuild", 1.0, 1)];
    let (sent, accepted) = tokio::join!(
        pool.with_pool_item(async |client: &mut TcpClient| client.send(&batch).await),
        listener.accept(),
    );
    sent.unwrap().unwrap();

    let (mut second, _): (TcpStream, _) = accepted.unwrap();
    let mut buf = vec![0u8; 18];
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, b"after.rebuild 1 1\n");

    pool.close().await.unwrap();
    event_loop.shutdown();
}

#[tokio::test]
async fn test_closed_pool_rejects_publish() {
    let (port, _received) = plaintext_listener().await;
    let event_loop = EventLoop::current().unwrap();
    let handle = event_loop.handle();
    let config = ClientConfig::new("127.0.0.1", Protocol::Plaintext).with_port(port);
    let pool = ConnectionPool::new(PoolConfig::new(2), move || {
        TcpClient::new(config.clone(), &handle)
    })
    .unwrap();
    pool.await_readiness().await.unwrap();
    pool.close().await.unwrap();

    let result = pool
        .with_pool_item(async |client: &mut TcpClient| client.is_open())
        .await;
    assert!(matches!(result, Err(PoolError::Closed)));

    let err: GraphyteError = result.unwrap_err().into();
    assert!(err.to_string().contains("closed"));
}
