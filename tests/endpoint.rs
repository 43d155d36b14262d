use futures::{SinkExt, StreamExt};
use mprpc::{
    codec::MsgpackCodec, Client, EndpointConfig, Error, Message, MethodKind, Methods,
    RegisterError, ServerConn, Service, Value,
};
use rand::seq::SliceRandom;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{duplex, DuplexStream, ReadHalf, WriteHalf},
    task,
};
use tokio_util::codec::{FramedRead, FramedWrite};

#[derive(Default)]
struct Arith {
    logged: Arc<AtomicUsize>,
}

impl Arith {
    fn add(&self, (a, b): (i64, i64), reply: &mut i64) -> Result<(), String> {
        *reply = a + b;
        Ok(())
    }

    fn div(&self, (a, b): (i64, i64), reply: &mut i64) -> Result<(), String> {
        if b == 0 {
            return Err("divide by zero".into());
        }
        *reply = a / b;
        Ok(())
    }

    fn log(&self, line: String) -> Result<(), String> {
        if line.is_empty() {
            return Err("empty line".into());
        }
        self.logged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn logged(&self, _: (), reply: &mut usize) -> Result<(), String> {
        *reply = self.logged.load(Ordering::SeqCst);
        Ok(())
    }
}

impl Service for Arith {
    fn methods(methods: &mut Methods<Self>) {
        methods
            .call("Add", Arith::add)
            .call("Div", Arith::div)
            .call("Logged", Arith::logged)
            .notify("Log", Arith::log);
    }
}

struct NoMethods;

impl Service for NoMethods {
    fn methods(_: &mut Methods<Self>) {}
}

/// Speaks the wire protocol directly, for checking exactly what is written.
struct RawPeer {
    reader: FramedRead<ReadHalf<DuplexStream>, MsgpackCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, MsgpackCodec>,
}

impl RawPeer {
    fn new(io: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: FramedRead::new(read, MsgpackCodec::default()),
            writer: FramedWrite::new(write, MsgpackCodec::default()),
        }
    }

    async fn recv_value(&mut self) -> Option<Value> {
        self.reader.next().await.map(|value| value.unwrap())
    }

    async fn recv(&mut self) -> Option<Message> {
        let value = self.recv_value().await?;
        Some(Message::from_value(value).unwrap())
    }

    async fn recv_request(&mut self) -> (u32, String, Vec<Value>) {
        match self.recv().await {
            Some(Message::Request {
                msgid,
                method,
                params,
            }) => (msgid, method, params),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    async fn send(&mut self, message: Message) {
        self.writer.send(message.into_value()).await.unwrap();
    }

    async fn respond(&mut self, msgid: u32, result: Value) {
        self.send(Message::Response {
            msgid,
            error: Value::Nil,
            result,
        })
        .await;
    }
}

fn config(name: &str) -> EndpointConfig {
    EndpointConfig::builder().name(name.to_string()).build()
}

/// A client wired to a raw peer playing the server.
fn client_with_raw_server() -> (Client, RawPeer) {
    let (local, remote) = duplex(64 * 1024);
    (Client::new(local, config("client")), RawPeer::new(remote))
}

/// A served `ServerConn` with `Arith` registered, wired to a raw peer.
fn served_arith_with_raw_client() -> (ServerConn, RawPeer) {
    let (local, remote) = duplex(64 * 1024);
    let server = ServerConn::new(local, config("server"));
    server.register(Arith::default()).unwrap();
    task::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });
    (server, RawPeer::new(remote))
}

/// A client and a served `ServerConn` with `Arith` registered.
fn connected() -> (Client, ServerConn, task::JoinHandle<Result<(), Error>>) {
    let (a, b) = duplex(64 * 1024);
    let server = ServerConn::new(b, config("server"));
    server.register(Arith::default()).unwrap();
    let serving = task::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });
    (Client::new(a, config("client")), server, serving)
}

#[tokio::test]
async fn add_answers_with_exact_envelope() {
    let (_server, mut peer) = served_arith_with_raw_client();
    peer.send(Message::Request {
        msgid: 7,
        method: "Add".into(),
        params: vec![Value::from(2), Value::from(3)],
    })
    .await;

    let expected = Value::Array(vec![Value::from(1), Value::from(7), Value::Nil, Value::from(5)]);
    assert_eq!(peer.recv_value().await, Some(expected));
}

#[tokio::test]
async fn client_calls_server() {
    let (client, _server, _serving) = connected();

    let sum: i64 = client.call("Add", (2, 3)).await.unwrap();
    assert_eq!(sum, 5);

    let err = client.call::<_, i64>("Div", (1, 0)).await.unwrap_err();
    match err {
        Error::Remote(reason) => assert_eq!(reason.as_str(), Some("divide by zero")),
        other => panic!("unexpected {other:?}"),
    }

    let err = client.call::<_, i64>("Add", ("two", "three")).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)), "{err}");
}

#[tokio::test]
async fn unknown_method_gets_an_error_response() {
    let (client, _server, _serving) = connected();

    let err = client.call::<_, Value>("Nope", ()).await.unwrap_err();
    match err {
        Error::Remote(reason) => {
            let reason = reason.as_str().unwrap_or_default().to_owned();
            assert!(reason.contains("can't find method Nope"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }

    // The loop survived the miss.
    let sum: i64 = client.call("Add", (20, 22)).await.unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn notifications_are_never_answered() {
    let (_server, mut peer) = served_arith_with_raw_client();

    peer.send(Message::Notification {
        method: "Missing".into(),
        params: vec![],
    })
    .await;
    // Registered, but fails: still no reply.
    peer.send(Message::Notification {
        method: "Log".into(),
        params: vec![Value::from("")],
    })
    .await;
    peer.send(Message::Request {
        msgid: 1,
        method: "Logged".into(),
        params: vec![],
    })
    .await;

    // The first thing written back is the answer to the request.
    assert_eq!(
        peer.recv().await,
        Some(Message::Response {
            msgid: 1,
            error: Value::Nil,
            result: Value::from(0),
        })
    );
}

#[tokio::test]
async fn notifications_reach_notify_methods() {
    let (client, server, _serving) = connected();

    client.notify("Log", ("first",)).await.unwrap();
    client.notify("Log", ("second",)).await.unwrap();
    // Inbound messages are handled in order, so this call observes both.
    let logged: usize = client.call("Logged", ()).await.unwrap();
    assert_eq!(logged, 2);

    let info = server.methods();
    let log = info.iter().find(|m| m.name == "Log").unwrap();
    assert_eq!(log.kind, MethodKind::Notify);
    assert_eq!(log.calls, 2);
}

#[tokio::test]
async fn notify_does_not_wait_for_the_peer() {
    let (client, mut peer) = client_with_raw_server();

    // The raw peer never answers anything.
    tokio::time::timeout(Duration::from_secs(1), client.notify("Log", ("hi",)))
        .await
        .expect("notify blocked")
        .unwrap();
    assert_eq!(
        peer.recv().await,
        Some(Message::Notification {
            method: "Log".into(),
            params: vec![Value::from("hi")],
        })
    );
}

#[tokio::test]
async fn late_response_for_earlier_call_is_routed_correctly() {
    let (client, mut peer) = client_with_raw_server();
    let client = Arc::new(client);

    let slow = task::spawn({
        let client = Arc::clone(&client);
        async move { client.call::<_, String>("Slow", ()).await }
    });
    let (slow_id, method, _) = peer.recv_request().await;
    assert_eq!(method, "Slow");

    let echo = task::spawn({
        let client = Arc::clone(&client);
        async move { client.call::<_, String>("Echo", ("hi",)).await }
    });
    let (echo_id, method, params) = peer.recv_request().await;
    assert_eq!(method, "Echo");
    assert_ne!(slow_id, echo_id);

    peer.respond(echo_id, params[0].clone()).await;
    assert_eq!(echo.await.unwrap().unwrap(), "hi");
    assert!(!slow.is_finished());

    peer.respond(slow_id, Value::from("done")).await;
    assert_eq!(slow.await.unwrap().unwrap(), "done");
}

#[tokio::test]
async fn concurrent_calls_get_their_own_results() {
    const CALLS: u64 = 32;
    let (client, mut peer) = client_with_raw_server();
    let client = Arc::new(client);

    let calls: Vec<_> = (0..CALLS)
        .map(|n| {
            let client = Arc::clone(&client);
            task::spawn(async move {
                let got: u64 = client.call("Id", (n,)).await.unwrap();
                assert_eq!(got, n);
            })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..CALLS {
        let (msgid, _, params) = peer.recv_request().await;
        requests.push((msgid, params[0].clone()));
    }
    requests.shuffle(&mut rand::thread_rng());
    for (msgid, param) in requests {
        peer.respond(msgid, param).await;
    }

    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(client.endpoint().pending_calls(), 0);
}

#[tokio::test]
async fn close_unblocks_waiting_calls_and_stops_writes() {
    let (client, mut peer) = client_with_raw_server();
    let client = Arc::new(client);

    let waiting: Vec<_> = (0..3)
        .map(|_| {
            let client = Arc::clone(&client);
            task::spawn(async move { client.call::<_, Value>("Never", ()).await })
        })
        .collect();
    for _ in 0..3 {
        peer.recv_request().await;
    }

    client.close().await;
    client.close().await;

    for call in waiting {
        let outcome = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call still blocked after close")
            .unwrap();
        assert!(matches!(outcome, Err(Error::Closed)));
    }
    assert!(matches!(client.call::<_, Value>("After", ()).await, Err(Error::Closed)));
    assert!(matches!(client.notify("After", ()).await, Err(Error::Closed)));

    // The write half was shut down with nothing further written.
    assert_eq!(peer.recv_value().await, None);
}

#[tokio::test]
async fn peer_hangup_fails_waiting_calls() {
    let (client, mut peer) = client_with_raw_server();
    let client = Arc::new(client);

    let waiting = task::spawn({
        let client = Arc::clone(&client);
        async move { client.call::<_, Value>("Never", ()).await }
    });
    peer.recv_request().await;
    drop(peer);

    assert!(matches!(waiting.await.unwrap(), Err(Error::ConnectionClosed)));
    assert!(matches!(
        client.call::<_, Value>("After", ()).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(client.endpoint().is_closed());
}

#[tokio::test]
async fn timed_out_call_ignores_its_late_response() {
    let (client, mut peer) = client_with_raw_server();

    let err = client
        .call_timeout::<_, Value>("Slow", (), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(client.endpoint().pending_calls(), 0);
    let (late_id, _, _) = peer.recv_request().await;
    peer.respond(late_id, Value::from("too late")).await;

    let client = Arc::new(client);
    let next = task::spawn({
        let client = Arc::clone(&client);
        async move { client.call::<_, String>("Next", ()).await }
    });
    let (next_id, _, _) = peer.recv_request().await;
    peer.respond(next_id, Value::from("on time")).await;
    assert_eq!(next.await.unwrap().unwrap(), "on time");
}

#[tokio::test]
async fn unknown_response_ids_are_ignored() {
    let (client, mut peer) = client_with_raw_server();
    let client = Arc::new(client);

    peer.respond(12345, Value::from("nobody asked")).await;
    let call = task::spawn({
        let client = Arc::clone(&client);
        async move { client.call::<_, i64>("Answer", ()).await }
    });
    let (msgid, _, _) = peer.recv_request().await;
    peer.respond(msgid, Value::from(42)).await;
    assert_eq!(call.await.unwrap().unwrap(), 42);
}

#[tokio::test]
async fn both_sides_call_each_other() {
    let (client, server, _serving) = connected();
    client
        .register_method("Whoami", |_: (), reply: &mut String| {
            *reply = "client".to_string();
            Ok::<_, String>(())
        })
        .unwrap();

    let (from_server, from_client) = tokio::join!(
        server.call::<_, String>("Whoami", ()),
        client.call::<_, i64>("Add", (1, 1)),
    );
    assert_eq!(from_server.unwrap(), "client");
    assert_eq!(from_client.unwrap(), 2);
}

#[tokio::test]
async fn registration_errors() {
    let (client, server, _serving) = connected();

    let err = server.register(Arith::default()).unwrap_err();
    assert!(matches!(err, RegisterError::DuplicateService(ref name) if name == "Arith"));

    let err = client.register(NoMethods).unwrap_err();
    assert!(matches!(err, RegisterError::NoSuitableMethods { .. }));

    // Registration failures leave the connection usable.
    let sum: i64 = client.call("Add", (1, 2)).await.unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn serve_ends_cleanly_when_client_shuts_down() {
    let (client, _server, serving) = connected();
    let sum: i64 = client.call("Add", (3, 4)).await.unwrap();
    assert_eq!(sum, 7);

    client.shutdown().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn tcp_round_trip() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    task::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let conn = ServerConn::new(sock, config("server"));
        conn.register(Arith::default()).unwrap();
        conn.serve().await
    });

    let client = Client::connect(addr).await.unwrap();
    let quotient: i64 = client.call("Div", (84, 2)).await.unwrap();
    assert_eq!(quotient, 42);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn close_aborts_a_request_the_peer_never_reads() {
    let (local, remote) = duplex(64);
    let client = Arc::new(Client::new(local, config("client")));
    let _peer = RawPeer::new(remote);

    let big = task::spawn({
        let client = Arc::clone(&client);
        async move { client.call::<_, Value>("Big", ("x".repeat(4096),)).await }
    });
    // Give the write time to fill the pipe and stall.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!big.is_finished());

    tokio::time::timeout(Duration::from_secs(1), client.close())
        .await
        .expect("close blocked behind a stalled write");
    let outcome = tokio::time::timeout(Duration::from_secs(1), big)
        .await
        .expect("call still blocked after close")
        .unwrap();
    assert!(matches!(outcome, Err(Error::Closed)));
    assert_eq!(client.endpoint().pending_calls(), 0);
}

#[tokio::test]
async fn close_aborts_a_response_the_peer_never_reads() {
    let (local, remote) = duplex(64);
    let server = ServerConn::new(local, config("server"));
    server
        .register_method("Echo", |line: String, reply: &mut String| {
            *reply = line;
            Ok::<_, String>(())
        })
        .unwrap();
    let serving = task::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    let mut peer = RawPeer::new(remote);
    peer.send(Message::Request {
        msgid: 1,
        method: "Echo".into(),
        params: vec![Value::from("x".repeat(4096))],
    })
    .await;
    // The loop is now stuck writing the echo back.
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(1), server.close())
        .await
        .expect("close blocked behind a stalled response");
    tokio::time::timeout(Duration::from_secs(1), serving)
        .await
        .expect("dispatch loop did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn panicking_method_answers_with_an_error() {
    let (client, server, _serving) = connected();
    client
        .register_method("Boom", |_: (), _: &mut i64| -> Result<(), String> {
            panic!("boom")
        })
        .unwrap();

    let err = server.call::<_, i64>("Boom", ()).await.unwrap_err();
    match err {
        Error::Remote(reason) => {
            let reason = reason.as_str().unwrap_or_default().to_owned();
            assert!(reason.contains("Boom panicked"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }

    // The client's dispatch loop survived the panic.
    let sum = tokio::time::timeout(Duration::from_secs(1), client.call::<_, i64>("Add", (1, 2)))
        .await
        .expect("client stopped dispatching")
        .unwrap();
    assert_eq!(sum, 3);
    assert!(!client.endpoint().is_closed());
}

#[tokio::test]
async fn failed_send_returns_at_once_and_leaves_nothing_pending() {
    let (local, remote) = duplex(64);
    drop(remote);
    let conn = ServerConn::new(local, config("server"));

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        conn.call::<_, Value>("Anything", ()),
    )
    .await
    .expect("call blocked after a failed send");
    assert!(matches!(outcome, Err(Error::Io(_))), "{outcome:?}");
    assert_eq!(conn.endpoint().pending_calls(), 0);
}

#[tokio::test]
async fn peer_eof_shuts_down_our_write_half() {
    let (client, peer) = client_with_raw_server();
    let RawPeer {
        mut reader,
        mut writer,
    } = peer;

    // Half-close: the client sees EOF but could still write to us.
    writer.close().await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(1), reader.next())
        .await
        .expect("write half left open after peer EOF");
    assert!(next.is_none());
    assert!(matches!(
        client.endpoint().terminal_error(),
        Some(Error::ConnectionClosed)
    ));
}
