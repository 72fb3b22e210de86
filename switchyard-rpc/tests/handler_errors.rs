use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_rpc::{
    type_tag,
    ClientConnection,
    ErrorCode,
    HandlerRegistry,
    InFlightRequests,
    ResponseHandle,
    RkyvSerializer,
    Serializer,
    Server,
    Status,
    WorkerPoolConfig,
    MAX_FRAME_SIZE,
};
use tokio::time::Instant;

async fn send<Req, Resp, S>(
    connection: &ClientConnection,
    serializer: S,
    msg: &Req,
) -> ResponseHandle<Resp>
where
    Resp: Send + 'static,
    S: Serializer<Req, Resp> + Copy,
{
    connection
        .send_request(
            type_tag(serializer.request_name()),
            serializer.request_to_bytes(msg).unwrap(),
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(1),
            move |bytes| serializer.response_from_bytes(bytes),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_handler_error() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = test_helper::get_unused_addr();

    let mut registry = HandlerRegistry::default();
    registry.register(
        |_: String| -> Result<String, Status> { Err(Status::handler("Oops! Something went wrong!")) },
        RkyvSerializer::<String, String>::with_name("always-fails"),
    );
    registry.register(
        |_: String| -> Result<String, Status> { panic!("Handler blew up") },
        RkyvSerializer::<String, String>::with_name("panics"),
    );

    let server = Server::listen(addr, registry, WorkerPoolConfig::default())
        .await
        .unwrap();

    let connection =
        ClientConnection::connect(addr, Duration::from_secs(1), InFlightRequests::default())
            .await
            .unwrap();

    let msg = "Hello".to_string();
    let status = send(
        &connection,
        RkyvSerializer::<String, String>::with_name("always-fails"),
        &msg,
    )
    .await
    .await
    .expect_err("Handler should return an error");
    assert_eq!(status, Status::handler("Oops! Something went wrong!"));
    assert!(!status.is_transport_error());

    let status = send(
        &connection,
        RkyvSerializer::<String, String>::with_name("panics"),
        &msg,
    )
    .await
    .await
    .expect_err("Handler should panic");
    assert_eq!(status.code, ErrorCode::HandlerError);
    assert!(status.message.contains("Handler blew up"));

    assert!(!connection.is_closed(), "Handler errors must not close the connection.");

    server.shutdown();
}

#[tokio::test]
async fn test_handler_transport_statuses_are_handler_errors() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = test_helper::get_unused_addr();

    let mut registry = HandlerRegistry::default();
    registry.register(
        |_: String| -> Result<String, Status> { Err(Status::connection("Database is down")) },
        RkyvSerializer::<String, String>::with_name("downstream"),
    );
    registry.register(
        |_: String| -> Result<String, Status> { Err(Status::timeout()) },
        RkyvSerializer::<String, String>::with_name("slow-downstream"),
    );

    let server = Server::listen(addr, registry, WorkerPoolConfig::default())
        .await
        .unwrap();

    let connection =
        ClientConnection::connect(addr, Duration::from_secs(1), InFlightRequests::default())
            .await
            .unwrap();

    let msg = "Hello".to_string();
    let status = send(
        &connection,
        RkyvSerializer::<String, String>::with_name("downstream"),
        &msg,
    )
    .await
    .await
    .expect_err("Handler should return an error");
    assert_eq!(status, Status::handler("Database is down"));
    assert!(!status.is_transport_error());

    let status = send(
        &connection,
        RkyvSerializer::<String, String>::with_name("slow-downstream"),
        &msg,
    )
    .await
    .await
    .expect_err("Handler should return an error");
    assert_eq!(status.code, ErrorCode::HandlerError);
    assert!(!status.is_transport_error());

    assert!(!connection.is_closed());

    server.shutdown();
}

#[tokio::test]
async fn test_oversized_messages() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = test_helper::get_unused_addr();

    let mut registry = HandlerRegistry::default();
    registry.register(
        |len: u64| -> Result<Vec<u8>, Status> { Ok(vec![1; len as usize]) },
        RkyvSerializer::<u64, Vec<u8>>::with_name("blob"),
    );

    let server = Server::listen(addr, registry, WorkerPoolConfig::default())
        .await
        .unwrap();

    let in_flight = InFlightRequests::default();
    let connection = ClientConnection::connect(addr, Duration::from_secs(1), in_flight.clone())
        .await
        .unwrap();
    let serializer = RkyvSerializer::<u64, Vec<u8>>::with_name("blob");

    let status = connection
        .send_request(
            type_tag(serializer.request_name()),
            vec![0; MAX_FRAME_SIZE + 1],
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(1),
            move |bytes| serializer.response_from_bytes(bytes),
        )
        .await
        .expect_err("Request should be refused before it is written");
    assert_eq!(status, Status::invalid());
    assert!(in_flight.is_empty(), "Refused requests must not be registered.");
    assert!(!connection.is_closed());

    let status = send(&connection, serializer, &(MAX_FRAME_SIZE as u64 + 1))
        .await
        .await
        .expect_err("Reply should be too large to send");
    assert_eq!(status.code, ErrorCode::HandlerError);

    let resp = send(&connection, serializer, &8)
        .await
        .await
        .expect("Connection should still serve requests");
    assert_eq!(resp, vec![1; 8]);

    server.shutdown();
}

#[tokio::test]
async fn test_unknown_handler() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = test_helper::get_unused_addr();

    let mut registry = HandlerRegistry::default();
    registry.register(
        |value: u64| -> Result<u64, Status> { Ok(value * 2) },
        RkyvSerializer::<u64, u64>::with_name("double"),
    );

    let server = Server::listen(addr, registry, WorkerPoolConfig::default())
        .await
        .unwrap();

    let connection =
        ClientConnection::connect(addr, Duration::from_secs(1), InFlightRequests::default())
            .await
            .unwrap();

    let status = send(&connection, RkyvSerializer::<u64, u64>::with_name("triple"), &4)
        .await
        .await
        .expect_err("No handler is registered for the request");
    assert_eq!(status.code, ErrorCode::UnknownHandler);

    let resp = send(&connection, RkyvSerializer::<u64, u64>::with_name("double"), &4)
        .await
        .await
        .expect("Connection should still serve known requests");
    assert_eq!(resp, 8);

    server.shutdown();
}

#[tokio::test]
async fn test_invalid_payload() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = test_helper::get_unused_addr();

    let mut registry = HandlerRegistry::default();
    registry.register(
        |value: String| -> Result<String, Status> { Ok(value) },
        RkyvSerializer::<String, String>::with_name("echo"),
    );

    let server = Server::listen(addr, registry, WorkerPoolConfig::default())
        .await
        .unwrap();

    let connection =
        ClientConnection::connect(addr, Duration::from_secs(1), InFlightRequests::default())
            .await
            .unwrap();

    let handle = connection
        .send_request(
            type_tag("echo"),
            vec![0xFF, 0x01],
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(1),
            |bytes| RkyvSerializer::<String, String>::new().response_from_bytes(bytes),
        )
        .await
        .unwrap();

    let status = handle.await.expect_err("Garbage payload should be rejected");
    assert_eq!(status.code, ErrorCode::InvalidPayload);

    server.shutdown();
}

#[tokio::test]
async fn test_overloaded_server() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = test_helper::get_unused_addr();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let release_rx = Mutex::new(release_rx);

    let mut registry = HandlerRegistry::default();
    registry.register(
        move |value: u64| -> Result<u64, Status> {
            let _ = started_tx.lock().send(());
            let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
            Ok(value)
        },
        RkyvSerializer::<u64, u64>::with_name("blocking"),
    );

    let pool_config = WorkerPoolConfig::new(1, 1, Duration::from_secs(1)).with_queue_size(1);
    let server = Server::listen(addr, registry, pool_config).await.unwrap();

    let connection =
        ClientConnection::connect(addr, Duration::from_secs(1), InFlightRequests::default())
            .await
            .unwrap();

    let serializer = RkyvSerializer::<u64, u64>::with_name("blocking");

    // Occupy the only worker.
    let running = send(&connection, serializer, &1).await;
    tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("First request should start");

    // Fill the queue.
    let queued = send(&connection, serializer, &2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = send(&connection, serializer, &3)
        .await
        .await
        .expect_err("Server should refuse more work");
    assert_eq!(status.code, ErrorCode::Overloaded);

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();

    assert_eq!(running.await, Ok(1));
    assert_eq!(queued.await, Ok(2));

    server.shutdown();
}
