use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gamenet::network::Transport;
use gamenet::service::ServerConfig;
use gamenet::{
    setup_local_tracing, AppError, AppResult, BackendKind, Connection, ConnectionFactory,
    ConnectionId, Frame, HandlerFactory, Multiplexer, PacketHandler, Server, WorkerPool,
};
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[fixture]
#[once]
fn log_setup() {
    let _ = setup_local_tracing("debug");
}

#[derive(Default)]
struct EchoRecorder {
    frames: Mutex<Vec<Frame>>,
}

impl PacketHandler for EchoRecorder {
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        self.frames.lock().push(frame.clone());
        connection.send_frame(frame.opcode(), frame.payload());
    }
}

/// Client side: keeps what the server sends back.
#[derive(Default)]
struct Collector {
    frames: Mutex<Vec<Frame>>,
}

impl PacketHandler for Collector {
    fn on_frame(&self, _connection: &Arc<Connection>, frame: Frame) {
        self.frames.lock().push(frame);
    }
}

/// Refuses the first `refusals` peers, then builds echo connections.
struct RefusingFactory {
    refusals: AtomicUsize,
    inner: HandlerFactory<EchoRecorder>,
}

impl ConnectionFactory for RefusingFactory {
    fn create(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        remote: SocketAddr,
    ) -> AppResult<Connection> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AppError::InvalidValue(format!(
                "no seat for player {}",
                remote
            )));
        }
        self.inner.create(id, transport, remote)
    }
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn test_config(backend: BackendKind) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.network.ip = "127.0.0.1".to_string();
    config.network.port = 0;
    config.network.max_connection = 8;
    config.multiplexer.backend = backend;
    config.multiplexer.workers = 2;
    config.multiplexer.poll_timeout_ms = 20;
    config.multiplexer.shutdown_timeout_ms = 2000;
    config
}

fn server(backend: BackendKind, handler: Arc<EchoRecorder>) -> Server {
    let config = test_config(backend);
    let factory = HandlerFactory::new(
        handler,
        config.buffers.read_buffer_size,
        config.buffers.write_buffer_size,
    );
    Server::new(config, Arc::new(factory)).unwrap()
}

#[rstest]
#[case::poll(BackendKind::Poll)]
#[case::completion(BackendKind::Completion)]
#[case::platform(BackendKind::Auto)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_in_one_write_are_decoded_and_echoed(
    #[from(log_setup)] _log_setup: (),
    #[case] backend: BackendKind,
) {
    let handler = Arc::new(EchoRecorder::default());
    let handle = server(backend, handler.clone()).start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut request = Frame::encode_parts(1, b"A").unwrap().to_vec();
    request.extend_from_slice(&Frame::encode_parts(2, b"BB").unwrap());
    client.write_all(&request).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, request);
    assert_eq!(
        *handler.frames.lock(),
        vec![Frame::new(1, &b"A"[..]), Frame::new(2, &b"BB"[..])]
    );

    let multiplexer = handle.multiplexer().clone();
    assert_eq!(multiplexer.connection_count(), 1);
    assert!(handle.shutdown().await);
    assert_eq!(multiplexer.connection_count(), 0);

    // the server side is gone
    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("close timed out");
    assert!(read.map(|n| n == 0).unwrap_or(true));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_closes_client(#[from(log_setup)] _log_setup: ()) {
    let handler = Arc::new(EchoRecorder::default());
    let handle = server(BackendKind::Auto, handler.clone()).start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut header = vec![3, 0];
    header.extend(70000u32.to_le_bytes());
    client.write_all(&header).await.unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("server kept the connection");
    assert!(read.map(|n| n == 0).unwrap_or(true));
    assert!(handler.frames.lock().is_empty());

    let multiplexer = handle.multiplexer().clone();
    for _ in 0..200 {
        if multiplexer.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(multiplexer.connection_count(), 0);
    assert!(handle.shutdown().await);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_drains_every_connection(#[from(log_setup)] _log_setup: ()) {
    let handler = Arc::new(EchoRecorder::default());
    let handle = server(BackendKind::Auto, handler).start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(handle.local_addr()).await.unwrap());
    }
    let multiplexer = handle.multiplexer().clone();
    for _ in 0..200 {
        if multiplexer.connection_count() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(multiplexer.connection_count(), 5);

    assert!(handle.shutdown().await);
    assert_eq!(multiplexer.connection_count(), 0);
    for mut client in clients {
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("client not closed");
        assert!(read.map(|n| n == 0).unwrap_or(true));
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bind_failure_is_fatal(#[from(log_setup)] _log_setup: ()) {
    let first = server(BackendKind::Poll, Arc::new(EchoRecorder::default()))
        .start()
        .await
        .unwrap();

    let mut config = test_config(BackendKind::Poll);
    config.network.port = first.local_addr().port();
    let factory = HandlerFactory::new(Arc::new(EchoRecorder::default()), 70000, 70000);
    let result = Server::new(config, Arc::new(factory)).unwrap().start().await;
    assert!(matches!(result, Err(AppError::Bind { .. })));

    assert!(first.shutdown().await);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outbound_connection_round_trip(#[from(log_setup)] _log_setup: ()) {
    let handle = server(BackendKind::Poll, Arc::new(EchoRecorder::default()))
        .start()
        .await
        .unwrap();

    let client = Arc::new(Multiplexer::new(BackendKind::Poll, 4).unwrap());
    let workers = WorkerPool::start(client.clone(), 1, Duration::from_millis(20)).unwrap();
    let collector = Arc::new(Collector::default());
    let factory = HandlerFactory::new(collector.clone(), 70000, 70000);

    let connection = client.connect(handle.local_addr(), &factory).unwrap();
    assert!(connection.is_connected());
    assert_eq!(connection.remote_address(), handle.local_addr());
    assert_eq!(client.connection_count(), 1);

    assert!(connection.send_frame(9, b"hi"));
    assert!(eventually(|| !collector.frames.lock().is_empty()).await);
    assert_eq!(*collector.frames.lock(), vec![Frame::new(9, &b"hi"[..])]);

    connection.disconnect();
    assert!(eventually(|| client.connection_count() == 0).await);
    tokio::task::spawn_blocking(move || workers.shutdown())
        .await
        .unwrap();
    assert!(handle.shutdown().await);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refused_peers_do_not_stop_the_listener(#[from(log_setup)] _log_setup: ()) {
    let config = test_config(BackendKind::Poll);
    let factory = RefusingFactory {
        refusals: AtomicUsize::new(3),
        inner: HandlerFactory::new(
            Arc::new(EchoRecorder::default()),
            config.buffers.read_buffer_size,
            config.buffers.write_buffer_size,
        ),
    };
    let handle = Server::new(config, Arc::new(factory))
        .unwrap()
        .start()
        .await
        .unwrap();

    for _ in 0..3 {
        let mut refused = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), refused.read(&mut buf))
            .await
            .expect("refused peer kept open");
        assert!(read.map(|n| n == 0).unwrap_or(true));
    }
    assert_eq!(handle.multiplexer().connection_count(), 0);

    // the accept loop is still running
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    let request = Frame::encode_parts(5, b"still here").unwrap().to_vec();
    client.write_all(&request).await.unwrap();
    let mut echoed = vec![0u8; request.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, request);
    assert_eq!(handle.multiplexer().connection_count(), 1);

    assert!(handle.shutdown().await);
}
