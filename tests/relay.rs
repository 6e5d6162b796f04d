//! End-to-end tests against a live relay on an ephemeral port.

use chat_relay::config::Config;
use chat_relay::server::Server;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay(config: Config) -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
    let server = Arc::new(Server::new(Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..config
    }));
    let listener = server.bind().await.expect("bind relay");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(Arc::clone(&server).serve(listener));
    (server, addr, handle)
}

async fn wait_for_members(server: &Server, expected: usize) {
    timeout(WAIT, async {
        while server.registry().len() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {expected} members, registry has {}",
            server.registry().len()
        )
    });
}

async fn recv(stream: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 4096];
    let n = timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("timed out waiting for message")
        .expect("read failed");
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(read.is_err(), "unexpected data: {:?}", read);
}

fn port_of(stream: &TcpStream) -> u16 {
    stream.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_two_clients_hello_then_quit() {
    let (server, addr, _handle) = start_relay(Config::default()).await;

    let mut client1 = TcpStream::connect(addr).await.unwrap();
    let mut client2 = TcpStream::connect(addr).await.unwrap();
    wait_for_members(&server, 2).await;

    client1.write_all(b"hello").await.unwrap();
    assert_eq!(
        recv(&mut client2).await,
        format!("client[{}]:hello", port_of(&client1))
    );

    client2.write_all(b"quit").await.unwrap();
    assert_eq!(
        recv(&mut client1).await,
        format!("client[{}]:quit", port_of(&client2))
    );

    // The relay closes the quitting connection.
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, client2.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
    wait_for_members(&server, 1).await;

    // Nobody left to hear it, and nothing comes back to the sender.
    client1.write_all(b"anyone there?").await.unwrap();
    assert_silent(&mut client1).await;
    assert_eq!(server.registry().len(), 1);
}

#[tokio::test]
async fn test_sender_never_receives_own_message() {
    let (server, addr, _handle) = start_relay(Config::default()).await;

    let mut sender = TcpStream::connect(addr).await.unwrap();
    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    wait_for_members(&server, 3).await;

    sender.write_all(b"ping").await.unwrap();
    let expected = format!("client[{}]:ping", port_of(&sender));

    assert_eq!(recv(&mut a).await, expected);
    assert_eq!(recv(&mut b).await, expected);
    assert_silent(&mut sender).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_disconnected_recipient_does_not_break_fanout() {
    let (server, addr, _handle) = start_relay(Config::default()).await;

    let mut sender = TcpStream::connect(addr).await.unwrap();
    let mut a = TcpStream::connect(addr).await.unwrap();
    let gone = TcpStream::connect(addr).await.unwrap();
    wait_for_members(&server, 3).await;

    drop(gone);
    sender.write_all(b"first").await.unwrap();
    assert_eq!(
        recv(&mut a).await,
        format!("client[{}]:first", port_of(&sender))
    );

    wait_for_members(&server, 2).await;
    a.write_all(b"reply").await.unwrap();
    assert_eq!(
        recv(&mut sender).await,
        format!("client[{}]:reply", port_of(&a))
    );
}

#[tokio::test]
async fn test_oversized_message_arrives_in_pieces() {
    let (server, addr, _handle) = start_relay(Config::default()).await;

    let mut sender = TcpStream::connect(addr).await.unwrap();
    let mut receiver = TcpStream::connect(addr).await.unwrap();
    wait_for_members(&server, 2).await;

    sender.write_all(&[b'a'; 1500]).await.unwrap();
    let prefix = format!("client[{}]:", port_of(&sender));

    let mut received = String::new();
    timeout(WAIT, async {
        while received.matches('a').count() < 1500 {
            received.push_str(&recv(&mut receiver).await);
        }
    })
    .await
    .expect("payload never fully arrived");

    // At most 1024 bytes per read, each relayed as its own message.
    assert!(received.matches(prefix.as_str()).count() >= 2);
    assert_eq!(received.matches('a').count(), 1500);
}

#[tokio::test]
async fn test_departure_notice() {
    let (server, addr, _handle) = start_relay(Config {
        notify_departures: true,
        ..Config::default()
    })
    .await;

    let mut stays = TcpStream::connect(addr).await.unwrap();
    let leaves = TcpStream::connect(addr).await.unwrap();
    wait_for_members(&server, 2).await;

    let port = port_of(&leaves);
    drop(leaves);

    assert_eq!(recv(&mut stays).await, format!("client[{port}] left"));
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let (server, addr, handle) = start_relay(Config::default()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for_members(&server, 1).await;

    server.shutdown();
    timeout(WAIT, handle).await.unwrap().unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
    assert!(server.registry().is_empty());

    // Listener is closed.
    assert!(TcpStream::connect(addr).await.is_err());

    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_clients_concurrently() {
    let (server, addr, _handle) = start_relay(Config::default()).await;

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_for_members(&server, 10).await;

    // Every client leaves; the registry drains without errors.
    let mut leaving = Vec::new();
    for mut client in clients.drain(..5) {
        leaving.push(tokio::spawn(async move {
            client.write_all(b"quit").await.unwrap();
            let mut buf = [0u8; 1024];
            // Drain relayed quits until the relay closes us.
            while let Ok(Ok(n)) = timeout(WAIT, client.read(&mut buf)).await {
                if n == 0 {
                    break;
                }
            }
        }));
    }
    for task in leaving {
        task.await.unwrap();
    }

    wait_for_members(&server, 5).await;
}
