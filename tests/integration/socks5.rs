//! SOCKS5 negotiation driven over a real socket pair.

use std::net::{IpAddr, Ipv4Addr};

use keel_net::transport::{StreamTransport, Transport};
use keel_net::{ProxyError, Socks5Auth, Socks5Client, Socks5Target, StepStatus};
use tokio::net::{TcpListener, TcpStream};

/// Drive a state machine against a transport until Done or Fail.
async fn drive<T: Transport>(
    client: &mut Socks5Client,
    transport: &mut T,
) -> Result<(), ProxyError> {
    let mut response: Vec<u8> = Vec::new();
    loop {
        match client.next_step(&response) {
            StepStatus::SendAndReceive { send, expect } => {
                transport.write_all(&send).await.unwrap();
                response = vec![0u8; expect];
                transport.read_exact(&mut response).await.unwrap();
            }
            StepStatus::Receive { expect } => {
                response = vec![0u8; expect];
                transport.read_exact(&mut response).await.unwrap();
            }
            StepStatus::Done => return Ok(()),
            StepStatus::Fail => return Err(client.error().cloned().expect("failed without error")),
        }
    }
}

/// A scripted proxy: (expected request bytes, canned reply) pairs.
async fn spawn_proxy(script: Vec<(Vec<u8>, Vec<u8>)>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = StreamTransport::new(stream);
        for (expected, reply) in script {
            let mut got = vec![0u8; expected.len()];
            transport.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected, "proxy saw unexpected request bytes");
            transport.write_all(&reply).await.unwrap();
        }
    });
    addr
}

#[tokio::test]
async fn ipv4_connect_through_proxy() {
    // The proxy accepts NO_AUTH and reports a bound endpoint of
    // 127.0.0.1:8080.
    let addr = spawn_proxy(vec![
        (vec![5, 2, 0, 2], vec![5, 0]),
        (
            vec![5, 1, 0, 1, 10, 0, 0, 7, 0x01, 0xbb],
            vec![5, 0, 0, 1, 127, 0, 0, 1, 0x1f, 0x90],
        ),
    ])
    .await;

    let mut transport = StreamTransport::new(TcpStream::connect(addr).await.unwrap());
    let mut client = Socks5Client::new(
        Socks5Target::Endpoint(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 443),
        None,
    );
    drive(&mut client, &mut transport).await.unwrap();

    assert_eq!(
        client.result(),
        Some(&Socks5Target::Endpoint(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            8080
        ))
    );
}

#[tokio::test]
async fn authenticated_connect_through_proxy() {
    let addr = spawn_proxy(vec![
        (vec![5, 2, 0, 2], vec![5, 2]),
        (b"\x01\x02me\x06secret".to_vec(), vec![1, 0]),
        (
            vec![5, 1, 0, 1, 192, 168, 0, 1, 0, 80],
            vec![5, 0, 0, 1, 192, 168, 0, 1, 0, 80],
        ),
    ])
    .await;

    let mut transport = StreamTransport::new(TcpStream::connect(addr).await.unwrap());
    let mut client = Socks5Client::new(
        Socks5Target::Endpoint(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)), 80),
        Some(Socks5Auth {
            username: "me".into(),
            password: "secret".into(),
        }),
    );
    drive(&mut client, &mut transport).await.unwrap();
    assert!(client.result().is_some());
}

#[tokio::test]
async fn proxy_error_code_is_surfaced() {
    // Reply 0x02: connection not allowed by ruleset.
    let addr = spawn_proxy(vec![
        (vec![5, 2, 0, 2], vec![5, 0]),
        (
            vec![5, 1, 0, 1, 10, 0, 0, 7, 0x01, 0xbb],
            vec![5, 2, 0, 1, 0, 0, 0, 0, 0, 0],
        ),
    ])
    .await;

    let mut transport = StreamTransport::new(TcpStream::connect(addr).await.unwrap());
    let mut client = Socks5Client::new(
        Socks5Target::Endpoint(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 443),
        None,
    );

    // The failure lands at the connect step, before the address read.
    let mut response = Vec::new();
    let error = loop {
        match client.next_step(&response) {
            StepStatus::SendAndReceive { send, expect } => {
                transport.write_all(&send).await.unwrap();
                response = vec![0u8; expect];
                // The connect reply is shorter than a success frame;
                // read only the 5 header bytes the machine asked for.
                transport.read_exact(&mut response).await.unwrap();
            }
            StepStatus::Receive { expect } => {
                response = vec![0u8; expect];
                transport.read_exact(&mut response).await.unwrap();
            }
            StepStatus::Fail => break client.error().cloned().unwrap(),
            StepStatus::Done => panic!("negotiation should have failed"),
        }
    };
    assert_eq!(error, ProxyError::ProxyReportedError(0x02));
}
