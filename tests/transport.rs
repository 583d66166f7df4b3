use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use vento_tools::connection::{DeviceAddress, Reply, Transport, TransportConfig};
use vento_tools::parameters::Parameter;
use vento_tools::protocol::{DataEntry, FunctionCode, Packet};

const DEVICE_ID: &str = "003A00345842570F";
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn transport(port: u16) -> Transport {
    Transport::new(TransportConfig {
        port,
        broadcast_address: LOCALHOST,
        bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        exchange_timeout: Duration::from_millis(300),
        discovery_receive_timeout: Duration::from_millis(300),
        discovery_window: Duration::from_secs(2),
    })
}

fn search_reply(id: &str) -> Vec<u8> {
    let entries = vec![DataEntry::new(Parameter::SEARCH.code(), Some(id.as_bytes().to_vec()))];
    Packet::new(id, "", FunctionCode::Response, entries).to_bytes().unwrap()
}

async fn receive(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buffer = [0; 1024];
    let (len, sender) = socket.recv_from(&mut buffer).await.unwrap();
    (Packet::from_bytes(&buffer[..len]).unwrap(), sender)
}

#[tokio::test]
async fn discovers_every_responder() {
    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.2:0").await.unwrap();
    let port = first.local_addr().unwrap().port();
    let (forward, mut forwarded) = tokio::sync::mpsc::channel::<SocketAddr>(1);
    let first = tokio::spawn(async move {
        let (request, client) = receive(&first).await;
        assert_eq!(request, Transport::search_packet());
        forward.send(client).await.unwrap();
        first.send_to(&search_reply(DEVICE_ID), client).await.unwrap();
    });
    let second = tokio::spawn(async move {
        let client = forwarded.recv().await.unwrap();
        second.send_to(&search_reply(DEVICE_ID), client).await.unwrap();
    });

    let mut found = transport(port).discover().await.unwrap();
    first.await.unwrap();
    second.await.unwrap();
    found.sort_by_key(|d| d.ip);
    assert_eq!(
        found,
        [
            DeviceAddress { id: DEVICE_ID.into(), ip: LOCALHOST },
            DeviceAddress { id: DEVICE_ID.into(), ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)) },
        ]
    );
}

#[tokio::test]
async fn discovery_skips_malformed_replies() {
    let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = controller.local_addr().unwrap().port();
    let responder = tokio::spawn(async move {
        let (_, client) = receive(&controller).await;
        controller.send_to(&[0xFD, 0xFD, 0x03, 0x00], client).await.unwrap();
        controller.send_to(&search_reply("0011223344556677"), client).await.unwrap();
    });
    let found = transport(port).discover().await.unwrap();
    responder.await.unwrap();
    assert_eq!(found, [DeviceAddress { id: "0011223344556677".into(), ip: LOCALHOST }]);
}

#[tokio::test]
async fn discovery_ends_with_its_window() {
    let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = controller.local_addr().unwrap().port();
    let chatty = tokio::spawn(async move {
        let (_, client) = receive(&controller).await;
        for _ in 0..60 {
            if controller.send_to(&search_reply(DEVICE_ID), client).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });
    let transport = Transport::new(TransportConfig {
        discovery_receive_timeout: Duration::from_millis(300),
        discovery_window: Duration::from_millis(500),
        ..transport(port).config().clone()
    });
    let started = tokio::time::Instant::now();
    let found = transport.discover().await.unwrap();
    let elapsed = started.elapsed();
    chatty.abort();
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
    assert!(!found.is_empty() && found.len() <= 15, "{}", found.len());
    assert!(found.iter().all(|d| d.id == DEVICE_ID && d.ip == LOCALHOST));
}

#[tokio::test]
async fn discovery_without_controllers_is_empty() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    assert!(transport(port).discover().await.unwrap().is_empty());
}

fn status_request() -> Packet {
    let entries = vec![DataEntry::of(Parameter::ON_OFF), DataEntry::of(Parameter::SPEED)];
    Packet::new(DEVICE_ID, "1111", FunctionCode::Read, entries)
}

/// Answer a single request with whatever `reply` makes of it.
async fn controller(
    reply: impl FnOnce(Packet) -> Vec<u8> + Send + 'static,
) -> (u16, tokio::task::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (request, client) = receive(&socket).await;
        socket.send_to(&reply(request), client).await.unwrap();
    });
    (port, task)
}

#[tokio::test]
async fn exchange_returns_the_response() {
    let (port, task) = controller(|request| {
        assert_eq!(request, status_request());
        let entries = vec![
            DataEntry::with_byte(Parameter::ON_OFF, 1),
            DataEntry::with_byte(Parameter::SPEED, 2),
        ];
        Packet::new(DEVICE_ID, "1111", FunctionCode::Response, entries).to_bytes().unwrap()
    })
    .await;
    let response = transport(port).exchange(&status_request(), LOCALHOST).await.unwrap();
    task.await.unwrap();
    let response = response.expect("a response");
    assert_eq!(response.ip, LOCALHOST);
    assert_eq!(
        response.packet.entries,
        [DataEntry::with_byte(Parameter::ON_OFF, 1), DataEntry::with_byte(Parameter::SPEED, 2)]
    );
}

#[tokio::test]
async fn replies_other_than_responses_are_ignored() {
    let (port, task) = controller(|request| request.to_bytes().unwrap()).await;
    let reply = transport(port).exchange_detailed(&status_request(), LOCALHOST).await.unwrap();
    task.await.unwrap();
    match reply {
        Reply::NotAResponse(packet, ip) => {
            assert_eq!(packet, status_request());
            assert_eq!(ip, LOCALHOST);
        }
        other => panic!("unexpected {other:?}"),
    }

    let (port, task) = controller(|request| request.to_bytes().unwrap()).await;
    let response = transport(port).exchange(&status_request(), LOCALHOST).await.unwrap();
    task.await.unwrap();
    assert!(response.is_none());
}

#[tokio::test]
async fn malformed_replies_are_ignored() {
    let corrupt = |request: Packet| {
        let mut bytes = request.to_bytes().unwrap();
        if let Some(last) = bytes.last_mut() {
            *last = last.wrapping_add(1);
        }
        bytes
    };
    let (port, task) = controller(corrupt).await;
    let reply = transport(port).exchange_detailed(&status_request(), LOCALHOST).await.unwrap();
    task.await.unwrap();
    assert!(matches!(reply, Reply::Malformed(_, ip) if ip == LOCALHOST), "{reply:?}");

    let (port, task) = controller(corrupt).await;
    let response = transport(port).exchange(&status_request(), LOCALHOST).await.unwrap();
    task.await.unwrap();
    assert!(response.is_none());
}

#[tokio::test]
async fn exchange_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let transport = transport(port);
    let started = tokio::time::Instant::now();
    let reply = transport.exchange_detailed(&status_request(), LOCALHOST).await.unwrap();
    assert!(matches!(reply, Reply::Timeout), "{reply:?}");
    assert!(started.elapsed() >= transport.config().exchange_timeout);
    assert!(transport.exchange(&status_request(), LOCALHOST).await.unwrap().is_none());
}

#[tokio::test]
async fn write_without_reply() {
    let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = controller.local_addr().unwrap().port();
    let request = Packet::new(
        DEVICE_ID,
        "1111",
        FunctionCode::Write,
        vec![DataEntry::with_byte(Parameter::SPEED, 3)],
    );
    transport(port).send_only(&request, LOCALHOST).await.unwrap();
    let (received, _) = receive(&controller).await;
    assert_eq!(received, request);
}
