use authdns::{
    Authority, DaemonStatus, DnsServer, MemoryStore, Message, QueryClass, QueryType,
    ServerConfig, ServerDaemon, ServerStatus,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use test_log::test;

/// id=1, RD set, one question: www A IN
const WWW_QUERY: [u8; 21] = [
    0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, b'w', b'w',
    b'w', 0x00, 0x00, 0x01, 0x00, 0x01,
];

const RECORDS: &str = "
www   1  1 300 127.0.0.1
www   16 1 300 hello world
alias 5  1 300 www
";

struct Running {
    daemon: ServerDaemon,
    udp: SocketAddr,
    tcp: SocketAddr,
}

fn start(config: ServerConfig) -> Running {
    let store = Arc::new(MemoryStore::load(RECORDS.as_bytes()).expect("valid records"));
    let mut server = DnsServer::new(config).expect("Failed to create server");
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let udp_port = server
        .open_udp(any, Authority::new(store.clone()))
        .expect("Failed to open UDP port");
    let tcp_port = server
        .open_tcp(any, Authority::new(store))
        .expect("Failed to open TCP port");
    let udp = server.local_addr(udp_port).unwrap();
    let tcp = server.local_addr(tcp_port).unwrap();

    let daemon = ServerDaemon::spawn(server).expect("Failed to spawn daemon");
    Running { daemon, udp, tcp }
}

fn udp_client() -> UdpSocket {
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    client
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).unwrap();
    let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut body).unwrap();
    body
}

fn stop(running: Running) {
    let receiver = running.daemon.shutdown().unwrap();
    let status = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);
}

#[test]
fn udp_query_gets_answer() {
    let running = start(ServerConfig::new());
    let client = udp_client();
    client.send_to(&WWW_QUERY, running.udp).unwrap();

    let mut buf = [0u8; 1500];
    let (sz, from) = client.recv_from(&mut buf).expect("no UDP response");
    assert_eq!(from, running.udp);

    // header: same id, QR and AA and RD set, one question and one answer
    assert_eq!(&buf[0..2], &[0x00, 0x01]);
    assert_eq!(buf[2] & 0x80, 0x80);
    assert_eq!(buf[2] & 0x04, 0x04);
    assert_eq!(buf[2] & 0x01, 0x01);
    assert_eq!(&buf[4..6], &[0, 1]);
    assert_eq!(&buf[6..8], &[0, 1]);

    let reply = Message::parse(&buf[..sz]).unwrap();
    assert_eq!(reply.questions.len(), 1);
    assert_eq!(reply.answers.len(), 1);
    let answer = &reply.answers[0];
    assert_eq!(answer.name(), "www");
    assert_eq!(answer.qtype(), QueryType::Host);
    assert_eq!(answer.data().data(), &[127, 0, 0, 1]);
    assert_eq!(answer.ttl(), 0);

    stop(running);
}

#[test]
fn udp_wildcard_query_returns_every_type() {
    let running = start(ServerConfig::new());
    let mut query = Message::new(9);
    query
        .add_question("WWW", QueryType::Wildcard, QueryClass::Internet)
        .unwrap();
    let client = udp_client();
    client
        .send_to(query.encode().unwrap().data(), running.udp)
        .unwrap();

    let mut buf = [0u8; 1500];
    let (sz, _) = client.recv_from(&mut buf).expect("no UDP response");
    let reply = Message::parse(&buf[..sz]).unwrap();
    assert_eq!(reply.id, 9);
    assert_eq!(reply.answers.len(), 2);
    let txt = reply
        .answers
        .iter()
        .find(|r| r.qtype() == QueryType::Txt)
        .expect("TXT answer");
    assert_eq!(txt.data().data(), b"hello world");

    stop(running);
}

#[test]
fn malformed_and_short_datagrams_are_dropped() {
    let running = start(ServerConfig::new());
    let client = udp_client();
    let mut buf = [0u8; 1500];

    // shorter than the minimum packet size
    client.send_to(&WWW_QUERY[..12], running.udp).unwrap();
    assert!(client.recv_from(&mut buf).is_err());

    // the question section is cut off
    client.send_to(&WWW_QUERY[..18], running.udp).unwrap();
    assert!(client.recv_from(&mut buf).is_err());

    // trailing garbage after the question
    let mut extra = WWW_QUERY.to_vec();
    extra.extend_from_slice(&[0xde, 0xad]);
    client.send_to(&extra, running.udp).unwrap();
    assert!(client.recv_from(&mut buf).is_err());

    // the server still answers afterwards
    client.send_to(&WWW_QUERY, running.udp).unwrap();
    assert!(client.recv_from(&mut buf).is_ok());

    stop(running);
}

#[test]
fn tcp_query_one_byte_at_a_time() {
    let running = start(ServerConfig::new());
    let mut stream = TcpStream::connect(running.tcp).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.set_nodelay(true).unwrap();

    let mut frame = (WWW_QUERY.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(&WWW_QUERY);
    for byte in frame.iter() {
        stream.write_all(&[*byte]).unwrap();
        sleep(Duration::from_millis(2));
    }

    let reply = Message::parse(&read_frame(&mut stream)).unwrap();
    assert_eq!(reply.id, 1);
    assert!(reply.is_response);
    assert_eq!(reply.answers.len(), 1);

    // one request per connection: the server closes after answering
    let mut rest = [0u8; 8];
    assert_eq!(stream.read(&mut rest).unwrap_or(0), 0);

    stop(running);
}

#[test]
fn tcp_connection_times_out_without_full_request() {
    let running = start(ServerConfig::new().tcp_timeout(Duration::from_millis(100)));
    let mut stream = TcpStream::connect(running.tcp).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // announce 21 bytes but only send the length prefix
    stream.write_all(&[0x00, 0x15]).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);

    let status = running
        .daemon
        .status()
        .unwrap()
        .recv_timeout(Duration::from_secs(1))
        .unwrap();
    assert_eq!(status.connections, 0);

    stop(running);
}

#[test]
fn status_counts_ports_and_connections() {
    let running = start(ServerConfig::new());
    let status = running
        .daemon
        .status()
        .unwrap()
        .recv_timeout(Duration::from_secs(1))
        .unwrap();
    assert_eq!(status, ServerStatus { ports: 2, connections: 0 });

    let _idle = TcpStream::connect(running.tcp).unwrap();
    let mut connections = 0;
    for _ in 0..50 {
        sleep(Duration::from_millis(10));
        let status = running
            .daemon
            .status()
            .unwrap()
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        connections = status.connections;
        if connections == 1 {
            break;
        }
    }
    assert_eq!(connections, 1);

    stop(running);
}

#[test]
fn shutdown_closes_ports() {
    let running = start(ServerConfig::new());
    let udp = running.udp;
    let daemon = running.daemon.clone();
    stop(running);

    // the daemon thread is gone; its channel no longer accepts commands
    sleep(Duration::from_millis(50));
    assert!(daemon.status().is_err());

    let client = udp_client();
    client.send_to(&WWW_QUERY, udp).unwrap();
    let mut buf = [0u8; 64];
    assert!(client.recv_from(&mut buf).is_err());
}
