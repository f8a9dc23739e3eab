mod helpers;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use gorrent::bitfield::Bitfield;
use gorrent::peer::PeerSession;
use gorrent::tracker::PeerInfo;
use gorrent::wire::WireMessage;

use helpers::fakes::{bitfield_with, fake_wire, full_bitfield, test_peer};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn expect_message(rx: &mut mpsc::UnboundedReceiver<WireMessage>) -> WireMessage {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("wire closed")
}

#[tokio::test]
async fn test_request_block_transmits_and_records() {
    let (writer, reader, mut remote) = fake_wire();
    let session = PeerSession::from_parts(test_peer(6881), full_bitfield(4), writer, reader);

    session.request_block(2, 0, 16384).await.unwrap();

    assert_eq!(
        expect_message(&mut remote.from_session).await,
        WireMessage::Request {
            piece: 2,
            begin: 0,
            length: 16384,
        }
    );
    assert!(session.has_outstanding(2, 0));
    assert!(!session.has_outstanding(2, 16384));
}

#[tokio::test]
async fn test_request_block_requires_the_piece() {
    let (writer, reader, mut remote) = fake_wire();
    let session = PeerSession::from_parts(test_peer(6881), bitfield_with(&[0], 4), writer, reader);

    let err = session.request_block(2, 0, 16384).await.unwrap_err();
    assert!(err.to_string().contains("does not have piece 2"));
    assert!(remote.from_session.try_recv().is_err(), "nothing was sent");
}

#[tokio::test]
async fn test_cancel_block_only_when_outstanding() {
    let (writer, reader, mut remote) = fake_wire();
    let session = PeerSession::from_parts(test_peer(6881), full_bitfield(4), writer, reader);

    // not outstanding: no CANCEL goes out
    session.cancel_block(1, 0, 16384).await.unwrap();
    assert!(remote.from_session.try_recv().is_err());

    session.request_block(1, 0, 16384).await.unwrap();
    let _request = expect_message(&mut remote.from_session).await;

    session.cancel_block(1, 0, 16384).await.unwrap();
    assert_eq!(
        expect_message(&mut remote.from_session).await,
        WireMessage::Cancel {
            piece: 1,
            begin: 0,
            length: 16384,
        }
    );
    assert!(!session.has_outstanding(1, 0));

    // cancelling again is a no-op
    session.cancel_block(1, 0, 16384).await.unwrap();
    assert!(remote.from_session.try_recv().is_err());
}

#[tokio::test]
async fn test_receiver_clears_outstanding_before_forwarding() {
    let (writer, reader, mut remote) = fake_wire();
    let session = PeerSession::from_parts(test_peer(6881), full_bitfield(4), writer, reader);

    session.request_block(3, 0, 4).await.unwrap();
    let _request = expect_message(&mut remote.from_session).await;
    assert!(session.has_outstanding(3, 0));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (error_tx, _error_rx) = mpsc::unbounded_channel();
    session.start_receiving(event_tx, error_tx, CancellationToken::new());

    remote
        .to_session
        .send(WireMessage::Piece {
            piece: 3,
            begin: 0,
            block: vec![1, 2, 3, 4],
        })
        .unwrap();

    let forwarded = expect_message(&mut event_rx).await;
    assert_eq!(
        forwarded,
        WireMessage::Piece {
            piece: 3,
            begin: 0,
            block: vec![1, 2, 3, 4],
        }
    );
    // the outstanding record is gone by the time the event is visible
    assert!(!session.has_outstanding(3, 0));
}

#[tokio::test]
async fn test_receiver_forwards_eof_as_error() {
    let (writer, reader, remote) = fake_wire();
    let session = PeerSession::from_parts(test_peer(6881), full_bitfield(4), writer, reader);

    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    session.start_receiving(event_tx, error_tx, CancellationToken::new());

    drop(remote); // closes the read side

    let err = timeout(RECV_TIMEOUT, error_rx.recv())
        .await
        .expect("timed out waiting for the error")
        .expect("error channel closed");
    assert!(err.to_string().contains("closed"));
}

#[tokio::test]
async fn test_receiver_stops_on_cancellation() {
    let (writer, reader, remote) = fake_wire();
    let session = PeerSession::from_parts(test_peer(6881), full_bitfield(4), writer, reader);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (error_tx, _error_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    session.start_receiving(event_tx, error_tx, cancel.clone());

    cancel.cancel();

    // the receiver exits without forwarding anything, closing the
    // event channel
    let event = timeout(RECV_TIMEOUT, event_rx.recv()).await.unwrap();
    assert!(event.is_none());
    drop(remote);
}

/// Remote side of a full session bring-up over real TCP, mirroring what
/// `PeerSession::connect` expects.
async fn serve_handshake(
    listener: TcpListener,
    info_hash: [u8; 20],
    remote_id: [u8; 20],
    remote_bits: Vec<u8>,
) {
    let (mut stream, _) = listener.accept().await.unwrap();

    let mut received = [0u8; 68];
    stream.read_exact(&mut received).await.unwrap();
    assert_eq!(received[0], 19);
    assert_eq!(&received[1..20], b"BitTorrent protocol");
    assert_eq!(&received[28..48], &info_hash);

    let mut response = received;
    response[48..68].copy_from_slice(&remote_id);
    stream.write_all(&response).await.unwrap();

    // local bitfield arrives first
    let mut frame = vec![0u8; 4 + 1 + remote_bits.len()];
    stream.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame[4], 5, "expected a bitfield message");

    stream
        .write_all(&WireMessage::Bitfield(remote_bits).to_bytes())
        .await
        .unwrap();

    // interested, then unchoke back
    let mut interested = [0u8; 5];
    stream.read_exact(&mut interested).await.unwrap();
    assert_eq!(interested[4], 2);

    stream
        .write_all(&WireMessage::Unchoke.to_bytes())
        .await
        .unwrap();

    // hold the socket open until the client is done
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_connect_performs_full_bring_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let info_hash = [0x11u8; 20];
    let remote_id = [0x22u8; 20];

    let server = tokio::spawn(serve_handshake(
        listener,
        info_hash,
        remote_id,
        vec![0b1010_0000],
    ));

    let peer = PeerInfo {
        id: Some(remote_id),
        ip: "127.0.0.1".parse().unwrap(),
        port,
    };
    let local_bitfield = Bitfield::blank(4);
    let session = PeerSession::connect(peer, info_hash, [0x33u8; 20], &local_bitfield)
        .await
        .unwrap();

    assert!(session.has_piece(0));
    assert!(!session.has_piece(1));
    assert!(session.has_piece(2));
    assert!(!session.has_piece(3));

    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_rejects_wrong_info_hash() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // the server echoes a different info hash
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = [0u8; 68];
        stream.read_exact(&mut received).await.unwrap();
        received[28..48].copy_from_slice(&[0xEEu8; 20]);
        stream.write_all(&received).await.unwrap();
    });

    let peer = test_peer(port);
    let err = PeerSession::connect(peer, [0x11u8; 20], [0x33u8; 20], &Bitfield::blank(4))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("info hash"));
}

#[tokio::test]
async fn test_connect_rejects_wrong_peer_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = [0u8; 68];
        stream.read_exact(&mut received).await.unwrap();
        received[48..68].copy_from_slice(&[0xEEu8; 20]);
        stream.write_all(&received).await.unwrap();
    });

    let peer = PeerInfo {
        id: Some([0x22u8; 20]),
        ip: "127.0.0.1".parse().unwrap(),
        port,
    };
    let err = PeerSession::connect(peer, [0x11u8; 20], [0x33u8; 20], &Bitfield::blank(4))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("peer id"));
}
