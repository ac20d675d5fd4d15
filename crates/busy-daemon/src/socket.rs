use crate::bus::{BusMessage, NotificationBus};
use crate::core::CoreHandle;
use crate::state::StateBoard;
use busy_proto::protocol::{Event, Message, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    board: StateBoard,
    core: CoreHandle,
    bus: NotificationBus,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let clients = Arc::new(AtomicUsize::new(0));
        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    let count = clients.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Client {} connected from {} ({} connected)", id, peer, count);

                    let board = board.clone();
                    let core = core.clone();
                    let bus_rx = bus.subscribe();
                    let clients = Arc::clone(&clients);

                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        handle_client(read_half, write_half, board, id, core, bus_rx).await;
                        let count = clients.fetch_sub(1, Ordering::SeqCst) - 1;
                        info!("Client {} disconnected ({} connected)", id, count);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

/// Serve one client: a `hello` on connect, then requests in and events out.
/// Each request is answered with the fresh `state`, or an `error` event when
/// the core rejected it.
async fn handle_client<R, W>(
    mut read_half: R,
    mut write_half: W,
    board: StateBoard,
    client_id: usize,
    core: CoreHandle,
    mut bus_rx: broadcast::Receiver<BusMessage>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&board).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Request(request), consumed)) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent request: {:?}", client_id, request);

                                    let reply = match core.request(request).await {
                                        Ok(()) => encode_state(&board).await,
                                        Err(e) => Message::Event(Event::Error { message: e.to_string() }).encode(),
                                    };
                                    if let Ok(encoded) = reply {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) if is_incomplete(&read_buf) => {
                                    debug!("Client {} partial frame: {}", client_id, e);
                                    break;
                                }
                                Err(e) => {
                                    // whole frame present but undecodable: skip it
                                    warn!("Client {} sent a malformed frame: {}", client_id, e);
                                    let len = frame_len(&read_buf);
                                    read_buf.drain(..4 + len);
                                    let message = format!("malformed request: {}", e);
                                    if let Ok(encoded) = Message::Event(Event::Error { message }).encode() {
                                        let _ = write_half.write_all(&encoded).await;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = bus_rx.recv() => {
                match msg {
                    Ok(BusMessage::StateUpdated) => {
                        if let Ok(encoded) = encode_state(&board).await {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BusMessage::Event(event)) => {
                        if let Ok(encoded) = Message::Event(event).encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} bus messages", client_id, n);
                        if let Ok(encoded) = encode_state(&board).await {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

fn frame_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

fn is_incomplete(buf: &[u8]) -> bool {
    buf.len() < 4 || buf.len() < 4 + frame_len(buf)
}

async fn encode_hello(board: &StateBoard) -> anyhow::Result<Vec<u8>> {
    let state = board.get_state().await;
    Message::Event(Event::Hello {
        protocol_version: PROTOCOL_VERSION,
        state,
    })
    .encode()
}

async fn encode_state(board: &StateBoard) -> anyhow::Result<Vec<u8>> {
    let state = board.get_state().await;
    Message::Event(Event::State { data: state }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DaemonCore, DaemonEvent};
    use crate::gateway::testing::RecordingGateway;
    use crate::transport::NullTransport;
    use busy_proto::config::Config;
    use busy_proto::protocol::Request;
    use busy_proto::store::MemoryStore;
    use busy_proto::sync::SettingsSynchronizer;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    async fn read_event(stream: &mut DuplexStream, buf: &mut Vec<u8>) -> Event {
        let mut tmp = [0u8; 4096];
        loop {
            if let Ok((msg, consumed)) = Message::decode(buf) {
                buf.drain(..consumed);
                match msg {
                    Message::Event(ev) => return ev,
                    Message::Request(_) => continue,
                }
            }
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "stream closed");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    fn spawn_client() -> DuplexStream {
        let sync = SettingsSynchronizer::load(
            Box::new(MemoryStore::new()),
            Config::default().default_snapshot(),
            None,
        )
        .unwrap();
        let bus = NotificationBus::new(64);
        let bus_rx = bus.subscribe();
        let core = DaemonCore::new(
            sync,
            Arc::new(RecordingGateway::default()),
            Arc::new(NullTransport),
            bus,
        );
        let board = core.board();
        let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(16);
        tokio::spawn(core.run(event_rx));

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(server);
        tokio::spawn(handle_client(
            read_half,
            write_half,
            board,
            1,
            CoreHandle::new(event_tx),
            bus_rx,
        ));
        client
    }

    #[tokio::test]
    async fn test_hello_then_request_roundtrip() {
        let mut client = spawn_client();
        let mut buf = Vec::new();

        match read_event(&mut client, &mut buf).await {
            Event::Hello { protocol_version, state } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.settings.channels.len(), 10);
            }
            other => panic!("expected hello, got {:?}", other),
        }

        let frame = Message::Request(Request::PlaySound {
            app_id: "slack".into(),
            sound_file: None,
            interval: None,
            volume: None,
        })
        .encode()
        .unwrap();
        client.write_all(&frame).await.unwrap();

        // the direct reply and the bus events arrive in either order
        let (mut saw_status, mut saw_state) = (false, false);
        while !(saw_status && saw_state) {
            match read_event(&mut client, &mut buf).await {
                Event::SoundStatus { app_id, playing } => {
                    assert_eq!(app_id, "slack");
                    assert!(playing);
                    saw_status = true;
                }
                Event::State { data } if data.playing == vec!["slack".to_string()] => saw_state = true,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_request_gets_error_event() {
        let mut client = spawn_client();
        let mut buf = Vec::new();
        read_event(&mut client, &mut buf).await;

        let frame = Message::Request(Request::StopSound { app_id: "fax".into() })
            .encode()
            .unwrap();
        client.write_all(&frame).await.unwrap();

        loop {
            if let Event::Error { message } = read_event(&mut client, &mut buf).await {
                assert!(message.contains("fax"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut client = spawn_client();
        let mut buf = Vec::new();
        read_event(&mut client, &mut buf).await;

        let junk = b"{\"request\":\"nope\"}";
        let mut frame = (junk.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(junk);
        frame.extend(Message::Request(Request::GetState).encode().unwrap());
        client.write_all(&frame).await.unwrap();

        let mut saw_error = false;
        loop {
            match read_event(&mut client, &mut buf).await {
                Event::Error { message } => {
                    assert!(message.starts_with("malformed request"));
                    saw_error = true;
                }
                Event::State { .. } if saw_error => break,
                _ => {}
            }
        }
    }
}
