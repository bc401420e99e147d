//! Control connections of a conference
//!
//! Each accepted connection gets a reader loop and a writer task joined by
//! an unbounded channel, so broadcasts never wait on a slow socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::CANCELLED;
use crate::error::NetworkError;
use crate::network::{control_reader, control_writer, read_message, send_body};
use crate::protocol::ControlMessage;
use crate::session::client::{Outbound, TextLink};
use crate::session::ConferenceSession;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept control connections until the session stops
pub(crate) async fn accept_loop(session: Arc<ConferenceSession>, listener: TcpListener) {
    let stopped = session.stopped();
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(handle_connection(Arc::clone(&session), stream, peer));
                }
                Err(e) => {
                    warn!(conference = session.id(), error = %e, "Accept failed");
                }
            }
        }
    }
    debug!(conference = session.id(), "Control listener closed");
}

/// Serve one control connection
pub async fn handle_connection(session: Arc<ConferenceSession>, stream: TcpStream, peer: SocketAddr) {
    let conn_id = Uuid::new_v4();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let max_len = session.session_config().max_control_message;
    let writer = tokio::spawn(write_loop(write_half, max_len, rx, peer));

    let mut reader = control_reader(read_half, max_len);
    let stopped = session.stopped();
    tokio::pin!(stopped);

    let mut client_id: Option<String> = None;
    let mut leaving = false;

    debug!(conference = session.id(), %peer, %conn_id, "Control connection opened");

    while !leaving {
        let msg = tokio::select! {
            _ = &mut stopped => break,
            msg = read_message(&mut reader) => msg,
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(NetworkError::InvalidMessage(e)) => {
                warn!(%peer, error = %e, "Ignoring invalid control message");
                continue;
            }
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                warn!(%peer, error = %e, "Control connection failed");
                break;
            }
        };

        match msg {
            ControlMessage::InitConference { client_id: id } => {
                session.register_text(&id, TextLink::new(conn_id, peer, tx.clone()));
                client_id = Some(id);
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session.switch_mode().await;
                });
            }
            ControlMessage::TextMessage { .. } => {
                session.broadcast_text(conn_id, &msg);
            }
            ControlMessage::P2pInfosNotification { p2p_info: Some(port), .. } => {
                let Some(id) = client_id.as_deref() else {
                    debug!(%peer, "P2P info before init, ignoring");
                    continue;
                };
                if let Err(e) = session.on_p2p_info(id, port) {
                    warn!(client = %id, error = %e, "Rejected P2P info");
                }
            }
            ControlMessage::QuitConference { .. } => {
                let _ = tx.send(Outbound::Cancelled);
                leaving = true;
            }
            ControlMessage::CancelConference { client_id: claimed } => {
                let Some(id) = client_id.as_deref() else {
                    debug!(%peer, "Cancel before init, ignoring");
                    continue;
                };
                if claimed.as_deref().is_some_and(|claimed| claimed != id) {
                    warn!(%peer, client = %id, ?claimed, "Cancel on behalf of another client rejected");
                    continue;
                }
                match session.cancel_conference(id) {
                    Ok(()) => info!(conference = session.id(), "Conference cancelled by manager"),
                    Err(e) => warn!(%peer, error = %e, "Cancel rejected"),
                }
            }
            other => {
                debug!(%peer, kind = other.kind(), "Unexpected control message");
            }
        }
    }

    session.on_connection_closed(client_id.as_deref(), conn_id).await;
    drop(tx);

    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(_) => {}
        Err(_) => debug!(%peer, "Writer did not drain in time"),
    }
    debug!(conference = session.id(), %peer, %conn_id, "Control connection closed");
}

/// Drain queued frames onto the socket. `Cancelled` is the last thing a
/// connection ever carries and goes out unframed.
async fn write_loop(
    writer: OwnedWriteHalf,
    max_len: usize,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    peer: SocketAddr,
) {
    let mut writer = control_writer(writer, max_len);
    while let Some(item) = rx.recv().await {
        let result = match &item {
            Outbound::Frame(body) => send_body(&mut writer, body.clone()).await,
            Outbound::Cancelled => writer
                .get_mut()
                .write_all(CANCELLED)
                .await
                .map_err(|e| NetworkError::SendFailed(e.to_string())),
        };
        if let Err(e) = result {
            debug!(%peer, error = %e, "Control write failed");
            break;
        }
        if item == Outbound::Cancelled {
            break;
        }
    }
    let _ = writer.get_mut().shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConfig, SessionConfig};
    use crate::network::{control_transport, write_json, ControlTransport};
    use crate::protocol::{MediaChannel, Mode};
    use tokio::io::AsyncReadExt;

    type Control = ControlTransport<TcpStream>;

    async fn started() -> Arc<ConferenceSession> {
        let config = SessionConfig {
            bind_address: "127.0.0.1".into(),
            barrier_timeout_ms: 200,
            ..SessionConfig::default()
        };
        let session = ConferenceSession::new(7, "boss", "room", &config, &MediaConfig::default());
        session.start().await.unwrap();
        session
    }

    async fn connect(session: &ConferenceSession, id: &str) -> Control {
        let (port, _) = session.ports();
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut control = control_transport(stream, 1 << 16);
        write_json(&mut control, &ControlMessage::init(id)).await.unwrap();
        control
    }

    async fn read_rest(control: &mut Control) -> Vec<u8> {
        let mut rest = control.read_buffer().to_vec();
        tokio::time::timeout(Duration::from_secs(2), control.get_mut().read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        rest
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_init_registers_client() {
        let session = started().await;
        let _boss = connect(&session, "boss").await;

        wait_for(|| session.participants() == vec!["boss".to_string()]).await;
        assert_eq!(session.mode(), Mode::ClientServer);
        assert_eq!(session.media_count(MediaChannel::Video), 0);
    }

    #[tokio::test]
    async fn test_quit_sends_cancelled_and_closes() {
        let session = started().await;
        let _boss = connect(&session, "boss").await;
        let mut guest = connect(&session, "guest").await;
        wait_for(|| session.participants().len() == 2).await;

        write_json(&mut guest, &ControlMessage::QuitConference { client_id: None })
            .await
            .unwrap();

        assert!(read_rest(&mut guest).await.ends_with(CANCELLED));

        wait_for(|| session.participants() == vec!["boss".to_string()]).await;
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_manager_disconnect_cancels_everyone() {
        let session = started().await;
        let boss = connect(&session, "boss").await;
        let mut guest = connect(&session, "guest").await;
        wait_for(|| session.participants().len() == 2).await;

        drop(boss);

        assert!(read_rest(&mut guest).await.ends_with(CANCELLED));
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_non_manager_cannot_cancel() {
        let session = started().await;
        let _boss = connect(&session, "boss").await;
        let mut guest = connect(&session, "guest").await;
        wait_for(|| session.participants().len() == 2).await;

        write_json(&mut guest, &ControlMessage::CancelConference { client_id: None })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.is_running());
    }
    #[tokio::test]
    async fn test_cancel_ignores_claimed_manager_id() {
        let session = started().await;
        let _boss = connect(&session, "boss").await;
        let mut guest = connect(&session, "guest").await;
        wait_for(|| session.participants().len() == 2).await;

        write_json(&mut guest, &ControlMessage::CancelConference { client_id: Some("boss".into()) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.is_running());
        assert_eq!(session.participants().len(), 2);
    }

    #[tokio::test]
    async fn test_manager_cancel_reaches_members() {
        let session = started().await;
        let mut boss = connect(&session, "boss").await;
        let mut guest = connect(&session, "guest").await;
        wait_for(|| session.participants().len() == 2).await;

        write_json(&mut boss, &ControlMessage::CancelConference { client_id: None })
            .await
            .unwrap();

        assert!(read_rest(&mut guest).await.ends_with(CANCELLED));
        assert!(!session.is_running());
    }
}
