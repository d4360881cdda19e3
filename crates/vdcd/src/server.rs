//! TCP server: accept loop, single-session policy, per-connection read loop
//! and the serialized writer task.
//!
//! Exactly one controller session is allowed at a time; while one is active,
//! any further accept is closed immediately. Framing violations are fatal to
//! the session; codec violations are logged (with the payload hex) and the
//! read loop keeps going.

use crate::dispatch::{self, DispatchOutcome, PostAction};
use crate::entities::VdcHost;
use crate::session::{Session, SessionTiming};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vdcproto::{decode_envelope, encode_envelope, frame, message, CodecError, Envelope};

pub struct Server {
    host: Arc<Mutex<VdcHost>>,
    listener: TcpListener,
    session_slot: Arc<Mutex<Option<Session>>>,
    timing: SessionTiming,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(host: Arc<Mutex<VdcHost>>, listener: TcpListener) -> Self {
        Self::with_timing(host, listener, SessionTiming::default())
    }

    pub fn with_timing(
        host: Arc<Mutex<VdcHost>>,
        listener: TcpListener,
        timing: SessionTiming,
    ) -> Self {
        Self {
            host,
            listener,
            session_slot: Arc::new(Mutex::new(None)),
            timing,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the shutdown token fires.
    pub async fn run(self) {
        info!(addr = ?self.listener.local_addr().ok(), "vDC API server listening");
        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            // Single-peer policy: the accept/claim decision is atomic under
            // the slot lock, so two racing connects cannot both win.
            let (session, outbound_rx) = {
                let mut slot = self.session_slot.lock().await;
                if slot.as_ref().is_some_and(|s| !s.is_closing()) {
                    warn!(%peer, "rejecting second connection, session already active");
                    drop(stream);
                    continue;
                }
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Envelope>();
                let session = Session::new(outbound_tx.clone(), peer, self.timing);
                *slot = Some(session.clone());
                self.host.lock().await.session_connected(outbound_tx);
                (session, outbound_rx)
            };

            let host = self.host.clone();
            let slot = self.session_slot.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                handle_connection(host, slot, stream, session, outbound_rx, shutdown).await;
            });
        }

        // Graceful stop: tear down any live session.
        let slot = self.session_slot.lock().await;
        if let Some(session) = slot.as_ref() {
            session.send(Envelope::notification(vdcproto::Message::Bye));
            session.close();
        }
        info!("vDC API server stopped");
    }
}

async fn handle_connection(
    host: Arc<Mutex<VdcHost>>,
    slot: Arc<Mutex<Option<Session>>>,
    stream: TcpStream,
    session: Session,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    shutdown: CancellationToken,
) {
    let peer = session.peer();
    let (reader, writer) = stream.into_split();

    let writer_task = spawn_writer(writer, outbound_rx, session.cancel_token());
    let hello_timer = session.spawn_hello_timer();
    let mut ping_loop = None;

    read_loop(&host, &session, reader, &mut ping_loop, &shutdown).await;

    // Teardown: cancel timers and tasks, drain the writer, fire the
    // disconnect hook exactly once.
    session.close();
    hello_timer.abort();
    if let Some(task) = ping_loop {
        task.abort();
    }
    let _ = writer_task.await;

    {
        let host = host.lock().await;
        host.session_disconnected();
    }
    session.mark_disconnected();
    *slot.lock().await = None;
    info!(%peer, "connection closed");
}

async fn read_loop<R>(
    host: &Arc<Mutex<VdcHost>>,
    session: &Session,
    mut reader: R,
    ping_loop: &mut Option<tokio::task::JoinHandle<()>>,
    shutdown: &CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let cancel = session.cancel_token();
    loop {
        let payload = tokio::select! {
            read = frame::read_frame(&mut reader) => match read {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    info!(peer = %session.peer(), "peer closed connection");
                    return;
                }
                Err(e) => {
                    // Framing violations are fatal to the session.
                    error!(peer = %session.peer(), error = %e, "framing error, closing session");
                    return;
                }
            },
            _ = cancel.cancelled() => return,
            _ = shutdown.cancelled() => return,
        };

        session.touch_activity();

        let envelope = match decode_envelope(&payload) {
            Ok(envelope) => envelope,
            Err(CodecError::Malformed { .. }) => {
                // Either an unknown message type or a malformed payload of a
                // known one. The first deserves a generic error when it was a
                // request; both are non-fatal.
                match message::probe_unknown(&payload) {
                    Some((kind, message_id)) if !message::KNOWN_TYPES.contains(&kind.as_str()) => {
                        if let Some(response) =
                            dispatch::unsupported_type_response(&kind, message_id)
                        {
                            session.send(response);
                        }
                    }
                    _ => {
                        warn!(
                            payload_hex = %hex_dump(&payload),
                            "undecodable payload, continuing"
                        );
                    }
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "decode error, continuing");
                continue;
            }
        };

        debug!(kind = envelope.message.kind(), "received");
        let DispatchOutcome { response, post } = dispatch::dispatch(host, session, envelope).await;

        if let Some(response) = response {
            session.send(response);
        }

        match post {
            PostAction::None => {}
            PostAction::HelloComplete => {
                session.activate();
                *ping_loop = Some(session.spawn_ping_loop());
                let mut host = host.lock().await;
                host.announce_all();
            }
            PostAction::Bye => {
                // Let queued writes drain in the writer task, then stop.
                return;
            }
        }
    }
}

fn spawn_writer<W>(
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        loop {
            let envelope = tokio::select! {
                next = outbound.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            let payload = match encode_envelope(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound envelope");
                    continue;
                }
            };
            debug!(kind = envelope.message.kind(), bytes = payload.len(), "sending");
            if let Err(e) = frame::write_frame(&mut writer, &payload).await {
                warn!(error = %e, "write failed, stopping writer");
                break;
            }
        }

        // Drain whatever is still queued so a bye can flush out.
        while let Ok(envelope) = outbound.try_recv() {
            if let Ok(payload) = encode_envelope(&envelope) {
                let _ = frame::write_frame(&mut writer, &payload).await;
            }
        }
    })
}

fn hex_dump(payload: &[u8]) -> String {
    const LIMIT: usize = 128;
    if payload.len() <= LIMIT {
        hex::encode(payload)
    } else {
        format!("{}… ({} bytes)", hex::encode(&payload[..LIMIT]), payload.len())
    }
}
