//! Controller session lifecycle.
//!
//! ```text
//! Disconnected → Connected → HelloReceived → Active → Closing → Disconnected
//! ```
//!
//! The peer must say hello within the hello timeout. Once active, the host
//! pings after a quiet minute and expects a pong within ten seconds. Those
//! two timeouts are the only paths by which the host unilaterally closes an
//! active session; content errors never do.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdcproto::{Envelope, Message};

/// Protocol timing. The defaults are the wire contract; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Peer must send hello within this after connecting.
    pub hello_timeout: Duration,
    /// Quiet period after which the host pings.
    pub ping_interval: Duration,
    /// How long to wait for the pong.
    pub pong_timeout: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    HelloReceived,
    Active,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::HelloReceived => "hello_received",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct SessionInner {
    state: Mutex<SessionState>,
    outbound: mpsc::UnboundedSender<Envelope>,
    peer: SocketAddr,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    pong_counter: watch::Sender<u64>,
    peer_version: Mutex<Option<String>>,
    cancel: CancellationToken,
    timing: SessionTiming,
}

/// Shared handle to one controller session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        peer: SocketAddr,
        timing: SessionTiming,
    ) -> Self {
        let (pong_counter, _) = watch::channel(0);
        info!(%peer, "session connected");
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState::Connected),
                outbound,
                peer,
                connected_at: Instant::now(),
                last_activity: Mutex::new(Instant::now()),
                pong_counter,
                peer_version: Mutex::new(None),
                cancel: CancellationToken::new(),
                timing,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.inner.state.lock().unwrap();
        debug!(from = %*current, to = %state, "session state");
        *current = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn peer_version(&self) -> Option<String> {
        self.inner.peer_version.lock().unwrap().clone()
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    /// Record inbound traffic; quiet-period pings key off this.
    pub fn touch_activity(&self) {
        *self.inner.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().unwrap().elapsed()
    }

    /// Queue an envelope on the session writer.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.inner.outbound.send(envelope).is_ok()
    }

    /// Hello received: capture the peer version, stop the hello clock.
    pub fn on_hello_received(&self, peer_version: Option<String>) {
        if self.state() != SessionState::Connected {
            warn!(state = %self.state(), "hello in unexpected state");
        }
        *self.inner.peer_version.lock().unwrap() = peer_version;
        self.touch_activity();
        self.set_state(SessionState::HelloReceived);
    }

    /// Hello response has been queued; the session is now fully active.
    pub fn activate(&self) {
        if self.state() != SessionState::HelloReceived {
            warn!(state = %self.state(), "activation in unexpected state");
        }
        self.set_state(SessionState::Active);
        info!(peer = %self.inner.peer, "session active");
    }

    /// Bye received: drain and tear down.
    pub fn on_bye(&self) {
        info!(peer = %self.inner.peer, "bye received");
        self.set_state(SessionState::Closing);
    }

    pub fn on_pong(&self) {
        self.touch_activity();
        self.inner.pong_counter.send_modify(|count| *count += 1);
        debug!("pong received");
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Disconnected)
    }

    /// Cancellation token shared by all session tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Tear the session down (timers, read loop, writer).
    pub fn close(&self) {
        self.set_state(SessionState::Closing);
        self.inner.cancel.cancel();
    }

    /// Mark fully disconnected.
    pub fn mark_disconnected(&self) {
        self.set_state(SessionState::Disconnected);
    }

    /// Enforce the hello deadline: a peer that connects but never says hello
    /// gets cut off.
    pub fn spawn_hello_timer(&self) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(session.inner.timing.hello_timeout) => {
                    if session.state() == SessionState::Connected {
                        warn!(
                            peer = %session.inner.peer,
                            "hello timeout, closing connection"
                        );
                        session.close();
                    }
                }
                _ = session.inner.cancel.cancelled() => {}
            }
        })
    }

    /// Keepalive: ping after a quiet interval, expect a pong within the pong
    /// timeout, close the session otherwise.
    pub fn spawn_ping_loop(&self) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(session.inner.timing.ping_interval) => {}
                    _ = session.inner.cancel.cancelled() => break,
                }

                if session.state() != SessionState::Active {
                    break;
                }
                // Skip the ping when there was recent traffic.
                if session.idle_for() < session.inner.timing.ping_interval {
                    continue;
                }

                let mut pong_rx = session.inner.pong_counter.subscribe();
                let seen = *pong_rx.borrow();
                debug!("sending keepalive ping");
                if !session.send(Envelope::notification(Message::Ping)) {
                    break;
                }

                let wait = async {
                    loop {
                        if *pong_rx.borrow() > seen {
                            return;
                        }
                        if pong_rx.changed().await.is_err() {
                            return;
                        }
                    }
                };
                tokio::select! {
                    result = tokio::time::timeout(session.inner.timing.pong_timeout, wait) => {
                        if result.is_err() {
                            warn!(
                                peer = %session.inner.peer,
                                "pong timeout, closing session"
                            );
                            session.close();
                            break;
                        }
                    }
                    _ = session.inner.cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_timing() -> SessionTiming {
        SessionTiming {
            hello_timeout: Duration::from_millis(50),
            ping_interval: Duration::from_millis(40),
            pong_timeout: Duration::from_millis(30),
        }
    }

    fn session() -> (Session, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer: SocketAddr = "127.0.0.1:4711".parse().unwrap();
        (Session::new(tx, peer, test_timing()), rx)
    }

    #[test]
    fn state_machine_happy_path() {
        let (session, _rx) = session();
        assert_eq!(session.state(), SessionState::Connected);

        session.on_hello_received(Some("vdSM 1.0".into()));
        assert_eq!(session.state(), SessionState::HelloReceived);
        assert_eq!(session.peer_version().as_deref(), Some("vdSM 1.0"));

        session.activate();
        assert!(session.is_active());

        session.on_bye();
        assert!(session.is_closing());
    }

    #[tokio::test]
    async fn hello_timeout_closes_connected_session() {
        let (session, _rx) = session();
        let timer = session.spawn_hello_timer();
        timer.await.unwrap();
        assert!(session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn hello_cancels_the_timer() {
        let (session, _rx) = session();
        let timer = session.spawn_hello_timer();

        tokio::time::sleep(Duration::from_millis(10)).await;
        session.on_hello_received(None);
        session.activate();

        timer.await.unwrap();
        assert!(!session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn ping_loop_closes_on_pong_timeout() {
        let (session, mut rx) = session();
        session.on_hello_received(None);
        session.activate();

        // Let the session go idle past the ping interval.
        let ping_loop = session.spawn_ping_loop();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // A ping must have been sent.
        let mut saw_ping = false;
        while let Ok(envelope) = rx.try_recv() {
            if envelope.message == Message::Ping {
                saw_ping = true;
            }
        }
        assert!(saw_ping);

        ping_loop.await.unwrap();
        assert!(session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn pong_keeps_the_session_alive() {
        let (session, mut rx) = session();
        session.on_hello_received(None);
        session.activate();

        let ping_loop = session.spawn_ping_loop();

        // Answer pings with pongs for a few cycles.
        let answered = tokio::spawn({
            let session = session.clone();
            async move {
                let mut pings = 0;
                while pings < 2 {
                    match rx.recv().await {
                        Some(envelope) if envelope.message == Message::Ping => {
                            pings += 1;
                            session.on_pong();
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                pings
            }
        });

        let pings = answered.await.unwrap();
        assert_eq!(pings, 2);
        assert!(!session.cancel_token().is_cancelled());

        session.close();
        ping_loop.await.unwrap();
    }

    #[tokio::test]
    async fn recent_activity_skips_the_ping() {
        let (session, mut rx) = session();
        session.on_hello_received(None);
        session.activate();

        let ping_loop = session.spawn_ping_loop();
        // Keep touching activity faster than the ping interval.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            session.touch_activity();
        }
        session.close();
        ping_loop.await.unwrap();

        while let Ok(envelope) = rx.try_recv() {
            assert_ne!(envelope.message, Message::Ping);
        }
    }
}
