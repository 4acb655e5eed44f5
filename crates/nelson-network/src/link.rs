//! Peer link sessions.
//!
//! A link is one long-lived socket to a remote peer. Each session runs as
//! a spawned task over a framed stream and reports [`LinkEvent`]s to its
//! owner; the owner writes through the [`LinkHandle`] and closes the link
//! by dropping it.

use crate::{Hello, LinkCodec, Message, PeerAdvert, MAGIC};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Identifier of one link session, unique for the owner's lifetime.
pub type LinkId = u64;

/// Which side initiated the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Incoming,
    Outgoing,
}

/// Session state as tracked by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound connect in flight.
    Dialing,
    /// Socket established, hello sent.
    Open,
    /// Session over; the entry is dropped.
    Closed,
}

/// Why a link closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Outbound connect failed or timed out.
    DialFailed,
    /// The remote side closed the socket.
    PeerClosed,
    /// Nothing heard for three beat intervals.
    Timeout,
    /// Malformed frame from the remote side.
    Protocol,
    /// The owner dropped the handle.
    Evicted,
}

/// Events a link session reports to its owner.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Socket established; the local hello is on the wire.
    Opened { id: LinkId, addr: SocketAddr },
    /// The remote hello arrived.
    Hello {
        id: LinkId,
        addr: SocketAddr,
        hello: Hello,
    },
    /// A gossip sample arrived.
    Peers { id: LinkId, peers: Vec<PeerAdvert> },
    /// The session is over. Always the last event for an id.
    Closed { id: LinkId, reason: CloseReason },
}

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Network magic for the frame codec.
    pub magic: [u8; 4],
    /// Scheduler beat period; reads time out after three of these.
    pub beat_interval: Duration,
    /// Outbound connect timeout.
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            beat_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Writer half of a link held by the owner.
///
/// Dropping the handle evicts the link: the session task drains, closes
/// the socket and reports `Closed { reason: Evicted }`.
pub struct LinkHandle {
    id: LinkId,
    direction: LinkDirection,
    addr: SocketAddr,
    tx: mpsc::Sender<Message>,
}

impl LinkHandle {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a message for the remote side. Returns false once the
    /// session is gone.
    pub async fn send(&self, message: Message) -> bool {
        self.tx.send(message).await.is_ok()
    }
}

/// Dial a peer and run the session.
///
/// `hello` is sent as soon as the socket opens.
pub fn open_link(
    id: LinkId,
    addr: SocketAddr,
    hello: Hello,
    config: LinkConfig,
    events: mpsc::Sender<LinkEvent>,
) -> LinkHandle {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(link = id, addr = %addr, error = %e, "Dial failed");
                let _ = events
                    .send(LinkEvent::Closed {
                        id,
                        reason: CloseReason::DialFailed,
                    })
                    .await;
                return;
            }
            Err(_) => {
                debug!(link = id, addr = %addr, "Dial timed out");
                let _ = events
                    .send(LinkEvent::Closed {
                        id,
                        reason: CloseReason::DialFailed,
                    })
                    .await;
                return;
            }
        };

        let _ = events.send(LinkEvent::Opened { id, addr }).await;
        run_link(id, addr, stream, hello, rx, config, events).await;
    });

    LinkHandle {
        id,
        direction: LinkDirection::Outgoing,
        addr,
        tx,
    }
}

/// Run the session for an accepted socket.
pub fn accept_link(
    id: LinkId,
    stream: TcpStream,
    addr: SocketAddr,
    hello: Hello,
    config: LinkConfig,
    events: mpsc::Sender<LinkEvent>,
) -> LinkHandle {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let _ = events.send(LinkEvent::Opened { id, addr }).await;
        run_link(id, addr, stream, hello, rx, config, events).await;
    });

    LinkHandle {
        id,
        direction: LinkDirection::Incoming,
        addr,
        tx,
    }
}

async fn run_link(
    id: LinkId,
    addr: SocketAddr,
    stream: TcpStream,
    hello: Hello,
    mut rx: mpsc::Receiver<Message>,
    config: LinkConfig,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut framed = Framed::new(stream, LinkCodec::with_magic(config.magic));

    if let Err(e) = framed.send(Message::Hello(hello)).await {
        warn!(link = id, addr = %addr, error = %e, "Hello send failed");
        let _ = events
            .send(LinkEvent::Closed {
                id,
                reason: CloseReason::PeerClosed,
            })
            .await;
        return;
    }

    let read_deadline = || Instant::now() + config.beat_interval * 3;
    let mut deadline = read_deadline();

    let reason = loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    deadline = read_deadline();
                    match message {
                        Message::Hello(hello) => {
                            let _ = events.send(LinkEvent::Hello { id, addr, hello }).await;
                        }
                        Message::Peers(peers) => {
                            let _ = events.send(LinkEvent::Peers { id, peers }).await;
                        }
                        Message::Beat => {}
                    }
                }
                Some(Err(e)) => {
                    warn!(link = id, addr = %addr, error = %e, "Protocol error");
                    break CloseReason::Protocol;
                }
                None => break CloseReason::PeerClosed,
            },

            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = framed.send(message).await {
                        debug!(link = id, addr = %addr, error = %e, "Send failed");
                        break CloseReason::PeerClosed;
                    }
                }
                None => break CloseReason::Evicted,
            },

            _ = sleep_until(deadline) => break CloseReason::Timeout,
        }
    };

    debug!(link = id, addr = %addr, reason = ?reason, "Link closed");
    let _ = events.send(LinkEvent::Closed { id, reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_hello() -> Hello {
        Hello {
            identity: PeerAdvert {
                hostname: String::new(),
                port: 16600,
                tcp_port: 15600,
                udp_port: 14600,
                is_trusted: false,
                weight: 1.0,
            },
            peers: Vec::new(),
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            beat_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn expect_closed(rx: &mut mpsc::Receiver<LinkEvent>) -> CloseReason {
        loop {
            match rx.recv().await.expect("event stream ended") {
                LinkEvent::Closed { reason, .. } => return reason,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_dial_failure() {
        // Bind-then-drop guarantees nothing is listening on the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _handle = open_link(1, addr, test_hello(), fast_config(), events_tx);

        assert_eq!(expect_closed(&mut events_rx).await, CloseReason::DialFailed);
    }

    #[tokio::test]
    async fn test_hello_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinkCodec::new());

            // Expect the client hello, then answer with our own.
            let incoming = framed.next().await.unwrap().unwrap();
            assert!(matches!(incoming, Message::Hello(_)));
            framed.send(Message::Hello(test_hello())).await.unwrap();
            framed
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _handle = open_link(7, addr, test_hello(), fast_config(), events_tx);

        match events_rx.recv().await.unwrap() {
            LinkEvent::Opened { id, .. } => assert_eq!(id, 7),
            other => panic!("expected Opened, got {:?}", other),
        }
        match events_rx.recv().await.unwrap() {
            LinkEvent::Hello { id, hello, .. } => {
                assert_eq!(id, 7);
                assert_eq!(hello.identity.port, 16600);
            }
            other => panic!("expected Hello, got {:?}", other),
        }

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_after_silence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and hold the socket open without ever writing.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _handle = open_link(1, addr, test_hello(), fast_config(), events_tx);

        let started = Instant::now();
        assert_eq!(expect_closed(&mut events_rx).await, CloseReason::Timeout);
        // Three missed beats at 50ms each
        assert!(started.elapsed() >= Duration::from_millis(150));

        server.abort();
    }

    #[tokio::test]
    async fn test_beats_keep_link_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinkCodec::new());
            let _ = framed.next().await; // client hello
            for _ in 0..8 {
                tokio::time::sleep(Duration::from_millis(40)).await;
                framed.send(Message::Beat).await.unwrap();
            }
            drop(framed);
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _handle = open_link(1, addr, test_hello(), fast_config(), events_tx);

        // Kept alive well past 3 * beat_interval by the beats, then the
        // server hangs up.
        let started = Instant::now();
        assert_eq!(expect_closed(&mut events_rx).await, CloseReason::PeerClosed);
        assert!(started.elapsed() >= Duration::from_millis(300));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_evicted_on_handle_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let handle = open_link(1, addr, test_hello(), fast_config(), events_tx);

        // Wait for the socket before evicting
        match events_rx.recv().await.unwrap() {
            LinkEvent::Opened { .. } => {}
            other => panic!("expected Opened, got {:?}", other),
        }
        drop(handle);

        assert_eq!(expect_closed(&mut events_rx).await, CloseReason::Evicted);
        server.abort();
    }
}
