//! Gemeinsame Test-Helfer: lokaler Media-Stream-Server und Audio-Backend

#![allow(dead_code)]

use call_session::audio::{AudioBackend, AudioError, AudioSink};
use call_session::media_stream::ConnectionEvent;
use call_session::SessionEvent;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Send(String),
    Close,
}

/// WebSocket-Server, der immer nur eine Verbindung bedient
pub struct TestServer {
    pub base_url: String,
    attempts: Arc<AtomicUsize>,
    reject: Arc<AtomicBool>,
    paths: Arc<Mutex<Vec<String>>>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
    opened: tokio::sync::Mutex<mpsc::UnboundedReceiver<usize>>,
    closed: tokio::sync::Mutex<mpsc::UnboundedReceiver<usize>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let attempts = Arc::new(AtomicUsize::new(0));
        let reject = Arc::new(AtomicBool::new(false));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let current = Arc::new(Mutex::new(None));
        let (opened_tx, opened) = mpsc::unbounded_channel();
        let (closed_tx, closed) = mpsc::unbounded_channel();

        let server = Self {
            base_url,
            attempts: Arc::clone(&attempts),
            reject: Arc::clone(&reject),
            paths: Arc::clone(&paths),
            current: Arc::clone(&current),
            opened: tokio::sync::Mutex::new(opened),
            closed: tokio::sync::Mutex::new(closed),
        };

        tokio::spawn(async move {
            let mut handshakes = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                attempts.fetch_add(1, Ordering::SeqCst);
                if reject.load(Ordering::SeqCst) {
                    // Verbindung ohne Handshake schließen
                    drop(stream);
                    continue;
                }

                let paths = Arc::clone(&paths);
                let callback =
                    move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        paths.lock().push(req.uri().path().to_string());
                        Ok(resp)
                    };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                handshakes += 1;
                let id = handshakes;
                let (tx, mut rx) = mpsc::unbounded_channel();
                *current.lock() = Some(tx);
                let _ = opened_tx.send(id);

                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            cmd = rx.recv() => match cmd {
                                Some(Command::Send(text)) => {
                                    if ws.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Command::Close) | None => {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            },
                            msg = ws.next() => match msg {
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                    let _ = closed_tx.send(id);
                });
            }
        });

        server
    }

    /// TCP-Verbindungsversuche insgesamt
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }

    /// Neue Verbindungen ab jetzt abweisen (oder wieder annehmen)
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = self.current.lock().as_ref() {
            let _ = tx.send(Command::Send(text.into()));
        }
    }

    /// Schließt die aktuelle Verbindung von Serverseite
    pub fn close_current(&self) {
        if let Some(tx) = self.current.lock().take() {
            let _ = tx.send(Command::Close);
        }
    }

    pub async fn wait_opened(&self) -> usize {
        within(async { self.opened.lock().await.recv().await.unwrap() }).await
    }

    pub async fn wait_closed(&self) -> usize {
        within(async { self.closed.lock().await.recv().await.unwrap() }).await
    }
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("timed out waiting for test condition")
}

/// Nächstes Session-Event, das `pred` erfüllt
pub async fn next_session_event(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    within(async {
        loop {
            let event = rx.recv().await.expect("handler channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
}

/// Sammelt Verbindungs-Events bis einschließlich dem ersten, das `stop` erfüllt
pub async fn collect_until(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    stop: impl Fn(&ConnectionEvent) -> bool,
) -> Vec<ConnectionEvent> {
    within(async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.expect("event channel closed");
            let done = stop(&event);
            events.push(event);
            if done {
                return events;
            }
        }
    })
    .await
}

/// Alles, was gerade im Channel liegt
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// AUDIO
// ============================================================================

/// Audio-Backend, das nur mitschreibt
#[derive(Default)]
pub struct RecordingBackend {
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub played: Arc<Mutex<Vec<usize>>>,
}

struct RecordingSink {
    closed: Arc<AtomicUsize>,
    played: Arc<Mutex<Vec<usize>>>,
}

impl AudioSink for RecordingSink {
    fn play(&self, samples: &[f32], _sample_rate: u32) -> Result<(), AudioError> {
        self.played.lock().push(samples.len());
        Ok(())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl AudioBackend for RecordingBackend {
    fn open_output(&self) -> Result<Box<dyn AudioSink>, AudioError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSink {
            closed: Arc::clone(&self.closed),
            played: Arc::clone(&self.played),
        }))
    }
}
