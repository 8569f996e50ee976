//! Notification fan-out: one dispatcher per datasource that hosts stream
//! channels, feeding bounded per-subscriber queues drained by WebSocket
//! and server-sent-event connection loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rowgate_config::{Stream, StreamKind};

use crate::endpoint::plain_error;
use crate::server::Engine;

// Max payloads allowed to wait per subscriber. A subscriber that is still
// this far behind when the next payload arrives is evicted.
const SUBSCRIBER_BACKLOG: usize = 16;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const SSE_KEEPALIVE: Duration = Duration::from_secs(60);
const SSE_COMMENT: &[u8] = b":\n\n";

const TOO_SLOW: &str = "aborting connection because it is too slow";

enum Command {
    Register {
        channel: String,
        id: u64,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        channel: String,
        id: u64,
    },
    Stop,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<String>,
}

/// Owner of one datasource's LISTEN connection and subscriber registry.
/// All mutation goes through the command channel; the registry itself is
/// owned exclusively by the dispatcher task.
pub(crate) struct Dispatcher {
    commands: mpsc::Sender<Command>,
    next_id: AtomicU64,
}

pub(crate) struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<String>,
}

impl Dispatcher {
    /// Issue LISTEN for every channel and start the dispatch task.
    pub(crate) async fn start(
        datasource: String,
        channels: Vec<String>,
        mut listener: PgListener,
    ) -> Result<Self, sqlx::Error> {
        let refs: Vec<&str> = channels.iter().map(String::as_str).collect();
        listener.listen_all(refs).await?;
        info!(datasource = %datasource, channels = ?channels, "started notification dispatcher");

        let (commands, command_rx) = mpsc::channel(64);
        tokio::spawn(dispatch_loop(datasource, listener, command_rx));
        Ok(Self {
            commands,
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) async fn register(&self, channel: &str) -> Option<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BACKLOG);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Register {
                channel: channel.to_string(),
                id,
                sender,
            })
            .await
            .ok()?;
        Some(Subscription { id, receiver })
    }

    pub(crate) fn unregister(&self, channel: &str, id: u64) {
        let _ = self.commands.try_send(Command::Unregister {
            channel: channel.to_string(),
            id,
        });
    }

    pub(crate) async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }
}

async fn dispatch_loop(
    datasource: String,
    mut listener: PgListener,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut registry: HashMap<String, Vec<Subscriber>> = HashMap::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Register { channel, id, sender }) => {
                    registry.entry(channel).or_default().push(Subscriber { id, sender });
                }
                Some(Command::Unregister { channel, id }) => {
                    if let Some(subs) = registry.get_mut(&channel) {
                        subs.retain(|s| s.id != id);
                    }
                }
                Some(Command::Stop) | None => break,
            },
            notification = listener.recv() => match notification {
                Ok(notification) => {
                    if let Some(subs) = registry.get_mut(notification.channel()) {
                        let payload = notification.payload();
                        subs.retain(|s| match s.sender.try_send(payload.to_string()) {
                            Ok(()) => true,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // Evict rather than block: dropping the
                                // sender closes the subscriber's queue.
                                warn!(datasource = %datasource, channel = %notification.channel(), "evicting slow stream subscriber");
                                false
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => false,
                        });
                    }
                }
                Err(err) => {
                    error!(datasource = %datasource, error = %err, "failed to wait for notification from postgres");
                    break;
                }
            },
        }
    }
    info!(datasource = %datasource, "stopped notification dispatcher");
}

// Sends the unregister command when a connection loop ends for any reason
// other than server shutdown (after shutdown the dispatcher may already
// be gone).
struct UnregisterGuard {
    dispatcher: Arc<Dispatcher>,
    channel: String,
    id: u64,
    cancel: CancellationToken,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.dispatcher.unregister(&self.channel, self.id);
        }
    }
}

pub(crate) async fn serve_stream(engine: Arc<Engine>, idx: usize, req: Request) -> Response {
    let stream = &engine.config.streams[idx];
    let uri = format!("{}{}", engine.config.common_prefix, stream.uri);
    if stream.debug {
        debug!(endpoint = %uri, channel = %stream.channel, datasource = %stream.datasource, kind = %stream.stream_type, "stream handler start");
    }

    let Some(dispatcher) = engine.dispatchers.get(&stream.datasource).cloned() else {
        error!(endpoint = %uri, datasource = %stream.datasource, "internal error: notification dispatcher not found");
        return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    };

    let Some(subscription) = dispatcher.register(&stream.channel).await else {
        error!(endpoint = %uri, datasource = %stream.datasource, "notification dispatcher is shut down");
        return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    };
    let guard = UnregisterGuard {
        dispatcher,
        channel: stream.channel.clone(),
        id: subscription.id,
        cancel: engine.cancel.clone(),
    };

    match stream.kind() {
        Some(StreamKind::Websocket) => {
            let (mut parts, _body) = req.into_parts();
            match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                Ok(upgrade) => {
                    let cancel = engine.cancel.clone();
                    let stream = stream.clone();
                    upgrade.on_upgrade(move |socket| async move {
                        websocket_loop(socket, subscription, guard, cancel, &stream).await;
                    })
                }
                Err(rejection) => rejection.into_response(),
            }
        }
        Some(StreamKind::Sse) => sse_response(subscription, guard, engine.cancel.clone(), stream),
        None => plain_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

async fn websocket_loop(
    socket: WebSocket,
    mut subscription: Subscription,
    guard: UnregisterGuard,
    cancel: CancellationToken,
    stream: &Stream,
) {
    let _guard = guard;
    let (mut sink, mut source) = socket.split();
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // The server never consumes client data; receiving
                    // any is a policy violation.
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "unexpected message from client".into(),
                        })))
                        .await;
                    break;
                }
                Some(Err(err)) => {
                    failure = Some(err.to_string());
                    break;
                }
            },
            payload = subscription.receiver.recv() => match payload {
                Some(payload) => {
                    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(payload.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            failure = Some(err.to_string());
                            break;
                        }
                        Err(_) => {
                            failure = Some("i/o timeout".to_string());
                            break;
                        }
                    }
                }
                None => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "connection too slow".into(),
                        })))
                        .await;
                    failure = Some(TOO_SLOW.to_string());
                    break;
                }
            },
            () = cancel.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "server shutdown".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    log_stream_exit(stream, failure);
}

fn sse_response(
    subscription: Subscription,
    guard: UnregisterGuard,
    cancel: CancellationToken,
    stream: &Stream,
) -> Response {
    let stream_cfg = stream.clone();
    let body_stream = async_stream::stream! {
        let _guard = guard;
        let mut receiver = subscription.receiver;
        // An initial comment starts the body; further comments keep the
        // connection alive.
        yield Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(SSE_COMMENT));
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + SSE_KEEPALIVE,
            SSE_KEEPALIVE,
        );
        let mut failure = None;
        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    yield Ok(Bytes::from_static(SSE_COMMENT));
                }
                payload = receiver.recv() => match payload {
                    Some(payload) => yield Ok(sse_frame(&payload)),
                    None => {
                        failure = Some(TOO_SLOW.to_string());
                        break;
                    }
                },
                () = cancel.cancelled() => break,
            }
        }
        log_stream_exit(&stream_cfg, failure);
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}

fn sse_frame(payload: &str) -> Bytes {
    let mut out = String::with_capacity(payload.len() + 16);
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

fn log_stream_exit(stream: &Stream, failure: Option<String>) {
    // Ordinary client hangups are not failures worth logging.
    let failure = failure.filter(|f| !f.contains("broken pipe") && !f.contains("i/o timeout"));
    if let Some(failure) = failure {
        error!(endpoint = %stream.uri, error = %failure, "stream closed on error");
    } else if stream.debug {
        debug!(endpoint = %stream.uri, channel = %stream.channel, datasource = %stream.datasource, kind = %stream.stream_type, "stream handler end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frames_split_payload_lines() {
        assert_eq!(&sse_frame("foo")[..], b"data: foo\n\n");
        assert_eq!(&sse_frame("a\nb")[..], b"data: a\ndata: b\n\n");
        assert_eq!(&sse_frame("")[..], b"data: \n\n");
    }

    #[tokio::test]
    async fn bounded_queue_evicts_on_overflow() {
        // Mirror the dispatcher's fan-out behaviour against a full queue.
        let (sender, mut receiver) = mpsc::channel::<String>(SUBSCRIBER_BACKLOG);
        let mut subs = vec![Subscriber { id: 1, sender }];

        for i in 0..SUBSCRIBER_BACKLOG {
            subs.retain(|s| s.sender.try_send(format!("p{i}")).is_ok());
        }
        assert_eq!(subs.len(), 1);

        // The next payload overflows the backlog and evicts.
        subs.retain(|s| s.sender.try_send("overflow".to_string()).is_ok());
        assert!(subs.is_empty());

        // The subscriber drains the backlog, then observes closure.
        for i in 0..SUBSCRIBER_BACKLOG {
            assert_eq!(receiver.recv().await.as_deref(), Some(format!("p{i}").as_str()));
        }
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn dispatcher_guard_unregisters_only_before_shutdown() {
        let (commands, mut command_rx) = mpsc::channel(4);
        let dispatcher = Arc::new(Dispatcher {
            commands,
            next_id: AtomicU64::new(1),
        });
        let cancel = CancellationToken::new();

        drop(UnregisterGuard {
            dispatcher: Arc::clone(&dispatcher),
            channel: "chan".to_string(),
            id: 7,
            cancel: cancel.clone(),
        });
        match command_rx.try_recv() {
            Ok(Command::Unregister { channel, id }) => {
                assert_eq!(channel, "chan");
                assert_eq!(id, 7);
            }
            _ => panic!("expected an unregister command"),
        }

        cancel.cancel();
        drop(UnregisterGuard {
            dispatcher,
            channel: "chan".to_string(),
            id: 8,
            cancel,
        });
        assert!(command_rx.try_recv().is_err());
    }
}
