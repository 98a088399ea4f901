//! Bidirectional WebSocket message relay between a caller and a backend.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::{sync::mpsc, task::AbortHandle};
use tokio_tungstenite::tungstenite::{
    Error as WsError, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, error};

use crate::error::{RelayError, is_closed};

/// Largest close reason that fits a control frame next to the status code.
pub const MAX_CLOSE_REASON: usize = 123;

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const TO_CLIENT: &str = "backend->client";
const TO_BACKEND: &str = "client->backend";

/// How one relay direction ended.
#[derive(Debug)]
enum Outcome {
    /// A close frame or an already-closed connection; `code` is the peer's.
    Closed(Option<CloseCode>),
    Failed(RelayError),
}

impl Outcome {
    #[must_use]
    const fn is_abnormal(&self) -> bool {
        match self {
            Self::Closed(_) => false,
            Self::Failed(err) => !err.is_normal_closure(),
        }
    }
}

/// Copies messages both ways until each direction has ended.
///
/// Once one direction reports, the other gets `close_grace` to finish
/// (`None` waits as long as it takes) before it is aborted. Both connections
/// are closed on return.
#[tracing::instrument(skip_all)]
pub async fn relay<C, B>(client: C, backend: B, close_grace: Option<Duration>)
where
    C: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static,
    B: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static,
{
    let (client_sink, client_stream) = client.split();
    let (backend_sink, backend_stream) = backend.split();

    let (client_tx, mut client_rx) = mpsc::channel(1);
    let (backend_tx, mut backend_rx) = mpsc::channel(1);

    let to_client = tokio::spawn(replicate(backend_stream, client_sink, client_tx));
    let to_backend = tokio::spawn(replicate(client_stream, backend_sink, backend_tx));

    debug!("Relay started");

    let first = tokio::select! {
        Some(outcome) = client_rx.recv() => Some((TO_CLIENT, outcome)),
        Some(outcome) = backend_rx.recv() => Some((TO_BACKEND, outcome)),
        else => None,
    };

    match first {
        Some((direction, outcome)) => {
            log_outcome(direction, &outcome);
            let (rx, task, direction) = if direction == TO_CLIENT {
                (&mut backend_rx, to_backend.abort_handle(), TO_BACKEND)
            } else {
                (&mut client_rx, to_client.abort_handle(), TO_CLIENT)
            };
            if let Some(outcome) = await_second(rx, task, close_grace, direction).await {
                log_outcome(direction, &outcome);
            }
        }
        None => error!("Relay tasks ended without reporting"),
    }

    // The client connection is closed whichever side ended the session.
    if let Ok(mut sink) = to_client.await {
        close_sink(&mut sink, "client").await;
    }
    if let Ok(mut sink) = to_backend.await {
        close_sink(&mut sink, "backend").await;
    }

    debug!("Relay finished");
}

async fn await_second(
    rx: &mut mpsc::Receiver<Outcome>,
    task: AbortHandle,
    close_grace: Option<Duration>,
    direction: &'static str,
) -> Option<Outcome> {
    let Some(grace) = close_grace else {
        return rx.recv().await;
    };
    if let Ok(outcome) = tokio::time::timeout(grace, rx.recv()).await {
        outcome
    } else {
        debug!(direction, grace = ?grace, "Direction still open after close grace; aborting");
        task.abort();
        None
    }
}

/// Forwards `src` into `dst` until a terminal condition, reports it on
/// `report` and hands `dst` back for teardown.
async fn replicate<S, D>(mut src: S, mut dst: D, report: mpsc::Sender<Outcome>) -> D
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    D: Sink<Message, Error = WsError> + Unpin,
{
    let outcome = loop {
        match src.next().await {
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|frame| frame.code);
                send_close(&mut dst, frame).await;
                break Outcome::Closed(code);
            }
            Some(Ok(message)) => {
                if let Err(e) = dst.send(message).await {
                    break Outcome::Failed(RelayError::Write(e));
                }
            }
            Some(Err(e)) if is_closed(&e) => {
                send_close(&mut dst, Some(normal_close())).await;
                break Outcome::Closed(None);
            }
            None => {
                send_close(&mut dst, Some(normal_close())).await;
                break Outcome::Closed(None);
            }
            Some(Err(e)) => {
                send_close(&mut dst, Some(abnormal_close(&e))).await;
                break Outcome::Failed(RelayError::Read(e));
            }
        }
    };

    let _ = report.send(outcome).await;
    dst
}

async fn send_close<D>(dst: &mut D, frame: Option<CloseFrame>)
where
    D: Sink<Message, Error = WsError> + Unpin,
{
    if let Err(e) = dst.send(Message::Close(frame)).await {
        if !is_closed(&e) {
            debug!(error = %e, "Close frame not delivered");
        }
    }
}

async fn close_sink<D>(sink: &mut D, side: &'static str)
where
    D: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Err(e)) if !is_closed(&e) => debug!(side, error = %e, "Failed to close connection"),
        Err(_) => debug!(side, "Timed out closing connection"),
        _ => {}
    }
}

fn normal_close() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }
}

fn abnormal_close(err: &WsError) -> CloseFrame {
    let reason = err.to_string();
    CloseFrame {
        code: CloseCode::Abnormal,
        reason: truncate_reason(&reason).to_owned().into(),
    }
}

/// Cuts `reason` to [`MAX_CLOSE_REASON`] bytes on a char boundary.
#[must_use]
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn log_outcome(direction: &'static str, outcome: &Outcome) {
    match outcome {
        Outcome::Failed(err) if outcome.is_abnormal() => {
            error!(direction, error = %err, "Relay direction failed");
        }
        Outcome::Failed(err) => debug!(direction, error = %err, "Relay direction closed"),
        Outcome::Closed(code) => debug!(direction, code = ?code, "Relay direction closed"),
    }
}
