//! Delivery of the pairing handshake to whoever created the session.

use {
    serde::{Deserialize, Serialize},
    switchboard_common::SessionStatus,
    tokio::sync::{mpsc, oneshot},
};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeMode {
    /// Resolve the create call with the first QR code (or the open).
    #[default]
    SingleShot,
    /// Push every connection tick to a long-lived stream.
    Stream,
}

/// One message on a handshake stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Qr { code: String, attempt: u32 },
    Status { status: SessionStatus },
    Open,
    Failed { reason: String },
    QrLimit,
}

impl HandshakeMessage {
    /// Event name used when the stream is rendered as SSE.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::Status { .. } => "status",
            Self::Open => "open",
            Self::Failed { .. } => "failed",
            Self::QrLimit => "qr_limit",
        }
    }
}

/// Answer to a single-shot create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Qr(String),
    Open,
}

pub(crate) type ReplyTx = oneshot::Sender<Result<HandshakeReply, SessionError>>;

/// Why a pending handshake gave up on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abort {
    QrLimit,
    ConsumerGone,
}

impl Abort {
    pub(crate) fn reason(self) -> &'static str {
        match self {
            Self::QrLimit => "qr generation limit reached",
            Self::ConsumerGone => "handshake consumer disconnected",
        }
    }
}

pub(crate) struct StreamState {
    tx: mpsc::UnboundedSender<HandshakeMessage>,
    qr_count: u32,
    max_qr: u32,
}

/// Pending handshake of a session. Once resolved it becomes `Unattended`
/// and every later tick is ignored.
pub(crate) enum Handshake {
    Unattended,
    SingleShot(ReplyTx),
    Stream(StreamState),
}

impl Handshake {
    pub(crate) fn single_shot() -> (Self, oneshot::Receiver<Result<HandshakeReply, SessionError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SingleShot(tx), rx)
    }

    pub(crate) fn stream(max_qr: u32) -> (Self, mpsc::UnboundedReceiver<HandshakeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::Stream(StreamState {
                tx,
                qr_count: 0,
                max_qr,
            }),
            rx,
        )
    }

    pub(crate) fn on_qr(&mut self, code: &str) -> Result<(), Abort> {
        match std::mem::replace(self, Self::Unattended) {
            Self::Unattended => Ok(()),
            Self::SingleShot(tx) => {
                let _ = tx.send(Ok(HandshakeReply::Qr(code.to_string())));
                Ok(())
            },
            Self::Stream(mut stream) => {
                stream.qr_count += 1;
                if stream.qr_count > stream.max_qr {
                    let _ = stream.tx.send(HandshakeMessage::QrLimit);
                    return Err(Abort::QrLimit);
                }
                stream
                    .tx
                    .send(HandshakeMessage::Qr {
                        code: code.to_string(),
                        attempt: stream.qr_count,
                    })
                    .map_err(|_| Abort::ConsumerGone)?;
                *self = Self::Stream(stream);
                Ok(())
            },
        }
    }

    /// Forward a status tick. Only streams care.
    pub(crate) fn on_status(&mut self, status: SessionStatus) -> Result<(), Abort> {
        if let Self::Stream(stream) = self
            && stream.tx.send(HandshakeMessage::Status { status }).is_err()
        {
            *self = Self::Unattended;
            return Err(Abort::ConsumerGone);
        }
        Ok(())
    }

    /// The connection opened. Resolves the caller and closes any stream.
    pub(crate) fn on_open(&mut self) {
        match std::mem::replace(self, Self::Unattended) {
            Self::Unattended => {},
            Self::SingleShot(tx) => {
                let _ = tx.send(Ok(HandshakeReply::Open));
            },
            Self::Stream(stream) => {
                let _ = stream.tx.send(HandshakeMessage::Open);
            },
        }
    }

    /// The session is gone before the handshake completed.
    pub(crate) fn fail(&mut self, reason: &str) {
        match std::mem::replace(self, Self::Unattended) {
            Self::Unattended => {},
            Self::SingleShot(tx) => {
                let _ = tx.send(Err(SessionError::HandshakeFailed(reason.to_string())));
            },
            Self::Stream(stream) => {
                let _ = stream.tx.send(HandshakeMessage::Failed {
                    reason: reason.to_string(),
                });
            },
        }
    }
}
