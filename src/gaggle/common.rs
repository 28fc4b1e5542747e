//! Messages exchanged between a manager and its workers.
//!
//! Everything travels as JSON text frames over a WebSocket. A worker opens a connection
//! and introduces itself with a [`Hello`]:
//!
//!  - `Hello::Subscribe` keeps the connection open and the manager streams [`Event`]s
//!    down it until it sends [`Event::Disconnect`] or the connection drops.
//!  - `Hello::Submit` carries one statistics snapshot and is answered by exactly one
//!    [`SubmitResponse`] before the connection is closed.
//!
//! Event and submit result kinds are encoded as small integers.

use futures::{Sink, SinkExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::descriptor::Descriptor;
use crate::statistics::snapshot::GroupSnapshot;
use crate::SkeinError;

/// Constant defining the default port a manager listens on.
pub(crate) const DEFAULT_GAGGLE_PORT: &str = "5115";

/// Constant defining the default host a manager listens on and workers connect to.
pub(crate) const DEFAULT_GAGGLE_HOST: &str = "127.0.0.1";

/// Identifies one round of statistics collection.
pub type BatchId = u32;

/// Something the manager tells a subscribed worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub enum Event {
    /// Keep-alive, ignored by workers.
    Ping,
    /// Always the first event on a new subscription.
    Connected,
    /// The manager is closing this subscription.
    Disconnect,
    PlanStarted { plan_name: String },
    PlanFinished,
    PlanInterrupted,
    /// Move to this worker's share of a new stage.
    NextStageStarted {
        strategy: Descriptor,
        timer: Descriptor,
    },
    /// Submit a statistics snapshot for this batch.
    StatsAggregate { batch_id: BatchId },
}

impl Event {
    /// Numeric kind of this event on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Event::Ping => 1,
            Event::Connected => 2,
            Event::Disconnect => 3,
            Event::PlanStarted { .. } => 4,
            Event::PlanFinished => 5,
            Event::PlanInterrupted => 6,
            Event::NextStageStarted { .. } => 7,
            Event::StatsAggregate { .. } => 8,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::Ping => write!(f, "ping"),
            Event::Connected => write!(f, "connected"),
            Event::Disconnect => write!(f, "disconnect"),
            Event::PlanStarted { plan_name } => write!(f, "plan-started({})", plan_name),
            Event::PlanFinished => write!(f, "plan-finished"),
            Event::PlanInterrupted => write!(f, "plan-interrupted"),
            Event::NextStageStarted { strategy, timer } => {
                write!(f, "next-stage-started({}, {})", strategy.kind, timer.kind)
            }
            Event::StatsAggregate { batch_id } => write!(f, "stats-aggregate({})", batch_id),
        }
    }
}

// Flat representation carrying the numeric event kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plan_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    strategy: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timer: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    batch_id: Option<BatchId>,
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        let kind = event.code();
        match event {
            Event::PlanStarted { plan_name } => WireEvent {
                kind,
                plan_name: Some(plan_name),
                ..Default::default()
            },
            Event::NextStageStarted { strategy, timer } => WireEvent {
                kind,
                strategy: Some(strategy),
                timer: Some(timer),
                ..Default::default()
            },
            Event::StatsAggregate { batch_id } => WireEvent {
                kind,
                batch_id: Some(batch_id),
                ..Default::default()
            },
            _ => WireEvent {
                kind,
                ..Default::default()
            },
        }
    }
}

fn missing(field: &str, kind: u8) -> String {
    format!("event type {} requires {}", kind, field)
}

impl TryFrom<WireEvent> for Event {
    type Error = String;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        match kind {
            1 => Ok(Event::Ping),
            2 => Ok(Event::Connected),
            3 => Ok(Event::Disconnect),
            4 => Ok(Event::PlanStarted {
                plan_name: wire.plan_name.ok_or_else(|| missing("plan_name", kind))?,
            }),
            5 => Ok(Event::PlanFinished),
            6 => Ok(Event::PlanInterrupted),
            7 => Ok(Event::NextStageStarted {
                strategy: wire.strategy.ok_or_else(|| missing("strategy", kind))?,
                timer: wire.timer.ok_or_else(|| missing("timer", kind))?,
            }),
            8 => Ok(Event::StatsAggregate {
                batch_id: wire.batch_id.ok_or_else(|| missing("batch_id", kind))?,
            }),
            kind => Err(format!("unknown event type {}", kind)),
        }
    }
}

/// The first message a worker sends on a new connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hello", rename_all = "snake_case")]
pub enum Hello {
    Subscribe {
        worker_id: String,
        #[serde(default)]
        extras: BTreeMap<String, String>,
    },
    Submit(SubmitRequest),
}

/// One worker's statistics for one batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub worker_id: String,
    pub batch_id: BatchId,
    pub stats: GroupSnapshot,
}

/// Outcome of a [`SubmitRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum SubmitResult {
    Unknown,
    Accepted,
    /// No subscribed worker has this id.
    UnregisteredWorker,
    /// The batch is unknown, expired, or was already submitted by this worker.
    BatchRejected,
    /// The snapshot could not be rebuilt into statistics.
    BadSubmission,
}

impl From<u8> for SubmitResult {
    fn from(code: u8) -> Self {
        match code {
            1 => SubmitResult::Accepted,
            2 => SubmitResult::UnregisteredWorker,
            3 => SubmitResult::BatchRejected,
            4 => SubmitResult::BadSubmission,
            _ => SubmitResult::Unknown,
        }
    }
}

impl From<SubmitResult> for u8 {
    fn from(result: SubmitResult) -> Self {
        match result {
            SubmitResult::Unknown => 0,
            SubmitResult::Accepted => 1,
            SubmitResult::UnregisteredWorker => 2,
            SubmitResult::BatchRejected => 3,
            SubmitResult::BadSubmission => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub result: SubmitResult,
}

/// Build the WebSocket url workers use to reach a manager.
pub(crate) fn manager_url(host: &str, port: u16) -> Result<Url, SkeinError> {
    Ok(Url::parse(&format!("ws://{}:{}", host, port))?)
}

/// Serialize `value` and send it as one text frame.
pub(crate) async fn send_json<S, T>(sink: &mut S, value: &T) -> Result<(), SkeinError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)?;
    sink.send(Message::text(json)).await?;
    Ok(())
}

/// Decode a data frame. Control frames yield `None`, a close frame is an error.
pub(crate) fn decode_message<T: DeserializeOwned>(message: &Message) -> Result<Option<T>, SkeinError> {
    if message.is_close() {
        return Err(SkeinError::Protocol {
            detail: "connection closed by peer".to_string(),
        });
    }
    if !(message.is_text() || message.is_binary()) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(message.to_text()?)?))
}
