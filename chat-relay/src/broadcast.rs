//! Message formatting and fan-out.
//!
//! A broadcast writes one rendered line to every client in a registry
//! snapshot, minus an optional excluded client. Failed writes are only
//! collected during the pass; once the pass is over each failed client is
//! removed and a "left the chat" notice is queued. Queued notices go through
//! the same loop instead of recursing, and since a client can only be removed
//! once the queue always drains.

use std::{collections::VecDeque, sync::Arc};

use chrono::{Local, NaiveTime};
use futures::future::join_all;
use tracing::{debug, info};

use crate::{
    framing::Framing,
    registry::{ClientId, Registry},
};

/// The private greeting a client receives right after its handshake.
pub fn welcome_line(nickname: &str) -> String {
    format!("Welcome to the chat, {nickname}!")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    timestamp: NaiveTime,
    sender: Option<String>,
    body: String,
}

impl BroadcastMessage {
    /// Server-authored text with no sender attribution.
    pub fn system(body: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().time(),
            sender: None,
            body: body.into(),
        }
    }

    pub fn chat(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().time(),
            sender: Some(sender.into()),
            body: body.into(),
        }
    }

    pub fn joined(nickname: &str) -> Self {
        Self::system(format!("{nickname} joined the chat"))
    }

    pub fn left(nickname: &str) -> Self {
        Self::system(format!("{nickname} left the chat"))
    }

    pub fn at(mut self, timestamp: NaiveTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Renders the single line that goes on the wire.
    pub fn render(&self) -> String {
        let timestamp = self.timestamp.format("%H:%M:%S");
        match &self.sender {
            Some(sender) => format!("[{timestamp}] {sender}: {}", self.body),
            None => format!("[{timestamp}] {}", self.body),
        }
    }
}

/// Outcome of one [`Broadcaster::broadcast`] call, including any follow-up
/// departure notices it triggered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    /// Successful writes across every pass.
    pub delivered: usize,
    /// Nicknames of clients removed because a write to them failed.
    pub evicted: Vec<String>,
}

pub struct Broadcaster {
    registry: Arc<Registry>,
    framing: Framing,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, framing: Framing) -> Self {
        Self { registry, framing }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Broadcasts text sent by a registered client to everyone else.
    ///
    /// The sender's nickname comes from the registry. If the sender has already
    /// been removed the message is dropped.
    pub async fn broadcast_from(&self, origin: ClientId, text: impl Into<String>) -> FanoutReport {
        let Some(nickname) = self.registry.lookup(origin).await else {
            debug!(client = origin, "dropping message from unregistered client");
            return FanoutReport::default();
        };
        self.broadcast(BroadcastMessage::chat(nickname, text), Some(origin))
            .await
    }

    /// Writes `message` to every registered client except `exclude`.
    pub async fn broadcast(
        &self,
        message: BroadcastMessage,
        exclude: Option<ClientId>,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        let mut pending = VecDeque::from([(message, exclude)]);

        while let Some((message, exclude)) = pending.pop_front() {
            let failed = self.fan_out(&message, exclude, &mut report).await;

            for id in failed {
                // Someone else (the client's own session, or an earlier pass)
                // may already have removed it.
                let Some(entry) = self.registry.remove(id).await else {
                    continue;
                };
                info!(nickname = %entry.nickname, "evicting client after failed write");
                entry.handle.close().await;
                pending.push_back((BroadcastMessage::left(&entry.nickname), None));
                report.evicted.push(entry.nickname);
            }
        }

        report
    }

    /// One pass over a registry snapshot. Returns the ids whose write failed.
    async fn fan_out(
        &self,
        message: &BroadcastMessage,
        exclude: Option<ClientId>,
        report: &mut FanoutReport,
    ) -> Vec<ClientId> {
        let line = message.render();
        info!("broadcasting: {line}");
        let payload = self.framing.encode(&line);

        let recipients: Vec<_> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|entry| Some(entry.handle.id()) != exclude)
            .collect();

        let results = join_all(
            recipients
                .iter()
                .map(|entry| entry.handle.send(&payload)),
        )
        .await;

        let mut failed = Vec::new();
        for (entry, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(nickname = %entry.nickname, ?err, "failed to deliver message");
                    failed.push(entry.handle.id());
                }
            }
        }
        failed
    }
}
