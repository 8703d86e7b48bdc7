//! Event-bus websocket client.
//!
//! A single long-lived connection carries every in-flight subscription. The
//! client task owns the socket and all subscription bookkeeping; the rest of
//! the process talks to it through a cheaply cloneable [`EventBusHandle`].
//! Decoded JSON frames are pushed to the correlator over an unbounded channel.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

use super::config::EventBusConfig;
use crate::metrics;

/// Control commands accepted by the client task.
#[derive(Debug)]
pub enum BusCommand {
    /// Issue `subscribe: {topic}` and track it for replay on reconnect.
    Subscribe(String),
    /// Issue `unsubscribe: {topic}` and drop all tracking.
    Unsubscribe(String),
    /// Issue `ack: {topic}`.
    Ack(String),
    /// A result for this topic was delivered; stop replaying it.
    Delivered(String),
    /// Close the connection and stop the client.
    Close,
}

/// Error talking to the client task.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus client has shut down")]
    Closed,
}

/// Handle used by the rest of the process to drive the client task.
#[derive(Clone)]
pub struct EventBusHandle {
    commands: mpsc::UnboundedSender<BusCommand>,
    connected: Arc<AtomicBool>,
}

impl EventBusHandle {
    pub fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.command(BusCommand::Subscribe(topic.to_string()))
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.command(BusCommand::Unsubscribe(topic.to_string()))
    }

    pub fn ack(&self, topic: &str) -> Result<(), BusError> {
        self.command(BusCommand::Ack(topic.to_string()))
    }

    pub fn delivered(&self, topic: &str) -> Result<(), BusError> {
        self.command(BusCommand::Delivered(topic.to_string()))
    }

    /// Close the connection and stop the client task.
    pub fn close(&self) {
        let _ = self.commands.send(BusCommand::Close);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn command(&self, command: BusCommand) -> Result<(), BusError> {
        self.commands.send(command).map_err(|_| BusError::Closed)
    }

    /// Handle wired to a bare channel, for driving the correlator in tests.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (
        Self,
        mpsc::UnboundedReceiver<BusCommand>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        (
            Self {
                commands: tx,
                connected: connected.clone(),
            },
            rx,
            connected,
        )
    }
}

/// Subscription bookkeeping, mutated only by the client task.
#[derive(Default)]
pub(crate) struct SubscriptionState {
    /// Topics currently believed subscribed on the bus.
    active: HashSet<String>,
    /// Topic -> timestamp of the last (re)subscribe, replayed on reconnect.
    pending: HashMap<String, Instant>,
}

impl SubscriptionState {
    fn record_subscribe(&mut self, topic: &str, now: Instant) {
        self.active.insert(topic.to_string());
        self.pending.insert(topic.to_string(), now);
    }

    fn remove(&mut self, topic: &str) {
        self.active.remove(topic);
        self.pending.remove(topic);
    }

    fn mark_delivered(&mut self, topic: &str) {
        self.pending.remove(topic);
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drop pending entries at or past `expiry`, restamp the rest, and return
    /// them for replay.
    fn resubscriptions(&mut self, now: Instant, expiry: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, stamped)| now.duration_since(**stamped) >= expiry)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in &expired {
            self.pending.remove(topic);
            self.active.remove(topic);
        }

        let mut topics: Vec<String> = self.pending.keys().cloned().collect();
        topics.sort();
        for topic in &topics {
            self.pending.insert(topic.clone(), now);
        }
        topics
    }
}

/// How an inbound text frame should be treated.
#[derive(Debug)]
enum Frame {
    /// Valid JSON, to be handed to the correlator.
    Message(Value),
    /// Looked like JSON but did not parse.
    Malformed(serde_json::Error),
    /// Non-JSON chatter, ignored.
    Chatter,
}

fn classify_frame(text: &str) -> Frame {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Frame::Message(value),
        Err(e) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                Frame::Malformed(e)
            } else {
                Frame::Chatter
            }
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The client task. Owns the socket, the command receiver, and the
/// subscription bookkeeping; everything here runs on one task.
pub struct EventBusClient {
    config: EventBusConfig,
    commands: mpsc::UnboundedReceiver<BusCommand>,
    messages: mpsc::UnboundedSender<Value>,
    connected: Arc<AtomicBool>,
    state: SubscriptionState,
    closing: bool,
}

impl EventBusClient {
    /// Create the client plus its handle and the decoded-frame stream.
    pub fn new(
        config: EventBusConfig,
    ) -> (Self, EventBusHandle, mpsc::UnboundedReceiver<Value>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let client = Self {
            config,
            commands: command_rx,
            messages: message_tx,
            connected: connected.clone(),
            state: SubscriptionState::default(),
            closing: false,
        };
        let handle = EventBusHandle {
            commands: command_tx,
            connected,
        };
        (client, handle, message_rx)
    }

    /// Connect, serve, and reconnect until closed or out of attempts.
    pub async fn run(mut self) {
        let mut attempts: u32 = 0;
        loop {
            if self.closing {
                break;
            }

            info!(url = %self.config.websocket_url, "connecting to event bus");
            match connect_async(self.config.websocket_url.as_str()).await {
                Ok((ws, _)) => {
                    attempts = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    metrics::set_bus_connected(true);
                    info!("event bus connected");
                    self.run_connection(ws).await;
                    self.connected.store(false, Ordering::SeqCst);
                    metrics::set_bus_connected(false);
                    info!("event bus disconnected");
                }
                Err(e) => {
                    warn!(error = %e, "event bus connection failed");
                }
            }

            if self.closing {
                break;
            }

            attempts += 1;
            metrics::BUS_RECONNECTS_TOTAL.inc();
            if attempts >= self.config.max_reconnect_attempts {
                error!(
                    attempts,
                    "event bus reconnect limit reached; staying disconnected"
                );
                self.park().await;
                break;
            }

            debug!(attempt = attempts, "scheduling event bus reconnect");
            self.sleep_and_drain(self.config.reconnect_interval).await;
        }
        debug!("event bus client stopped");
    }

    /// Serve one open connection until it drops or the client is closed.
    async fn run_connection(&mut self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();

        // Replay unexpired pending subscriptions before anything else so
        // in-flight waiters survive the reconnect.
        let replay = self
            .state
            .resubscriptions(Instant::now(), self.config.subscription_expiry);
        for topic in replay {
            debug!(topic = %topic, "replaying subscription");
            if sink
                .send(WsMessage::Text(format!("subscribe: {topic}")))
                .await
                .is_err()
            {
                warn!("event bus write failed during replay");
                return;
            }
        }

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.reset();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        trace!("event bus pong");
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "event bus read failed");
                        return;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(BusCommand::Close) | None => {
                        self.closing = true;
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return;
                    }
                    Some(command) => {
                        if let Some(frame) = self.apply_command(command) {
                            if sink.send(WsMessage::Text(frame)).await.is_err() {
                                warn!("event bus write failed");
                                return;
                            }
                        }
                    }
                },
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Update bookkeeping; return the control frame to send, if any.
    fn apply_command(&mut self, command: BusCommand) -> Option<String> {
        match command {
            BusCommand::Subscribe(topic) => {
                self.state.record_subscribe(&topic, Instant::now());
                Some(format!("subscribe: {topic}"))
            }
            BusCommand::Unsubscribe(topic) => {
                self.state.remove(&topic);
                Some(format!("unsubscribe: {topic}"))
            }
            BusCommand::Ack(topic) => Some(format!("ack: {topic}")),
            BusCommand::Delivered(topic) => {
                self.state.mark_delivered(&topic);
                None
            }
            BusCommand::Close => None,
        }
    }

    fn handle_frame(&self, text: &str) {
        match classify_frame(text) {
            Frame::Message(value) => {
                let _ = self.messages.send(value);
            }
            Frame::Malformed(e) => {
                warn!(error = %e, "dropping malformed event bus frame");
            }
            Frame::Chatter => {
                trace!(frame = %text, "ignoring non-JSON event bus frame");
            }
        }
    }

    /// Wait out the reconnect interval while still applying bookkeeping
    /// commands, so subscriptions issued while offline replay later.
    async fn sleep_and_drain(&mut self, period: Duration) {
        let deadline = tokio::time::sleep(period);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return,
                command = self.commands.recv() => match command {
                    Some(BusCommand::Close) | None => {
                        self.closing = true;
                        return;
                    }
                    Some(command) => {
                        let _ = self.apply_command(command);
                    }
                }
            }
        }
    }

    /// Permanently disconnected: keep draining commands so callers do not
    /// block, until the process closes the bus.
    async fn park(&mut self) {
        while let Some(command) = self.commands.recv().await {
            if matches!(command, BusCommand::Close) {
                return;
            }
            let _ = self.apply_command(command);
        }
    }
}
