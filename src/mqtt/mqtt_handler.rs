//! rumqttc-backed client.
//!
//! rumqttc hands requests to its event loop without reporting when the broker
//! answers. The handler task closes that gap: every request is queued in call
//! order, bound to its packet id when the matching `Outgoing` event shows up,
//! and resolved by the acknowledgement carrying that id.
//!
//! ```text
//! RumqttHandle ──request──> AsyncClient ──> EventLoop
//!      │ queue                                   │ Outgoing(pkid) / Incoming(ack)
//!      └────────> PendingRequests <── MqttHandler┘──> ClientEvent feed
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubAck, SubscribeReasonCode,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::client::{ClientEvent, ClientHandle, Connector, EventReceiver, EventSender};
use super::config::{MqttConfig, Protocol};
use super::error::ClientError;
use super::types::{PublishOptions, QoS, SubscribeOptions, SubscriptionGrant};

/// How long a graceful `end` waits for the DISCONNECT to be written.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Ack = oneshot::Sender<Result<(), ClientError>>;
type GrantReply = oneshot::Sender<Result<Vec<SubscriptionGrant>, ClientError>>;

struct PendingSubscribe {
    topic: String,
    reply: GrantReply,
}

struct PendingPublish {
    qos: QoS,
    reply: Ack,
}

/// Requests waiting for their packet id (queued) or for their ack (keyed).
#[derive(Default)]
struct PendingRequests {
    queued_subscribes: VecDeque<PendingSubscribe>,
    subscribes: HashMap<u16, PendingSubscribe>,
    queued_unsubscribes: VecDeque<Ack>,
    unsubscribes: HashMap<u16, Ack>,
    queued_publishes: VecDeque<PendingPublish>,
    publishes: HashMap<u16, Ack>,
}

impl PendingRequests {
    fn bind_subscribe(&mut self, pkid: u16) {
        match self.queued_subscribes.pop_front() {
            Some(pending) => {
                self.subscribes.insert(pkid, pending);
            }
            None => trace!("Outgoing subscribe {} was not requested through this handle", pkid),
        }
    }

    fn resolve_subscribe(&mut self, ack: SubAck) {
        let Some(pending) = self.subscribes.remove(&ack.pkid) else {
            debug!("SubAck for unknown packet {}", ack.pkid);
            return;
        };

        let mut grants = Vec::with_capacity(ack.return_codes.len());
        for code in ack.return_codes {
            match code {
                SubscribeReasonCode::Success(qos) => {
                    grants.push(SubscriptionGrant::new(pending.topic.clone(), qos.into()))
                }
                SubscribeReasonCode::Failure => {
                    let _ = pending.reply.send(Err(ClientError::Rejected(format!(
                        "subscription to {} refused",
                        pending.topic
                    ))));
                    return;
                }
            }
        }
        let _ = pending.reply.send(Ok(grants));
    }

    fn bind_unsubscribe(&mut self, pkid: u16) {
        if let Some(reply) = self.queued_unsubscribes.pop_front() {
            self.unsubscribes.insert(pkid, reply);
        }
    }

    fn resolve_unsubscribe(&mut self, pkid: u16) {
        if let Some(reply) = self.unsubscribes.remove(&pkid) {
            let _ = reply.send(Ok(()));
        }
    }

    fn bind_publish(&mut self, pkid: u16) {
        // retransmission of a publish that is already waiting for its ack
        if pkid != 0 && self.publishes.contains_key(&pkid) {
            trace!("Retransmitted publish {}", pkid);
            return;
        }
        let Some(pending) = self.queued_publishes.pop_front() else {
            return;
        };
        if pending.qos == QoS::AtMostOnce {
            let _ = pending.reply.send(Ok(()));
        } else {
            self.publishes.insert(pkid, pending.reply);
        }
    }

    fn resolve_publish(&mut self, pkid: u16) {
        if let Some(reply) = self.publishes.remove(&pkid) {
            let _ = reply.send(Ok(()));
        }
    }

    /// Fails subscribe/unsubscribe requests already on the wire. Publishes are
    /// kept; rumqttc retransmits them after reconnecting. Queued requests are
    /// still in rumqttc's request channel and get sent later.
    fn fail_sent(&mut self) {
        for (_, pending) in self.subscribes.drain() {
            let _ = pending.reply.send(Err(ClientError::Closed));
        }
        for (_, reply) in self.unsubscribes.drain() {
            let _ = reply.send(Err(ClientError::Closed));
        }
    }

    /// Fails every request, queued or sent. Called once the event loop is gone.
    fn fail_all(&mut self) {
        self.fail_sent();
        for pending in self.queued_subscribes.drain(..) {
            let _ = pending.reply.send(Err(ClientError::Closed));
        }
        for reply in self.queued_unsubscribes.drain(..) {
            let _ = reply.send(Err(ClientError::Closed));
        }
        for pending in self.queued_publishes.drain(..) {
            let _ = pending.reply.send(Err(ClientError::Closed));
        }
        for (_, reply) in self.publishes.drain() {
            let _ = reply.send(Err(ClientError::Closed));
        }
    }
}

/// Builds rumqttc options from the service configuration.
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, ClientError> {
    if config.host.trim().is_empty() {
        return Err(ClientError::InvalidConfig("host must not be empty".to_string()));
    }

    let client_id = config.client_id();
    let mut options = match config.protocol {
        Protocol::Mqtt => MqttOptions::new(client_id, config.host.clone(), config.port),
        Protocol::Mqtts => {
            let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
            options.set_transport(Transport::tls_with_default_config());
            options
        }
        // websocket transports take the full URL as host
        Protocol::Ws => {
            let mut options = MqttOptions::new(client_id, config.broker_url(), config.port);
            options.set_transport(Transport::Ws);
            options
        }
        Protocol::Wss => {
            let mut options = MqttOptions::new(client_id, config.broker_url(), config.port);
            options.set_transport(Transport::wss_with_default_config());
            options
        }
    };

    // very short keep-alive intervals are clamped
    let keep_alive = config.keep_alive().max(Duration::from_secs(5));
    options
        .set_keep_alive(keep_alive)
        .set_clean_session(config.clean_session);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    Ok(options)
}

struct MqttHandler {
    event_loop: EventLoop,
    events: EventSender,
    pending: Arc<Mutex<PendingRequests>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
}

impl MqttHandler {
    async fn run(mut self) {
        info!("MQTT event loop started");
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(packet)) => self.handle_incoming(packet),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnect sent, stopping event loop");
                    break;
                }
                Ok(Event::Outgoing(outgoing)) => self.handle_outgoing(outgoing),
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    error!("MQTT event loop error: {}", e);
                    self.mark_offline();

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {
                            debug!("Reconnecting to broker");
                        }
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        let pending = self.pending.clone();
        // requests sent after this point fail on the closed request channel
        drop(self);
        pending.lock().fail_all();
        info!("MQTT event loop stopped");
    }

    fn handle_incoming(&mut self, packet: Packet) {
        match packet {
            Packet::ConnAck(_) => {
                info!("Connected to MQTT broker");
                self.connected.store(true, Ordering::SeqCst);
                let _ = self.events.send(ClientEvent::Connect);
            }
            Packet::Publish(publish) => {
                trace!("Received message on {}", publish.topic);
                let _ = self.events.send(ClientEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Packet::SubAck(ack) => self.pending.lock().resolve_subscribe(ack),
            Packet::UnsubAck(ack) => self.pending.lock().resolve_unsubscribe(ack.pkid),
            Packet::PubAck(ack) => self.pending.lock().resolve_publish(ack.pkid),
            Packet::PubComp(ack) => self.pending.lock().resolve_publish(ack.pkid),
            Packet::Disconnect => {
                warn!("Broker closed the session");
                self.mark_offline();
            }
            _ => {}
        }
    }

    fn handle_outgoing(&mut self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Subscribe(pkid) => self.pending.lock().bind_subscribe(pkid),
            Outgoing::Unsubscribe(pkid) => self.pending.lock().bind_unsubscribe(pkid),
            Outgoing::Publish(pkid) => self.pending.lock().bind_publish(pkid),
            _ => {}
        }
    }

    fn mark_offline(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().fail_sent();
        let _ = self.events.send(ClientEvent::Offline);
    }
}

/// Handle to a rumqttc connection.
pub struct RumqttHandle {
    client: AsyncClient,
    pending: Arc<Mutex<PendingRequests>>,
    connected: Arc<AtomicBool>,
    // keeps queue order identical to rumqttc's request order
    request_order: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttHandle {
    async fn join_task(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("MQTT event loop task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for RumqttHandle {
    fn drop(&mut self) {
        // the event loop would otherwise keep reconnecting on its own
        self.shutdown.cancel();
    }
}

#[async_trait]
impl ClientHandle for RumqttHandle {
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<SubscriptionGrant>, ClientError> {
        let (reply, answer) = oneshot::channel();
        {
            let _order = self.request_order.lock().await;
            self.pending.lock().queued_subscribes.push_back(PendingSubscribe {
                topic: topic.to_string(),
                reply,
            });
            if let Err(e) = self
                .client
                .subscribe(topic, options.requested_qos().into())
                .await
            {
                self.pending.lock().queued_subscribes.pop_back();
                return Err(e.into());
            }
        }
        answer.await.map_err(|_| ClientError::Closed)?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        let (reply, answer) = oneshot::channel();
        {
            let _order = self.request_order.lock().await;
            self.pending.lock().queued_unsubscribes.push_back(reply);
            if let Err(e) = self.client.unsubscribe(topic).await {
                self.pending.lock().queued_unsubscribes.pop_back();
                return Err(e.into());
            }
        }
        answer.await.map_err(|_| ClientError::Closed)?
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), ClientError> {
        let (reply, answer) = oneshot::channel();
        {
            let _order = self.request_order.lock().await;
            self.pending.lock().queued_publishes.push_back(PendingPublish {
                qos: options.qos,
                reply,
            });
            if let Err(e) = self
                .client
                .publish(topic, options.qos.into(), options.retain, payload)
                .await
            {
                self.pending.lock().queued_publishes.pop_back();
                return Err(e.into());
            }
        }
        answer.await.map_err(|_| ClientError::Closed)?
    }

    async fn end(&self, force: bool) -> Result<(), ClientError> {
        if !force {
            match self.client.disconnect().await {
                Ok(()) => {
                    let graceful = tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, self.join_task()).await;
                    if graceful.is_err() {
                        warn!("Graceful disconnect timed out, forcing close");
                    }
                }
                Err(e) => warn!("Could not request graceful disconnect: {}", e),
            }
        }
        self.shutdown.cancel();
        self.join_task().await;
        // a detached event loop may still be winding down
        self.pending.lock().fail_all();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Opens rumqttc connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttConnector;

impl Connector for RumqttConnector {
    type Handle = RumqttHandle;

    fn connect(&self, config: &MqttConfig) -> Result<(RumqttHandle, EventReceiver), ClientError> {
        let options = mqtt_options(config)?;
        let (client, event_loop) = AsyncClient::new(options, config.request_capacity.max(1));
        let (events, receiver) = mpsc::unbounded_channel();

        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let handler = MqttHandler {
            event_loop,
            events,
            pending: pending.clone(),
            connected: connected.clone(),
            shutdown: shutdown.clone(),
            reconnect_delay: config.reconnect_delay(),
        };
        let task = tokio::spawn(handler.run());
        debug!("Spawned MQTT event loop for {}", config.broker_url());

        Ok((
            RumqttHandle {
                client,
                pending,
                connected,
                request_order: tokio::sync::Mutex::new(()),
                shutdown,
                task: Mutex::new(Some(task)),
            },
            receiver,
        ))
    }
}
