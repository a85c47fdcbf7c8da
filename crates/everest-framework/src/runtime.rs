//! Everest: the framework runtime handle of one module.
//!
//! The handle owns the module's broker connection and its dispatch tables.
//! [`Everest::spawn_main_loop_thread`] starts the single processing thread
//! that receives every frame addressed to the module:
//!
//! - variable updates and the ready hook run inline on that thread, in
//!   arrival order, so one publisher's updates are never reordered;
//! - command calls are handed to a fresh handler thread each, so a handler
//!   may block on a nested [`Everest::call_cmd`] without stalling dispatch.
//!
//! Results of outgoing calls never pass through the processing thread. Each
//! call subscribes a private reply topic with its own channel and waits on
//! it, which is what makes calls from handlers (and from the processing
//! thread itself) safe. One hazard remains: code running inline on the
//! processing thread must not call a command provided by its own module.
//! That covers variable handlers and the ready handler. The call is queued
//! behind the caller itself and only returns on timeout.
//!
//! On shutdown, calls already handed to a handler thread still deliver their
//! result, and calls still queued are answered with a failure.

use crate::config::Config;
use crate::settings::RuntimeSettings;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use dashmap::{DashMap, DashSet};
use everest_types::{EverestError, EverestResult, PeerRef};
use everest_wire::{
    decode_frame, encode_message, topic, Broker, CommandCall, CommandResult, Delivery, VarUpdate,
    WireMessage, WireMessageKind,
};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Handler for incoming calls of one command.
pub type CmdHandler = Arc<dyn Fn(Value) -> EverestResult<Value> + Send + Sync>;
/// Handler for updates of one subscribed variable.
pub type VarHandler = Arc<dyn Fn(Value) + Send + Sync>;
/// Handler run once when the module becomes ready.
pub type ReadyHandler = Arc<dyn Fn() + Send + Sync>;

/// State shared between the handle, the processing thread and handler threads.
struct Shared {
    module_id: String,
    /// Broker identity of this handle; unique per process.
    client_id: String,
    prefix: String,
    endpoint: String,
    call_timeout: Option<Duration>,
    config: Arc<Config>,
    broker: RwLock<Option<Broker>>,
    inbox_tx: Sender<Delivery>,
    /// Topic → handler.
    cmd_handlers: DashMap<String, CmdHandler>,
    /// Topic → handlers, in registration order.
    var_handlers: DashMap<String, Vec<VarHandler>>,
    ready_handler: RwLock<Option<ReadyHandler>>,
    ready_fired: AtomicBool,
    ready_peers: DashSet<String>,
    var_seq: AtomicU64,
}

/// Runtime handle of one module.
pub struct Everest {
    shared: Arc<Shared>,
    inbox_rx: Receiver<Delivery>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    main_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Everest {
    /// Create a handle bound to the broker endpoint and topic prefix of
    /// `settings`. Nothing is connected until [`Everest::connect`].
    pub fn new(module_id: &str, config: Arc<Config>, settings: &RuntimeSettings) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let shared = Shared {
            module_id: module_id.to_string(),
            client_id: format!("{module_id}-{}", uuid::Uuid::new_v4()),
            prefix: settings.mqtt_everest_prefix.clone(),
            endpoint: settings.broker_endpoint(),
            call_timeout: settings.call_timeout,
            config,
            broker: RwLock::new(None),
            inbox_tx,
            cmd_handlers: DashMap::new(),
            var_handlers: DashMap::new(),
            ready_handler: RwLock::new(None),
            ready_fired: AtomicBool::new(false),
            ready_peers: DashSet::new(),
            var_seq: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            inbox_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            main_loop: Mutex::new(None),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.shared.module_id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.shared.config
    }

    /// Connect to the broker and subscribe every topic registered so far.
    pub fn connect(&self) -> EverestResult<()> {
        let shared = &self.shared;
        // Held across the subscriptions so a concurrent registration either
        // lands in the tables before we iterate or sees the broker after.
        let mut guard = shared.broker.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Ok(());
        }
        let broker = Broker::connect(&shared.endpoint);
        for entry in shared.cmd_handlers.iter() {
            broker.subscribe(entry.key(), &shared.client_id, shared.inbox_tx.clone());
        }
        for entry in shared.var_handlers.iter() {
            broker.subscribe(entry.key(), &shared.client_id, shared.inbox_tx.clone());
        }
        broker.subscribe(
            &topic::ready(&shared.prefix),
            &shared.client_id,
            shared.inbox_tx.clone(),
        );
        *guard = Some(broker);
        info!(
            module = %shared.module_id,
            endpoint = %shared.endpoint,
            "Connected to broker"
        );
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .broker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Start the processing thread. Calling it again is a no-op.
    pub fn spawn_main_loop_thread(&self) -> EverestResult<()> {
        let mut guard = self.main_loop.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let inbox = self.inbox_rx.clone();
        let shutdown = self.shutdown_rx.clone();
        let handle = thread::Builder::new()
            .name(format!("everest-{}", self.shared.module_id))
            .spawn(move || main_loop(shared, inbox, shutdown))
            .map_err(|e| EverestError::Internal(format!("cannot spawn main loop: {e}")))?;
        *guard = Some(handle);
        debug!(module = %self.shared.module_id, "Main loop started");
        Ok(())
    }

    /// Register the handler run once when the module becomes ready.
    pub fn register_on_ready_handler(&self, handler: ReadyHandler) {
        *self
            .shared
            .ready_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Declare the module ready.
    ///
    /// The processing thread runs the ready handler and only then announces
    /// the module to its peers. Before the main loop is started the request
    /// is queued.
    pub fn signal_ready(&self) -> EverestResult<()> {
        let shared = &self.shared;
        let frame = encode_message(&WireMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Ready {
                module_id: shared.module_id.clone(),
            },
        })?;
        shared
            .inbox_tx
            .send(Delivery {
                topic: shared.local_ready_topic(),
                frame,
            })
            .map_err(|_| EverestError::Internal("module inbox closed".to_string()))
    }

    /// Whether another module announced readiness on this broker.
    pub fn is_peer_ready(&self, module_id: &str) -> bool {
        self.shared.ready_peers.contains(module_id)
    }

    /// Serve calls of `name` on one of this module's implementations.
    pub fn provide_cmd(
        &self,
        implementation_id: &str,
        name: &str,
        handler: CmdHandler,
    ) -> EverestResult<()> {
        let shared = &self.shared;
        if !shared.config.provides(&shared.module_id, implementation_id)? {
            return Err(EverestError::NotFound(format!(
                "module '{}' does not provide implementation '{implementation_id}'",
                shared.module_id
            )));
        }
        let topic = topic::cmd(&shared.prefix, &shared.module_id, implementation_id, name);
        if shared.cmd_handlers.insert(topic.clone(), handler).is_some() {
            warn!(%topic, "Replaced existing command handler");
        }
        shared.subscribe_if_connected(&topic);
        debug!(%topic, "Providing command");
        Ok(())
    }

    /// Receive updates of `name` from the peer bound to a requirement slot.
    pub fn subscribe_var(&self, peer: &PeerRef, name: &str, handler: VarHandler) -> EverestResult<()> {
        let shared = &self.shared;
        let conn = shared.config.resolve_requirement(&shared.module_id, peer)?;
        let topic = topic::var(&shared.prefix, &conn.module_id, &conn.implementation_id, name);
        shared
            .var_handlers
            .entry(topic.clone())
            .or_default()
            .push(handler);
        shared.subscribe_if_connected(&topic);
        debug!(%topic, %peer, "Subscribed variable");
        Ok(())
    }

    /// Call `name` on the peer bound to a requirement slot and wait for the
    /// result.
    pub fn call_cmd(&self, peer: &PeerRef, name: &str, args: Value) -> EverestResult<Value> {
        let shared = &self.shared;
        let conn = shared
            .config
            .resolve_requirement(&shared.module_id, peer)?
            .clone();
        let broker = shared.broker()?;

        let call_id = uuid::Uuid::new_v4().to_string();
        let reply_to = topic::reply(&shared.prefix, &shared.module_id, &call_id);
        let (tx, rx) = bounded(1);
        broker.subscribe(&reply_to, &call_id, tx);

        let target = topic::cmd(&shared.prefix, &conn.module_id, &conn.implementation_id, name);
        let outcome = (|| -> EverestResult<Value> {
            let frame = encode_message(&WireMessage {
                id: call_id.clone(),
                kind: WireMessageKind::Call(CommandCall {
                    origin: shared.module_id.clone(),
                    reply_to: reply_to.clone(),
                    args,
                }),
            })?;
            broker.publish_to_listener(&target, frame)?;
            debug!(%target, %call_id, "Command call sent");

            let delivery = match shared.call_timeout {
                Some(timeout) => rx.recv_timeout(timeout).map_err(|_| {
                    EverestError::Transport(format!(
                        "no result for '{name}' from module '{}' within {timeout:?}",
                        conn.module_id
                    ))
                })?,
                None => rx
                    .recv()
                    .map_err(|_| EverestError::Transport("reply channel closed".to_string()))?,
            };
            match decode_frame(&delivery.frame)?.kind {
                WireMessageKind::Result(CommandResult {
                    error: Some(reason),
                    ..
                }) => Err(EverestError::CallFailed {
                    command: name.to_string(),
                    reason,
                }),
                WireMessageKind::Result(result) => Ok(result.retval),
                other => Err(EverestError::Transport(format!(
                    "unexpected reply to '{name}': {other:?}"
                ))),
            }
        })();
        broker.unsubscribe(&reply_to, &call_id);
        outcome
    }

    /// Publish `value` as variable `name` of one of this module's
    /// implementations.
    pub fn publish_var(&self, implementation_id: &str, name: &str, value: Value) -> EverestResult<()> {
        let shared = &self.shared;
        if !shared.config.provides(&shared.module_id, implementation_id)? {
            return Err(EverestError::NotFound(format!(
                "module '{}' does not provide implementation '{implementation_id}'",
                shared.module_id
            )));
        }
        let broker = shared.broker()?;
        let topic = topic::var(&shared.prefix, &shared.module_id, implementation_id, name);
        let frame = encode_message(&WireMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Var(VarUpdate {
                origin: shared.module_id.clone(),
                seq: shared.var_seq.fetch_add(1, Ordering::SeqCst),
                data: value,
            }),
        })?;
        let subscribers = broker.publish(&topic, frame);
        debug!(%topic, subscribers, "Published variable");
        Ok(())
    }

    /// Stop the processing thread, leave the broker and drop every handler.
    ///
    /// Runs on drop; calling it earlier is allowed and idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        drop(
            self.shutdown_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        let handle = self
            .main_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Dropped from one of our own handlers; the loop exits once
                // it returns.
                debug!(module = %shared.module_id, "Main loop detached");
            } else if handle.join().is_err() {
                error!(module = %shared.module_id, "Main loop panicked");
            }
        }
        let broker = shared
            .broker
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(broker) = broker {
            broker.unsubscribe_client(&shared.client_id);
            self.refuse_queued_calls(&broker);
            info!(module = %shared.module_id, "Disconnected from broker");
            broker.disconnect();
        }
        shared.cmd_handlers.clear();
        shared.var_handlers.clear();
        shared
            .ready_handler
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl Everest {
    /// Fail every call still waiting in the inbox so its caller returns now.
    fn refuse_queued_calls(&self, broker: &Broker) {
        for delivery in self.inbox_rx.try_iter() {
            match decode_frame(&delivery.frame) {
                Ok(WireMessage {
                    id,
                    kind: WireMessageKind::Call(call),
                }) => {
                    debug!(topic = %delivery.topic, %id, "Refusing queued call");
                    send_result(
                        broker,
                        &call.reply_to,
                        id,
                        CommandResult::failed("module shutting down"),
                    );
                }
                _ => debug!(topic = %delivery.topic, "Dropping queued frame"),
            }
        }
    }
}

impl Drop for Everest {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn broker(&self) -> EverestResult<Broker> {
        self.broker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                EverestError::Transport(format!(
                    "module '{}' is not connected to broker {}",
                    self.module_id, self.endpoint
                ))
            })
    }

    fn subscribe_if_connected(&self, topic: &str) {
        let guard = self.broker.read().unwrap_or_else(|e| e.into_inner());
        if let Some(broker) = guard.as_ref() {
            broker.subscribe(topic, &self.client_id, self.inbox_tx.clone());
        }
    }

    /// Inbox-only topic carrying this module's own ready request.
    fn local_ready_topic(&self) -> String {
        format!("{}{}/ready", self.prefix, self.module_id)
    }

    fn dispatch(&self, delivery: Delivery) {
        let msg = match decode_frame(&delivery.frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(topic = %delivery.topic, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        match msg.kind {
            WireMessageKind::Call(call) => self.dispatch_call(&delivery.topic, msg.id, call),
            WireMessageKind::Var(update) => self.dispatch_var(&delivery.topic, update),
            WireMessageKind::Ready { module_id } => {
                if delivery.topic == self.local_ready_topic() {
                    self.fire_ready();
                } else if module_id != self.module_id {
                    debug!(peer = %module_id, "Peer ready");
                    self.ready_peers.insert(module_id);
                }
            }
            WireMessageKind::Result(_) => {
                warn!(topic = %delivery.topic, id = %msg.id, "Unexpected command result");
            }
        }
    }

    fn dispatch_call(&self, topic: &str, call_id: String, call: CommandCall) {
        // Handler threads keep their own handle so a result still reaches
        // the caller after this module shut down.
        let broker = match self.broker() {
            Ok(broker) => broker,
            Err(e) => {
                warn!(%topic, error = %e, "Call dropped");
                return;
            }
        };
        let handler = self.cmd_handlers.get(topic).map(|h| Arc::clone(h.value()));
        let Some(handler) = handler else {
            send_result(
                &broker,
                &call.reply_to,
                call_id,
                CommandResult::failed(format!("no handler for {topic}")),
            );
            return;
        };

        let handler_broker = broker.clone();
        let command = topic.to_string();
        let reply_to = call.reply_to.clone();
        let id = call_id.clone();
        let spawned = thread::Builder::new()
            .name("everest-cmd".to_string())
            .spawn(move || {
                debug!(%command, origin = %call.origin, "Handling command");
                let result = match panic::catch_unwind(AssertUnwindSafe(|| handler(call.args))) {
                    Ok(Ok(retval)) => CommandResult::ok(retval),
                    Ok(Err(e)) => {
                        warn!(%command, error = %e, "Command handler failed");
                        CommandResult::failed(e.to_string())
                    }
                    Err(_) => {
                        error!(%command, "Command handler panicked");
                        CommandResult::failed("command handler panicked")
                    }
                };
                send_result(&handler_broker, &call.reply_to, call_id, result);
            });
        if let Err(e) = spawned {
            error!(%topic, error = %e, "Cannot spawn command handler thread");
            send_result(
                &broker,
                &reply_to,
                id,
                CommandResult::failed(format!("cannot dispatch: {e}")),
            );
        }
    }

    fn dispatch_var(&self, topic: &str, update: VarUpdate) {
        let handlers = match self.var_handlers.get(topic) {
            Some(handlers) => handlers.value().clone(),
            None => return,
        };
        for handler in handlers {
            let data = update.data.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                error!(%topic, origin = %update.origin, seq = update.seq, "Variable handler panicked");
            }
        }
    }

    fn fire_ready(&self) {
        if self.ready_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = self
            .ready_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                error!(module = %self.module_id, "Ready handler panicked");
            }
        }

        let broker = match self.broker() {
            Ok(broker) => broker,
            Err(e) => {
                warn!(error = %e, "Cannot announce readiness");
                return;
            }
        };
        match encode_message(&WireMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Ready {
                module_id: self.module_id.clone(),
            },
        }) {
            Ok(frame) => {
                broker.publish(&topic::ready(&self.prefix), frame);
                info!(module = %self.module_id, "Module ready");
            }
            Err(e) => error!(error = %e, "Cannot encode ready announcement"),
        }
    }
}

fn send_result(broker: &Broker, reply_to: &str, call_id: String, result: CommandResult) {
    let frame = match encode_message(&WireMessage {
        id: call_id,
        kind: WireMessageKind::Result(result),
    }) {
        Ok(frame) => frame,
        Err(e) => {
            error!(%reply_to, error = %e, "Cannot encode command result");
            return;
        }
    };
    if broker.publish(reply_to, frame) == 0 {
        debug!(%reply_to, "Caller no longer waiting for result");
    }
}

fn main_loop(shared: Arc<Shared>, inbox: Receiver<Delivery>, shutdown: Receiver<()>) {
    loop {
        crossbeam::select! {
            recv(inbox) -> delivery => match delivery {
                Ok(delivery) => shared.dispatch(delivery),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!(module = %shared.module_id, "Main loop stopped");
}
