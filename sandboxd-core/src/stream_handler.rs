use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{error, info, warn};
use sandboxd_registry::{Registration, Registry};
use sandboxd_store::Store;
use sandboxd_wire::{
    control_message, host_message, ControlMessage, HostId, HostMessage, OrgId, RegistrationAck,
};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::cancel::CancelSignal;
use crate::error::{ConnectionError, DispatchError};
use crate::pending::{PendingGuard, PendingRequests};

/// The outbound half of one daemon's bidirectional stream: a channel the
/// gRPC service drains into the response stream tonic hands back to the
/// client. Cloning it is cheap and shared between the registry's
/// bookkeeping copy and this crate's own `streams` map.
pub type ControlSink = mpsc::UnboundedSender<Result<ControlMessage, tonic::Status>>;

/// Terminates every daemon stream. Owns the registration handshake,
/// heartbeat monitoring, inbound dispatch, and the correlated
/// `send_and_wait` primitive every orchestrator verb is built on.
///
/// `streams`, `pending`, `send_mutexes`, and `cancel_fns` are kept
/// separate from `Registry` even though `Registry` also stores a stream
/// handle: the registry's copy exists for read-mostly snapshot queries
/// (placement), while these maps are the mutation surface the stream
/// handler itself owns and races against reconnects.
pub struct StreamHandler {
    registry: Arc<Registry<ControlSink>>,
    store: Arc<dyn Store>,
    streams: RwLock<HashMap<HostId, ControlSink>>,
    send_mutexes: RwLock<HashMap<HostId, Arc<AsyncMutex<()>>>>,
    cancel_fns: RwLock<HashMap<HostId, watch::Sender<bool>>>,
    pending: PendingRequests,
    heartbeat_timeout: Duration,
}

impl StreamHandler {
    pub fn new(registry: Arc<Registry<ControlSink>>, store: Arc<dyn Store>, heartbeat_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            streams: RwLock::new(HashMap::new()),
            send_mutexes: RwLock::new(HashMap::new()),
            cancel_fns: RwLock::new(HashMap::new()),
            pending: PendingRequests::new(),
            heartbeat_timeout,
        })
    }

    pub fn registry(&self) -> &Arc<Registry<ControlSink>> {
        &self.registry
    }

    fn send_mutex_for(&self, host_id: &HostId) -> Arc<AsyncMutex<()>> {
        if let Some(m) = self.send_mutexes.read().unwrap().get(host_id) {
            return m.clone();
        }
        let mut mutexes = self.send_mutexes.write().unwrap();
        mutexes
            .entry(host_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn get_stream(&self, host_id: &HostId) -> Option<ControlSink> {
        self.streams.read().unwrap().get(host_id).cloned()
    }

    /// Runs the ACCEPT -> RECV_FIRST -> RECV_LOOP state machine for one
    /// inbound connection and returns the outbound half for the gRPC layer
    /// to hand back as the response stream. `org_id`/`token_id` come from
    /// the authenticated transport context (§6.1); `token_id` always wins
    /// over any daemon-claimed `host_id` in the registration message.
    pub async fn accept(
        self: Arc<Self>,
        org_id: String,
        token_id: String,
        mut inbound: tonic::Streaming<HostMessage>,
    ) -> Result<mpsc::UnboundedReceiver<Result<ControlMessage, tonic::Status>>, ConnectionError> {
        Self::check_token_identity(&token_id)?;

        let first = inbound
            .message()
            .await
            .map_err(|e| ConnectionError::StreamRecv(e.to_string()))?
            .ok_or(ConnectionError::MissingRegistration)?;

        let registration_msg = match first.payload {
            Some(host_message::Payload::HostRegistration(r)) => r,
            _ => return Err(ConnectionError::MissingRegistration),
        };

        let host_id = HostId::from(token_id.clone());
        if !registration_msg.host_id.is_empty() && registration_msg.host_id != token_id {
            warn!(
                "host {host_id}: daemon-claimed host_id {:?} overridden by token identity",
                registration_msg.host_id
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let ack = ControlMessage {
            request_id: String::new(),
            payload: Some(control_message::Payload::RegistrationAck(RegistrationAck {
                accepted: true,
                assigned_host_id: host_id.to_string(),
                error: String::new(),
            })),
        };
        tx.send(Ok(ack)).map_err(|_| ConnectionError::AckSendFailed)?;

        let cancel_tx = self.register_connection(&host_id, org_id, tx.clone(), &registration_msg)?;
        let cancel_rx = cancel_tx.subscribe();

        tokio::spawn(self.clone().heartbeat_monitor(host_id.clone(), cancel_tx, cancel_rx.clone()));
        tokio::spawn(self.clone().recv_loop(host_id, tx, inbound, cancel_rx));

        Ok(rx)
    }

    /// The duplicate-connection arbitration unit (spec.md §4.3.1/§9): cancel
    /// the old connection's tasks, THEN store our stream, THEN register, so
    /// a concurrent `send_and_wait` on a reconnecting host either sees the
    /// fresh stream or fails `HostNotConnected` — never sends to a dead one.
    /// Split out of `accept` so it is exercisable without a real transport
    /// stream (see the reconnect-arbitration test below).
    pub(crate) fn register_connection(
        self: &Arc<Self>,
        host_id: &HostId,
        org_id: String,
        tx: ControlSink,
        registration_msg: &sandboxd_wire::HostRegistration,
    ) -> Result<watch::Sender<bool>, ConnectionError> {
        if let Some(old_cancel) = self.cancel_fns.write().unwrap().remove(host_id) {
            let _ = old_cancel.send(true);
        }
        self.streams.write().unwrap().insert(host_id.clone(), tx.clone());

        self.registry
            .register(host_id.clone(), OrgId::from(org_id.clone()), registration_msg.hostname.clone(), tx.clone())?;
        let registration = registration_to_domain(registration_msg);
        let source_vm_count = registration.source_vms.len() as u32;
        self.registry.set_registration(host_id, registration);
        self.registry.update_heartbeat_counts(host_id, 0, source_vm_count);

        self.persist_host_detached(host_id.clone(), org_id, registration_msg);

        let (cancel_tx, _cancel_rx) = watch::channel(false);
        self.cancel_fns.write().unwrap().insert(host_id.clone(), cancel_tx.clone());
        Ok(cancel_tx)
    }

    /// Rejects a connection before any registry mutation when the transport
    /// auth layer supplied no token identity (spec.md §4.3.1, §8 scenario 7).
    fn check_token_identity(token_id: &str) -> Result<(), ConnectionError> {
        if token_id.is_empty() {
            Err(ConnectionError::MissingTokenIdentity)
        } else {
            Ok(())
        }
    }

    fn persist_host_detached(
        self: &Arc<Self>,
        host_id: HostId,
        org_id: String,
        reg: &sandboxd_wire::HostRegistration,
    ) {
        let store = self.store.clone();
        let host = sandboxd_store::Host {
            id: host_id.clone(),
            org_id: OrgId::from(org_id),
            hostname: reg.hostname.clone(),
            status: "CONNECTED".to_string(),
            total_cpus: reg.total_cpus,
            total_memory_mb: reg.total_memory_mb,
            total_disk_mb: reg.total_disk_mb,
            available_cpus: reg.available_cpus,
            available_memory_mb: reg.available_memory_mb,
            available_disk_mb: reg.available_disk_mb,
            base_images: reg.base_images.clone(),
            source_vms: serde_json::to_value(&reg.source_vms).unwrap_or_default(),
            bridges: serde_json::to_value(&reg.bridges).unwrap_or_default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        // Detached from the stream's own context/lifetime: the write must
        // survive even if the accepting request future is later dropped.
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(Duration::from_secs(10), async {
                match store.get_host(&host.id).await {
                    Ok(_) => store.update_host(&host).await,
                    Err(sandboxd_store::StoreError::NotFound) => store.create_host(&host).await,
                    Err(e) => Err(e),
                }
            })
            .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("persisting host row for {}: {e}", host.id),
                Err(_) => error!("persisting host row for {} timed out", host.id),
            }
        });
    }

    async fn heartbeat_monitor(
        self: Arc<Self>,
        host_id: HostId,
        cancel_tx: watch::Sender<bool>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let interval = self.heartbeat_timeout.div_f64(3.0).max(Duration::from_secs(10));
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        let mut misses: u32 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(snapshot) = self.registry.get_host(&host_id) else { return; };
                    if Instant::now().saturating_duration_since(snapshot.last_heartbeat) > self.heartbeat_timeout {
                        misses += 1;
                        if misses >= 3 {
                            warn!("host {host_id} missed {misses} consecutive heartbeats, disconnecting");
                            let _ = cancel_tx.send(true);
                            return;
                        }
                    } else {
                        misses = 0;
                    }
                }
                _ = cancel_rx.changed() => {
                    return;
                }
            }
        }
    }

    async fn recv_loop(
        self: Arc<Self>,
        host_id: HostId,
        our_stream: ControlSink,
        mut inbound: tonic::Streaming<HostMessage>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    info!("host {host_id}: connection cancelled");
                    break;
                }
                msg = inbound.message() => {
                    match msg {
                        Ok(Some(m)) => self.dispatch_inbound(&host_id, m),
                        Ok(None) => {
                            info!("host {host_id}: stream closed by peer");
                            break;
                        }
                        Err(e) => {
                            warn!("host {host_id}: recv error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        self.cleanup_connection(&host_id, &our_stream);
    }

    /// The CompareAndDelete stream-ownership invariant (spec.md
    /// §4.3.1/§9): only the still-current stream for `host_id` may tear
    /// down shared state. A stream displaced by a newer connection calls
    /// this too (once its recv loop exits via cancellation) but must leave
    /// the replacement's state untouched. Split out of `recv_loop` so the
    /// invariant is directly testable without standing up a real
    /// `tonic::Streaming`.
    pub(crate) fn cleanup_connection(&self, host_id: &HostId, our_stream: &ControlSink) {
        let mut streams = self.streams.write().unwrap();
        if streams.get(host_id).is_some_and(|cur| cur.same_channel(our_stream)) {
            streams.remove(host_id);
            drop(streams);
            self.cancel_fns.write().unwrap().remove(host_id);
            self.send_mutexes.write().unwrap().remove(host_id);
            self.registry.unregister(host_id);
        }
    }

    pub(crate) fn dispatch_inbound(&self, host_id: &HostId, msg: HostMessage) {
        if sandboxd_wire::is_unsolicited(&msg) {
            match msg.payload {
                Some(host_message::Payload::Heartbeat(hb)) => {
                    self.registry.update_heartbeat(host_id);
                    self.registry
                        .update_heartbeat_counts(host_id, hb.active_sandboxes, hb.source_vm_count);
                    self.registry
                        .update_resources(host_id, hb.available_cpus, hb.available_memory_mb);
                    let store = self.store.clone();
                    let host_id = host_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = store
                            .update_host_heartbeat(&host_id, hb.available_cpus, hb.available_memory_mb, hb.available_disk_mb)
                            .await
                        {
                            warn!("persisting heartbeat for {host_id}: {e}");
                        }
                    });
                }
                Some(host_message::Payload::ResourceReport(rr)) => {
                    self.registry.update_heartbeat(host_id);
                    self.registry.update_resources(host_id, rr.available_cpus, rr.available_memory_mb);
                }
                Some(host_message::Payload::ErrorReport(er)) => {
                    error!(
                        "host {host_id}: error report sandbox={} error={} context={}",
                        er.sandbox_id, er.error, er.context
                    );
                }
                _ => warn!("host {host_id}: unsolicited message with unexpected payload"),
            }
        } else if !self.pending.deliver(&msg.request_id, msg.clone()) {
            warn!("host {host_id}: no pending request for request_id {}", msg.request_id);
        }
    }

    /// The correlated request/reply primitive every orchestrator verb uses.
    /// Races the reply against the timeout and the caller's own
    /// `CancelSignal` (spec.md §4.3.3/§5's three-armed `{reply, ctx.Done(),
    /// timeout}` select) so a caller-initiated cancellation surfaces as
    /// `DispatchError::Cancelled` rather than silently vanishing. The
    /// `PendingGuard` removes the pending entry on every exit path,
    /// preserving the "no reply leak" invariant.
    pub async fn send_and_wait(
        &self,
        host_id: &HostId,
        msg: ControlMessage,
        timeout: Duration,
        cancel: &mut CancelSignal,
    ) -> Result<HostMessage, DispatchError> {
        if msg.request_id.is_empty() {
            return Err(DispatchError::InvalidRequest);
        }
        let sink = self
            .get_stream(host_id)
            .ok_or_else(|| DispatchError::HostNotConnected(host_id.to_string()))?;

        let request_id = msg.request_id.clone();
        let rx = self.pending.insert(request_id.clone());
        let _guard = PendingGuard::new(&self.pending, request_id.clone());

        {
            let mutex = self.send_mutex_for(host_id);
            let _permit = mutex.lock().await;
            sink.send(Ok(msg))
                .map_err(|e| DispatchError::SendFailed(host_id.to_string(), e.to_string()))?;
        }

        tokio::select! {
            reply = rx => reply.map_err(|_| DispatchError::Timeout(host_id.to_string())),
            _ = tokio::time::sleep(timeout) => Err(DispatchError::Timeout(host_id.to_string())),
            _ = cancel.cancelled() => Err(DispatchError::Cancelled(host_id.to_string())),
        }
    }
}

fn registration_to_domain(reg: &sandboxd_wire::HostRegistration) -> Registration {
    Registration {
        total_cpus: reg.total_cpus,
        total_memory_mb: reg.total_memory_mb,
        total_disk_mb: reg.total_disk_mb,
        available_cpus: reg.available_cpus,
        available_memory_mb: reg.available_memory_mb,
        available_disk_mb: reg.available_disk_mb,
        base_images: reg.base_images.clone(),
        source_vms: reg.source_vms.clone(),
        bridges: reg.bridges.clone(),
    }
}
