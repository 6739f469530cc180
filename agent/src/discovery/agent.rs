//! Discovery agent: advertises local services, looks up remote ones and keeps
//! the peer registry fresh.
//!
//! Three loops run once [`DiscoveryAgent::run`] is called: one per transport
//! channel and a prober that sweeps expired peers and broadcasts PROBEs. All
//! of them share the registry and the registered-service map through locks
//! that are never held across an `.await` or while a callback runs.

use chrono::{DateTime, Utc};
use common::{
    DiscoveryConfig, DiscoveryError, Message, MessageKind, Peer, PeerEvent, Result,
};
use futures::future::{join_all, BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::discovery::codec;
use crate::discovery::registry::{PeerRegistry, Upsert};
use crate::discovery::transport::{self, Channel, InboundHandler, Transport};

type Callback = Arc<dyn Fn(&Peer) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Side effects of one inbound message, applied once every lock is released.
#[derive(Debug, Default, PartialEq)]
struct Dispatch {
    reply: Option<(Message, SocketAddr)>,
    events: Vec<(PeerEvent, Peer)>,
}

struct Inner {
    config: DiscoveryConfig,
    lookup: BTreeSet<String>,
    services: RwLock<HashMap<String, SocketAddr>>,
    registry: Mutex<PeerRegistry>,
    callbacks: RwLock<HashMap<PeerEvent, Callback>>,
    transport: Transport,
}

pub struct DiscoveryAgent {
    inner: Arc<Inner>,
    state: Mutex<RunState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl DiscoveryAgent {
    /// Binds the direct channel. `lookup` is the fixed set of services whose
    /// peers this agent tracks.
    pub async fn new<I, S>(config: DiscoveryConfig, lookup: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        let max_life = chrono::Duration::from_std(config.host_max_life)
            .map_err(|e| DiscoveryError::ConfigError(format!("host max life: {}", e)))?;

        let transport = Transport::bind(&config).await?;
        let lookup: BTreeSet<String> = lookup.into_iter().map(Into::into).collect();
        info!("Discovery agent looking up {:?}", lookup);

        let (stop, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                lookup,
                services: RwLock::new(HashMap::new()),
                registry: Mutex::new(PeerRegistry::new(max_life)),
                callbacks: RwLock::new(HashMap::new()),
                transport,
            }),
            state: Mutex::new(RunState::Idle),
            tasks: Mutex::new(Vec::new()),
            stop,
        })
    }

    /// Advertises `name` at `ip:port`.
    ///
    /// Registering a name again replaces its address (last write wins). The
    /// first registration joins the multicast group; the entry is recorded and
    /// announced only once the group channel is ready. Join failures are
    /// returned and leave the registered services untouched, a failed
    /// ANNOUNCE send is only logged.
    pub async fn register_service(&self, name: &str, ip: IpAddr, port: u16) -> Result<()> {
        if *self.state.lock() == RunState::Stopped {
            return Err(stopped_error());
        }

        let address = SocketAddr::new(ip, port);
        let announce = codec::encode(&Message::announce(name, address))?;

        self.inner.transport.join_group().await?;

        {
            // Recording under the state lock orders this entry before the
            // RETRACT snapshot taken by a concurrent shutdown.
            let state = self.state.lock();
            if *state == RunState::Stopped {
                drop(state);
                if let Err(e) = self.inner.transport.leave_group() {
                    debug!("Leaving group after late registration of '{}': {}", name, e);
                }
                return Err(stopped_error());
            }
            self.inner.record_service(name, address);
        }

        if *self.state.lock() == RunState::Stopped {
            debug!("Skipping announce of '{}', agent is shutting down", name);
            return Ok(());
        }
        if let Err(e) = self.inner.transport.send_group(&announce).await {
            error!("Failed to announce '{}' at {}: {}", name, address, e);
        }
        Ok(())
    }

    /// Stops advertising `name` and broadcasts a RETRACT for it. Returns
    /// whether the name was registered.
    pub async fn unregister_service(&self, name: &str) -> Result<bool> {
        let removed = self.inner.services.write().remove(name);
        match removed {
            Some(address) => {
                info!("Unregistered service '{}' at {}", name, address);
                self.inner.broadcast(&Message::retract(name, address)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sets the handler for `event`, replacing any previous one.
    pub fn register_callback<F>(&self, event: PeerEvent, handler: F)
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().insert(event, Arc::new(handler));
    }

    /// Spawns the group listener, direct listener and prober on the current
    /// Tokio runtime and returns immediately.
    pub fn run(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            RunState::Running => {
                return Err(DiscoveryError::AgentStateError(
                    "agent is already running".to_string(),
                ))
            }
            RunState::Stopped => {
                return Err(DiscoveryError::AgentStateError(
                    "agent has been shut down".to_string(),
                ))
            }
            RunState::Idle => {}
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DiscoveryError::AgentStateError(e.to_string()))?;

        let mut tasks = self.tasks.lock();
        tasks.push(runtime.spawn(listen_group(
            Arc::clone(&self.inner),
            self.stop.subscribe(),
        )));
        tasks.push(runtime.spawn(listen_direct(
            Arc::clone(&self.inner),
            self.stop.subscribe(),
        )));
        tasks.push(runtime.spawn(probe(
            Arc::clone(&self.inner),
            self.stop.subscribe(),
        )));

        *state = RunState::Running;
        info!(
            "Discovery agent running on {}",
            self.inner
                .transport
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown address".to_string())
        );
        Ok(())
    }

    /// Stops the loops, then broadcasts a RETRACT for every registered
    /// service and leaves the group.
    ///
    /// Delivery of the RETRACTs is not guaranteed; peers that miss them drop
    /// this agent once its entries expire. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == RunState::Stopped {
                return;
            }
            *state = RunState::Stopped;
        }

        self.stop.send_replace(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if timeout(self.inner.config.shutdown_timeout, join_all(handles))
            .await
            .is_err()
        {
            warn!(
                "Discovery loops did not stop within {:?}, aborting them",
                self.inner.config.shutdown_timeout
            );
            for abort in aborts {
                abort.abort();
            }
        }

        for (name, address) in self.registered_services() {
            self.inner.broadcast(&Message::retract(&name, address)).await;
        }

        if let Err(e) = self.inner.transport.leave_group() {
            warn!("Failed to leave multicast group: {}", e);
        }

        info!("Discovery agent stopped");
    }

    pub fn peers(&self, service: &str) -> Vec<Peer> {
        self.inner.registry.lock().peers(service)
    }

    pub fn registered_services(&self) -> Vec<(String, SocketAddr)> {
        self.inner
            .services
            .read()
            .iter()
            .map(|(name, address)| (name.clone(), *address))
            .collect()
    }

    pub fn lookup_services(&self) -> Vec<String> {
        self.inner.lookup.iter().cloned().collect()
    }

    /// Address of the direct channel, where unicast replies arrive.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == RunState::Running
    }

    /// Whether a registration has joined the multicast group.
    pub fn is_joined(&self) -> bool {
        self.inner.transport.is_joined()
    }
}

fn stopped_error() -> DiscoveryError {
    DiscoveryError::AgentStateError("cannot register a service after shutdown".to_string())
}

impl Inner {
    fn record_service(&self, name: &str, address: SocketAddr) {
        let previous = self.services.write().insert(name.to_string(), address);
        match previous {
            Some(old) if old != address => {
                info!("Re-registered service '{}' at {} (was {})", name, address, old)
            }
            Some(_) => debug!("Service '{}' re-registered at {}", name, address),
            None => info!("Registered service '{}' at {}", name, address),
        }
    }

    fn dispatch(&self, message: Message, from: SocketAddr, now: DateTime<Utc>) -> Dispatch {
        let mut dispatch = Dispatch::default();

        match message.kind {
            MessageKind::Probe => {
                let local = self.services.read().get(&message.service).copied();
                match local {
                    Some(address) => {
                        dispatch.reply = Some((Message::announce(&message.service, address), from));
                    }
                    None => debug!("Ignoring probe for unregistered '{}'", message.service),
                }
            }
            MessageKind::Announce => {
                if !self.lookup.contains(&message.service) {
                    debug!("Ignoring announce for '{}' (not looked up)", message.service);
                    return dispatch;
                }
                let Some(address) = message.reply else {
                    return dispatch;
                };

                let upsert = self.registry.lock().upsert(&message.service, address, now);
                match upsert {
                    Upsert::Added => {
                        let peer = Peer {
                            service: message.service,
                            address,
                            last_seen: now,
                        };
                        info!("Found peer {}", peer);
                        dispatch.events.push((PeerEvent::Found, peer));
                    }
                    Upsert::Refreshed => {
                        debug!("Refreshed peer {}@{}", message.service, address)
                    }
                }
            }
            MessageKind::Retract => {
                let Some(address) = message.reply else {
                    return dispatch;
                };

                let removed = self.registry.lock().remove(&message.service, address);
                match removed {
                    Some(peer) => {
                        info!("Peer {} retracted", peer);
                        dispatch.events.push((PeerEvent::Gone, peer));
                    }
                    None => debug!("Ignoring retract for unknown {}@{}", message.service, address),
                }
            }
        }

        dispatch
    }

    async fn on_message(&self, channel: Channel, message: Message, from: SocketAddr) {
        let dispatch = self.dispatch(message, from, Utc::now());

        if let Some((reply, to)) = dispatch.reply {
            debug!("Answering probe for '{}' from {} via {} channel", reply.service, to, channel);
            self.unicast(&reply, to).await;
        }
        for (event, peer) in dispatch.events {
            self.fire(event, &peer);
        }
    }

    /// One prober round: expire silent peers, then probe every looked-up
    /// service.
    async fn probe_round(&self, now: DateTime<Utc>) {
        let expired = self.registry.lock().sweep(now);
        for peer in expired {
            info!("Peer {} expired", peer);
            self.fire(PeerEvent::Gone, &peer);
        }

        for service in &self.lookup {
            self.broadcast(&Message::probe(service)).await;
        }
    }

    fn fire(&self, event: PeerEvent, peer: &Peer) {
        let callback = self.callbacks.read().get(&event).cloned();
        if let Some(callback) = callback {
            callback(peer);
        }
    }

    async fn broadcast(&self, message: &Message) {
        let result = match codec::encode(message) {
            Ok(payload) => self.transport.send_group(&payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Failed to broadcast {} for '{}': {}", message.kind, message.service, e);
        }
    }

    async fn unicast(&self, message: &Message, to: SocketAddr) {
        let result = match codec::encode(message) {
            Ok(payload) => self.transport.send_unicast(&payload, to).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Failed to send {} for '{}' to {}: {}", message.kind, message.service, to, e);
        }
    }
}

impl InboundHandler for Inner {
    fn handle<'a>(
        &'a self,
        channel: Channel,
        message: Message,
        from: SocketAddr,
    ) -> BoxFuture<'a, ()> {
        self.on_message(channel, message, from).boxed()
    }
}

async fn listen_group(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    // Nothing arrives on the group channel until a service is registered.
    let socket = tokio::select! {
        _ = transport::wait_for_shutdown(&mut shutdown) => return,
        socket = inner.transport.wait_for_group() => match socket {
            Some(socket) => socket,
            None => return,
        },
    };

    let max_packet_size = inner.config.max_packet_size;
    transport::receive_loop(Channel::Group, socket, max_packet_size, &*inner, shutdown).await;
}

async fn listen_direct(inner: Arc<Inner>, shutdown: watch::Receiver<bool>) {
    let socket = inner.transport.direct_channel();
    let max_packet_size = inner.config.max_packet_size;
    transport::receive_loop(Channel::Direct, socket, max_packet_size, &*inner, shutdown).await;
}

async fn probe(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.lookup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = transport::wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => inner.probe_round(Utc::now()).await,
        }
    }

    debug!("Prober stopped");
}
