//! Connection Hub
//!
//! Process-wide registry of live connections keyed by identity. The table
//! is owned by a single task: registration, unregistration, subscription
//! and listing all arrive as commands on one channel, so the table never
//! has concurrent writers and needs no lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::connection::{Connection, Outbound};
use crate::envelope::Envelope;

/// Default capacity of the hub command channel
pub const DEFAULT_COMMAND_CAPACITY: usize = 256;

/// Request handled by the hub task
#[derive(Debug)]
pub(crate) enum HubCommand {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
    Subscribe {
        subscriber: String,
        channel: String,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    List(oneshot::Sender<Vec<String>>),
}

/// Hub owns the identity -> connection table
pub struct Hub {
    connections: HashMap<String, Arc<Connection>>,
    commands: mpsc::Receiver<HubCommand>,
}

/// Cloneable handle for sending commands to a running [`Hub`]
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Create a hub and its handle. The hub does nothing until [`Hub::run`].
    pub fn new(capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let hub = Self {
            connections: HashMap::new(),
            commands: rx,
        };
        (hub, HubHandle { commands: tx })
    }

    /// Create a hub and run it on its own task
    pub fn spawn(capacity: usize) -> HubHandle {
        let (hub, handle) = Self::new(capacity);
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until every handle has been dropped
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        debug!(connections = self.connections.len(), "hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(connection) => self.register(connection),
            HubCommand::Unregister(connection) => self.unregister(&connection),
            HubCommand::Subscribe {
                subscriber,
                channel,
                reply,
            } => {
                let _ = reply.send(self.subscribe(&subscriber, &channel));
            }
            HubCommand::List(reply) => {
                let _ = reply.send(self.identities());
            }
        }
    }

    fn register(&mut self, connection: Arc<Connection>) {
        let identity = connection.identity().to_owned();

        if let Some(previous) = self.connections.insert(identity.clone(), connection.clone()) {
            if Arc::ptr_eq(&previous, &connection) {
                debug!(identity, "connection already registered");
                return;
            }
            // The displaced connection is unreachable now; let it tear down
            previous.close_outbound();
            warn!(identity, "identity reused, replaced previous connection");
        }

        info!(identity, connections = self.connections.len(), "connection registered");
        self.broadcast(&Envelope::connect(identity.as_str()), Some(&identity));
    }

    fn unregister(&mut self, connection: &Arc<Connection>) {
        let identity = connection.identity();

        let registered = self
            .connections
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if !registered {
            debug!(identity, "unknown connection");
            return;
        }

        self.connections.remove(identity);
        connection.close_outbound();
        info!(identity, connections = self.connections.len(), "connection unregistered");
        self.broadcast(&Envelope::disconnect(identity), None);
    }

    fn subscribe(&self, subscriber: &str, channel: &str) -> Result<(), HubError> {
        let subscriber_conn = self
            .connections
            .get(subscriber)
            .ok_or_else(|| HubError::UnknownSubscriber(subscriber.to_owned()))?;
        let channel_conn = self
            .connections
            .get(channel)
            .ok_or_else(|| HubError::UnknownChannel(channel.to_owned()))?;

        if channel_conn.add_subscriber(subscriber_conn) {
            info!(subscriber, channel, "subscribed");
        } else {
            debug!(subscriber, channel, "already subscribed");
        }
        Ok(())
    }

    fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.connections.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Queue a lifecycle envelope on every registered connection
    fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) {
        let encoded: Arc<str> = match envelope.encode() {
            Ok(encoded) => encoded.into(),
            Err(e) => {
                warn!(error = %e, "failed to encode lifecycle event");
                return;
            }
        };

        let mut receivers = 0;
        for (identity, connection) in &self.connections {
            if exclude == Some(identity.as_str()) {
                continue;
            }
            match connection.try_enqueue(Outbound::Deliver(encoded.clone())) {
                Ok(()) => receivers += 1,
                Err(e) => {
                    warn!(
                        identity,
                        kind = ?envelope.kind,
                        error = %e,
                        "failed to deliver lifecycle event"
                    );
                }
            }
        }

        debug!(kind = ?envelope.kind, body = %envelope.body, receivers, "lifecycle event sent");
    }

    #[cfg(test)]
    pub(crate) async fn next_command(&mut self) -> Option<HubCommand> {
        self.commands.recv().await
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl HubHandle {
    /// Ask the hub to register a freshly accepted connection
    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Register(connection))
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Ask the hub to unregister a connection. Unknown connections are ignored.
    pub async fn unregister(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Unregister(connection))
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Subscribe `subscriber` to the channel owned by `channel`
    pub async fn subscribe(&self, subscriber: &str, channel: &str) -> Result<(), HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Subscribe {
                subscriber: subscriber.to_owned(),
                channel: channel.to_owned(),
                reply,
            })
            .await
            .map_err(|_| HubError::Stopped)?;
        response.await.map_err(|_| HubError::Stopped)?
    }

    /// Identities of all registered connections, sorted
    pub async fn list_identities(&self) -> Result<Vec<String>, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::List(reply))
            .await
            .map_err(|_| HubError::Stopped)?;
        response.await.map_err(|_| HubError::Stopped)
    }
}

/// Hub errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("client not found: {0}")]
    UnknownSubscriber(String),
    #[error("subscription client not found: {0}")]
    UnknownChannel(String),
    #[error("hub is not running")]
    Stopped,
}
