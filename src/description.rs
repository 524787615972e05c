//! Connection metadata.
//!
//! A [`ConnectionDescription`] is fixed when the connection is constructed
//! and shared as `Arc` by every exchange on that connection.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;

/// Default server port.
pub const DEFAULT_PORT: u16 = 27017;

/// Default maximum BSON document size (16 MiB).
pub const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 0x100_0000;

/// Default maximum number of documents in a write batch.
pub const DEFAULT_MAX_BATCH_COUNT: i32 = 512;

static NEXT_LOCAL_CONNECTION_ID: AtomicI32 = AtomicI32::new(1);

/// Host and port of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of a server within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    pub cluster_id: String,
    pub address: ServerAddress,
}

impl ServerId {
    pub fn new(cluster_id: impl Into<String>, address: ServerAddress) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            address,
        }
    }
}

/// Identity of one connection.
///
/// `local_value` is unique within the process; `server_value` is the id the
/// server reports once known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    pub server_id: ServerId,
    pub local_value: i32,
    pub server_value: Option<i32>,
}

impl ConnectionId {
    /// Allocate a new process-unique connection id for `server_id`.
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            local_value: NEXT_LOCAL_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            server_value: None,
        }
    }

    /// Same id with the server-side value filled in.
    pub fn with_server_value(&self, server_value: i32) -> Self {
        Self {
            server_value: Some(server_value),
            ..self.clone()
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server_value {
            Some(server) => write!(
                f,
                "conn{}/{} ({})",
                self.local_value, server, self.server_id.address
            ),
            None => write!(f, "conn{} ({})", self.local_value, self.server_id.address),
        }
    }
}

/// Server release, e.g. `[3, 0, 2]`. Empty when unknown.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ServerVersion(pub Vec<i32>);

impl ServerVersion {
    pub fn new(parts: impl Into<Vec<i32>>) -> Self {
        Self(parts.into())
    }

    pub fn is_known(&self) -> bool {
        !self.0.is_empty()
    }
}

/// Role of the server this connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerType {
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ReplicaSetArbiter,
    ShardRouter,
    #[default]
    Unknown,
}

/// Immutable metadata of an established connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    pub connection_id: ConnectionId,
    pub server_version: ServerVersion,
    pub max_wire_version: i32,
    pub server_type: ServerType,
    pub max_document_size: i32,
    pub max_message_size: i32,
    pub max_batch_count: i32,
}

impl ConnectionDescription {
    /// Description with default limits for a server not yet inspected.
    pub fn new(server_id: ServerId) -> Self {
        Self::with_connection_id(ConnectionId::new(server_id))
    }

    pub fn with_connection_id(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            server_version: ServerVersion::default(),
            max_wire_version: 0,
            server_type: ServerType::Unknown,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
        }
    }

    /// Set the server release and wire version.
    pub fn server_version(mut self, version: ServerVersion, max_wire_version: i32) -> Self {
        self.server_version = version;
        self.max_wire_version = max_wire_version;
        self
    }

    pub fn server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    /// Set document, message and batch limits.
    pub fn limits(mut self, max_document_size: i32, max_message_size: i32, max_batch_count: i32) -> Self {
        self.max_document_size = max_document_size;
        self.max_message_size = max_message_size;
        self.max_batch_count = max_batch_count;
        self
    }

    #[inline]
    pub fn server_id(&self) -> &ServerId {
        &self.connection_id.server_id
    }

    #[inline]
    pub fn server_address(&self) -> &ServerAddress {
        &self.connection_id.server_id.address
    }
}
