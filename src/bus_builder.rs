//! Bus builder for creating bus connections.
//!
//! Provides a fluent builder API for constructing buses with clear separation
//! between required and optional configuration.

use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    // ---
    create_memory_bus,
    create_memory_bus_with_hub,
    create_nats_bus,
    BusPtr,
    MemoryHub,
    PipeConfig,
    PipeError,
    Result,
};

/// Bus types accepted by [`BusBuilder::bus_type`].
pub const BUS_TYPES: &[&str] = &["nats", "memory"];

/// Builder for creating bus instances.
///
/// # Examples
///
/// ## NATS with explicit servers and credentials
/// ```no_run
/// use piper::BusBuilder;
///
/// # async fn example() -> piper::Result<()> {
/// let bus = BusBuilder::new()
///     .servers("nats://localhost:4222")
///     .credentials("/etc/piper/user.creds")
///     .bus_id("notify-1")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Isolated in-memory bus
/// ```
/// use piper::{BusBuilder, MemoryHub};
///
/// # async fn example() -> piper::Result<()> {
/// let hub = MemoryHub::new();
/// let bus = BusBuilder::new()
///     .bus_id("test")
///     .memory_hub(hub)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct BusBuilder {
    servers: Option<String>,
    credentials: Option<PathBuf>,
    default_credentials: bool,
    bus_id: Option<String>,
    bus_type: Option<String>,
    hub: Option<Arc<MemoryHub>>,
}

impl BusBuilder {
    /// Create a new bus builder.
    pub fn new() -> Self {
        Self {
            servers: None,
            credentials: None,
            default_credentials: false,
            bus_id: None,
            bus_type: None,
            hub: None,
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: &PipeConfig) -> Self {
        // ---
        let servers = (!config.servers.is_empty()).then(|| config.servers.clone());
        Self {
            servers,
            credentials: config.credentials.clone(),
            bus_id: Some(config.bus_id.clone()),
            ..Self::new()
        }
    }

    /// Set the comma separated server list.
    ///
    /// Examples:
    /// - `"nats://localhost:4222"`
    /// - `"nats://a:4222,nats://b:4222"`
    pub fn servers(mut self, servers: impl Into<String>) -> Self {
        self.servers = Some(servers.into());
        self
    }

    /// Set an explicit credentials file.
    pub fn credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = Some(path.into());
        self
    }

    /// Fall back to `~/.piper.creds` when present.
    ///
    /// Cannot be used together with [`memory_hub`](Self::memory_hub).
    pub fn default_credentials(mut self) -> Self {
        self.default_credentials = true;
        self
    }

    /// Set the bus id used in log lines (required).
    pub fn bus_id(mut self, id: impl Into<String>) -> Self {
        self.bus_id = Some(id.into());
        self
    }

    /// Set explicit bus type.
    ///
    /// Valid values: `"nats"`, `"memory"`
    ///
    /// If not specified, NATS is used when the `transport_nats` feature is
    /// enabled, memory otherwise.
    pub fn bus_type(mut self, flag: impl Into<String>) -> Self {
        self.bus_type = Some(flag.into());
        self
    }

    /// Attach an isolated in-memory hub. Implies the memory bus.
    pub fn memory_hub(mut self, hub: Arc<MemoryHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Build the bus (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `bus_id` is missing
    /// - the bus type is not recognized
    /// - NATS-only settings are combined with the memory bus
    /// - the connection fails
    pub async fn build(self) -> Result<BusPtr> {
        // ---
        let bus_id = self
            .bus_id
            .ok_or_else(|| PipeError::MissingConfig("bus_id".into()))?;

        let bus_type = match (self.bus_type.as_deref(), &self.hub) {
            (Some("memory"), _) | (None, Some(_)) => "memory",
            (Some("nats"), Some(_)) => {
                return Err(PipeError::ConfigConflict(
                    "a memory hub cannot be used with the nats bus".into(),
                ))
            }
            (Some("nats"), None) => "nats",
            (Some(other), _) => {
                return Err(PipeError::ConfigConflict(format!(
                    "unrecognized bus type: {other}, valid values: {}",
                    BUS_TYPES.join(", ")
                )))
            }
            (None, None) if cfg!(feature = "transport_nats") => "nats",
            (None, None) => "memory",
        };

        if bus_type == "memory" && (self.credentials.is_some() || self.default_credentials) {
            return Err(PipeError::ConfigConflict(
                "credentials only apply to the nats bus".into(),
            ));
        }

        let mut config =
            PipeConfig::with_servers(self.servers.unwrap_or_default(), bus_id);
        if let Some(path) = self.credentials {
            config = config.with_credentials(path);
        }
        if self.default_credentials {
            config = config.with_default_credentials();
        }

        match (bus_type, self.hub) {
            ("memory", Some(hub)) => create_memory_bus_with_hub(&config, hub).await,
            ("memory", None) => create_memory_bus(&config).await,
            _ => create_nats_bus(&config).await,
        }
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
