//! Server configuration - server-wide static settings.
//!
//! Set once at startup, shared by every connection session.

use rpcmux_core::Status;

/// Default maximum inbound message size (4 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default number of outbound frames buffered per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 128;

/// Limit on the size of inbound WebSocket messages.
///
/// Oversized messages are answered with a `PAYLOAD_TOO_LARGE` error frame;
/// the connection stays open.
///
/// # Example
///
/// ```rust
/// use rpcmux::MessageLimits;
///
/// // Use default 4 MB limit
/// let limits = MessageLimits::default();
///
/// // Custom 16 MB limit for large payloads
/// let limits = MessageLimits::new(16 * 1024 * 1024);
///
/// // No limit (not recommended for production)
/// let limits = MessageLimits::unlimited();
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageLimits {
    /// Maximum size of a single message in bytes.
    /// `None` means unlimited.
    max_message_size: Option<usize>,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
        }
    }
}

impl MessageLimits {
    /// Create new limits with the specified maximum message size in bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: Some(max_message_size),
        }
    }

    /// Create limits with no maximum.
    pub fn unlimited() -> Self {
        Self {
            max_message_size: None,
        }
    }

    /// Returns the maximum message size, or `None` if unlimited.
    pub fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    /// Check if a message size exceeds the configured limit.
    pub fn check_size(&self, size: usize) -> Result<(), Status> {
        if let Some(max) = self.max_message_size
            && size > max
        {
            return Err(Status::payload_too_large(format!(
                "message size {} bytes exceeds maximum allowed size of {} bytes",
                size, max
            )));
        }
        Ok(())
    }
}

/// Server-wide configuration for connection sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Outbound frames buffered per connection before senders wait.
    pub outbound_capacity: usize,
    /// Inbound message size limits.
    pub limits: MessageLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            limits: MessageLimits::default(),
        }
    }
}
