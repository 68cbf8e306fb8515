//! The service interface (RFC 4253 Section 10).
//!
//! Services are the SSH sub-protocols the transport carries: `ssh-userauth`,
//! `ssh-connection`. The transport requests one by name with
//! SSH_MSG_SERVICE_REQUEST and, once the peer accepts, forwards every packet
//! that is not a transport-layer message to the active service's handler.

use crate::ssh::buffer::Buffer;
use async_trait::async_trait;
use skiff_platform::{Error, Result};

/// An SSH service multiplexed over the transport.
#[async_trait]
pub trait Service: Send + Sync {
    /// The service name as sent in SSH_MSG_SERVICE_REQUEST
    /// (e.g. `ssh-userauth`).
    fn name(&self) -> &str;

    /// Handles one inbound packet routed to this service.
    ///
    /// `msg` is the message-type byte; `payload` is positioned just past it.
    async fn handle(&self, msg: u8, payload: Buffer) -> Result<()>;

    /// Notifies the service that the transport died; any waiters inside the
    /// service should observe `err`.
    fn notify_error(&self, err: &Error);
}
