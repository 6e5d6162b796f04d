//! Fan-out of one sender's message to every other live session.
//!
//! Delivery is best-effort: each recipient gets the attributed message queued
//! on its own outbound queue, and a recipient that is gone or backed up only
//! costs that one delivery.

use crate::registry::ConnectionRegistry;
use crate::session::ClientSession;
use bytes::Bytes;
use tracing::{debug, warn};

/// Attributed wire form: `client[<sender port>]:<message>`.
pub fn encode(sender: &ClientSession, message: &str) -> Bytes {
    Bytes::from(format!("{}{}", sender.display_name(), message))
}

/// Send `message` from `sender` to every other session in the registry.
///
/// Never fails as a whole; per-recipient failures are logged. Returns how
/// many recipients had the message queued.
pub fn forward(registry: &ConnectionRegistry, sender: &ClientSession, message: &str) -> usize {
    fan_out(registry, sender, encode(sender, message))
}

/// Tell every remaining session that `departed` has left.
pub fn announce_departure(registry: &ConnectionRegistry, departed: &ClientSession) -> usize {
    let notice = Bytes::from(format!("client[{}] left", departed.peer().port()));
    fan_out(registry, departed, notice)
}

fn fan_out(registry: &ConnectionRegistry, sender: &ClientSession, payload: Bytes) -> usize {
    let mut delivered = 0;

    for member in registry.snapshot() {
        if *member == *sender {
            continue;
        }

        match member.deliver(payload.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(from = %sender.id(), to = %member.id(), error = %e, "Delivery failed"),
        }
    }

    debug!(from = %sender.id(), delivered, "Forwarded message");
    delivered
}
