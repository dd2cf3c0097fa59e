//! Open client connections of a controller.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use super::generation::ClientMessage;

const CHANNEL_CAPACITY: usize = 16;

/// Every client connected to one controller, reached through a broadcast channel.
#[derive(Debug)]
pub struct ClientRegistry {
    sender: broadcast::Sender<ClientMessage>,
    claimed: AtomicBool,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender, claimed: AtomicBool::new(false) }
    }

    /// Connect a new client. Dropping the receiver disconnects it.
    pub fn connect(&self) -> broadcast::Receiver<ClientMessage> {
        self.sender.subscribe()
    }

    pub fn connected(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Take control of every open client.
    pub fn claim(&self) {
        self.claimed.store(true, Ordering::SeqCst);
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Send `message` to every open client. Returns how many received it.
    pub fn broadcast(&self, message: ClientMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ClientMessage {
        ClientMessage::VersionInfo { version: "1".into(), timestamp: Some(1) }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let registry = ClientRegistry::new();
        let mut first = registry.connect();
        let mut second = registry.connect();
        assert_eq!(registry.connected(), 2);

        assert_eq!(registry.broadcast(info()), 2);
        assert_eq!(first.recv().await.unwrap(), info());
        assert_eq!(second.recv().await.unwrap(), info());
    }

    #[test]
    fn test_broadcast_without_clients() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.broadcast(info()), 0);
        assert!(!registry.is_claimed());
        registry.claim();
        assert!(registry.is_claimed());
    }
}
