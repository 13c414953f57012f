use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::handler::Connection;

/// Publish/subscribe hub: channel name to subscriber connections.
/// Subscribers are held weakly so a vanished connection never keeps a
/// channel alive; dead entries are pruned on every publish.
pub struct Hub {
    channels: Mutex<HashMap<String, Vec<Weak<Connection>>>>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, conn: &Arc<Connection>, names: &[Vec<u8>]) {
        for raw in names {
            let name = String::from_utf8_lossy(raw).into_owned();
            if conn.add_subscription(&name) {
                let mut channels = self.channels.lock();
                channels
                    .entry(name.clone())
                    .or_default()
                    .push(Arc::downgrade(conn));
            }
            let _ = conn.write(&confirmation(b"subscribe", &name, conn.subscription_count()));
        }
    }

    /// Unsubscribes from the named channels, or all of them when none
    /// are named, confirming each one.
    pub fn unsubscribe(&self, conn: &Arc<Connection>, names: &[Vec<u8>]) {
        let names: Vec<String> = if names.is_empty() {
            conn.subscriptions()
        } else {
            names
                .iter()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .collect()
        };
        for name in names {
            self.detach(conn, &name);
            conn.remove_subscription(&name);
            let _ = conn.write(&confirmation(b"unsubscribe", &name, conn.subscription_count()));
        }
    }

    /// Silent cleanup when a connection goes away.
    pub fn drop_connection(&self, conn: &Arc<Connection>) {
        for name in conn.subscriptions() {
            self.detach(conn, &name);
        }
        conn.clear_subscriptions();
    }

    fn detach(&self, conn: &Arc<Connection>, name: &str) {
        let mut channels = self.channels.lock();
        if let Some(subs) = channels.get_mut(name) {
            subs.retain(|w| w.upgrade().is_some_and(|c| !Arc::ptr_eq(&c, conn)));
            if subs.is_empty() {
                channels.remove(name);
            }
        }
    }

    /// Pushes the message to every live subscriber, returning how many
    /// received it.
    pub fn publish(&self, channel: &str, message: &[u8]) -> i64 {
        let subscribers: Vec<Arc<Connection>> = {
            let mut channels = self.channels.lock();
            match channels.get_mut(channel) {
                None => return 0,
                Some(subs) => {
                    subs.retain(|w| w.upgrade().is_some());
                    subs.iter().filter_map(|w| w.upgrade()).collect()
                }
            }
        };
        let msg = push_message(channel, message);
        let mut received = 0i64;
        for conn in subscribers {
            if conn.write(&msg).is_ok() {
                received += 1;
            }
        }
        received
    }
}

impl Default for Hub {
    fn default() -> Hub {
        Hub::new()
    }
}

/// `*3` of kind, channel, subscription count. The trailing integer makes
/// this a mixed array, so it is laid out by hand.
fn confirmation(kind: &[u8], channel: &str, count: usize) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"*3\r\n");
    out.extend_from_slice(format!("${}\r\n", kind.len()).as_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("${}\r\n{}\r\n", channel.len(), channel).as_bytes());
    out.extend_from_slice(format!(":{}\r\n", count).as_bytes());
    out
}

/// `*3` of "message", channel, payload.
fn push_message(channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"*3\r\n$7\r\nmessage\r\n");
    out.extend_from_slice(format!("${}\r\n{}\r\n", channel.len(), channel).as_bytes());
    out.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_then_publish_counts_receivers() {
        let hub = Hub::new();
        let a = Connection::fake();
        let b = Connection::fake();
        hub.subscribe(&a, &[b"news".to_vec()]);
        hub.subscribe(&b, &[b"news".to_vec(), b"sport".to_vec()]);
        assert_eq!(hub.publish("news", b"hello"), 2);
        assert_eq!(hub.publish("sport", b"goal"), 1);
        assert_eq!(hub.publish("empty", b"x"), 0);
    }

    #[test]
    fn unsubscribe_and_drop_detach() {
        let hub = Hub::new();
        let a = Connection::fake();
        hub.subscribe(&a, &[b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(a.subscription_count(), 2);
        hub.unsubscribe(&a, &[b"one".to_vec()]);
        assert_eq!(a.subscription_count(), 1);
        assert_eq!(hub.publish("one", b"x"), 0);
        assert_eq!(hub.publish("two", b"x"), 1);

        hub.drop_connection(&a);
        assert_eq!(a.subscription_count(), 0);
        assert_eq!(hub.publish("two", b"x"), 0);
    }

    #[test]
    fn duplicate_subscription_is_counted_once() {
        let hub = Hub::new();
        let a = Connection::fake();
        hub.subscribe(&a, &[b"ch".to_vec(), b"ch".to_vec()]);
        assert_eq!(a.subscription_count(), 1);
        assert_eq!(hub.publish("ch", b"x"), 1);
    }

    #[test]
    fn wire_shapes() {
        assert_eq!(
            confirmation(b"subscribe", "ch", 1),
            b"*3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n".to_vec()
        );
        assert_eq!(
            push_message("ch", b"payload"),
            b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$7\r\npayload\r\n".to_vec()
        );
    }
}
