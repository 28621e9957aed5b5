//! What the client remembers between sessions, so a reconnect can ask the
//! server for a delta instead of everything.

use std::collections::HashMap;
use std::sync::Arc;

use empire_net::{Dispatcher, Empire, Packet, PacketKind, ResumeSource, Star};
use parking_lot::Mutex;

#[derive(Default)]
struct Cached {
    empire: Option<Empire>,
    stars: HashMap<i64, Star>,
    last_chat_time: Option<i64>,
}

/// Client-side cache fed by inbound packets.
#[derive(Default)]
pub struct SessionCache {
    inner: Mutex<Cached>,
}

impl SessionCache {
    /// Register the handlers that keep the cache current.
    pub fn attach(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let cache = Arc::clone(self);
        dispatcher.register_handler(PacketKind::Hello, move |packet| {
            if let Packet::Hello(hello) = packet
                && let Some(empire) = &hello.empire
            {
                let mut inner = cache.inner.lock();
                if let Some(home) = &empire.home_star {
                    inner.stars.entry(home.id).or_insert_with(|| home.clone());
                }
                inner.empire = Some(empire.clone());
            }
            Ok(())
        });

        let cache = Arc::clone(self);
        dispatcher.register_handler(PacketKind::StarUpdated, move |packet| {
            if let Packet::StarUpdated(update) = packet {
                let mut inner = cache.inner.lock();
                for star in &update.stars {
                    inner.stars.insert(star.id, star.clone());
                }
            }
            Ok(())
        });

        let cache = Arc::clone(self);
        dispatcher.register_handler(PacketKind::ChatMessages, move |packet| {
            if let Packet::ChatMessages(chat) = packet {
                let newest = chat.messages.iter().map(|m| m.date_posted).max();
                let mut inner = cache.inner.lock();
                inner.last_chat_time = inner.last_chat_time.max(newest);
            }
            Ok(())
        });
    }

    /// The player's empire, once the server has said hello.
    pub fn empire(&self) -> Option<Empire> {
        self.inner.lock().empire.clone()
    }

    /// Number of stars seen so far.
    pub fn star_count(&self) -> usize {
        self.inner.lock().stars.len()
    }
}

impl ResumeSource for SessionCache {
    fn our_star_last_simulation(&self) -> Option<i64> {
        let inner = self.inner.lock();
        let home = inner.empire.as_ref()?.home_star.as_ref()?;
        inner.stars.get(&home.id)?.last_simulation
    }

    fn last_chat_time(&self) -> Option<i64> {
        self.inner.lock().last_chat_time
    }
}
