//! A small in-memory universe behind the demo server: one home star per
//! empire, a shared chat log, and the sessions that said hello.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use empire_net::{
    AccountResolver, ChatMessage, ChatMessagesPacket, Empire, EmpireDetailsPacket, GameSession,
    HelloPacket, ModifyStarPacket, Packet, PlayerHandler, SessionId, Star, StarUpdatedPacket,
    StaticAccounts, WatchSectorsPacket,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

/// How much chat history a fresh client gets on hello.
const CHAT_BACKLOG: usize = 50;
/// Messages kept in memory; older ones are forgotten.
const CHAT_HISTORY: usize = CHAT_BACKLOG * 4;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

struct ChatLog {
    next_id: i64,
    messages: VecDeque<ChatMessage>,
}

/// Game state shared by every session.
pub struct World {
    empires: HashMap<i64, Empire>,
    stars: RwLock<HashMap<i64, Star>>,
    chat: Mutex<ChatLog>,
    roster: RwLock<HashMap<SessionId, Arc<GameSession>>>,
    /// One writer task per session, so packets reach a client in the order
    /// they were produced.
    outboxes: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Packet>>>,
}

impl World {
    /// Build a world giving each empire a home star at sector `(id, 0)`.
    pub fn new(empires: impl IntoIterator<Item = Empire>) -> Self {
        let now = now_millis();
        let mut by_id = HashMap::new();
        let mut stars = HashMap::new();
        for mut empire in empires {
            let star = Star {
                id: empire.id,
                name: format!("{} Prime", empire.display_name),
                sector_x: empire.id,
                sector_y: 0,
                offset_x: 512.0,
                offset_y: 512.0,
                last_simulation: Some(now),
            };
            empire.home_star = Some(star.clone());
            stars.insert(star.id, star);
            by_id.insert(empire.id, empire);
        }
        Self {
            empires: by_id,
            stars: RwLock::new(stars),
            chat: Mutex::new(ChatLog {
                next_id: 1,
                messages: VecDeque::new(),
            }),
            roster: RwLock::new(HashMap::new()),
            outboxes: Mutex::new(HashMap::new()),
        }
    }

    /// An empire with its current home star.
    pub fn empire(&self, id: i64) -> Option<Empire> {
        let mut empire = self.empires.get(&id)?.clone();
        if let Some(home) = &empire.home_star {
            empire.home_star = self.stars.read().get(&home.id).cloned();
        }
        Some(empire)
    }

    /// Sessions that have said hello and not left.
    pub fn online(&self) -> usize {
        self.roster.read().len()
    }

    /// Record a chat message from `empire_id` and return it stamped.
    pub fn post_chat(&self, empire_id: Option<i64>, message: String) -> ChatMessage {
        let mut chat = self.chat.lock();
        let stamped = ChatMessage {
            id: chat.next_id,
            empire_id,
            date_posted: now_millis(),
            message,
        };
        chat.next_id += 1;
        chat.messages.push_back(stamped.clone());
        while chat.messages.len() > CHAT_HISTORY {
            chat.messages.pop_front();
        }
        stamped
    }

    fn chat_since(&self, since: Option<i64>) -> Vec<ChatMessage> {
        let chat = self.chat.lock();
        let newer: Vec<_> = chat
            .messages
            .iter()
            .filter(|m| since.is_none_or(|t| m.date_posted > t))
            .cloned()
            .collect();
        let skip = newer.len().saturating_sub(CHAT_BACKLOG);
        newer.into_iter().skip(skip).collect()
    }

    fn stars_in(&self, area: &WatchSectorsPacket) -> Vec<Star> {
        let mut found: Vec<_> = self
            .stars
            .read()
            .values()
            .filter(|s| {
                (area.left..=area.right).contains(&s.sector_x)
                    && (area.top..=area.bottom).contains(&s.sector_y)
            })
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        found
    }

    fn on_hello(&self, session: &Arc<GameSession>, hello: HelloPacket) -> Vec<Packet> {
        self.roster
            .write()
            .insert(session.id(), Arc::clone(session));
        tracing::info!(
            "{:?} resumed (star sim {:?}, chat {:?})",
            session.id(),
            hello.our_star_last_simulation,
            hello.last_chat_time
        );

        let mut replies = Vec::new();
        let messages = self.chat_since(hello.last_chat_time);
        if !messages.is_empty() {
            replies.push(Packet::ChatMessages(ChatMessagesPacket { messages }));
        }
        if let Some(home) = self
            .empire(session.empire().id)
            .and_then(|e| e.home_star)
            .filter(|star| hello.our_star_last_simulation < star.last_simulation)
        {
            replies.push(Packet::StarUpdated(StarUpdatedPacket { stars: vec![home] }));
        }
        replies
    }

    fn on_modify(&self, session: &Arc<GameSession>, modify: ModifyStarPacket) -> Vec<Packet> {
        if modify.empire_id != session.empire().id {
            tracing::warn!(
                "{:?} tried to modify star {} as empire {}",
                session.id(),
                modify.star_id,
                modify.empire_id
            );
            return Vec::new();
        }
        let mut stars = self.stars.write();
        let Some(star) = stars.get_mut(&modify.star_id) else {
            tracing::debug!("Modify for unknown star {}", modify.star_id);
            return Vec::new();
        };
        tracing::info!(
            "Empire {} applied {} modification(s) to {}",
            modify.empire_id,
            modify.modifications.len(),
            star.name
        );
        star.last_simulation = Some(now_millis());
        vec![Packet::StarUpdated(StarUpdatedPacket {
            stars: vec![star.clone()],
        })]
    }

    fn relay_chat(&self, session: &Arc<GameSession>, packet: ChatMessagesPacket) {
        let messages: Vec<_> = packet
            .messages
            .into_iter()
            .map(|m| self.post_chat(Some(session.empire().id), m.message))
            .collect();
        if messages.is_empty() {
            return;
        }
        let relay = Packet::ChatMessages(ChatMessagesPacket { messages });
        let listeners: Vec<_> = self.roster.read().values().cloned().collect();
        for listener in &listeners {
            self.deliver(listener, [relay.clone()]);
        }
    }

    /// Queue `packets` on the session's outbox, starting its writer task on
    /// first use.
    fn deliver(&self, session: &Arc<GameSession>, packets: impl IntoIterator<Item = Packet>) {
        if session.is_disconnected() {
            return;
        }
        let mut outboxes = self.outboxes.lock();
        let outbox = outboxes.entry(session.id()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
            let session = Arc::clone(session);
            tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    // Failures are logged by the session.
                    if session.send(&packet).await.is_err() {
                        break;
                    }
                }
            });
            tx
        });
        for packet in packets {
            if outbox.send(packet).is_err() {
                tracing::debug!("{:?} outbox closed, dropping replies", session.id());
                break;
            }
        }
    }
}

impl PlayerHandler for World {
    fn on_packet(&self, session: &Arc<GameSession>, packet: Packet) {
        let replies = match packet {
            Packet::Hello(hello) => self.on_hello(session, hello),
            Packet::WatchSectors(area) => {
                vec![Packet::StarUpdated(StarUpdatedPacket {
                    stars: self.stars_in(&area),
                })]
            }
            Packet::ModifyStar(modify) => self.on_modify(session, modify),
            Packet::ChatMessages(chat) => {
                self.relay_chat(session, chat);
                Vec::new()
            }
            Packet::RequestEmpire(request) => {
                let empires = request
                    .empire_ids
                    .iter()
                    .filter_map(|id| self.empire(*id))
                    .collect();
                vec![Packet::EmpireDetails(EmpireDetailsPacket { empires })]
            }
            other @ (Packet::StarUpdated(_) | Packet::EmpireDetails(_)) => {
                tracing::warn!("{:?} sent server-only {:?}", session.id(), other.kind());
                Vec::new()
            }
        };

        if !replies.is_empty() {
            self.deliver(session, replies);
        }
    }

    fn on_disconnect(&self, session: &Arc<GameSession>) {
        self.roster.write().remove(&session.id());
        self.outboxes.lock().remove(&session.id());
    }
}

/// Resolves cookies through the account table, then fills in the empire's
/// home star from the world.
pub struct WorldAccounts {
    pub table: StaticAccounts,
    pub world: Arc<World>,
}

impl AccountResolver for WorldAccounts {
    fn resolve(&self, cookie: &str) -> Option<Empire> {
        let empire = self.table.resolve(cookie)?;
        self.world.empire(empire.id).or(Some(empire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use empire_net::{
        FrameConfig, SessionIdentity, decode_payload, encode_payload, read_frame, write_frame,
    };
    use tokio::io::duplex;

    fn empire(id: i64, name: &str) -> Empire {
        Empire {
            id,
            display_name: name.to_string(),
            home_star: None,
        }
    }

    fn world() -> Arc<World> {
        Arc::new(World::new([empire(1, "Red"), empire(2, "Blue")]))
    }

    async fn join(
        world: &Arc<World>,
        empire_id: i64,
        id: u64,
    ) -> (Arc<GameSession>, tokio::io::DuplexStream) {
        let (server_side, mut client_side) = duplex(64 * 1024);
        let identity = SessionIdentity {
            cookie: format!("cookie-{empire_id}"),
            empire: world.empire(empire_id).unwrap(),
        };
        let handler: Arc<dyn PlayerHandler> = world.clone();
        let session = GameSession::accept(
            server_side,
            SessionId(id),
            identity,
            handler,
            FrameConfig::default(),
        )
        .await
        .unwrap();
        // Server greeting.
        let greeting = next(&mut client_side).await;
        assert!(matches!(greeting, Packet::Hello(_)));
        (session, client_side)
    }

    async fn next(stream: &mut tokio::io::DuplexStream) -> Packet {
        let frame = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            read_frame(stream, &FrameConfig::default()),
        )
        .await
        .unwrap()
        .unwrap();
        decode_payload(&frame).unwrap()
    }

    async fn say(stream: &mut tokio::io::DuplexStream, packet: Packet) {
        let payload = encode_payload(&packet).unwrap();
        write_frame(stream, &payload, &FrameConfig::default())
            .await
            .unwrap();
    }

    #[test]
    fn test_every_empire_gets_a_home_star() {
        let world = world();
        let red = world.empire(1).unwrap();
        let home = red.home_star.unwrap();
        assert_eq!(home.name, "Red Prime");
        assert_eq!((home.sector_x, home.sector_y), (1, 0));
        assert!(world.empire(99).is_none());
    }

    #[test]
    fn test_chat_backlog_filters_by_time() {
        let world = world();
        let first = world.post_chat(Some(1), "hi".to_string());
        let second = world.post_chat(Some(2), "hello".to_string());
        assert!(second.id > first.id);

        assert_eq!(world.chat_since(None).len(), 2);
        let newer = world.chat_since(Some(second.date_posted));
        assert!(newer.is_empty());
    }

    #[test]
    fn test_chat_history_is_capped() {
        let world = world();
        let total = CHAT_HISTORY + 30;
        for n in 0..total {
            world.post_chat(Some(1), format!("line {n}"));
        }

        let chat = world.chat.lock();
        assert_eq!(chat.messages.len(), CHAT_HISTORY);
        assert_eq!(chat.messages[0].id, 31);
        assert_eq!(chat.messages.back().unwrap().id, total as i64);
        drop(chat);

        let backlog = world.chat_since(None);
        assert_eq!(backlog.len(), CHAT_BACKLOG);
        assert_eq!(backlog.last().unwrap().message, format!("line {}", total - 1));
    }

    #[test]
    fn test_stars_in_rectangle() {
        let world = world();
        let area = WatchSectorsPacket {
            left: 0,
            top: 0,
            right: 1,
            bottom: 0,
        };
        let ids: Vec<_> = world.stars_in(&area).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_resolver_adds_home_star() {
        let world = world();
        let mut table = StaticAccounts::default();
        table.insert("red", empire(1, "Red"));
        let accounts = WorldAccounts { table, world };
        assert!(accounts.resolve("red").unwrap().home_star.is_some());
        assert!(accounts.resolve("nobody").is_none());
    }

    #[tokio::test]
    async fn test_hello_with_stale_star_gets_update() {
        let world = world();
        let (_session, mut client) = join(&world, 1, 1).await;

        say(
            &mut client,
            Packet::Hello(HelloPacket {
                empire_id: Some(1),
                our_star_last_simulation: Some(0),
                ..Default::default()
            }),
        )
        .await;

        match next(&mut client).await {
            Packet::StarUpdated(update) => assert_eq!(update.stars[0].id, 1),
            other => panic!("expected StarUpdated, got {other:?}"),
        }
        assert_eq!(world.online(), 1);
    }

    #[tokio::test]
    async fn test_chat_is_relayed_to_everyone() {
        let world = world();
        let (_red, mut red) = join(&world, 1, 1).await;
        let (_blue, mut blue) = join(&world, 2, 2).await;
        let hello = Packet::Hello(HelloPacket {
            our_star_last_simulation: Some(i64::MAX),
            ..Default::default()
        });
        say(&mut red, hello.clone()).await;
        say(&mut blue, hello).await;
        while world.online() < 2 {
            tokio::task::yield_now().await;
        }

        say(
            &mut red,
            Packet::ChatMessages(ChatMessagesPacket {
                messages: vec![ChatMessage {
                    id: 0,
                    empire_id: None,
                    date_posted: 0,
                    message: "for the empire".to_string(),
                }],
            }),
        )
        .await;

        for stream in [&mut red, &mut blue] {
            match next(stream).await {
                Packet::ChatMessages(chat) => {
                    assert_eq!(chat.messages[0].message, "for the empire");
                    assert_eq!(chat.messages[0].empire_id, Some(1));
                    assert!(chat.messages[0].id > 0);
                }
                other => panic!("expected chat, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_modify_for_other_empire_is_ignored() {
        let world = world();
        let (_session, mut client) = join(&world, 1, 1).await;

        say(
            &mut client,
            Packet::ModifyStar(ModifyStarPacket {
                star_id: 2,
                empire_id: 2,
                modifications: Vec::new(),
            }),
        )
        .await;
        say(
            &mut client,
            Packet::RequestEmpire(empire_net::RequestEmpirePacket {
                empire_ids: vec![2, 7],
            }),
        )
        .await;

        // The modify got no answer; the first reply is the empire lookup.
        match next(&mut client).await {
            Packet::EmpireDetails(details) => {
                assert_eq!(details.empires.len(), 1);
                assert_eq!(details.empires[0].display_name, "Blue");
            }
            other => panic!("expected EmpireDetails, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replies_keep_request_order() {
        let world = world();
        let (_session, mut client) = join(&world, 1, 1).await;

        let asked: Vec<i64> = (0..40).map(|n| 1 + n % 2).collect();
        for id in &asked {
            say(
                &mut client,
                Packet::RequestEmpire(empire_net::RequestEmpirePacket {
                    empire_ids: vec![*id],
                }),
            )
            .await;
        }

        let mut answered = Vec::new();
        for _ in &asked {
            match next(&mut client).await {
                Packet::EmpireDetails(details) => answered.push(details.empires[0].id),
                other => panic!("expected EmpireDetails, got {other:?}"),
            }
        }
        assert_eq!(answered, asked);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_roster() {
        let world = world();
        let (session, mut client) = join(&world, 1, 1).await;
        say(&mut client, Packet::Hello(HelloPacket::default())).await;
        while world.online() < 1 {
            tokio::task::yield_now().await;
        }
        session.close();
        assert_eq!(world.online(), 0);
        assert!(world.outboxes.lock().is_empty());
    }
}
