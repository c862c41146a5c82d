//! Registry of live sessions. Owns session tokens, random seeds and the
//! public listing pushed to idle players.

use crate::session::{Effects, Joiner, Session, SessionConfig, SEED_BASE, SEED_SPREAD};
use crate::utils::hex_token;
use log::info;
use rand::rngs::StdRng;
use rand::Rng;
use shared::{ErrorCode, RequestId, SeatId, SessionSummary, SessionToken};
use std::collections::HashMap;

pub struct Directory {
    sessions: HashMap<SessionToken, Session>,
    config: SessionConfig,
    rng: StdRng,
}

impl Directory {
    pub fn new(config: SessionConfig, rng: StdRng) -> Self {
        Directory {
            sessions: HashMap::new(),
            config,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut Session> {
        self.sessions.get_mut(token)
    }

    /// Founds a new session with `joiner` as its owner. Returns the session
    /// token and the owner's seat for linking the connection.
    pub fn create(&mut self, joiner: Joiner, request_id: RequestId) -> (SessionToken, SeatId) {
        let token = loop {
            let candidate = hex_token(&mut self.rng, 16);
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let seed = SEED_BASE + self.rng.gen_range(0..SEED_SPREAD);

        let session = Session::found(
            token.clone(),
            self.config.clone(),
            seed,
            joiner,
            request_id,
            &mut self.rng,
        );
        let seat = session.owner_seat();
        self.sessions.insert(token.clone(), session);
        info!("{} sessions in the directory", self.sessions.len());
        (token, seat)
    }

    pub fn join(
        &mut self,
        token: &str,
        joiner: Joiner,
        request_id: RequestId,
    ) -> Result<(SeatId, Effects), ErrorCode> {
        let session = self.sessions.get_mut(token).ok_or(ErrorCode::NotFound)?;
        session.join(joiner, request_id, &mut self.rng)
    }

    /// Drops a closed session from the registry. The members' seat links are
    /// returned so the caller can clear them.
    pub fn remove(&mut self, token: &str) -> Option<Session> {
        let session = self.sessions.remove(token);
        if session.is_some() {
            info!("{} sessions in the directory", self.sessions.len());
        }
        session
    }

    /// Deferred close for sessions whose last member left. A session that
    /// picked up new members in the meantime stays.
    pub fn close_if_empty(&mut self, token: &str) -> bool {
        let empty = self
            .sessions
            .get(token)
            .map(|session| session.is_empty())
            .unwrap_or(false);
        if empty {
            if let Some(mut session) = self.sessions.remove(token) {
                session.close();
            }
            info!("{} sessions in the directory", self.sessions.len());
        }
        empty
    }

    /// The listing offered to idle players. Running sessions cannot be
    /// joined and are left out.
    pub fn public_list(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .sessions
            .values()
            .filter(|session| !session.is_started())
            .map(|session| session.summary())
            .collect();
        list.sort_by(|a, b| a.token.cmp(&b.token));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionTable, Outbox};
    use rand::SeedableRng;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Harness {
        table: ConnectionTable,
        inboxes: HashMap<ConnectionId, mpsc::UnboundedReceiver<shared::ServerMessage>>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                table: ConnectionTable::new(),
                inboxes: HashMap::new(),
            }
        }

        fn connect(&mut self) -> ConnectionId {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = self
                .table
                .add(format!("127.0.0.1:{}", 5000 + self.inboxes.len()), Outbox::new(tx));
            self.inboxes.insert(id, rx);
            id
        }

        fn joiner(&self, conn: ConnectionId, name: &str) -> Joiner {
            let connection = self.table.get(conn).expect("connected");
            Joiner {
                conn,
                name: name.to_string(),
                address: connection.address.clone(),
                outbox: connection.outbox.clone(),
            }
        }
    }

    fn directory() -> Directory {
        Directory::new(SessionConfig::default(), StdRng::seed_from_u64(99))
    }

    #[test]
    fn test_create_registers_and_lists() {
        let mut harness = Harness::new();
        let conn = harness.connect();
        let mut directory = directory();

        let (token, seat) = directory.create(harness.joiner(conn, "alice"), 1);
        assert_eq!(seat, 1);
        assert_eq!(directory.len(), 1);
        assert_eq!(token.len(), 32);

        let list = directory.public_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].token, token);
        assert_eq!(list[0].member_count, 1);
    }

    #[test]
    fn test_session_tokens_are_unique() {
        let mut harness = Harness::new();
        let mut directory = directory();

        let mut tokens = std::collections::HashSet::new();
        for _ in 0..16 {
            let conn = harness.connect();
            let (token, _) = directory.create(harness.joiner(conn, "p"), 1);
            assert!(tokens.insert(token));
        }
        assert_eq!(directory.len(), 16);
    }

    #[test]
    fn test_join_unknown_session() {
        let mut harness = Harness::new();
        let conn = harness.connect();
        let mut directory = directory();

        let result = directory.join("deadbeef", harness.joiner(conn, "bob"), 2);
        assert_eq!(result.unwrap_err(), ErrorCode::NotFound);
    }

    #[test]
    fn test_join_assigns_next_seat() {
        let mut harness = Harness::new();
        let owner = harness.connect();
        let guest = harness.connect();
        let mut directory = directory();

        let (token, _) = directory.create(harness.joiner(owner, "alice"), 1);
        let (seat, effects) = directory
            .join(&token, harness.joiner(guest, "bob"), 2)
            .expect("joined");
        assert_eq!(seat, 2);
        assert!(effects.list_changed);
    }

    #[test]
    fn test_close_if_empty_only_removes_empty_sessions() {
        let mut harness = Harness::new();
        let conn = harness.connect();
        let mut directory = directory();

        let (token, _) = directory.create(harness.joiner(conn, "alice"), 1);
        assert!(!directory.close_if_empty(&token), "still has its owner");
        assert_eq!(directory.len(), 1);

        let session = directory.get_mut(&token).expect("registered");
        session.leave(1, None).expect("leave");
        assert!(session.is_empty());

        assert!(directory.close_if_empty(&token));
        assert_eq!(directory.len(), 0);
        // Closing an unknown token is a quiet no-op.
        assert!(!directory.close_if_empty(&token));
    }

    #[test]
    fn test_public_list_skips_started_sessions() {
        let mut harness = Harness::new();
        let a = harness.connect();
        let b = harness.connect();
        let mut directory = directory();

        let (first, _) = directory.create(harness.joiner(a, "alice"), 1);
        let (second, _) = directory.create(harness.joiner(b, "bob"), 2);
        assert_eq!(directory.public_list().len(), 2);

        // Drive the first session into running; it drops off the list.
        for i in 0..crate::clock::PROBE_WINDOW {
            let clock = &mut harness.table.get_mut(a).unwrap().clock;
            let local = 50_000 + i as i64 * 10;
            clock.on_probe_reply(local - 10, 20, local);
        }
        let session = directory.get_mut(&first).expect("registered");
        session.start(1, 3).expect("start accepted");
        session.try_begin(&harness.table);
        assert!(session.is_started());

        let list = directory.public_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].token, second);
    }
}
