//! A seat inside a session.

use crate::connection::{ConnectionId, ConnectionTable, Outbox};
use log::debug;
use shared::{PlayerInfo, SeatId, ServerMessage, Tick};

#[derive(Debug)]
pub struct Player {
    seat: SeatId,
    token: String,
    name: String,
    address: String,
    conn: ConnectionId,
    outbox: Outbox,
    ready: bool,
    confirmed_tick: Tick,
}

impl Player {
    pub fn new(
        seat: SeatId,
        token: String,
        name: String,
        address: String,
        conn: ConnectionId,
        outbox: Outbox,
    ) -> Self {
        Player {
            seat,
            token,
            name,
            address,
            conn,
            outbox,
            ready: false,
            confirmed_tick: 0,
        }
    }

    pub fn seat(&self) -> SeatId {
        self.seat
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        debug!("Player #{} ready: {}", self.seat, ready);
        self.ready = ready;
    }

    pub fn confirmed_tick(&self) -> Tick {
        self.confirmed_tick
    }

    /// Ticks only ever move forward; a confirmation that does not advance
    /// the player's tick is dropped.
    pub fn confirm_tick(&mut self, tick: Tick) -> bool {
        if tick > self.confirmed_tick {
            self.confirmed_tick = tick;
            true
        } else {
            debug!(
                "Player #{} confirmed tick {} at or below {}, ignoring",
                self.seat, tick, self.confirmed_tick
            );
            false
        }
    }

    pub fn send(&self, message: ServerMessage) {
        self.outbox.send(message);
    }

    pub fn info(&self, with_token: bool) -> PlayerInfo {
        PlayerInfo {
            seat: self.seat,
            name: self.name.clone(),
            address: self.address.clone(),
            token: if with_token {
                Some(self.token.clone())
            } else {
                None
            },
        }
    }

    /// Latency between this player and `other` through the server, relative
    /// to this player.
    pub fn ping_to(&self, other: &Player, connections: &ConnectionTable) -> i64 {
        let own = connections.ping_of(self.conn);
        if self.seat == other.seat {
            own
        } else {
            own + connections.ping_of(other.conn)
        }
    }

    /// Clock offset from this player to `other`, relative to this player.
    pub fn offset_to(&self, other: &Player, connections: &ConnectionTable) -> i64 {
        if self.seat == other.seat {
            0
        } else {
            connections.offset_of(other.conn) - connections.offset_of(self.conn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::PROBE_WINDOW;
    use tokio::sync::mpsc;

    fn player(seat: SeatId, conn: ConnectionId) -> Player {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        Player::new(
            seat,
            format!("token-{}", seat),
            format!("player-{}", seat),
            format!("127.0.0.1:{}", 4000 + seat),
            conn,
            Outbox::new(tx),
        )
    }

    /// Builds a table whose clocks report exactly the given ping and offset,
    /// by replaying a full probe window per connection.
    fn table_with(estimates: &[(i64, i64)]) -> (ConnectionTable, Vec<ConnectionId>) {
        let mut table = ConnectionTable::new();
        let mut ids = Vec::new();

        for &(ping, offset) in estimates {
            let (tx, rx) = mpsc::unbounded_channel();
            drop(rx);
            let id = table.add("127.0.0.1:0".to_string(), Outbox::new(tx));

            let clock = &mut table.get_mut(id).unwrap().clock;
            for i in 0..PROBE_WINDOW {
                let local = 50_000 + i as i64 * 10;
                // Constant round trip of 2*ping and skew of offset-ping land
                // the estimates exactly on the requested values.
                clock.on_probe_reply(local + offset - ping, ping * 2, local);
            }
            assert_eq!(table.ping_of(id), ping);
            assert_eq!(table.offset_of(id), offset);
            ids.push(id);
        }

        (table, ids)
    }

    #[test]
    fn test_tick_confirmations_are_monotonic() {
        let mut p = player(1, 1);
        assert_eq!(p.confirmed_tick(), 0);

        assert!(p.confirm_tick(5));
        assert_eq!(p.confirmed_tick(), 5);

        assert!(!p.confirm_tick(3));
        assert!(!p.confirm_tick(5));
        assert_eq!(p.confirmed_tick(), 5);

        assert!(p.confirm_tick(6));
        assert_eq!(p.confirmed_tick(), 6);
    }

    #[test]
    fn test_info_hides_token_from_others() {
        let p = player(2, 1);
        assert_eq!(p.info(true).token.as_deref(), Some("token-2"));
        assert_eq!(p.info(false).token, None);
        assert_eq!(p.info(false).seat, 2);
    }

    #[test]
    fn test_ping_to_self_is_own_ping() {
        let (table, ids) = table_with(&[(40, 100)]);
        let p = player(1, ids[0]);

        assert_eq!(p.ping_to(&p, &table), 40);
        assert_eq!(p.offset_to(&p, &table), 0);
    }

    #[test]
    fn test_ping_to_other_sums_both_legs() {
        let (table, ids) = table_with(&[(40, 100), (25, -60)]);
        let a = player(1, ids[0]);
        let b = player(2, ids[1]);

        assert_eq!(a.ping_to(&b, &table), 65);
        assert_eq!(b.ping_to(&a, &table), 65);
    }

    #[test]
    fn test_offset_to_other_is_difference() {
        let (table, ids) = table_with(&[(40, 100), (25, -60)]);
        let a = player(1, ids[0]);
        let b = player(2, ids[1]);

        assert_eq!(a.offset_to(&b, &table), -160);
        assert_eq!(b.offset_to(&a, &table), 160);
    }
}
