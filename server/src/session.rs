//! Session lifecycle: membership, readiness, pausing and the handover into
//! lockstep once a game starts.
//!
//! A session moves through `Forming` and `ReadyPending` while gathering
//! members, then `Running`/`Paused` once started. `Closed` is terminal; the
//! directory drops a session the moment it closes.

use crate::connection::{ConnectionId, ConnectionTable, Outbox};
use crate::lockstep::Lockstep;
use crate::player::Player;
use crate::utils::hex_token;
use log::{debug, info};
use rand::Rng;
use shared::{
    ActionEnvelope, ErrorCode, GameInfo, GamePlayer, PlayerInfo, Push, Reply, RequestId, SeatId,
    ServerMessage, SessionSummary, SessionToken, Tick,
};
use std::collections::HashSet;

pub const DEFAULT_TICK_RATE: u32 = 100;
pub const DEFAULT_TICK_BUFFER: u32 = 3;
pub const DEFAULT_MAX_PLAYERS: usize = 8;

/// Range of the per-session random seed handed to clients at game start.
pub const SEED_BASE: i64 = 500_000;
pub const SEED_SPREAD: i64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tick_rate: u32,
    pub tick_buffer: u32,
    pub max_players: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            tick_rate: DEFAULT_TICK_RATE,
            tick_buffer: DEFAULT_TICK_BUFFER,
            max_players: DEFAULT_MAX_PLAYERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Gathering members; not everyone is ready.
    Forming,
    /// Every member is ready, waiting for the owner to start.
    ReadyPending,
    Running,
    Paused,
    Closed,
}

/// Registry work left for the directory after a session operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Effects {
    /// The public listing changed.
    pub list_changed: bool,
    /// The last member left; the session should close once the current
    /// event has fully unwound.
    pub emptied: bool,
    /// The session closed and must leave the registry.
    pub closed: bool,
    /// A start is pending on the sync gate; poll again shortly.
    pub poll_start: bool,
}

/// Connection-side identity of a player being admitted.
#[derive(Debug, Clone)]
pub struct Joiner {
    pub conn: ConnectionId,
    pub name: String,
    pub address: String,
    pub outbox: Outbox,
}

#[derive(Debug)]
pub struct Session {
    token: SessionToken,
    state: SessionState,
    config: SessionConfig,
    players: Vec<Player>,
    next_seat: SeatId,
    owner_seat: SeatId,
    /// Snapshot of the owner; survives the owner leaving a running session.
    owner_info: Option<PlayerInfo>,
    paused_by: HashSet<SeatId>,
    start_pending: bool,
    lockstep: Lockstep,
}

impl Session {
    /// Creates a session and seats `owner` in it. Owners are always ready.
    pub fn found<R: Rng>(
        token: SessionToken,
        config: SessionConfig,
        seed: i64,
        owner: Joiner,
        request_id: RequestId,
        rng: &mut R,
    ) -> Session {
        let lockstep = Lockstep::new(config.tick_rate, config.tick_buffer, seed);
        let mut session = Session {
            token,
            state: SessionState::Forming,
            config,
            players: Vec::new(),
            next_seat: 0,
            owner_seat: 0,
            owner_info: None,
            paused_by: HashSet::new(),
            start_pending: false,
            lockstep,
        };

        let seat = session.create_player(owner, rng);
        if let Some(player) = session.player_mut(seat) {
            player.set_ready(true);
        }
        session.owner_seat = seat;
        session.owner_info = session.player(seat).map(|p| p.info(false));
        session.refresh_state();
        session.welcome(seat, request_id);

        info!("Session {} founded", session.token);
        session
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn owner_seat(&self) -> SeatId {
        self.owner_seat
    }

    /// True from the moment a session starts; pausing does not suspend it.
    pub fn is_started(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Paused)
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.players.len()
    }

    pub fn member_conns(&self) -> Vec<ConnectionId> {
        self.players.iter().map(|p| p.conn()).collect()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            token: self.token.clone(),
            running: self.is_started(),
            ready: self.all_ready(),
            owner: self.owner_info.clone(),
            member_count: self.players.len() as u32,
        }
    }

    // Membership -------------------------------------------------------------

    /// Admits a player and reports the assigned seat so the caller can link
    /// the connection to it.
    pub fn join<R: Rng>(
        &mut self,
        joiner: Joiner,
        request_id: RequestId,
        rng: &mut R,
    ) -> Result<(SeatId, Effects), ErrorCode> {
        if self.is_started() {
            return Err(ErrorCode::Running);
        }
        if self.players.len() >= self.config.max_players {
            return Err(ErrorCode::Full);
        }

        let seat = self.create_player(joiner, rng);
        self.refresh_state();
        self.welcome(seat, request_id);

        info!("Player #{} joined session {}", seat, self.token);
        Ok((
            seat,
            Effects {
                list_changed: true,
                ..Effects::default()
            },
        ))
    }

    /// A member leaves, voluntarily (`request_id` present) or because the
    /// connection went away. An owner leaving before the start takes the
    /// whole session down.
    pub fn leave(
        &mut self,
        seat: SeatId,
        request_id: Option<RequestId>,
    ) -> Result<Effects, ErrorCode> {
        if self.player(seat).is_none() {
            return Err(ErrorCode::NotFound);
        }

        if seat == self.owner_seat && !self.is_started() {
            if let Some(id) = request_id {
                self.reply_to(seat, id, Reply::Closed(self.summary()));
            }
            self.close();
            return Ok(Effects {
                list_changed: true,
                closed: true,
                ..Effects::default()
            });
        }

        if let Some(id) = request_id {
            self.reply_to(seat, id, Reply::Left(self.summary()));
        }
        self.remove_player(seat);

        Ok(Effects {
            list_changed: true,
            emptied: self.players.is_empty(),
            ..Effects::default()
        })
    }

    /// Broadcasts the closure to whoever is still seated. The caller drops
    /// the session from the registry and unlinks the members' connections.
    pub fn close(&mut self) {
        self.broadcast(push(Push::SessionClosed(self.summary())));
        self.state = SessionState::Closed;
        info!("Session {} closed", self.token);
    }

    // Readiness and start ----------------------------------------------------

    pub fn ready(&mut self, seat: SeatId, request_id: RequestId) -> Result<Effects, ErrorCode> {
        if seat == self.owner_seat {
            return Err(ErrorCode::Invalid);
        }
        if self.is_started() {
            return Err(ErrorCode::Running);
        }
        {
            let player = self.player_mut(seat).ok_or(ErrorCode::NotFound)?;
            if player.is_ready() {
                return Err(ErrorCode::IsReady);
            }
            player.set_ready(true);
        }
        self.after_ready_change(seat);
        self.reply_to(seat, request_id, Reply::Ready(self.summary()));
        Ok(Effects {
            list_changed: true,
            ..Effects::default()
        })
    }

    pub fn not_ready(&mut self, seat: SeatId, request_id: RequestId) -> Result<Effects, ErrorCode> {
        if seat == self.owner_seat {
            return Err(ErrorCode::Invalid);
        }
        if self.is_started() {
            return Err(ErrorCode::Running);
        }
        {
            let player = self.player_mut(seat).ok_or(ErrorCode::NotFound)?;
            if !player.is_ready() {
                return Err(ErrorCode::NotReady);
            }
            player.set_ready(false);
        }
        self.after_ready_change(seat);
        self.reply_to(seat, request_id, Reply::NotReady(self.summary()));
        Ok(Effects {
            list_changed: true,
            ..Effects::default()
        })
    }

    /// Accepts a start request from the owner. The session answers right
    /// away and then waits on the sync gate before actually running.
    pub fn start(&mut self, seat: SeatId, request_id: RequestId) -> Result<Effects, ErrorCode> {
        if !self.all_ready() {
            return Err(ErrorCode::NotReady);
        }
        if self.is_started() || self.start_pending {
            return Err(ErrorCode::Running);
        }
        if seat != self.owner_seat {
            return Err(ErrorCode::NotOwner);
        }

        self.start_pending = true;
        self.reply_to(seat, request_id, Reply::Started(self.summary()));
        info!("Session {} starting", self.token);
        Ok(Effects {
            poll_start: true,
            ..Effects::default()
        })
    }

    /// Runs the sync gate for a pending start: the game begins only once
    /// every member's clock has settled.
    pub fn try_begin(&mut self, connections: &ConnectionTable) -> Effects {
        if !self.start_pending || self.is_started() {
            return Effects::default();
        }
        if !self.all_ready() {
            info!(
                "Session {} start abandoned, members are no longer ready",
                self.token
            );
            self.start_pending = false;
            return Effects::default();
        }
        if !self
            .players
            .iter()
            .all(|player| connections.is_synced(player.conn()))
        {
            debug!("Session {} waiting for clock sync", self.token);
            return Effects {
                poll_start: true,
                ..Effects::default()
            };
        }

        self.start_pending = false;
        self.state = SessionState::Running;
        self.broadcast_with(|to| push(Push::GameStart(self.game_info(to.seat()))));
        self.broadcast(push(Push::TickLimit {
            tick: self.lockstep.tick_limit(),
        }));
        info!(
            "Session {} running with seed {}",
            self.token,
            self.lockstep.random_seed()
        );
        Effects {
            list_changed: true,
            ..Effects::default()
        }
    }

    /// Explicit close by the owner; only legal before the start.
    pub fn close_by(&mut self, seat: SeatId, request_id: RequestId) -> Result<Effects, ErrorCode> {
        if self.is_started() {
            return Err(ErrorCode::Running);
        }
        if seat != self.owner_seat {
            return Err(ErrorCode::NotOwner);
        }
        self.reply_to(seat, request_id, Reply::Closed(self.summary()));
        self.close();
        Ok(Effects {
            list_changed: true,
            closed: true,
            ..Effects::default()
        })
    }

    // Pause and resume -------------------------------------------------------

    /// Any member may pause a running session. Every current member is
    /// recorded as holding the pause and must resume individually.
    pub fn pause(&mut self, seat: SeatId, request_id: RequestId) -> Result<Effects, ErrorCode> {
        if !self.is_started() {
            return Err(ErrorCode::NotRunning);
        }
        if self.state == SessionState::Paused {
            return Err(ErrorCode::Paused);
        }
        if self.paused_by.contains(&seat) {
            return Err(ErrorCode::Invalid);
        }
        let info = self.player(seat).ok_or(ErrorCode::NotFound)?.info(false);

        self.state = SessionState::Paused;
        self.paused_by = self.players.iter().map(|p| p.seat()).collect();

        self.broadcast(push(Push::PlayerPaused(info)));
        self.broadcast(push(Push::SessionPaused(self.summary())));
        self.reply_to(seat, request_id, Reply::Paused(self.summary()));
        info!("Session {} paused by #{}", self.token, seat);
        Ok(Effects::default())
    }

    /// Releases one member's hold on the pause; the session resumes once
    /// the last hold is gone.
    pub fn resume(&mut self, seat: SeatId, request_id: RequestId) -> Result<Effects, ErrorCode> {
        if !self.is_started() {
            return Err(ErrorCode::NotRunning);
        }
        if self.state != SessionState::Paused {
            return Err(ErrorCode::NotPaused);
        }
        if !self.paused_by.contains(&seat) {
            return Err(ErrorCode::Invalid);
        }
        let info = self.player(seat).ok_or(ErrorCode::NotFound)?.info(false);

        self.paused_by.remove(&seat);
        self.broadcast(push(Push::PlayerResumed(info)));
        if self.paused_by.is_empty() {
            self.resume_play();
        }
        self.reply_to(seat, request_id, Reply::Resumed(self.summary()));
        Ok(Effects::default())
    }

    // Lockstep ---------------------------------------------------------------

    /// Feeds a member's tick confirmation into the coordinator. While the
    /// session is paused the confirmation is recorded per player but never
    /// moves the shared limit.
    pub fn confirm_tick(&mut self, seat: SeatId, tick: Tick) {
        if !self.is_started() {
            debug!(
                "Tick confirm for session {} before the start, ignoring",
                self.token
            );
            return;
        }

        let advanced = match self.player_mut(seat) {
            Some(player) => player.confirm_tick(tick),
            None => {
                debug!("Tick confirm from unknown seat #{}", seat);
                return;
            }
        };
        if !advanced || self.state != SessionState::Running {
            return;
        }

        let ticks = self.players.iter().map(|p| p.confirmed_tick());
        if let Some(limit) = self.lockstep.advance(ticks) {
            self.broadcast(push(Push::TickLimit { tick: limit }));
        }
    }

    /// Relays an opaque action to every member, stamped with the agreed
    /// execution tick and the pairwise latency estimates.
    pub fn relay_action(
        &mut self,
        seat: SeatId,
        payload: Vec<u8>,
        connections: &ConnectionTable,
    ) {
        if !self.is_started() {
            debug!(
                "Action for session {} before the start, ignoring",
                self.token
            );
            return;
        }
        let sender = match self.players.iter().find(|p| p.seat() == seat) {
            Some(player) => player,
            None => {
                debug!("Action from unknown seat #{}", seat);
                return;
            }
        };

        let sequence = self.lockstep.next_sequence();
        let execute_at_tick = self.lockstep.action_tick();

        for to in &self.players {
            to.send(push(Push::ActionRelay(ActionEnvelope {
                sequence,
                sender: seat,
                execute_at_tick,
                payload: payload.clone(),
                ping_to_sender: to.ping_to(sender, connections),
                offset_to_sender: to.offset_to(sender, connections),
            })));
        }
    }

    // Internals --------------------------------------------------------------

    fn create_player<R: Rng>(&mut self, joiner: Joiner, rng: &mut R) -> SeatId {
        self.next_seat += 1;
        let seat = self.next_seat;
        self.players.push(Player::new(
            seat,
            hex_token(rng, 16),
            joiner.name,
            joiner.address,
            joiner.conn,
            joiner.outbox,
        ));
        seat
    }

    /// Sends the admitted player its snapshot, then announces the admission
    /// to the whole session. The snapshot must land first: the newcomer has
    /// to know the session state before any roster deltas arrive.
    fn welcome(&self, seat: SeatId, request_id: RequestId) {
        let player = match self.player(seat) {
            Some(player) => player,
            None => return,
        };

        player.send(reply(request_id, Reply::SessionJoined(self.summary())));
        player.send(push(Push::SeatAssigned(player.info(true))));
        for other in self.players.iter().filter(|p| p.seat() != seat) {
            player.send(push(Push::PlayerJoined(other.info(false))));
        }

        self.broadcast(push(Push::PlayerJoined(player.info(false))));
        self.broadcast(push(Push::SessionUpdate(self.summary())));
    }

    fn remove_player(&mut self, seat: SeatId) {
        let index = match self.players.iter().position(|p| p.seat() == seat) {
            Some(index) => index,
            None => return,
        };
        let player = self.players.remove(index);

        // The leaver is already gone; announcements reach the rest only.
        self.broadcast(push(Push::PlayerLeft(player.info(false))));
        self.refresh_state();
        self.broadcast(push(Push::SessionUpdate(self.summary())));
        info!("Player #{} left session {}", seat, self.token);

        // A departed member must not keep the session paused.
        if self.state == SessionState::Paused {
            self.paused_by.remove(&seat);
            if self.paused_by.is_empty() {
                self.resume_play();
            }
        }
    }

    fn resume_play(&mut self) {
        self.state = SessionState::Running;
        self.broadcast(push(Push::SessionResumed(self.summary())));
        info!("Session {} resumed", self.token);
    }

    fn after_ready_change(&mut self, seat: SeatId) {
        self.refresh_state();
        if let Some(player) = self.player(seat) {
            let info = player.info(false);
            let event = if player.is_ready() {
                Push::PlayerReady(info)
            } else {
                Push::PlayerNotReady(info)
            };
            self.broadcast(push(event));
        }
        self.broadcast(push(Push::SessionUpdate(self.summary())));
    }

    fn refresh_state(&mut self) {
        if matches!(self.state, SessionState::Forming | SessionState::ReadyPending) {
            self.state = if !self.players.is_empty() && self.all_ready() {
                SessionState::ReadyPending
            } else {
                SessionState::Forming
            };
        }
    }

    fn all_ready(&self) -> bool {
        self.players.iter().all(|p| p.is_ready())
    }

    fn player(&self, seat: SeatId) -> Option<&Player> {
        self.players.iter().find(|p| p.seat() == seat)
    }

    fn player_mut(&mut self, seat: SeatId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.seat() == seat)
    }

    fn reply_to(&self, seat: SeatId, request_id: RequestId, message: Reply) {
        if let Some(player) = self.player(seat) {
            player.send(reply(request_id, message));
        }
    }

    fn broadcast(&self, message: ServerMessage) {
        for player in &self.players {
            player.send(message.clone());
        }
    }

    fn broadcast_with<F: Fn(&Player) -> ServerMessage>(&self, build: F) {
        for player in &self.players {
            player.send(build(player));
        }
    }

    fn game_info(&self, recipient: SeatId) -> GameInfo {
        GameInfo {
            random_seed: self.lockstep.random_seed(),
            tick_rate: self.lockstep.tick_rate(),
            tick_buffer: self.lockstep.tick_buffer(),
            players: self
                .players
                .iter()
                .map(|player| GamePlayer {
                    info: player.info(false),
                    is_self: player.seat() == recipient,
                })
                .collect(),
        }
    }
}

fn push(push: Push) -> ServerMessage {
    ServerMessage::Push(push)
}

fn reply(id: RequestId, reply: Reply) -> ServerMessage {
    ServerMessage::Reply { id, reply }
}
