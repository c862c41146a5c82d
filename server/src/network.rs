//! TCP front end and the event loop owning all server state.
//!
//! Socket reads and writes happen in per-connection tasks; everything else
//! runs on a single loop around `ServerState::handle`, so the state itself
//! never needs locking and can be driven directly in tests.

use crate::auth::{Authenticator, BasicAuth, SWEEP_INTERVAL};
use crate::clock::{ProbeDirective, PROBE_INTERVAL};
use crate::connection::{ConnectionId, ConnectionTable, Outbox, SeatRef};
use crate::directory::Directory;
use crate::session::{Effects, Joiner, Session, SessionConfig};
use crate::utils::{now_ms, sync_time};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{
    encode_frame, ClientMessage, ErrorCode, LoginRequest, Notice, Push, Reply, Request, RequestId,
    SeatId, ServerMessage, SessionToken, FRAME_HEADER_LEN, MAX_FRAME_LEN,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// How often a pending start re-checks the sync gate.
pub const START_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Events feeding the main loop.
#[derive(Debug)]
pub enum Event {
    Inbound {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
    /// The periodic clock probe for a connection is due.
    ProbeTimer {
        conn: ConnectionId,
        seq: u64,
    },
    /// A session with a pending start should re-check its sync gate.
    StartPoll {
        session: SessionToken,
    },
    AuthSweep,
    Shutdown,
}

/// The whole server state, owned by one task.
pub struct ServerState {
    connections: ConnectionTable,
    directory: Directory,
    auth: Box<dyn Authenticator>,
    /// Close-if-empty work queued behind the current event.
    deferred: VecDeque<SessionToken>,
    /// Timers requested while handling the current event. The shell drains
    /// them and feeds the events back after their delay.
    timers: Vec<(Duration, Event)>,
}

impl ServerState {
    pub fn new(config: SessionConfig, auth: Box<dyn Authenticator>, rng: StdRng) -> Self {
        ServerState {
            connections: ConnectionTable::new(),
            directory: Directory::new(config, rng),
            auth,
            deferred: VecDeque::new(),
            timers: vec![(SWEEP_INTERVAL, Event::AuthSweep)],
        }
    }

    pub fn connect(&mut self, address: String, outbox: Outbox) -> ConnectionId {
        let conn = self.connections.add(address, outbox);
        info!(
            "Connection {} opened ({} total)",
            conn,
            self.connections.len()
        );
        conn
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Inbound { conn, message } => self.on_message(conn, message),
            Event::Disconnected { conn } => self.drop_connection(conn),
            Event::ProbeTimer { conn, seq } => self.on_probe_timer(conn, seq),
            Event::StartPoll { session } => self.on_start_poll(&session),
            Event::AuthSweep => {
                self.auth.sweep();
                self.timers.push((SWEEP_INTERVAL, Event::AuthSweep));
            }
            Event::Shutdown => {
                info!(
                    "Shutting down, notifying {} connections",
                    self.connections.len()
                );
                for connection in self.connections.iter() {
                    connection.outbox.send(ServerMessage::Push(Push::Shutdown));
                }
            }
        }
        self.run_deferred();
    }

    /// Hands out the timers requested by the last event.
    pub fn take_timers(&mut self) -> Vec<(Duration, Event)> {
        std::mem::take(&mut self.timers)
    }

    // Message handling -------------------------------------------------------

    fn on_message(&mut self, conn: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Notice(notice) => self.on_notice(conn, notice),
            ClientMessage::Request { id, request } => self.on_request(conn, id, request),
        }
    }

    fn on_notice(&mut self, conn: ConnectionId, notice: Notice) {
        let logged_in = self
            .connections
            .get(conn)
            .map(|c| c.is_logged_in())
            .unwrap_or(false);
        if !logged_in {
            // Chatter before login is dropped.
            return;
        }

        match notice {
            Notice::ClockProbeReply {
                remote_time,
                round_trip,
            } => self.on_probe_reply(conn, remote_time, round_trip),
            Notice::TickConfirm { tick } => {
                self.with_seated(conn, |session, seat, _| session.confirm_tick(seat, tick));
            }
            Notice::SubmitAction { payload } => {
                self.with_seated(conn, |session, seat, connections| {
                    session.relay_action(seat, payload, connections)
                });
            }
        }
    }

    fn on_request(&mut self, conn: ConnectionId, id: RequestId, request: Request) {
        let logged_in = self
            .connections
            .get(conn)
            .map(|c| c.is_logged_in())
            .unwrap_or(false);

        if !logged_in {
            match request {
                Request::Login(login) => self.on_login(conn, id, login),
                _ => {
                    warn!("Request before login on connection {}, closing", conn);
                    self.drop_connection(conn);
                }
            }
            return;
        }

        if matches!(request, Request::Login(_)) {
            self.send_error(conn, id, ErrorCode::Invalid);
            return;
        }

        match self.connections.get(conn).and_then(|c| c.seat.clone()) {
            Some(seat_ref) => self.on_seated_request(conn, id, request, seat_ref),
            None => self.on_idle_request(conn, id, request),
        }
    }

    fn on_login(&mut self, conn: ConnectionId, id: RequestId, login: LoginRequest) {
        let connections = &self.connections;
        let in_use = |identifier: &str| connections.identifier_in_use(identifier);

        match self.auth.login(&login, &in_use) {
            Ok(identity) => {
                info!(
                    "Connection {} logged in as \"{}\"",
                    conn, identity.username
                );
                if let Some(connection) = self.connections.get_mut(conn) {
                    connection.identity = Some(identity.clone());
                }
                self.send(
                    conn,
                    ServerMessage::Reply {
                        id,
                        reply: Reply::LoggedIn(identity),
                    },
                );
                // Kick off clock probing right away.
                self.send_push(conn, Push::ClockProbe { echo: 0 });
                self.send_push(conn, Push::SessionList(self.directory.public_list()));
            }
            Err(code) => {
                self.send_error(conn, id, code);
                self.drop_connection(conn);
            }
        }
    }

    /// Session requests from a seated connection must address the session
    /// the seat belongs to.
    fn on_seated_request(
        &mut self,
        conn: ConnectionId,
        id: RequestId,
        request: Request,
        seat_ref: SeatRef,
    ) {
        if request.session() != Some(&seat_ref.session) {
            self.send_error(conn, id, ErrorCode::Invalid);
            return;
        }
        let leaving = matches!(request, Request::Leave { .. });
        let seat = seat_ref.seat;

        let outcome = self.directory.get_mut(&seat_ref.session).map(|session| {
            match request {
                Request::Ready { .. } => session.ready(seat, id),
                Request::NotReady { .. } => session.not_ready(seat, id),
                Request::Start { .. } => session.start(seat, id),
                Request::Leave { .. } => session.leave(seat, Some(id)),
                Request::Pause { .. } => session.pause(seat, id),
                Request::Resume { .. } => session.resume(seat, id),
                Request::CloseSession { .. } => session.close_by(seat, id),
                // Joining or creating makes no sense while seated.
                Request::Login(_) | Request::CreateSession | Request::JoinSession { .. } => {
                    Err(ErrorCode::Invalid)
                }
            }
        });

        match outcome {
            None => {
                // The session vanished; unlink the stale seat.
                self.connections.clear_seat(conn);
                self.send_error(conn, id, ErrorCode::NotFound);
            }
            Some(Ok(effects)) => {
                if leaving && !effects.closed {
                    self.connections.clear_seat(conn);
                }
                self.apply_effects(&seat_ref.session, effects);
            }
            Some(Err(code)) => self.send_error(conn, id, code),
        }
    }

    fn on_idle_request(&mut self, conn: ConnectionId, id: RequestId, request: Request) {
        match request {
            Request::CreateSession => {
                let joiner = match self.joiner_for(conn) {
                    Some(joiner) => joiner,
                    None => return,
                };
                let (token, seat) = self.directory.create(joiner, id);
                self.connections.set_seat(
                    conn,
                    SeatRef {
                        session: token,
                        seat,
                    },
                );
                self.push_session_list();
            }
            Request::JoinSession { session } => {
                let joiner = match self.joiner_for(conn) {
                    Some(joiner) => joiner,
                    None => return,
                };
                match self.directory.join(&session, joiner, id) {
                    Ok((seat, effects)) => {
                        self.connections.set_seat(
                            conn,
                            SeatRef {
                                session: session.clone(),
                                seat,
                            },
                        );
                        self.apply_effects(&session, effects);
                    }
                    Err(code) => self.send_error(conn, id, code),
                }
            }
            // Everything else needs a seat.
            _ => self.send_error(conn, id, ErrorCode::Invalid),
        }
    }

    // Clock ------------------------------------------------------------------

    fn on_probe_reply(&mut self, conn: ConnectionId, remote_time: i64, round_trip: i64) {
        let directive = match self.connections.get_mut(conn) {
            Some(connection) => {
                connection
                    .clock
                    .on_probe_reply(remote_time, round_trip, sync_time(now_ms()))
            }
            None => return,
        };

        match directive {
            ProbeDirective::Probe { echo } => self.send_push(conn, Push::ClockProbe { echo }),
            ProbeDirective::Report { ping, offset, seq } => {
                self.send_push(conn, Push::ClockReport { ping, offset });
                self.timers
                    .push((PROBE_INTERVAL, Event::ProbeTimer { conn, seq }));
            }
        }
    }

    fn on_probe_timer(&mut self, conn: ConnectionId, seq: u64) {
        let echo = self
            .connections
            .get_mut(conn)
            .and_then(|connection| connection.clock.on_probe_timer(seq));
        if let Some(echo) = echo {
            self.send_push(conn, Push::ClockProbe { echo });
        }
    }

    // Lifecycle --------------------------------------------------------------

    fn on_start_poll(&mut self, token: &SessionToken) {
        let effects = self
            .directory
            .get_mut(token)
            .map(|session| session.try_begin(&self.connections));
        if let Some(effects) = effects {
            self.apply_effects(token, effects);
        }
    }

    /// Removes a connection and leaves its session, if any. Used for both
    /// peer disconnects and server-side closes.
    fn drop_connection(&mut self, conn: ConnectionId) {
        let connection = match self.connections.remove(conn) {
            Some(connection) => connection,
            None => return,
        };
        info!(
            "Connection {} closed ({} remain)",
            conn,
            self.connections.len()
        );

        if let Some(seat_ref) = connection.seat {
            let effects = self
                .directory
                .get_mut(&seat_ref.session)
                .and_then(|session| session.leave(seat_ref.seat, None).ok());
            if let Some(effects) = effects {
                self.apply_effects(&seat_ref.session, effects);
            }
        }
    }

    fn apply_effects(&mut self, token: &SessionToken, effects: Effects) {
        if effects.poll_start {
            self.timers.push((
                START_POLL_INTERVAL,
                Event::StartPoll {
                    session: token.clone(),
                },
            ));
        }
        if effects.closed {
            self.finish_close(token);
        } else if effects.emptied {
            self.deferred.push_back(token.clone());
        }
        if effects.list_changed {
            self.push_session_list();
        }
    }

    /// Drops a closed session and unlinks every member's seat.
    fn finish_close(&mut self, token: &str) {
        if let Some(session) = self.directory.remove(token) {
            for conn in session.member_conns() {
                self.connections.clear_seat(conn);
            }
        }
    }

    fn run_deferred(&mut self) {
        while let Some(token) = self.deferred.pop_front() {
            if self.directory.close_if_empty(&token) {
                self.push_session_list();
            }
        }
    }

    // Outbound ---------------------------------------------------------------

    /// The session listing goes to logged in connections that are not in a
    /// session themselves.
    fn push_session_list(&self) {
        let list = self.directory.public_list();
        for connection in self.connections.iter() {
            if connection.is_logged_in() && connection.seat.is_none() {
                connection
                    .outbox
                    .send(ServerMessage::Push(Push::SessionList(list.clone())));
            }
        }
    }

    fn joiner_for(&self, conn: ConnectionId) -> Option<Joiner> {
        self.connections.get(conn).map(|connection| Joiner {
            conn,
            name: connection.display_name().to_string(),
            address: connection.address.clone(),
            outbox: connection.outbox.clone(),
        })
    }

    fn with_seated<F>(&mut self, conn: ConnectionId, f: F)
    where
        F: FnOnce(&mut Session, SeatId, &ConnectionTable),
    {
        let seat_ref = match self.connections.get(conn).and_then(|c| c.seat.clone()) {
            Some(seat_ref) => seat_ref,
            None => {
                debug!("Game notice from connection {} without a seat", conn);
                return;
            }
        };
        if let Some(session) = self.directory.get_mut(&seat_ref.session) {
            f(session, seat_ref.seat, &self.connections);
        }
    }

    fn send(&self, conn: ConnectionId, message: ServerMessage) {
        if let Some(connection) = self.connections.get(conn) {
            connection.outbox.send(message);
        }
    }

    fn send_push(&self, conn: ConnectionId, push: Push) {
        self.send(conn, ServerMessage::Push(push));
    }

    fn send_error(&self, conn: ConnectionId, id: RequestId, code: ErrorCode) {
        self.send(conn, ServerMessage::Error { id, code });
    }
}

// Front end ------------------------------------------------------------------

/// Listening front end. Accepts sockets and drives `ServerState` from a
/// single event loop.
pub struct Server {
    listener: TcpListener,
    state: ServerState,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        config: SessionConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let auth = Box::new(BasicAuth::new(StdRng::from_entropy()));
        let state = ServerState::new(config, auth, StdRng::from_entropy());

        Ok(Server {
            listener,
            state,
            event_tx,
            event_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Main loop: accepts connections, feeds events into the state and arms
    /// whatever timers the state asked for.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.arm_timers();
        info!("Server started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => self.register(socket, addr),
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.state.handle(event);
                            self.arm_timers();
                        }
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    self.state.handle(Event::Shutdown);
                    break;
                }
            }
        }

        Ok(())
    }

    fn register(&mut self, socket: TcpStream, addr: SocketAddr) {
        let (reader, writer) = socket.into_split();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let conn = self.state.connect(addr.to_string(), Outbox::new(outbox_tx));
        spawn_io(conn, reader, writer, outbox_rx, self.event_tx.clone());
    }

    fn arm_timers(&mut self) {
        for (delay, event) in self.state.take_timers() {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event);
            });
        }
    }
}

/// Spawns the per-connection reader and writer tasks. Generic over the
/// transport so tests can drive a connection through an in-memory duplex.
pub fn spawn_io<R, W>(
    conn: ConnectionId,
    reader: R,
    writer: W,
    outbox_rx: mpsc::UnboundedReceiver<ServerMessage>,
    events: mpsc::UnboundedSender<Event>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(read_loop(conn, reader, events));
    tokio::spawn(write_loop(conn, writer, outbox_rx));
}

async fn read_loop<R>(conn: ConnectionId, mut reader: R, events: mpsc::UnboundedSender<Event>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => {
                if events.send(Event::Inbound { conn, message }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Connection {} read error: {}", conn, e);
                break;
            }
        }
    }
    let _ = events.send(Event::Disconnected { conn });
}

/// Reads one length-prefixed frame; `None` on a clean end of stream.
async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<ClientMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the limit", len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn write_loop<W>(
    conn: ConnectionId,
    mut writer: W,
    mut outbox_rx: mpsc::UnboundedReceiver<ServerMessage>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbox_rx.recv().await {
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode outbound message: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Connection {} write error: {}", conn, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Identity, SessionSummary, PROTOCOL_VERSION};
    use tokio::sync::mpsc::error::TryRecvError;

    type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

    fn state() -> ServerState {
        let auth = Box::new(BasicAuth::new(StdRng::seed_from_u64(5)));
        let mut state = ServerState::new(SessionConfig::default(), auth, StdRng::seed_from_u64(6));
        // The initial sweep timer is not under test here.
        state.take_timers();
        state
    }

    fn open(state: &mut ServerState) -> (ConnectionId, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = state.connect("127.0.0.1:9000".to_string(), Outbox::new(tx));
        (conn, rx)
    }

    fn request(state: &mut ServerState, conn: ConnectionId, id: RequestId, request: Request) {
        state.handle(Event::Inbound {
            conn,
            message: ClientMessage::Request { id, request },
        });
    }

    fn notice(state: &mut ServerState, conn: ConnectionId, notice: Notice) {
        state.handle(Event::Inbound {
            conn,
            message: ClientMessage::Notice(notice),
        });
    }

    fn login_request(username: &str) -> Request {
        Request::Login(LoginRequest {
            client_version: PROTOCOL_VERSION,
            game: "ivy".to_string(),
            game_version: 1,
            username: username.to_string(),
            token: None,
        })
    }

    fn login(state: &mut ServerState, conn: ConnectionId, rx: &mut Inbox, username: &str) {
        request(state, conn, 1, login_request(username));
        let identity = drain(rx)
            .into_iter()
            .find_map(|message| match message {
                ServerMessage::Reply {
                    reply: Reply::LoggedIn(identity),
                    ..
                } => Some(identity),
                _ => None,
            })
            .expect("login accepted");
        assert_eq!(identity.username, username);
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Answers every pending clock probe until the window has filled.
    fn settle_clock(state: &mut ServerState, conn: ConnectionId, rx: &mut Inbox) {
        for _ in 0..crate::clock::PROBE_WINDOW {
            notice(
                state,
                conn,
                Notice::ClockProbeReply {
                    remote_time: 5_000,
                    round_trip: 40,
                },
            );
        }
        drain(rx);
    }

    fn joined_session(messages: &[ServerMessage]) -> Option<SessionSummary> {
        messages.iter().find_map(|message| match message {
            ServerMessage::Reply {
                reply: Reply::SessionJoined(summary),
                ..
            } => Some(summary.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_login_replies_probe_and_listing() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);

        request(&mut state, conn, 7, login_request("alice"));
        let messages = drain(&mut rx);

        assert!(matches!(
            &messages[0],
            ServerMessage::Reply {
                id: 7,
                reply: Reply::LoggedIn(Identity { username, .. })
            } if username == "alice"
        ));
        assert!(matches!(
            messages[1],
            ServerMessage::Push(Push::ClockProbe { echo: 0 })
        ));
        assert!(matches!(
            &messages[2],
            ServerMessage::Push(Push::SessionList(list)) if list.is_empty()
        ));
    }

    #[test]
    fn test_request_before_login_closes_connection() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);

        request(&mut state, conn, 1, Request::CreateSession);

        // No error is sent; the connection is simply gone.
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
        let _ = conn;
    }

    #[test]
    fn test_failed_login_errors_then_closes() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);

        request(&mut state, conn, 3, login_request("x"));

        let message = rx.try_recv().expect("error delivered");
        assert!(matches!(
            message,
            ServerMessage::Error {
                id: 3,
                code: ErrorCode::LoginUsername
            }
        ));
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[test]
    fn test_duplicate_identity_rejected_while_connected() {
        let mut state = state();
        let (first, mut first_rx) = open(&mut state);
        login(&mut state, first, &mut first_rx, "alice");

        let (second, mut second_rx) = open(&mut state);
        request(&mut state, second, 2, login_request("ALICE"));
        assert!(matches!(
            second_rx.try_recv().expect("error delivered"),
            ServerMessage::Error {
                code: ErrorCode::IdentityInUse,
                ..
            }
        ));
    }

    #[test]
    fn test_second_login_is_invalid() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);
        login(&mut state, conn, &mut rx, "alice");

        request(&mut state, conn, 9, login_request("alice2"));
        assert!(matches!(
            rx.try_recv().expect("error delivered"),
            ServerMessage::Error {
                id: 9,
                code: ErrorCode::Invalid
            }
        ));
    }

    #[test]
    fn test_create_seats_creator_and_updates_idlers() {
        let mut state = state();
        let (creator, mut creator_rx) = open(&mut state);
        let (idler, mut idler_rx) = open(&mut state);
        login(&mut state, creator, &mut creator_rx, "alice");
        login(&mut state, idler, &mut idler_rx, "bob");
        drain(&mut idler_rx);

        request(&mut state, creator, 2, Request::CreateSession);

        let summary = joined_session(&drain(&mut creator_rx)).expect("joined own session");
        assert_eq!(summary.member_count, 1);

        // The idle player sees the new session in a listing push.
        let listings = drain(&mut idler_rx);
        assert!(listings.iter().any(|message| matches!(
            message,
            ServerMessage::Push(Push::SessionList(list)) if list.len() == 1
        )));

        // The creator is seated now; further creates are invalid.
        request(&mut state, creator, 3, Request::CreateSession);
        assert!(matches!(
            drain(&mut creator_rx).first(),
            Some(ServerMessage::Error {
                id: 3,
                code: ErrorCode::Invalid
            })
        ));
    }

    #[test]
    fn test_join_unknown_session_not_found() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);
        login(&mut state, conn, &mut rx, "alice");

        request(
            &mut state,
            conn,
            4,
            Request::JoinSession {
                session: "feedfacefeedface".to_string(),
            },
        );
        assert!(matches!(
            rx.try_recv().expect("error delivered"),
            ServerMessage::Error {
                id: 4,
                code: ErrorCode::NotFound
            }
        ));
    }

    #[test]
    fn test_seated_request_must_address_own_session() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);
        login(&mut state, conn, &mut rx, "alice");
        request(&mut state, conn, 2, Request::CreateSession);
        drain(&mut rx);

        request(
            &mut state,
            conn,
            5,
            Request::Ready {
                session: "0000000000000000".to_string(),
            },
        );
        assert!(matches!(
            rx.try_recv().expect("error delivered"),
            ServerMessage::Error {
                id: 5,
                code: ErrorCode::Invalid
            }
        ));
    }

    #[test]
    fn test_idle_session_request_is_invalid() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);
        login(&mut state, conn, &mut rx, "alice");

        request(
            &mut state,
            conn,
            6,
            Request::Ready {
                session: "feedfacefeedface".to_string(),
            },
        );
        assert!(matches!(
            rx.try_recv().expect("error delivered"),
            ServerMessage::Error {
                id: 6,
                code: ErrorCode::Invalid
            }
        ));
    }

    #[test]
    fn test_full_start_flow_through_events() {
        let mut state = state();
        let (owner, mut owner_rx) = open(&mut state);
        let (guest, mut guest_rx) = open(&mut state);
        login(&mut state, owner, &mut owner_rx, "alice");
        login(&mut state, guest, &mut guest_rx, "bob");

        request(&mut state, owner, 2, Request::CreateSession);
        let token = joined_session(&drain(&mut owner_rx)).expect("created").token;

        request(
            &mut state,
            guest,
            2,
            Request::JoinSession {
                session: token.clone(),
            },
        );
        assert!(joined_session(&drain(&mut guest_rx)).is_some());

        request(
            &mut state,
            guest,
            3,
            Request::Ready {
                session: token.clone(),
            },
        );
        settle_clock(&mut state, owner, &mut owner_rx);
        settle_clock(&mut state, guest, &mut guest_rx);

        request(
            &mut state,
            owner,
            4,
            Request::Start {
                session: token.clone(),
            },
        );
        // The start is pending on the sync gate; the state asked for a poll.
        let timers = state.take_timers();
        assert!(timers
            .iter()
            .any(|(_, event)| matches!(event, Event::StartPoll { session } if *session == token)));

        state.handle(Event::StartPoll {
            session: token.clone(),
        });

        for rx in [&mut owner_rx, &mut guest_rx] {
            let messages = drain(rx);
            assert!(
                messages
                    .iter()
                    .any(|m| matches!(m, ServerMessage::Push(Push::GameStart(_)))),
                "game start missing"
            );
            assert!(messages
                .iter()
                .any(|m| matches!(m, ServerMessage::Push(Push::TickLimit { tick: 3 }))));
        }

        // Actions and tick confirmations flow through notices now.
        notice(&mut state, guest, Notice::SubmitAction { payload: vec![1] });
        let messages = drain(&mut owner_rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::Push(Push::ActionRelay(envelope)) if envelope.sender == 2
        )));

        notice(&mut state, owner, Notice::TickConfirm { tick: 3 });
        notice(&mut state, guest, Notice::TickConfirm { tick: 1 });
        assert!(drain(&mut guest_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Push(Push::TickLimit { tick: 4 }))));
    }

    #[test]
    fn test_unsynced_clocks_keep_polling() {
        let mut state = state();
        let (owner, mut owner_rx) = open(&mut state);
        login(&mut state, owner, &mut owner_rx, "alice");
        request(&mut state, owner, 2, Request::CreateSession);
        let token = joined_session(&drain(&mut owner_rx)).expect("created").token;

        request(
            &mut state,
            owner,
            3,
            Request::Start {
                session: token.clone(),
            },
        );
        state.take_timers();
        state.handle(Event::StartPoll {
            session: token.clone(),
        });

        // Still gated; another poll was requested and no game start went out.
        assert!(state
            .take_timers()
            .iter()
            .any(|(_, event)| matches!(event, Event::StartPoll { .. })));
        assert!(drain(&mut owner_rx)
            .iter()
            .all(|m| !matches!(m, ServerMessage::Push(Push::GameStart(_)))));
    }

    #[test]
    fn test_disconnect_leaves_session() {
        let mut state = state();
        let (owner, mut owner_rx) = open(&mut state);
        let (guest, mut guest_rx) = open(&mut state);
        login(&mut state, owner, &mut owner_rx, "alice");
        login(&mut state, guest, &mut guest_rx, "bob");

        request(&mut state, owner, 2, Request::CreateSession);
        let token = joined_session(&drain(&mut owner_rx)).expect("created").token;
        request(&mut state, guest, 2, Request::JoinSession { session: token });
        drain(&mut owner_rx);

        state.handle(Event::Disconnected { conn: guest });

        let messages = drain(&mut owner_rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::Push(Push::PlayerLeft(info)) if info.seat == 2)));
        let _ = guest_rx;
    }

    #[test]
    fn test_owner_disconnect_closes_unstarted_session() {
        let mut state = state();
        let (owner, mut owner_rx) = open(&mut state);
        let (guest, mut guest_rx) = open(&mut state);
        login(&mut state, owner, &mut owner_rx, "alice");
        login(&mut state, guest, &mut guest_rx, "bob");

        request(&mut state, owner, 2, Request::CreateSession);
        let token = joined_session(&drain(&mut owner_rx)).expect("created").token;
        request(&mut state, guest, 2, Request::JoinSession { session: token });
        drain(&mut guest_rx);

        state.handle(Event::Disconnected { conn: owner });

        // The guest hears the closure and, now unseated, gets a listing.
        let messages = drain(&mut guest_rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::Push(Push::SessionClosed(_)))));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::Push(Push::SessionList(list)) if list.is_empty()
        )));

        // The guest can create a fresh session immediately.
        request(&mut state, guest, 3, Request::CreateSession);
        assert!(joined_session(&drain(&mut guest_rx)).is_some());
    }

    #[test]
    fn test_last_leaver_triggers_deferred_close() {
        let mut state = state();
        let (owner, mut owner_rx) = open(&mut state);
        let (guest, mut guest_rx) = open(&mut state);
        login(&mut state, owner, &mut owner_rx, "alice");
        login(&mut state, guest, &mut guest_rx, "bob");

        request(&mut state, owner, 2, Request::CreateSession);
        let token = joined_session(&drain(&mut owner_rx)).expect("created").token;
        request(
            &mut state,
            guest,
            2,
            Request::JoinSession {
                session: token.clone(),
            },
        );
        settle_clock(&mut state, owner, &mut owner_rx);
        settle_clock(&mut state, guest, &mut guest_rx);
        request(
            &mut state,
            guest,
            3,
            Request::Ready {
                session: token.clone(),
            },
        );
        request(
            &mut state,
            owner,
            4,
            Request::Start {
                session: token.clone(),
            },
        );
        state.handle(Event::StartPoll {
            session: token.clone(),
        });

        // Both members leave the running session; the empty session is
        // closed behind the second leave.
        request(
            &mut state,
            owner,
            5,
            Request::Leave {
                session: token.clone(),
            },
        );
        request(
            &mut state,
            guest,
            6,
            Request::Leave {
                session: token.clone(),
            },
        );

        request(&mut state, guest, 7, Request::JoinSession { session: token });
        assert!(
            drain(&mut guest_rx).iter().any(|m| matches!(
                m,
                ServerMessage::Error {
                    id: 7,
                    code: ErrorCode::NotFound
                }
            )),
            "session should be gone"
        );
    }

    #[test]
    fn test_probe_reply_drives_report_and_timer() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);
        login(&mut state, conn, &mut rx, "alice");

        // The first eleven replies are answered immediately.
        for _ in 0..11 {
            notice(
                &mut state,
                conn,
                Notice::ClockProbeReply {
                    remote_time: 1_000,
                    round_trip: 30,
                },
            );
            assert!(matches!(
                rx.try_recv().expect("echo"),
                ServerMessage::Push(Push::ClockProbe { .. })
            ));
        }
        assert!(state.take_timers().is_empty());

        // The twelfth completes the window: report plus a probe timer.
        notice(
            &mut state,
            conn,
            Notice::ClockProbeReply {
                remote_time: 1_000,
                round_trip: 30,
            },
        );
        assert!(matches!(
            rx.try_recv().expect("report"),
            ServerMessage::Push(Push::ClockReport {
                ping: 15,
                ..
            })
        ));
        let timers = state.take_timers();
        let seq = timers
            .iter()
            .find_map(|(delay, event)| match event {
                Event::ProbeTimer { seq, .. } => {
                    assert_eq!(*delay, PROBE_INTERVAL);
                    Some(*seq)
                }
                _ => None,
            })
            .expect("probe timer armed");

        // Firing the timer sends the next probe.
        state.handle(Event::ProbeTimer { conn, seq });
        assert!(matches!(
            rx.try_recv().expect("probe"),
            ServerMessage::Push(Push::ClockProbe { .. })
        ));

        // A stale timer sequence does nothing.
        state.handle(Event::ProbeTimer { conn, seq: seq + 40 });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_auth_sweep_rearms_itself() {
        let mut state = state();
        state.handle(Event::AuthSweep);
        assert!(state
            .take_timers()
            .iter()
            .any(|(delay, event)| *delay == SWEEP_INTERVAL
                && matches!(event, Event::AuthSweep)));
    }

    #[test]
    fn test_shutdown_notifies_everyone() {
        let mut state = state();
        let (a, mut a_rx) = open(&mut state);
        let (b, mut b_rx) = open(&mut state);
        login(&mut state, a, &mut a_rx, "alice");

        state.handle(Event::Shutdown);

        assert!(drain(&mut a_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Push(Push::Shutdown))));
        // Even the connection that never logged in hears it.
        assert!(drain(&mut b_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Push(Push::Shutdown))));
        let _ = (a, b);
    }

    #[test]
    fn test_notices_before_login_are_dropped() {
        let mut state = state();
        let (conn, mut rx) = open(&mut state);

        notice(
            &mut state,
            conn,
            Notice::ClockProbeReply {
                remote_time: 1,
                round_trip: 1,
            },
        );
        notice(&mut state, conn, Notice::TickConfirm { tick: 1 });

        // Still connected, nothing was sent back.
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }
}
