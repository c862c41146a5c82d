use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Clock readings on the wire are normalized into [0, SYNC_TIME_RANGE) so
/// both ends compare positions on the same ring regardless of epoch.
pub const SYNC_TIME_RANGE: i64 = 100_000_000;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub type RequestId = u32;
pub type SessionToken = String;
pub type SeatId = u32;
pub type Tick = u64;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ClientMessage {
    /// Fire-and-forget traffic; never answered directly.
    Notice(Notice),
    /// Correlated traffic; always answered with `Reply` or `Error` under `id`.
    Request { id: RequestId, request: Request },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Notice {
    /// Answer to a `Push::ClockProbe`: the client's own normalized clock
    /// reading plus the round trip it measured against the probe's echo.
    ClockProbeReply { remote_time: i64, round_trip: i64 },
    /// Highest tick the sender has fully simulated.
    TickConfirm { tick: Tick },
    /// Opaque game action to relay to every member of the sender's session.
    SubmitAction { payload: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Request {
    Login(LoginRequest),
    CreateSession,
    JoinSession { session: SessionToken },
    Ready { session: SessionToken },
    NotReady { session: SessionToken },
    Start { session: SessionToken },
    Leave { session: SessionToken },
    Pause { session: SessionToken },
    Resume { session: SessionToken },
    CloseSession { session: SessionToken },
}

impl Request {
    /// The session this request addresses, when it names one.
    pub fn session(&self) -> Option<&SessionToken> {
        match self {
            Request::Login(_) | Request::CreateSession => None,
            Request::JoinSession { session }
            | Request::Ready { session }
            | Request::NotReady { session }
            | Request::Start { session }
            | Request::Leave { session }
            | Request::Pause { session }
            | Request::Resume { session }
            | Request::CloseSession { session } => Some(session),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginRequest {
    pub client_version: u32,
    pub game: String,
    pub game_version: u32,
    pub username: String,
    /// Token from an earlier login, if the client still holds one.
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ServerMessage {
    Reply { id: RequestId, reply: Reply },
    Error { id: RequestId, code: ErrorCode },
    Push(Push),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Reply {
    LoggedIn(Identity),
    SessionJoined(SessionSummary),
    Ready(SessionSummary),
    NotReady(SessionSummary),
    Started(SessionSummary),
    Left(SessionSummary),
    Paused(SessionSummary),
    Resumed(SessionSummary),
    Closed(SessionSummary),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Push {
    /// Public directory listing; pushed to authenticated connections that
    /// occupy no seat.
    SessionList(Vec<SessionSummary>),
    SessionUpdate(SessionSummary),
    SessionPaused(SessionSummary),
    SessionResumed(SessionSummary),
    SessionClosed(SessionSummary),
    /// The recipient's own seat, token included. Sent once on admission.
    SeatAssigned(PlayerInfo),
    PlayerJoined(PlayerInfo),
    PlayerLeft(PlayerInfo),
    PlayerReady(PlayerInfo),
    PlayerNotReady(PlayerInfo),
    PlayerPaused(PlayerInfo),
    PlayerResumed(PlayerInfo),
    GameStart(GameInfo),
    TickLimit { tick: Tick },
    ActionRelay(ActionEnvelope),
    ClockProbe { echo: i64 },
    ClockReport { ping: i64, offset: i64 },
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Invalid,
    NotFound,
    Running,
    NotRunning,
    Full,
    NotReady,
    IsReady,
    NotOwner,
    Paused,
    NotPaused,
    LoginVersion,
    LoginGame,
    LoginUsername,
    LoginToken,
    IdentityInUse,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Identity {
    pub username: String,
    /// Lowercased username; unique among live connections.
    pub identifier: String,
    pub token: String,
    /// Epoch milliseconds after which the token is no longer accepted.
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub seat: SeatId,
    pub name: String,
    pub address: String,
    /// Only present when describing the recipient's own seat.
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub token: SessionToken,
    pub running: bool,
    pub ready: bool,
    pub owner: Option<PlayerInfo>,
    pub member_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GamePlayer {
    pub info: PlayerInfo,
    pub is_self: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GameInfo {
    pub random_seed: i64,
    pub tick_rate: u32,
    pub tick_buffer: u32,
    pub players: Vec<GamePlayer>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActionEnvelope {
    pub sequence: u64,
    pub sender: SeatId,
    /// One tick beyond the limit broadcast at relay time.
    pub execute_at_tick: Tick,
    pub payload: Vec<u8>,
    pub ping_to_sender: i64,
    pub offset_to_sender: i64,
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Box::new(bincode::ErrorKind::Custom(format!(
            "frame body of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        ))));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses one frame from the front of `buf`. Returns the decoded message and
/// the number of bytes consumed, or `None` when `buf` does not yet hold a
/// complete frame.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, bincode::Error> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    let body_len = u32::from_be_bytes(header) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(Box::new(bincode::ErrorKind::Custom(format!(
            "frame header announces {} bytes, limit is {}",
            body_len, MAX_FRAME_LEN
        ))));
    }
    if buf.len() < FRAME_HEADER_LEN + body_len {
        return Ok(None);
    }
    let message = bincode::deserialize(&buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len])?;
    Ok(Some((message, FRAME_HEADER_LEN + body_len)))
}
