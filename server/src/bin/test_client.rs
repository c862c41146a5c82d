use bincode::deserialize;
use server::utils::{now_ms, sync_time};
use shared::{
    encode_frame, ClientMessage, LoginRequest, Notice, Push, Reply, Request, ServerMessage,
    FRAME_HEADER_LEN, PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// Once the tick limit reaches this the walkthrough leaves the session
const LAST_TICK: u64 = 9;

async fn send(stream: &mut TcpStream, message: &ClientMessage) -> Result<(), Box<dyn std::error::Error>> {
    let frame = encode_frame(message)?;
    stream.write_all(&frame).await?;
    Ok(())
}

async fn send_request(
    stream: &mut TcpStream,
    id: u32,
    request: Request,
) -> Result<(), Box<dyn std::error::Error>> {
    send(stream, &ClientMessage::Request { id, request }).await
}

async fn read_message(stream: &mut TcpStream) -> Result<ServerMessage, Box<dyn std::error::Error>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut body).await?;
    Ok(deserialize(&body)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr = "127.0.0.1:8080";

    println!("Connecting to {}", server_addr);
    let mut stream = TcpStream::connect(server_addr).await?;
    println!("Connected from {}", stream.local_addr()?);

    // Log in with a fresh username
    println!("Logging in as 'tester'");
    send_request(
        &mut stream,
        1,
        Request::Login(LoginRequest {
            client_version: PROTOCOL_VERSION,
            game: "walkthrough".to_string(),
            game_version: 1,
            username: "tester".to_string(),
            token: None,
        }),
    )
    .await?;

    let mut session = None;
    let mut created = false;
    let mut action_sent = false;

    loop {
        let message = read_message(&mut stream).await?;

        match message {
            ServerMessage::Reply { id, reply } => match reply {
                Reply::LoggedIn(identity) => {
                    println!(
                        "Logged in as '{}' ({}), token expires at {}",
                        identity.username, identity.identifier, identity.expires_at
                    );
                    println!("Login token: {}", identity.token);
                }
                Reply::SessionJoined(summary) => {
                    println!(
                        "Created session {} with {} member(s)",
                        summary.token, summary.member_count
                    );
                    // Sole ready member, so the session can start right away
                    println!("Requesting start");
                    session = Some(summary.token.clone());
                    send_request(&mut stream, 3, Request::Start { session: summary.token }).await?;
                }
                Reply::Started(summary) => {
                    println!("Start accepted for session {}", summary.token);
                }
                Reply::Left(summary) => {
                    println!("Left session {}", summary.token);
                    break;
                }
                other => println!("Reply to request {}: {:?}", id, other),
            },
            ServerMessage::Error { id, code } => {
                println!("Request {} failed: {:?}", id, code);
                break;
            }
            ServerMessage::Push(push) => match push {
                Push::ClockProbe { echo } => {
                    // Echo carries our previous clock reading, so the gap to
                    // now is the round trip. The first probe echoes zero and
                    // the server discards the resulting garbage sample.
                    let now = sync_time(now_ms());
                    let reply = ClientMessage::Notice(Notice::ClockProbeReply {
                        remote_time: now,
                        round_trip: now - echo,
                    });
                    send(&mut stream, &reply).await?;
                }
                Push::ClockReport { ping, offset } => {
                    println!("Clock report: {}ms ping, {}ms offset", ping, offset);
                    if !created {
                        created = true;
                        println!("Creating a session");
                        send_request(&mut stream, 2, Request::CreateSession).await?;
                    }
                }
                Push::SessionList(list) => {
                    println!("Session list with {} entr(ies)", list.len());
                    for summary in &list {
                        println!(
                            "  {} - {} member(s), ready: {}",
                            summary.token, summary.member_count, summary.ready
                        );
                    }
                }
                Push::SeatAssigned(info) => {
                    println!("Assigned seat {} as '{}'", info.seat, info.name);
                }
                Push::GameStart(info) => {
                    println!(
                        "Game started - seed: {}, tick rate: {}, tick buffer: {}, {} player(s)",
                        info.random_seed,
                        info.tick_rate,
                        info.tick_buffer,
                        info.players.len()
                    );
                    for player in &info.players {
                        println!(
                            "  Seat {}: {}{}",
                            player.info.seat,
                            player.info.name,
                            if player.is_self { " (self)" } else { "" }
                        );
                    }
                }
                Push::TickLimit { tick } => {
                    println!("Tick limit is now {}", tick);
                    if !action_sent {
                        action_sent = true;
                        println!("Submitting a test action");
                        let action = ClientMessage::Notice(Notice::SubmitAction {
                            payload: b"wave".to_vec(),
                        });
                        send(&mut stream, &action).await?;
                    }
                    if tick < LAST_TICK {
                        // Pretend we simulated up to the limit instantly
                        send(&mut stream, &ClientMessage::Notice(Notice::TickConfirm { tick }))
                            .await?;
                    } else if let Some(token) = session.clone() {
                        println!("Reached tick {}, leaving", tick);
                        send_request(&mut stream, 4, Request::Leave { session: token }).await?;
                    }
                }
                Push::ActionRelay(envelope) => {
                    println!(
                        "Action {} from seat {} executes at tick {} ({}ms ping, {}ms offset)",
                        envelope.sequence,
                        envelope.sender,
                        envelope.execute_at_tick,
                        envelope.ping_to_sender,
                        envelope.offset_to_sender
                    );
                }
                Push::Shutdown => {
                    println!("Server is shutting down");
                    break;
                }
                other => println!("Push: {:?}", other),
            },
        }
    }

    println!("Test client finished");
    Ok(())
}
