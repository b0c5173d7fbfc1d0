use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::allocator::{Allocator, BookingError, BookingRequest};
use crate::auth::Actor;
use crate::limits::MAX_LINE_LEN;
use crate::model::{Role, normalize_handle};
use crate::observability::{REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, command_label};
use crate::protocol::{Command, Envelope, ErrorReply, ProtocolError, error_reply, ok_reply, parse_request};

/// Everything a connection needs, shared across all of them.
pub struct ServerContext {
    pub allocator: Arc<Allocator>,
    /// Normalised handles that register with the Admin role.
    pub admins: Vec<String>,
}

impl ServerContext {
    pub fn new(allocator: Arc<Allocator>, admins: Vec<String>) -> Self {
        Self { allocator, admins }
    }

    fn role_for(&self, handle: &str) -> Role {
        let handle = normalize_handle(handle);
        if self.admins.iter().any(|a| *a == handle) {
            Role::Admin
        } else {
            Role::Student
        }
    }

    /// One request line in, one reply line out.
    pub async fn handle_line(&self, line: &str) -> String {
        let envelope = match parse_request(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                    .increment(1);
                return error_reply(e);
            }
        };

        let op = command_label(&envelope.command);
        let started = Instant::now();
        let result = self.execute(envelope).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(body) => ok_reply(body),
            Err(e) => {
                debug!(op, code = e.code, "request failed: {}", e.message);
                error_reply(e)
            }
        }
    }

    async fn execute(&self, envelope: Envelope) -> Result<Value, ErrorReply> {
        let alloc = &self.allocator;
        let Envelope { user, command } = envelope;
        let user = alloc.identify(&user, self.role_for(&user)).await?;
        let actor = Actor::for_user(&user);

        match command {
            Command::Book { game, date, time } => {
                let (resource_id, game) = self.resolve_game(&game).await?;
                let reservation = alloc
                    .request_booking(BookingRequest {
                        resource_id,
                        user_id: user.id,
                        date,
                        time,
                    })
                    .await?;
                body("booking", alloc.booking_line(&reservation, &game, &user.handle))
            }
            Command::Cancel { booking } => {
                let reservation = alloc.cancel_booking(booking, actor).await?;
                let game = alloc
                    .games()
                    .await?
                    .into_iter()
                    .find(|g| g.id == reservation.resource_id)
                    .map(|g| g.name)
                    .unwrap_or_default();
                let owner = if reservation.user_id == user.id {
                    user.handle.clone()
                } else {
                    String::new()
                };
                body("booking", alloc.booking_line(&reservation, &game, &owner))
            }
            Command::Slots { game, date } => {
                let (id, _) = self.resolve_game(&game).await?;
                body("board", alloc.day_board(id, date).await?)
            }
            Command::Week { game } => {
                let (id, _) = self.resolve_game(&game).await?;
                body("boards", alloc.week(id).await?)
            }
            Command::Games => body("games", alloc.games().await?),
            Command::MyBookings => body("bookings", alloc.user_bookings(&user).await?),
            Command::AllBookings => body("bookings", alloc.all_bookings(actor).await?),
            Command::Users => body("users", alloc.list_users(actor).await?),
            Command::DeleteUser { target } => {
                if !actor.is_admin() {
                    return Err(BookingError::Forbidden.into());
                }
                let target_user = alloc.find_user(&target).await?.ok_or_else(|| {
                    ErrorReply::new("unknown_user", format!("unknown user: {target}"))
                })?;
                let removed = alloc.delete_user(actor, target_user.id).await?;
                Ok(json!({ "removed": removed }))
            }
            Command::Stats => body("stats", alloc.stats(user.id).await?),
        }
    }

    /// A game id, or a game name compared case-insensitively.
    async fn resolve_game(&self, game: &str) -> Result<(Ulid, String), ErrorReply> {
        let games = self.allocator.games().await?;
        let wanted = game.trim();
        let found = match Ulid::from_string(wanted) {
            Ok(id) => games.into_iter().find(|g| g.id == id),
            Err(_) => games
                .into_iter()
                .find(|g| g.name.eq_ignore_ascii_case(wanted)),
        };
        found
            .map(|g| (g.id, g.name))
            .ok_or_else(|| ErrorReply::new("resource_not_found", format!("game not found: {wanted}")))
    }
}

fn body(key: &str, value: impl Serialize) -> Result<Value, ErrorReply> {
    let value = serde_json::to_value(value)
        .map_err(|e| ErrorReply::new("internal", format!("cannot encode reply: {e}")))?;
    let mut fields = Map::new();
    fields.insert(key.to_string(), value);
    Ok(Value::Object(fields))
}

/// Serve one client until it hangs up.
pub async fn process_connection(
    socket: TcpStream,
    ctx: Arc<ServerContext>,
) -> Result<(), ProtocolError> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut recovering = false;
    loop {
        let frame = match lines.next().await {
            Some(frame) => frame,
            // After a decode error the stream yields one `None`, then resumes.
            None if recovering => {
                recovering = false;
                continue;
            }
            None => break,
        };
        let reply = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => ctx.handle_line(&line).await,
            // The codec skips to the next newline.
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                recovering = true;
                error_reply(ProtocolError::LineTooLong)
            }
            Err(LinesCodecError::Io(e)) => return Err(ProtocolError::Io(e.to_string())),
        };
        lines
            .send(reply)
            .await
            .map_err(|e| ProtocolError::Io(e.to_string()))?;
    }
    Ok(())
}
