// WebSocket binding for document sessions.
//
// One socket carries one document. Authentication happens upstream; the
// proxy in front of the relay forwards the caller's id in `x-docsync-user`.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, State,
    },
    http::{request::Parts, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use docsync_common::ChannelMessage;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{error_message, ErrorCode, RelayError};
use crate::session::{DocumentSession, SessionError, SessionUser, Subscription, SyncServices};
use crate::staleness::HeadCheck;

pub const USER_HEADER: &str = "x-docsync-user";
pub const USER_NAME_HEADER: &str = "x-docsync-user-name";
pub const USER_EMAIL_HEADER: &str = "x-docsync-user-email";

/// Full CRDT states travel in one frame, so the cap is generous.
pub(crate) const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub fn router(services: SyncServices) -> Router {
    Router::new()
        .route("/projects/{project_id}/documents/{*path}", get(ws_upgrade))
        .with_state(services)
}

/// Caller identity forwarded by the authenticating proxy.
pub struct ForwardedUser(pub SessionUser);

impl<S> FromRequestParts<S> for ForwardedUser
where
    S: Send + Sync,
{
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_from_headers(&parts.headers).map(Self)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

pub fn user_from_headers(headers: &HeaderMap) -> Result<SessionUser, RelayError> {
    let raw = header_str(headers, USER_HEADER)
        .ok_or_else(|| RelayError::from_code(ErrorCode::Unauthenticated))?;
    let id = Uuid::parse_str(raw).map_err(|_| {
        RelayError::new(ErrorCode::Unauthenticated, format!("`{USER_HEADER}` is not a user id"))
    })?;

    Ok(SessionUser::new(
        id,
        header_str(headers, USER_NAME_HEADER).map(ToOwned::to_owned),
        header_str(headers, USER_EMAIL_HEADER).map(ToOwned::to_owned),
    ))
}

async fn ws_upgrade(
    Path((project_id, path)): Path<(Uuid, String)>,
    State(services): State<SyncServices>,
    ForwardedUser(user): ForwardedUser,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES).on_upgrade(move |socket| {
        let span = info_span!("relay.session", project_id = %project_id, path = %path, user_id = %user.id);
        handle_socket(services, project_id, path, user, socket).instrument(span)
    })
}

async fn send_message(socket: &mut WebSocket, message: &ChannelMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

fn log_session_error(error: &SessionError) {
    let code = ErrorCode::from(error);
    if code.retryable() {
        warn!(code = code.as_str(), error = %error, "session request failed");
    } else {
        debug!(code = code.as_str(), error = %error, "session request rejected");
    }
}

async fn handle_socket(
    services: SyncServices,
    project_id: Uuid,
    path: String,
    user: SessionUser,
    mut socket: WebSocket,
) {
    let head_check_interval = services.tuning.head_check_interval;
    let subscription = DocumentSession::subscribe(services, project_id, &path, user).await;
    let Subscription { mut session, sync, mut updates } = match subscription {
        Ok(subscription) => subscription,
        Err(error) => {
            log_session_error(&error);
            let _ = send_message(&mut socket, &error_message(&error)).await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: ErrorCode::from(&error).as_str().to_string().into(),
                })))
                .await;
            return;
        }
    };

    if send_message(&mut socket, &sync).await.is_ok() {
        let mut head_check = tokio::time::interval(head_check_interval);
        head_check.reset();

        loop {
            tokio::select! {
                _ = head_check.tick() => {
                    // A detected change reaches this socket through the topic.
                    if let HeadCheck::Invalidated(revision) = session.check_head().await {
                        debug!(revision = %revision, "announced external change");
                    }
                }
                broadcast = updates.recv() => {
                    let outbound = match broadcast {
                        Ok(message) => message,
                        Err(RecvError::Lagged(skipped)) => {
                            // Missed updates cannot be replayed; make the editor refetch.
                            warn!(skipped, "subscriber lagged behind the document topic");
                            ChannelMessage::FileChanged
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if send_message(&mut socket, &outbound).await.is_err() {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    let Some(Ok(frame)) = incoming else {
                        break;
                    };
                    let reply = match frame {
                        Message::Text(raw) => match serde_json::from_str::<ChannelMessage>(raw.as_str()) {
                            Ok(inbound) => match session.receive(inbound).await {
                                Ok(reply) => reply,
                                Err(error) => {
                                    log_session_error(&error);
                                    Some(error_message(&error))
                                }
                            },
                            Err(error) => {
                                debug!(error = %error, "undecodable frame");
                                Some(invalid_frame("message is not a valid document envelope"))
                            }
                        },
                        Message::Binary(_) => Some(invalid_frame("binary frames are not supported")),
                        Message::Close(_) => break,
                        Message::Ping(_) | Message::Pong(_) => None,
                    };
                    if let Some(reply) = reply {
                        if send_message(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    drop(updates);
    if let Err(error) = session.unsubscribe().await {
        warn!(error = %error, "failed to deregister session");
    }
    info!("session ended");
}

fn invalid_frame(message: &str) -> ChannelMessage {
    ChannelMessage::Error {
        code: ErrorCode::InvalidMessage.as_str().to_string(),
        message: message.to_string(),
        retryable: false,
    }
}
