//! Business logic: connections, rooms, presence, relay, typing and read receipts.

pub mod authz;
pub mod broadcast;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod typing;

pub use authz::RoomAuthorizer;
pub use broadcast::Broadcaster;
pub use presence::{Departure, PresenceService};
pub use receipts::ReadReceiptService;
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use relay::{MessageRelay, SendIntent};
pub use rooms::RoomService;
pub use typing::TypingService;

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::{RawId, UserId};

/// Run a storage call with an upper bound on how long it may take.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| AppError::Timeout(limit.as_millis()))?
}

/// The socket's user is bound at upgrade time; a user id in a payload may only repeat it.
pub fn resolve_user(claimed: Option<&RawId>, session_user: UserId) -> AppResult<UserId> {
    let Some(raw) = claimed else {
        return Ok(session_user);
    };
    let user_id = raw
        .parse()
        .ok_or_else(|| AppError::Validation("userId must be a positive integer".to_string()))?;
    if user_id != session_user {
        return Err(AppError::Validation(
            "userId does not match the authenticated user".to_string(),
        ));
    }
    Ok(user_id)
}
