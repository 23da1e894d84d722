//! Room-join authorization against the persisted participant list.

use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use super::bounded;
use crate::db::ChatStore;
use crate::error::AppResult;
use crate::models::{Authorization, ConversationId, UserId};

#[derive(Clone)]
pub struct RoomAuthorizer {
    store: Arc<dyn ChatStore>,
    enforce: bool,
    timeout: Duration,
}

impl RoomAuthorizer {
    pub fn new(store: Arc<dyn ChatStore>, enforce: bool, timeout: Duration) -> Self {
        Self {
            store,
            enforce,
            timeout,
        }
    }

    pub fn enforcing(&self) -> bool {
        self.enforce
    }

    /// `Allowed` when the user is a participant, or when enforcement is switched off.
    #[instrument(skip(self))]
    pub async fn authorize(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> AppResult<Authorization> {
        if !self.enforce {
            return Ok(Authorization::Allowed);
        }
        let participants = bounded(self.timeout, self.store.participants(conversation_id)).await?;
        if participants.contains(&user_id) {
            Ok(Authorization::Allowed)
        } else {
            warn!(conversation_id, user_id, "room join denied");
            Ok(Authorization::Denied(format!(
                "user {} is not a participant of conversation {}",
                user_id, conversation_id
            )))
        }
    }
}
