use crate::config::PrivacyMode;
use crate::error::RoomsError;
use crate::roomdb::RoomDb;
use room_common::FeedRef;

/// Decide whether an authenticated peer may open a session.
///
/// The room's own key always passes. Denied keys never do. In restricted
/// mode only members get in.
pub async fn admit(db: &RoomDb, room: &FeedRef, remote: &FeedRef) -> Result<(), RoomsError> {
    if remote == room {
        return Ok(());
    }

    if db.denied.has_feed(remote).await {
        return Err(RoomsError::Refused("this key has been banned"));
    }

    let mode = db
        .config
        .privacy_mode()
        .await
        .map_err(|_| RoomsError::Refused("room configuration unavailable"))?;
    if mode == PrivacyMode::Restricted {
        let member = db
            .is_member(remote)
            .await
            .map_err(|_| RoomsError::Refused("members directory unavailable"))?;
        if !member {
            return Err(RoomsError::Refused("access restricted to members"));
        }
    }
    Ok(())
}
