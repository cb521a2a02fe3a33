use super::RoomContext;
use crate::metrics::counters;
use crate::roomdb::DbError;
use async_trait::async_trait;
use room_common::crypto::{decode_signature, verify_alias, SIGNATURE_SUFFIX};
use room_common::muxrpc::{AsyncHandler, CallError, Request};
use room_common::FeedRef;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const MAX_ALIAS_LEN: usize = 63;

/// Alias names are DNS labels restricted to lowercase letters and digits.
#[must_use]
pub fn is_valid_alias(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ALIAS_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

pub(super) struct Register(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for Register {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        let args: Vec<String> = req.args()?;
        let [name, signature] = args.as_slice() else {
            return Err(CallError::Invalid(format!(
                "registerAlias: expected two arguments got {}",
                args.len()
            )));
        };

        if !signature.ends_with(SIGNATURE_SUFFIX) {
            return Err(CallError::Invalid(
                "registerAlias: signature does not have the expected suffix".to_string(),
            ));
        }
        let signature = decode_signature(signature)
            .map_err(|e| CallError::Invalid(format!("registerAlias: bad signature encoding: {e}")))?;
        if !is_valid_alias(name) {
            return Err(CallError::Invalid("registerAlias: invalid alias".to_string()));
        }

        let user = *req.remote();
        if !verify_alias(&self.0.room, &user, name, &signature) {
            return Err(CallError::Invalid(
                "registerAlias: invalid signature".to_string(),
            ));
        }

        self.0
            .db
            .aliases
            .register(name, user, signature)
            .await
            .map_err(|e| match e {
                DbError::AliasTaken => {
                    CallError::Failed(format!("registerAlias: alias {name} is already taken"))
                }
                other => CallError::Failed(format!("registerAlias: could not register alias: {other}")),
            })?;
        info!(alias = %name, user = %user.short(), "alias registered");
        Ok(Value::String(self.0.alias_url(name)))
    }
}

pub(super) struct Revoke(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for Revoke {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        let args: Vec<String> = req.args()?;
        let [name] = args.as_slice() else {
            return Err(CallError::Invalid(format!(
                "revokeAlias: expected one argument got {}",
                args.len()
            )));
        };

        let alias = self.0.db.aliases.resolve(name).await.map_err(|e| match e {
            DbError::NotFound => CallError::Invalid(format!("revokeAlias: no such alias: {name}")),
            other => CallError::Failed(format!("revokeAlias: {other}")),
        })?;
        if alias.feed != *req.remote() {
            return Err(CallError::Unauthorized(
                "revokeAlias: not your alias".to_string(),
            ));
        }
        self.0
            .db
            .aliases
            .revoke(name)
            .await
            .map_err(|e| CallError::Failed(format!("revokeAlias: {e}")))?;
        info!(alias = %name, user = %req.remote().short(), "alias revoked");
        Ok(Value::Bool(true))
    }
}

/// Names registered to a feed, the caller's by default.
pub(super) struct List(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for List {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        let has_arg = req.args.as_array().is_some_and(|a| !a.is_empty());
        let feed: FeedRef = if has_arg {
            req.first_arg()?
        } else {
            *req.remote()
        };
        let aliases = self
            .0
            .db
            .aliases
            .list_for(&feed)
            .await
            .map_err(|e| CallError::Failed(format!("listAliases: {e}")))?;
        let mut names: Vec<String> = aliases.into_iter().map(|a| a.name).collect();
        names.sort();
        Ok(serde_json::to_value(names).unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_name_boundaries() {
        assert!(!is_valid_alias(""));
        assert!(is_valid_alias(&"a".repeat(63)));
        assert!(!is_valid_alias(&"a".repeat(64)));
        assert!(is_valid_alias("bob42"));
    }

    #[test]
    fn alias_names_reject_other_characters() {
        for bad in ["Bob", "bob-", "bo b", "bób", "bob.example", "ßob"] {
            assert!(!is_valid_alias(bad), "{bad} accepted");
        }
    }
}
