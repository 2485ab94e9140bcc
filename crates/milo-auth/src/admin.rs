// User statistics for the admin dashboard.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use milo_core::db::models::{User, ADMIN_ROLE, DEFAULT_ROLE};
use milo_core::error::MiloError;
use milo_store::StoreClient;

/// Recent users returned when no limit is given.
pub const DEFAULT_RECENT_USERS: usize = 10;

/// User counts at a point in time. "Today", "this week" and "this month" are
/// the trailing 1, 7 and 30 days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub total_users: usize,
    pub users_today: usize,
    pub users_this_week: usize,
    pub users_this_month: usize,
    pub admin_users: usize,
    /// Users with the default role or none at all.
    pub regular_users: usize,
    pub banned_users: usize,
    pub active_users: usize,
}

#[derive(Debug, Clone)]
pub struct UserDirectory {
    client: Arc<StoreClient>,
}

impl UserDirectory {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    pub async fn count(&self) -> Result<usize, MiloError> {
        Ok(self.client.users().count().await?)
    }

    /// Users created within the last `days` days of `now`.
    pub async fn count_recent(&self, days: i64, now: DateTime<Utc>) -> Result<usize, MiloError> {
        let since = Duration::try_days(days)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| MiloError::Validation(format!("{days} days is out of range")))?;
        Ok(self.client.users().count_created_since(since).await?)
    }

    /// Newest users first; `limit` defaults to [`DEFAULT_RECENT_USERS`].
    pub async fn recent_users(&self, limit: Option<usize>) -> Result<Vec<User>, MiloError> {
        let limit = limit.filter(|n| *n > 0).unwrap_or(DEFAULT_RECENT_USERS);
        Ok(self.client.users().recent(limit).await?)
    }

    pub async fn admin_stats(&self, now: DateTime<Utc>) -> Result<AdminStats, MiloError> {
        let users = self.client.users();
        let all = users.list_all().await?;
        let since = |days: i64| {
            let cutoff = now - Duration::days(days);
            all.iter().filter(|u| u.created_at >= cutoff).count()
        };
        let banned_users = all.iter().filter(|u| u.banned == Some(true)).count();
        Ok(AdminStats {
            total_users: all.len(),
            users_today: since(1),
            users_this_week: since(7),
            users_this_month: since(30),
            admin_users: users.count_by_role(ADMIN_ROLE).await?,
            regular_users: all
                .iter()
                .filter(|u| matches!(u.role.as_deref(), None | Some(DEFAULT_ROLE)))
                .count(),
            banned_users,
            active_users: all.len() - banned_users,
        })
    }
}
