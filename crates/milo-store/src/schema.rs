// Table and index definitions. Names are part of the persisted layout and are
// shared by every backend.

use std::fmt;

/// Built-in index present on every table, ordered by `_creationTime`.
pub const BY_CREATION_TIME: &str = "by_creation_time";

/// Creation time field every document carries.
pub const CREATION_TIME: &str = "_creationTime";

/// Document id field.
pub const ID: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    pub unique: bool,
}

const fn index(name: &'static str, fields: &'static [&'static str]) -> IndexDef {
    IndexDef {
        name,
        fields,
        unique: false,
    }
}

const fn unique(name: &'static str, fields: &'static [&'static str]) -> IndexDef {
    IndexDef {
        name,
        fields,
        unique: true,
    }
}

const CREATION_INDEX: IndexDef = index(BY_CREATION_TIME, &[CREATION_TIME]);

/// Every table in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Sessions,
    Accounts,
    Verifications,
    Products,
    Subscriptions,
    BillingEvents,
    UsageEvents,
    CheckoutSessions,
    CacheEntries,
}

impl Table {
    pub const ALL: [Table; 10] = [
        Table::Users,
        Table::Sessions,
        Table::Accounts,
        Table::Verifications,
        Table::Products,
        Table::Subscriptions,
        Table::BillingEvents,
        Table::UsageEvents,
        Table::CheckoutSessions,
        Table::CacheEntries,
    ];

    /// Collection name.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Sessions => "sessions",
            Table::Accounts => "accounts",
            Table::Verifications => "verifications",
            Table::Products => "products",
            Table::Subscriptions => "subscriptions",
            Table::BillingEvents => "billing_events",
            Table::UsageEvents => "usage_events",
            Table::CheckoutSessions => "checkout_sessions",
            Table::CacheEntries => "cacheEntries",
        }
    }

    /// Declared indexes, excluding the built-in creation-time index.
    pub fn indexes(&self) -> &'static [IndexDef] {
        const USERS: &[IndexDef] = &[
            unique("by_email", &["email"]),
            index("by_role", &["role"]),
            index("by_created_at", &["createdAt"]),
        ];
        const SESSIONS: &[IndexDef] = &[
            index("by_user_id", &["userId"]),
            unique("by_token", &["token"]),
            index("by_expires_at", &["expiresAt"]),
        ];
        const ACCOUNTS: &[IndexDef] = &[
            index("by_user_id", &["userId"]),
            unique("by_provider_account", &["providerId", "accountId"]),
        ];
        const VERIFICATIONS: &[IndexDef] = &[
            index("by_identifier", &["identifier"]),
            index("by_identifier_value", &["identifier", "value"]),
            index("by_expires_at", &["expiresAt"]),
        ];
        const PRODUCTS: &[IndexDef] = &[
            unique("by_product_id", &["id"]),
            index("by_stripe_product", &["stripeProductId"]),
            index("by_active", &["active"]),
        ];
        const SUBSCRIPTIONS: &[IndexDef] = &[
            index("by_user", &["userId"]),
            index("by_external_id", &["externalId"]),
            index("by_status", &["status"]),
            index("by_platform", &["platform"]),
            index("by_autumn_customer", &["autumnCustomerId"]),
        ];
        const BILLING_EVENTS: &[IndexDef] = &[
            index("by_user", &["userId"]),
            index("by_type", &["type"]),
            index("by_external_id", &["externalId"]),
            index("by_processed", &["processed"]),
            index("by_platform_external_id", &["platform", "externalId"]),
        ];
        const USAGE_EVENTS: &[IndexDef] = &[
            index("by_user_feature", &["userId", "featureId", "timestamp"]),
            index("by_timestamp", &["timestamp"]),
        ];
        const CHECKOUT_SESSIONS: &[IndexDef] = &[
            unique("by_session_id", &["sessionId"]),
            index("by_user", &["userId"]),
            index("by_status", &["status"]),
        ];
        const CACHE_ENTRIES: &[IndexDef] = &[
            unique("by_key", &["key"]),
            index("by_expires_at", &["expiresAt"]),
        ];

        match self {
            Table::Users => USERS,
            Table::Sessions => SESSIONS,
            Table::Accounts => ACCOUNTS,
            Table::Verifications => VERIFICATIONS,
            Table::Products => PRODUCTS,
            Table::Subscriptions => SUBSCRIPTIONS,
            Table::BillingEvents => BILLING_EVENTS,
            Table::UsageEvents => USAGE_EVENTS,
            Table::CheckoutSessions => CHECKOUT_SESSIONS,
            Table::CacheEntries => CACHE_ENTRIES,
        }
    }

    /// Look up an index by name, including the built-in creation-time index.
    pub fn index(&self, name: &str) -> Option<&'static IndexDef> {
        if name == BY_CREATION_TIME {
            return Some(&CREATION_INDEX);
        }
        self.indexes().iter().find(|idx| idx.name == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_names_are_unique_per_table() {
        for table in Table::ALL {
            let mut names: Vec<_> = table.indexes().iter().map(|i| i.name).collect();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), table.indexes().len(), "{table}");
        }
    }

    #[test]
    fn test_unique_indexes() {
        assert!(Table::Users.index("by_email").unwrap().unique);
        assert!(Table::Sessions.index("by_token").unwrap().unique);
        assert!(Table::CacheEntries.index("by_key").unwrap().unique);
        assert!(Table::CheckoutSessions.index("by_session_id").unwrap().unique);
        assert!(!Table::BillingEvents.index("by_platform_external_id").unwrap().unique);
    }

    #[test]
    fn test_creation_index_on_every_table() {
        for table in Table::ALL {
            assert_eq!(table.index(BY_CREATION_TIME).unwrap().fields, &[CREATION_TIME]);
        }
        assert!(Table::Users.index("by_nothing").is_none());
    }
}
