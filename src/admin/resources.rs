use std::fmt;

use crate::cache::CacheKey;

const ADMIN_SEGMENT: &str = "admin";
const LIST_SEGMENT: &str = "all";

/// Resources managed from the back office.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminResource {
    Articles,
    Categories,
    Contacts,
    Formations,
    Sessions,
}

impl AdminResource {
    pub const ALL: [AdminResource; 5] = [
        Self::Articles,
        Self::Categories,
        Self::Contacts,
        Self::Formations,
        Self::Sessions,
    ];

    /// Name of the backing table.
    pub fn table(self) -> &'static str {
        match self {
            Self::Articles => "articles",
            Self::Categories => "categories",
            Self::Contacts => "contacts",
            Self::Formations => "formations",
            Self::Sessions => "sessions",
        }
    }

    /// `["admin", <resource>]`: parent of every key of this resource.
    pub fn prefix(self) -> CacheKey {
        CacheKey::from([ADMIN_SEGMENT, self.table()])
    }

    /// `["admin", <resource>, "all"]`
    pub fn list_key(self) -> CacheKey {
        self.prefix().child(LIST_SEGMENT)
    }

    /// `["admin", <resource>, <id>]`
    pub fn detail_key(self, id: &str) -> CacheKey {
        self.prefix().child(id)
    }

    /// Resources whose cached rows embed this one and go stale with it.
    pub fn dependants(self) -> &'static [AdminResource] {
        match self {
            Self::Categories => &[Self::Articles, Self::Formations],
            Self::Formations => &[Self::Sessions],
            Self::Articles | Self::Contacts | Self::Sessions => &[],
        }
    }

    /// Prefixes to invalidate after a confirmed write to this resource.
    pub fn invalidation_keys(self) -> Vec<CacheKey> {
        std::iter::once(self)
            .chain(self.dependants().iter().copied())
            .map(Self::prefix)
            .collect()
    }
}

impl fmt::Display for AdminResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}
