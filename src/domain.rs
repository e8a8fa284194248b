//! DB domain resolution: the (database, schema, table prefix) triple that
//! scopes a logical unit of data.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::ConfigError;

/// The triple that identifies a logical data-space. Immutable once
/// constructed; equality is triple equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbDomain {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub prefix: String,
}

impl DbDomain {
    pub fn new(database: Option<String>, schema: Option<String>, prefix: impl Into<String>) -> Self {
        Self {
            database,
            schema,
            prefix: prefix.into(),
        }
    }

    /// Canonical id in `database[-schema]-prefix` form, the inverse of
    /// [`DomainResolver::parse_canonical`].
    pub fn canonical_id(&self) -> String {
        match (&self.database, &self.schema) {
            (Some(db), Some(schema)) => format!("{db}-{schema}-{}", self.prefix),
            (Some(db), None) => format!("{db}-{}", self.prefix),
            (None, _) => self.prefix.clone(),
        }
    }
}

/// Input accepted by [`DomainResolver::resolve`].
#[derive(Debug, Clone)]
pub enum DomainInput {
    /// Already resolved; returned as-is.
    Resolved(DbDomain),
    /// Sentinel meaning "use the local domain".
    Local,
    /// An alias registered via [`DomainResolver::add_alias`].
    Alias(String),
    /// A canonical `database[-schema]-prefix` string.
    Canonical(String),
}

/// Normalises domain inputs into canonical [`DbDomain`] instances.
///
/// Resolution is pure and idempotent. The local domain is returned for both
/// [`DomainInput::Local`] and for canonical strings equal to the local
/// domain's canonical id. The alias table is lazily materialised on first
/// hit (callers populate it with [`DomainResolver::add_alias`] before use;
/// the structure itself never auto-populates).
#[derive(Debug)]
pub struct DomainResolver {
    local: DbDomain,
    aliases: Mutex<HashMap<String, DbDomain>>,
    /// Single-slot cache for the most-recently-seen non-local domain.
    recent: Mutex<Option<(String, DbDomain)>>,
}

impl DomainResolver {
    pub fn new(local: DbDomain) -> Self {
        Self {
            local,
            aliases: Mutex::new(HashMap::new()),
            recent: Mutex::new(None),
        }
    }

    pub fn local(&self) -> &DbDomain {
        &self.local
    }

    pub fn add_alias(&self, alias: impl Into<String>, domain: DbDomain) {
        self.aliases.lock().insert(alias.into(), domain);
    }

    /// Parse `database[-schema]-prefix`. Two dash-separated segments means
    /// no schema; three means database-schema-prefix.
    pub fn parse_canonical(s: &str) -> Result<DbDomain, ConfigError> {
        let parts: Vec<&str> = s.split('-').collect();
        match parts.len() {
            1 => Ok(DbDomain::new(None, None, parts[0])),
            2 => Ok(DbDomain::new(Some(parts[0].to_string()), None, parts[1])),
            3 => Ok(DbDomain::new(
                Some(parts[0].to_string()),
                Some(parts[1].to_string()),
                parts[2],
            )),
            _ => Err(ConfigError::InvalidDomainString(s.to_string())),
        }
    }

    /// Resolve an input into a canonical domain instance.
    pub fn resolve(&self, input: DomainInput) -> Result<DbDomain, ConfigError> {
        let domain = match input {
            DomainInput::Resolved(domain) => domain,
            DomainInput::Local => return Ok(self.local.clone()),
            DomainInput::Alias(alias) => {
                if let Some(domain) = self.aliases.lock().get(&alias).cloned() {
                    domain
                } else {
                    Self::parse_canonical(&alias)?
                }
            }
            DomainInput::Canonical(s) => Self::parse_canonical(&s)?,
        };

        if domain.canonical_id() == self.local.canonical_id() {
            return Ok(self.local.clone());
        }

        let mut recent = self.recent.lock();
        *recent = Some((domain.canonical_id(), domain.clone()));

        Ok(domain)
    }

    /// The most-recently resolved non-local domain, if any.
    pub fn most_recent(&self) -> Option<DbDomain> {
        self.recent.lock().as_ref().map(|(_, d)| d.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn local() -> DbDomain {
        DbDomain::new(Some("pgdog".into()), None, "pub")
    }

    #[test]
    fn test_resolve_local_sentinel() {
        let resolver = DomainResolver::new(local());
        assert_eq!(resolver.resolve(DomainInput::Local).unwrap(), local());
    }

    #[test]
    fn test_resolve_canonical_equal_to_local() {
        let resolver = DomainResolver::new(local());
        let resolved = resolver
            .resolve(DomainInput::Canonical("pgdog-pub".into()))
            .unwrap();
        assert_eq!(resolved, local());
        assert!(resolver.most_recent().is_none());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let resolver = DomainResolver::new(local());
        let input = DomainInput::Canonical("other-schema-pre".into());
        let a = resolver.resolve(input.clone()).unwrap();
        let b = resolver.resolve(input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_alias_lazily_materialised() {
        let resolver = DomainResolver::new(local());
        let aliased = DbDomain::new(Some("reports".into()), None, "rpt");
        resolver.add_alias("analytics", aliased.clone());

        let resolved = resolver
            .resolve(DomainInput::Alias("analytics".into()))
            .unwrap();
        assert_eq!(resolved, aliased);
        assert_eq!(resolver.most_recent(), Some(aliased));
    }

    #[test]
    fn test_three_part_canonical_string() {
        let domain = DomainResolver::parse_canonical("db-schema-prefix").unwrap();
        assert_eq!(domain.database.as_deref(), Some("db"));
        assert_eq!(domain.schema.as_deref(), Some("schema"));
        assert_eq!(domain.prefix, "prefix");
    }

    #[test]
    fn test_invalid_canonical_string() {
        assert!(DomainResolver::parse_canonical("a-b-c-d").is_err());
    }
}
