//! Domain Registry — canonical-name resolution
//!
//! Loaded once at startup from the [`crate::store::Store`] and held
//! read-only for the life of the process; any change requires a restart.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::store::{Domain, Store};
use crate::{Error, Result};

#[derive(Debug)]
pub struct DomainRegistry {
    domains: HashMap<String, Uuid>,
}

impl DomainRegistry {
    /// Loads every domain and its aliases. Fails service init if the
    /// store holds no domains at all.
    pub async fn load(store: &dyn Store) -> Result<Self> {
        let domains = store.list_domains().await?;
        if domains.is_empty() {
            return Err(Error::internal("domain registry loaded zero domains"));
        }

        let mut table = HashMap::new();
        for domain in &domains {
            insert_unique(&mut table, &domain.name, domain.id);
            for alias in &domain.aliases {
                insert_unique(&mut table, alias, domain.id);
            }
        }

        Ok(Self { domains: table })
    }

    pub fn from_domains(domains: &[Domain]) -> Self {
        let mut table = HashMap::new();
        for domain in domains {
            insert_unique(&mut table, &domain.name, domain.id);
            for alias in &domain.aliases {
                insert_unique(&mut table, alias, domain.id);
            }
        }
        Self { domains: table }
    }

    /// Case-insensitive: direct name match first, then alias. Returns
    /// `None` if `host` is not an owned domain or alias.
    pub fn canonicalise(&self, host: &str) -> Option<Uuid> {
        self.domains.get(&host.to_ascii_lowercase()).copied()
    }
}

fn insert_unique(table: &mut HashMap<String, Uuid>, name: &str, id: Uuid) {
    let key = name.to_ascii_lowercase();
    if let Some(existing) = table.get(&key) {
        if *existing != id {
            warn!(name = %name, "duplicate domain name/alias ignored");
        }
        return;
    }
    table.insert(key, id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str, aliases: &[&str]) -> Domain {
        Domain {
            id: Uuid::new_v4(),
            name: name.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn resolves_name_and_alias_case_insensitively() {
        let d = domain("example.com", &["example.local"]);
        let id = d.id;
        let registry = DomainRegistry::from_domains(&[d]);
        assert_eq!(registry.canonicalise("Example.COM"), Some(id));
        assert_eq!(registry.canonicalise("EXAMPLE.LOCAL"), Some(id));
    }

    #[test]
    fn returns_none_for_unowned_host() {
        let registry = DomainRegistry::from_domains(&[domain("example.com", &[])]);
        assert_eq!(registry.canonicalise("evil.example"), None);
    }

    #[test]
    fn duplicate_alias_keeps_first_owner() {
        let a = domain("a.example", &["shared.example"]);
        let b = domain("b.example", &["shared.example"]);
        let a_id = a.id;
        let registry = DomainRegistry::from_domains(&[a, b]);
        assert_eq!(registry.canonicalise("shared.example"), Some(a_id));
    }
}
