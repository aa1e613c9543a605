/// Maps tenants to their physical database names
#[derive(Debug, Clone)]
pub struct DatabaseRouter {
    prefix: String,
}

impl DatabaseRouter {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: sanitize_identifier(prefix),
        }
    }

    /// Database name for a tenant: `{prefix}_{tenant_id}` (e.g. `tenant_acme_01`)
    pub fn database_name(&self, tenant_id: &str) -> String {
        format!("{}_{}", self.prefix, sanitize_identifier(tenant_id))
    }
}

impl Default for DatabaseRouter {
    fn default() -> Self {
        Self::new("tenant")
    }
}

/// Sanitize identifier for PostgreSQL (lowercase, alphanumeric, underscore)
pub fn sanitize_identifier(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// A name we are willing to splice into DDL unquoted-safe
pub fn is_valid_identifier(name: &str) -> bool {
    let Some(first_char) = name.chars().next() else {
        return false;
    };
    if name.len() > 63 {
        return false;
    }
    if !first_char.is_ascii_lowercase() && first_char != '_' {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
