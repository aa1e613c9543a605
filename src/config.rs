use ipnetwork::IpNetwork;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub gateway_host: String,
    pub gateway_port: u16,
    pub max_connections_per_pool: u32,
    pub max_total_connections: u32,
    pub pool_idle_timeout: Duration,
    pub allowed_networks: Vec<IpNetwork>,
    pub data_dir: PathBuf,
    pub migrations_dir: PathBuf,
    pub tenant_db_prefix: String,
    pub migration_timeout: Duration,
    pub admin_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // DATABASE_URL wins over the individual DB_* fields
        let database_url = if let Ok(url) = env::var("DATABASE_URL") {
            url
        } else {
            let db_host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
            let db_port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
            let db_name = env::var("DB_NAME").unwrap_or_else(|_| "postgres".to_string());
            let db_user = env::var("DB_USER").unwrap_or_else(|_| "tenantdb".to_string());
            let db_password = env::var("DB_PASSWORD").unwrap_or_else(|_| "password".to_string());

            let encoded_password = urlencoding::encode(&db_password);

            format!("postgres://{}:{}@{}:{}/{}", db_user, encoded_password, db_host, db_port, db_name)
        };

        let gateway_host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let gateway_port = parse_env("GATEWAY_PORT", 9100u16);

        let max_connections_per_pool = parse_env("MAX_CONNECTIONS_PER_POOL", 5u32);
        let max_total_connections = parse_env("MAX_TOTAL_CONNECTIONS", 100u32);
        let pool_idle_timeout_secs = parse_env("POOL_IDLE_TIMEOUT_SECS", 1800u64);
        let migration_timeout_secs = parse_env("MIGRATION_TIMEOUT_SECS", 300u64);

        let allowed_networks = parse_networks(
            &env::var("ALLOWED_NETWORKS").unwrap_or_else(|_| "127.0.0.0/8,::1/128".to_string()),
        );

        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let migrations_dir = env::var("MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./migrations"));

        let tenant_db_prefix = env::var("TENANT_DB_PREFIX").unwrap_or_else(|_| "tenant".to_string());

        let admin_token = env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(Config {
            database_url,
            gateway_host,
            gateway_port,
            max_connections_per_pool,
            max_total_connections,
            pool_idle_timeout: Duration::from_secs(pool_idle_timeout_secs),
            allowed_networks,
            data_dir,
            migrations_dir,
            tenant_db_prefix,
            migration_timeout: Duration::from_secs(migration_timeout_secs),
            admin_token,
        })
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.gateway_host, self.gateway_port);
        addr.parse().map_err(|e| anyhow::anyhow!("Invalid socket address: {}", e))
    }
}

fn parse_env<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated CIDR list, skipping blanks and malformed entries
fn parse_networks(raw: &str) -> Vec<IpNetwork> {
    raw.split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                IpNetwork::from_str(trimmed).ok()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_networks_skips_garbage() {
        let nets = parse_networks("10.0.1.0/24, ,not-a-net,::1/128");
        assert_eq!(nets.len(), 2);
        assert!(nets[0].contains("10.0.1.7".parse().unwrap()));
    }

    #[test]
    fn test_parse_env_falls_back_on_bad_value() {
        env::set_var("TENANTDB_TEST_PORT", "not-a-number");
        assert_eq!(parse_env("TENANTDB_TEST_PORT", 42u16), 42);
        env::set_var("TENANTDB_TEST_PORT", " 8080 ");
        assert_eq!(parse_env("TENANTDB_TEST_PORT", 42u16), 8080);
        env::remove_var("TENANTDB_TEST_PORT");
    }
}
