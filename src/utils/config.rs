use std::env;

/// Process configuration, read once at startup from the environment.
/// Every key has a default so the service runs with no configuration at
/// all against a local Redis.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_addr: String,
    pub redis_password: String,
    /// Only used to format the user-facing `<addr>@<domain>` string.
    pub domain: String,
    smtp_listen_addr: String,
    http_listen_addr: String,
    pub smtp_cert_path: Option<String>,
    pub smtp_key_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self where F: Fn(&str) -> Option<String> {
        let get = |key: &str, fallback: &str| {
            match lookup(key) {
                Some(value) if !value.is_empty() => value,
                _ => fallback.to_string(),
            }
        };
        let get_opt = |key: &str| lookup(key).filter(|value| !value.is_empty());

        Self {
            redis_addr: get("REDIS_ADDR", "localhost:6379"),
            redis_password: get("REDIS_PASSWORD", ""),
            domain: get("DOMAIN_NAME", "localhost"),
            smtp_listen_addr: get("SMTP_LISTEN_ADDR", ":1025"),
            http_listen_addr: get("HTTP_LISTEN_ADDR", ":8080"),
            smtp_cert_path: get_opt("SMTP_CERT_PATH"),
            smtp_key_path: get_opt("SMTP_KEY_PATH"),
        }
    }

    pub fn smtp_listen_addr(&self) -> String {
        normalize_listen_addr(&self.smtp_listen_addr)
    }

    pub fn http_listen_addr(&self) -> String {
        normalize_listen_addr(&self.http_listen_addr)
    }
}

// ":1025" style addresses bind on all interfaces.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}
