#![forbid(unsafe_code)]

// Process configuration, loaded once at startup from the environment.
// Room defaults are captured here and stamped onto rooms at creation time.

use crate::ice::{self, IceServer, TurnRestConfig};
use crate::recorder::RecorderConfig;
use crate::rooms::RoomOptions;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{info, warn};

/// One SFU listen address, optionally with a separate announced address for
/// clients behind NAT.
#[derive(Debug, Clone)]
pub struct ListenIp {
    pub ip: IpAddr,
    pub announced_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenIpEntry {
    ip: IpAddr,
    #[serde(default)]
    announced_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub admin_port: u16,
    pub enable_auth: bool,
    pub jwt_secret: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub turn_rest: Option<TurnRestConfig>,
    pub listen_ips: Vec<ListenIp>,
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub room_defaults: RoomOptions,
    pub max_connections: usize,
    pub recorder: Option<RecorderConfig>,
    pub record_auto: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_port: 9090,
            enable_auth: false,
            jwt_secret: None,
            ice_servers: Vec::new(),
            turn_rest: None,
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".parse().expect("valid address"),
                announced_ip: None,
            }],
            num_workers: default_num_workers(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            room_defaults: RoomOptions::default(),
            max_connections: 10_000,
            recorder: None,
            record_auto: false,
        }
    }
}

fn default_num_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// "1"/"true"/"yes" (case-insensitive) are truthy; everything else is false.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Parse SFU_LISTEN_IPS: a JSON array of `{ip, announcedIp}` objects.
pub fn parse_listen_ips(json: &str) -> anyhow::Result<Vec<ListenIp>> {
    let entries: Vec<ListenIpEntry> = serde_json::from_str(json)?;
    if entries.is_empty() {
        anyhow::bail!("SFU_LISTEN_IPS must not be empty");
    }
    Ok(entries
        .into_iter()
        .map(|e| ListenIp {
            ip: e.ip,
            announced_ip: e.announced_ip,
        })
        .collect())
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults and
    /// logging every decision that affects connectivity.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.port = env_parse("PORT", cfg.port);
        cfg.admin_port = env_parse("ADMIN_PORT", cfg.admin_port);
        cfg.enable_auth = env_var("ENABLE_AUTH").map(|v| parse_flag(&v)).unwrap_or(false);
        cfg.jwt_secret = env_var("JWT_SECRET");
        if cfg.enable_auth && cfg.jwt_secret.is_none() {
            warn!("ENABLE_AUTH is set but JWT_SECRET is missing; all connections will be rejected");
        }

        if let Some(json) = env_var("ICE_SERVERS") {
            match ice::parse_ice_servers(&json) {
                Ok(servers) => cfg.ice_servers = servers,
                Err(e) => warn!("Ignoring invalid ICE_SERVERS: {}", e),
            }
        } else if let Some(host) = env_var("TURN_HOST") {
            cfg.ice_servers.push(ice::static_turn_entry(
                &host,
                env_var("TURN_PORT").as_deref(),
                env_var("TURN_USERNAME").as_deref(),
                env_var("TURN_PASSWORD").as_deref(),
            ));
        }

        if let (Some(host), Some(secret)) = (env_var("TURN_HOST"), env_var("TURN_SECRET")) {
            let port = env_var("TURN_PORT").unwrap_or_else(|| "3478".into());
            cfg.turn_rest = Some(TurnRestConfig {
                urls: vec![format!("turn:{host}:{port}")],
                secret,
                ttl_secs: env_parse("TURN_TTL", 86_400),
            });
        }

        let announced = env_var("PUBLIC_IP");
        if let Some(json) = env_var("SFU_LISTEN_IPS") {
            match parse_listen_ips(&json) {
                Ok(ips) => cfg.listen_ips = ips,
                Err(e) => warn!("Ignoring invalid SFU_LISTEN_IPS: {}", e),
            }
        } else {
            let bind: IpAddr = env_var("SFU_BIND_IP")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| "0.0.0.0".parse().expect("valid address"));
            cfg.listen_ips = vec![ListenIp {
                ip: bind,
                announced_ip: announced.clone(),
            }];
        }
        if cfg.listen_ips.iter().all(|l| l.announced_ip.is_none()) {
            if let Some(ip) = announced {
                for l in &mut cfg.listen_ips {
                    l.announced_ip = Some(ip.clone());
                }
            } else {
                info!("No PUBLIC_IP set; ICE candidates will announce the bind address");
            }
        }

        cfg.num_workers = env_parse("SFU_NUM_WORKERS", cfg.num_workers).max(1);
        cfg.max_connections = env_parse("MAX_CONNECTIONS", cfg.max_connections);
        if cfg.max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            cfg.max_connections = 10_000;
        }

        cfg.room_defaults = RoomOptions {
            max_video_producers: env_parse("MAX_VIDEO_PER_ROOM", 0),
            allow_observers: env_var("ALLOW_OBSERVERS")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            max_observers: env_parse("MAX_OBSERVERS", 0),
        };

        if let Some(url) = env_var("RECORDER_API_URL") {
            cfg.recorder = Some(RecorderConfig {
                api_url: url,
                rtp_ip: env_var("RECORDER_RTP_IP")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| "127.0.0.1".parse().expect("valid address")),
                rtp_port_base: env_parse("RECORDER_RTP_PORT", 5004),
            });
        }
        cfg.record_auto = env_var("RECORD_AUTO").map(|v| parse_flag(&v)).unwrap_or(false);
        if cfg.record_auto && cfg.recorder.is_none() {
            warn!("RECORD_AUTO is set but RECORDER_API_URL is missing; auto-recording disabled");
            cfg.record_auto = false;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(parse_flag("YES"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_parse_listen_ips() {
        let ips =
            parse_listen_ips(r#"[{"ip": "0.0.0.0", "announcedIp": "203.0.113.5"}]"#).unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].ip.to_string(), "0.0.0.0");
        assert_eq!(ips[0].announced_ip.as_deref(), Some("203.0.113.5"));

        let ips = parse_listen_ips(r#"[{"ip": "10.0.0.2"}]"#).unwrap();
        assert!(ips[0].announced_ip.is_none());
    }

    #[test]
    fn test_parse_listen_ips_rejects_invalid() {
        assert!(parse_listen_ips("[]").is_err());
        assert!(parse_listen_ips("nope").is_err());
        assert!(parse_listen_ips(r#"[{"announcedIp": "1.2.3.4"}]"#).is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.admin_port, 9090);
        assert!(!cfg.enable_auth);
        assert!(cfg.num_workers >= 1);
        assert_eq!(cfg.room_defaults.max_video_producers, 0);
        assert!(cfg.room_defaults.allow_observers);
        assert!(!cfg.record_auto);
    }
}
