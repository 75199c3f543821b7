#![forbid(unsafe_code)]

// ICE server configuration handed to clients alongside created transports.
// Static entries come from ICE_SERVERS / TURN_* env vars; when TURN_SECRET is
// set, time-limited credentials are minted per client with HMAC-SHA1 in the
// coturn REST format (--use-auth-secret).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// ICE server entry sent to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Time-limited TURN credential configuration (coturn REST API).
#[derive(Debug, Clone)]
pub struct TurnRestConfig {
    pub urls: Vec<String>,
    pub secret: String,
    pub ttl_secs: u64,
}

impl TurnRestConfig {
    /// Generate time-limited credentials for a client.
    ///
    /// coturn format: username = "expiry_timestamp:arbitrary_id"
    ///               credential = base64(HMAC-SHA1(secret, username))
    pub fn generate_credentials(&self, client_id: &str) -> IceServer {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;

        let username = format!("{expiry}:{client_id}");

        let mut mac =
            HmacSha1::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(username.as_bytes());
        let credential =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        }
    }
}

/// Parse the ICE_SERVERS env value: a JSON array of ice server entries.
pub fn parse_ice_servers(json: &str) -> anyhow::Result<Vec<IceServer>> {
    let servers: Vec<IceServer> = serde_json::from_str(json)?;
    Ok(servers)
}

/// Build a static TURN entry from TURN_HOST/PORT/USERNAME/PASSWORD values.
pub fn static_turn_entry(
    host: &str,
    port: Option<&str>,
    username: Option<&str>,
    password: Option<&str>,
) -> IceServer {
    let port = port.unwrap_or("3478");
    IceServer {
        urls: vec![format!("turn:{host}:{port}")],
        username: username.map(str::to_string),
        credential: password.map(str::to_string),
    }
}

/// Resolve the ice server list for one client: static entries plus a minted
/// TURN REST entry when configured.
pub fn ice_servers_for(
    static_servers: &[IceServer],
    turn_rest: Option<&TurnRestConfig>,
    client_id: &str,
) -> Vec<IceServer> {
    let mut servers = static_servers.to_vec();
    if let Some(tc) = turn_rest {
        servers.push(tc.generate_credentials(client_id));
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ice_servers() {
        let json = r#"[{"urls": ["stun:stun.example.org:3478"]},
                       {"urls": ["turn:turn.example.org:3478"], "username": "u", "credential": "p"}]"#;
        let servers = parse_ice_servers(json).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert_eq!(servers[1].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_ice_servers("not json").is_err());
        assert!(parse_ice_servers(r#"{"urls": []}"#).is_err());
    }

    #[test]
    fn test_static_turn_entry_defaults_port() {
        let entry = static_turn_entry("turn.example.org", None, Some("alice"), Some("s3cret"));
        assert_eq!(entry.urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(entry.username.as_deref(), Some("alice"));
        assert_eq!(entry.credential.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_rest_credentials_embed_expiry_and_client() {
        let tc = TurnRestConfig {
            urls: vec!["turn:turn.example.org:3478".into()],
            secret: "shared".into(),
            ttl_secs: 600,
        };
        let entry = tc.generate_credentials("client-1");
        let username = entry.username.unwrap();
        let (expiry, id) = username.split_once(':').unwrap();
        assert_eq!(id, "client-1");
        assert!(expiry.parse::<u64>().unwrap() > 0);
        assert!(entry.credential.is_some());
    }

    #[test]
    fn test_ice_servers_for_appends_rest_entry() {
        let stat = vec![IceServer {
            urls: vec!["stun:stun.example.org:3478".into()],
            username: None,
            credential: None,
        }];
        let tc = TurnRestConfig {
            urls: vec!["turn:turn.example.org:3478".into()],
            secret: "shared".into(),
            ttl_secs: 600,
        };
        let servers = ice_servers_for(&stat, Some(&tc), "c1");
        assert_eq!(servers.len(), 2);
        let servers = ice_servers_for(&stat, None, "c1");
        assert_eq!(servers.len(), 1);
    }
}
