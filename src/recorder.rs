#![forbid(unsafe_code)]

// Client for the external recording worker. The recorder accepts RTP on a UDP
// port and is driven through a two-call HTTP RPC: POST /start with the
// producer's RTP description, POST /stop with the producer id.
//
// Recording is explicit: handlers call start/stop on client request, and the
// automatic-on-produce path stays behind the RECORD_AUTO flag.

use crate::media::ProducerSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::RwLock as StdRwLock;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub api_url: String,
    /// Address the recorder should accept RTP on
    pub rtp_ip: IpAddr,
    /// First RTP port handed out; subsequent recordings step by 2 (RTP+RTCP)
    pub rtp_port_base: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    ip: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    codec: Option<&'a str>,
    producer_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssrc: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    ok: bool,
    #[serde(default)]
    output_file: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    producer_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StopResponse {
    ok: bool,
}

pub struct RecorderClient {
    config: RecorderConfig,
    http: reqwest::Client,
    next_port: AtomicU16,
    active: StdRwLock<HashMap<String, Option<String>>>,
}

impl RecorderClient {
    pub fn new(config: RecorderConfig) -> Self {
        let base = config.rtp_port_base;
        Self {
            config,
            http: reqwest::Client::new(),
            next_port: AtomicU16::new(base),
            active: StdRwLock::new(HashMap::new()),
        }
    }

    fn alloc_port(&self) -> u16 {
        self.next_port.fetch_add(2, Ordering::Relaxed)
    }

    pub fn is_recording(&self, producer_id: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(producer_id)
    }

    /// Starts recording one producer. Returns the recorder's output file.
    pub async fn start(&self, snapshot: &ProducerSnapshot) -> anyhow::Result<Option<String>> {
        if self.is_recording(&snapshot.producer_id) {
            anyhow::bail!("producer is already being recorded");
        }

        let port = self.alloc_port();
        let request = StartRequest {
            ip: self.config.rtp_ip.to_string(),
            port,
            codec: snapshot.codec.as_deref(),
            producer_id: &snapshot.producer_id,
            payload_type: snapshot.payload_type,
            ssrc: snapshot.ssrc,
        };

        let response: StartResponse = self
            .http
            .post(format!("{}/start", self.config.api_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.ok {
            anyhow::bail!("recorder refused to start");
        }

        info!(
            "Recording producer {} ({:?}) to {:?} via {}:{}",
            snapshot.producer_id, snapshot.kind, response.output_file, self.config.rtp_ip, port
        );

        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.producer_id.clone(), response.output_file.clone());

        Ok(response.output_file)
    }

    /// Stops recording one producer.
    pub async fn stop(&self, producer_id: &str) -> anyhow::Result<()> {
        let known = self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(producer_id)
            .is_some();
        if !known {
            anyhow::bail!("producer is not being recorded");
        }

        let response: StopResponse = self
            .http
            .post(format!("{}/stop", self.config.api_url))
            .json(&StopRequest { producer_id })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.ok {
            anyhow::bail!("recorder refused to stop");
        }

        info!("Stopped recording producer {}", producer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RecorderClient {
        RecorderClient::new(RecorderConfig {
            api_url: "http://127.0.0.1:1".into(),
            rtp_ip: "127.0.0.1".parse().unwrap(),
            rtp_port_base: 5004,
        })
    }

    #[test]
    fn test_port_allocation_steps_by_two() {
        let client = client();
        assert_eq!(client.alloc_port(), 5004);
        assert_eq!(client.alloc_port(), 5006);
        assert_eq!(client.alloc_port(), 5008);
    }

    #[test]
    fn test_start_request_wire_shape() {
        let request = StartRequest {
            ip: "127.0.0.1".into(),
            port: 5004,
            codec: Some("video/VP8"),
            producer_id: "p1",
            payload_type: Some(96),
            ssrc: Some(1234),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["ip"], "127.0.0.1");
        assert_eq!(json["port"], 5004);
        assert_eq!(json["producerId"], "p1");
        assert_eq!(json["payloadType"], 96);
        assert_eq!(json["ssrc"], 1234);
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let client = client();
        assert!(client.stop("nope").await.is_err());
    }
}
