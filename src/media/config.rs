#![forbid(unsafe_code)]

// Engine settings: worker pool size, codec set, and transport listen addresses

use crate::config::{AppConfig, ListenIp};
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Settings the adapter needs from the config source.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub listen_ips: Vec<ListenIp>,
}

impl MediaSettings {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            num_workers: cfg.num_workers,
            rtc_min_port: cfg.rtc_min_port,
            rtc_max_port: cfg.rtc_max_port,
            listen_ips: cfg.listen_ips.clone(),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = WorkerLogLevel::Warn;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Rtcp,
        ];
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions::new(media_codecs())
    }

    /// Build transport options: every configured address is listened on over
    /// UDP and TCP, UDP entries first so clients prefer them.
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        let infos = self.listen_infos();
        let mut iter = infos.into_iter();
        let first = iter.next().expect("listen_infos is never empty");
        let mut listen = WebRtcTransportListenInfos::new(first);
        for info in iter {
            listen = listen.insert(info);
        }
        WebRtcTransportOptions::new(listen)
    }

    fn listen_infos(&self) -> Vec<ListenInfo> {
        let ips: Vec<ListenIp> = if self.listen_ips.is_empty() {
            vec![ListenIp {
                ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
                announced_ip: None,
            }]
        } else {
            self.listen_ips.clone()
        };

        let mut infos = Vec::with_capacity(ips.len() * 2);
        for protocol in [Protocol::Udp, Protocol::Tcp] {
            for ip in &ips {
                infos.push(ListenInfo {
                    protocol,
                    ip: ip.ip,
                    announced_address: ip.announced_ip.clone(),
                    port: None,
                    port_range: None,
                    flags: None,
                    send_buffer_size: None,
                    recv_buffer_size: None,
                });
            }
        }
        infos
    }
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// The codec set every room router is created with: Opus for audio, VP8 and
/// baseline H264 for video.
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(102),
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
    ]
}
