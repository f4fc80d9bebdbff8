//! UDP control channel.
//!
//! Receives the binary session control messages and drives the engine:
//! SessionBegin creates and starts a relay session for the carried URI,
//! SessionEnd tears the matching session down. A datagram that fails to
//! decode is logged and dropped; the channel stays open.

use std::net::SocketAddr;

use chrono::{DateTime, TimeZone, Utc};
use driftwood_core::engine::{CreateSessionRequest, EngineHandle};
use driftwood_core::protocol::{ControlCodec, ControlMessage};
use driftwood_core::session::SessionId;
use tokio::net::UdpSocket;

pub struct ControlListener {
    socket: UdpSocket,
    engine: EngineHandle,
}

impl ControlListener {
    /// Binds the control socket.
    pub async fn bind(addr: &str, engine: EngineHandle) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, engine })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives and applies control messages until aborted.
    pub async fn run(self) {
        // Control URIs can run long; size for the large-URI case.
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                Err(e) => {
                    tracing::warn!(error = %e, "control socket receive failed");
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        let message = match ControlCodec::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping malformed control message");
                return;
            }
        };

        match message {
            ControlMessage::SessionBegin {
                expires_at_epoch, ..
            } => {
                let Some(uri) = message.uri() else {
                    tracing::warn!(%peer, "session begin without uri");
                    return;
                };
                let id = session_id_for(uri);
                tracing::info!(%peer, source = %message.source_ip_str(), session = %id, "session begin");

                let request = CreateSessionRequest {
                    id: id.clone(),
                    source_uri: uri.to_string(),
                    expires_at: expiry_from_epoch(expires_at_epoch),
                };
                match self.engine.create_session(request).await {
                    Ok(id) => {
                        if let Err(e) = self.engine.start_retrieval(&id).await {
                            tracing::warn!(session = %id, error = %e, "start retrieval");
                        }
                    }
                    Err(e) => tracing::warn!(session = %id, error = %e, "create session"),
                }
            }
            ControlMessage::SessionEnd { .. } => {
                let Some(uri) = message.uri() else {
                    tracing::warn!(%peer, "session end without uri");
                    return;
                };
                let id = session_id_for(uri);
                tracing::info!(%peer, session = %id, "session end");
                if let Err(e) = self.engine.delete_session(&id).await {
                    tracing::debug!(session = %id, error = %e, "session end for unknown session");
                }
            }
        }
    }
}

/// Session id derived from the request uri: the final path segment without
/// its extension. Both begin and end messages for one stream must map to
/// the same id.
fn session_id_for(uri: &str) -> SessionId {
    let name = uri
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(uri);
    let name = name.split('.').next().filter(|s| !s.is_empty()).unwrap_or(name);
    SessionId::new(name)
}

/// Zero and negative epochs mean "no expiry".
fn expiry_from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch <= 0 {
        return None;
    }
    Utc.timestamp_opt(epoch, 0).single()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use driftwood_core::config::DriftwoodConfig;
    use driftwood_core::fetch::mock::{MockFetcher, MockOutcome};
    use driftwood_core::media::MediaStore;
    use driftwood_core::session::SessionRegistry;
    use driftwood_core::spawn_relay_engine;

    use super::*;

    const MANIFEST_URL: &str = "http://origin/cam-7/live.mpd";

    const LIVE_MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minBufferTime="PT2S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
          initialization="video-init.m4s" media="video-$Number$.m4s"/>
      <Representation id="video-1" bandwidth="800000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_session_id_from_uri() {
        assert_eq!(
            session_id_for("http://origin/streams/cam-7.mpd"),
            SessionId::new("cam-7")
        );
        assert_eq!(
            session_id_for("http://origin/streams/live/"),
            SessionId::new("live")
        );
    }

    #[test]
    fn test_expiry_epoch_conversion() {
        assert!(expiry_from_epoch(0).is_none());
        assert!(expiry_from_epoch(-5).is_none());
        let at = expiry_from_epoch(1_735_689_600).unwrap();
        assert_eq!(at.timestamp(), 1_735_689_600);
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_begin_and_end_over_udp() {
        let media_dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let fetcher = MockFetcher::new();
        fetcher.set_sticky(
            MANIFEST_URL,
            MockOutcome::Body(bytes::Bytes::from_static(LIVE_MANIFEST.as_bytes())),
        );
        let engine = spawn_relay_engine(
            DriftwoodConfig::for_testing(),
            registry.clone(),
            fetcher,
            MediaStore::new(media_dir.path()),
        );

        let listener = ControlListener::bind("127.0.0.1:0", engine).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let listener_task = tokio::spawn(listener.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Garbage first: dropped, channel stays usable.
        client.send_to(b"garbage", addr).await.unwrap();

        let begin = ControlMessage::session_begin(
            "192.168.0.10",
            Some(MANIFEST_URL.to_string()),
            0,
        )
        .unwrap();
        client
            .send_to(&ControlCodec::encode(&begin), addr)
            .await
            .unwrap();
        let id = SessionId::new("live");
        wait_for(|| registry.contains(&id)).await;

        let end = ControlMessage::session_end("192.168.0.10", Some(MANIFEST_URL.to_string()))
            .unwrap();
        client
            .send_to(&ControlCodec::encode(&end), addr)
            .await
            .unwrap();
        wait_for(|| !registry.contains(&id)).await;

        listener_task.abort();
    }
}
