// tl-test-utils: Shared test utilities for the telemetry stream client.
//
// Provides a scriptable mock telemetry server for integration tests of the
// connection session and reconnect supervisor.

pub mod mock_telemetry_server;

pub use mock_telemetry_server::{ConnectionPlan, MockTelemetryServer};

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::Message;

    /// Test: server starts, binds to a random port, and reports a valid address.
    #[tokio::test]
    async fn mock_server_starts_and_reports_port() {
        let server = MockTelemetryServer::start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0, "should bind to a real port");
        assert!(server.base_url().starts_with("http://127.0.0.1:"));
    }

    /// Test: probes are answered with the `pong` literal and counted.
    #[tokio::test]
    async fn mock_server_answers_probe_with_pong() {
        let server = MockTelemetryServer::start().await.unwrap();
        let url = format!("ws://{}/ws/telemetry?token=abc", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        ws.send(Message::Text("ping".into())).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply, Message::Text("pong".into()));
        assert_eq!(server.probe_count(), 1);
        assert_eq!(server.tokens_seen(), vec![Some("abc".to_owned())]);
    }

    /// Test: a rejected handshake surfaces as an HTTP error on the client.
    #[tokio::test]
    async fn mock_server_rejects_handshake_per_plan() {
        let server = MockTelemetryServer::start().await.unwrap();
        server.enqueue_plans([ConnectionPlan::RejectHandshake(403)]);
        let url = format!("ws://{}/ws/telemetry", server.local_addr());

        let err = tokio_tungstenite::connect_async(url.as_str())
            .await
            .expect_err("handshake should be rejected");
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status().as_u16(), 403);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Queue drained: the next connection is accepted.
        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_ok());
        assert_eq!(server.connection_count(), 2);
    }

    /// Test: pushed telemetry reaches a live connection as an envelope.
    #[tokio::test]
    async fn mock_server_pushes_telemetry_envelope() {
        let server = MockTelemetryServer::start().await.unwrap();
        let url = format!("ws://{}/ws/telemetry", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        assert!(
            server
                .wait_until(Duration::from_secs(1), |s| s.live_connections() == 1)
                .await
        );

        server.push_telemetry(serde_json::json!({"alt": 3.0}));
        let msg = ws.next().await.unwrap().unwrap();
        let text = msg.into_text().unwrap();
        assert_eq!(text.as_str(), r#"{"data":{"alt":3.0},"type":"telemetry"}"#);
    }

    /// Test: close_all delivers a close frame with the requested code.
    #[tokio::test]
    async fn mock_server_close_all_sends_code() {
        let server = MockTelemetryServer::start().await.unwrap();
        let url = format!("ws://{}/ws/telemetry", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        assert!(
            server
                .wait_until(Duration::from_secs(1), |s| s.live_connections() == 1)
                .await
        );

        server.close_all(4000);
        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4000),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
