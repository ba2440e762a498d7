/// Frame classification against the frames the telemetry server actually sends.
///
/// Every case is checked over both transports (text frame and binary frame)
/// because the encoding must never change the classification.
use bytes::Bytes;
use serde_json::json;
use tl_protocol::{FallbackPolicy, Frame, RawFrame, decode, telemetry_frame};

/// Decode `text` as both a text frame and a binary frame and assert both agree.
fn classify(text: &str, policy: FallbackPolicy) -> Frame {
    let as_text = decode(&RawFrame::Text(text.to_owned()), policy);
    let as_binary = decode(&RawFrame::Binary(Bytes::copy_from_slice(text.as_bytes())), policy);
    assert_eq!(
        as_text, as_binary,
        "transport encoding changed classification of {text:?}"
    );
    as_text
}

#[test]
fn bare_pong_literal_is_keepalive_ack() {
    assert_eq!(classify("pong", FallbackPolicy::WholeValue), Frame::KeepaliveAck);
    assert_eq!(classify("pong\n", FallbackPolicy::Strict), Frame::KeepaliveAck);
}

#[test]
fn pong_envelope_is_keepalive_ack() {
    assert_eq!(
        classify(r#"{"type":"pong"}"#, FallbackPolicy::Strict),
        Frame::KeepaliveAck
    );
}

#[test]
fn server_idle_keepalive_is_keepalive_ack() {
    assert_eq!(
        classify(
            r#"{"type":"keepalive","timestamp":1718031245.25}"#,
            FallbackPolicy::WholeValue
        ),
        Frame::KeepaliveAck
    );
}

#[test]
fn telemetry_envelope_is_unwrapped() {
    let frame = classify(
        r#"{"type":"telemetry","data":{"alt":12.5}}"#,
        FallbackPolicy::Strict,
    );
    assert_eq!(frame, Frame::TelemetryData(json!({"alt": 12.5})));
}

#[test]
fn full_server_snapshot_is_unwrapped() {
    let body = json!({
        "position": {"lat": 47.39, "lon": 8.54, "alt": 488.1, "relative_alt": 12.5},
        "attitude": {"roll": 0.01, "pitch": -0.02, "yaw": 1.57},
        "battery": {"voltage": 16.4, "current": 3.2, "remaining": 87, "temperature": 0},
        "mode": "GUIDED",
        "armed": true,
        "timestamp": 1718031245.25
    });
    let frame = classify(&telemetry_frame(body.clone()), FallbackPolicy::WholeValue);
    assert_eq!(frame, Frame::TelemetryData(body));
}

#[test]
fn telemetry_envelope_without_body_is_ignored() {
    for text in [
        r#"{"type":"telemetry"}"#,
        r#"{"type":"telemetry","data":null}"#,
        r#"{"type":"telemetry","data":{}}"#,
        r#"{"type":"telemetry","data":[]}"#,
    ] {
        assert_eq!(classify(text, FallbackPolicy::WholeValue), Frame::Ignore, "{text}");
    }
}

#[test]
fn unknown_discriminator_is_ignored() {
    assert_eq!(
        classify(r#"{"type":"mission_update","data":{"wp":3}}"#, FallbackPolicy::WholeValue),
        Frame::Ignore
    );
    assert_eq!(
        classify(r#"{"type":7,"data":{"wp":3}}"#, FallbackPolicy::WholeValue),
        Frame::Ignore
    );
}

#[test]
fn malformed_frames_are_ignored() {
    for text in ["", "{", "not json at all", r#"{"type":"telemetry","data":"#] {
        assert_eq!(classify(text, FallbackPolicy::WholeValue), Frame::Ignore, "{text:?}");
    }
}

#[test]
fn invalid_utf8_binary_is_ignored() {
    let frame = decode(
        &RawFrame::Binary(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])),
        FallbackPolicy::WholeValue,
    );
    assert_eq!(frame, Frame::Ignore);
}

#[test]
fn unenveloped_object_is_telemetry_under_whole_value_fallback() {
    let frame = classify(r#"{"alt":12.5,"armed":false}"#, FallbackPolicy::WholeValue);
    assert_eq!(frame, Frame::TelemetryData(json!({"alt": 12.5, "armed": false})));
}

#[test]
fn unenveloped_object_is_ignored_under_strict_fallback() {
    assert_eq!(
        classify(r#"{"alt":12.5}"#, FallbackPolicy::Strict),
        Frame::Ignore
    );
}

#[test]
fn empty_unenveloped_values_are_ignored() {
    assert_eq!(classify("{}", FallbackPolicy::WholeValue), Frame::Ignore);
    assert_eq!(classify("[]", FallbackPolicy::WholeValue), Frame::Ignore);
    assert_eq!(classify("null", FallbackPolicy::WholeValue), Frame::Ignore);
}

#[test]
fn fallback_policy_parses_from_config_names() {
    #[derive(serde::Deserialize)]
    struct Wrapper {
        fallback: FallbackPolicy,
    }
    let w: Wrapper = serde_json::from_str(r#"{"fallback":"strict"}"#).unwrap();
    assert_eq!(w.fallback, FallbackPolicy::Strict);
    let w: Wrapper = serde_json::from_str(r#"{"fallback":"whole_value"}"#).unwrap();
    assert_eq!(w.fallback, FallbackPolicy::WholeValue);
}
