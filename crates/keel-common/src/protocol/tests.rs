use super::*;
use serde_json::json;

#[test]
fn test_classify_call() {
    let packet = Packet::classify(json!({"call": 7, "example/add": {"a": 1}})).unwrap();
    assert_eq!(
        packet,
        Packet::Call(CallEnvelope::new(7, "example/add", json!({"a": 1})))
    );
}

#[test]
fn test_classify_success_and_error() {
    let ok = Packet::classify(json!({"callback": 3, "result": [1, 2]})).unwrap();
    assert_eq!(ok, Packet::Response(ResponseEnvelope::success(3, json!([1, 2]))));

    let err = Packet::classify(json!({
        "callback": 3,
        "error": {"code": 404, "message": "Not Found"}
    }))
    .unwrap();
    match err {
        Packet::Response(resp) => {
            assert!(!resp.is_success());
            assert_eq!(resp.error.unwrap().code, 404);
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[test]
fn test_classify_event_and_token() {
    let event = Packet::classify(json!({"event": "tick", "clock": {"n": 1}})).unwrap();
    assert_eq!(event, Packet::Event(EventEnvelope::new("tick", "clock", json!({"n": 1}))));

    let token = Packet::classify(json!({"token": "abc"})).unwrap();
    assert_eq!(token, Packet::Token("abc".into()));
}

#[test]
fn test_structural_errors() {
    let bad = [
        json!([1, 2, 3]),
        json!({"call": 1}),
        json!({"call": 1, "a": 1, "b": 2}),
        json!({"call": "one", "a": 1}),
        json!({"call": -1, "a": 1}),
        json!({"call": 0, "a": 1}),
        json!({"callback": 1}),
        json!({"callback": 1, "result": 1, "error": {"code": 1, "message": ""}}),
        json!({"event": 5, "x": 1}),
        json!({"whatever": true}),
    ];
    for value in bad {
        let err = Packet::classify(value.clone()).unwrap_err();
        assert!(
            matches!(err, KeelError::Structural(_)),
            "{} should be structural",
            value
        );
        assert_eq!(err.code(), 400);
    }
}

#[test]
fn test_invalid_json_is_structural() {
    let err = Packet::from_slice(b"{not json").unwrap_err();
    assert!(matches!(err, KeelError::Structural(_)));
}

#[test]
fn test_response_serialization_shape() {
    let ok = ResponseEnvelope::success(1, json!({"result": "success"}));
    assert_eq!(ok.to_value(), json!({"callback": 1, "result": {"result": "success"}}));

    let err = ResponseEnvelope::failure(2, &KeelError::NotFound("nope".into()));
    assert_eq!(
        err.to_value(),
        json!({"callback": 2, "error": {"code": 404, "message": "Not Found"}})
    );
}

#[test]
fn test_public_message_hides_internal_detail() {
    let err = KeelError::Internal("stack trace with secrets".into());
    assert_eq!(err.code(), 500);
    assert_eq!(err.public_message(), "Internal Server Error");

    let business = KeelError::Method("Incorrect login or password".into());
    assert_eq!(business.public_message(), "Incorrect login or password");
}

#[test]
fn test_timeouts_are_retryable() {
    assert!(KeelError::Timeout(10).is_retryable());
    assert!(KeelError::QueueFull.is_retryable());
    assert!(!KeelError::Forbidden("x".into()).is_retryable());
}

#[test]
fn test_salvage_call_id() {
    assert_eq!(salvage_call_id(br#"{"call": 9, "a": 1, "b": 2}"#), 9);
    assert_eq!(salvage_call_id(b"garbage"), 0);
}

#[test]
fn test_into_result() {
    let ok = ResponseEnvelope::success(3, json!({"a": 1}));
    assert_eq!(ok.into_result().unwrap(), json!({"a": 1}));

    let err = ResponseEnvelope::error(3, ErrorBody::new(400, "Incorrect login or password"));
    match err.into_result().unwrap_err() {
        KeelError::Remote { code, message } => {
            assert_eq!(code, 400);
            assert_eq!(message, "Incorrect login or password");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
