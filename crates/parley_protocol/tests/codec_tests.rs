#![forbid(unsafe_code)]

use parley_protocol::codec::{CodecError, DEFAULT_MAX_LINE_SIZE, decode_line, encode_line};
use parley_protocol::{ClientEvent, ServerEvent};

#[test]
fn encode_decode_roundtrip() {
	let ev = ClientEvent::SendMessage {
		content: "hello".to_string(),
		attachment: None,
		parent: None,
	};

	let line = encode_line(&ev, DEFAULT_MAX_LINE_SIZE).expect("encode");
	assert_eq!(*line.last().expect("non-empty"), b'\n');

	let back: ClientEvent = decode_line(&line, DEFAULT_MAX_LINE_SIZE).expect("decode");
	assert_eq!(back, ev);
}

#[test]
fn decode_accepts_missing_newline() {
	let ev: ServerEvent = decode_line(br#"{"type":"kicked"}"#, DEFAULT_MAX_LINE_SIZE).expect("decode");
	assert_eq!(ev, ServerEvent::Kicked { reason: None });
}

#[test]
fn encode_rejects_too_long() {
	let ev = ClientEvent::SendMessage {
		content: "x".repeat(1024),
		attachment: None,
		parent: None,
	};

	let err = encode_line(&ev, 64).unwrap_err();
	match err {
		CodecError::LineTooLong { len, max } => assert!(len > max),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn decode_rejects_malformed_json() {
	let err = decode_line::<ClientEvent>(b"{not json}\n", DEFAULT_MAX_LINE_SIZE).unwrap_err();
	match err {
		CodecError::Json(_) => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn unknown_event_type_is_an_error() {
	let err = decode_line::<ClientEvent>(br#"{"type":"warp_drive"}"#, DEFAULT_MAX_LINE_SIZE);
	assert!(err.is_err());
}
