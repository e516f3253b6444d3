//! Property-based tests for the wire codec using proptest.
//!
//! These tests check invariants that hold for arbitrary input: decoding
//! reverses encoding, sizes use the short form below 255, and malformed input
//! yields errors rather than panics.

use std::collections::HashMap;

use bytes::Bytes;
use floe_rpc::codec::{Encapsulation, InputStream, OutputStream};
use floe_rpc::protocol::{MessageHeader, Request, RequestHeader, HEADER_SIZE};
use floe_rpc::{Endpoint, Identity, OperationMode, ENCODING_1_0, ENCODING_1_1};
use proptest::prelude::*;

fn any_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 _/@:\\\\\"'\\-\u{e9}\u{4e16}]{1,24}"
}

fn any_mode() -> impl Strategy<Value = OperationMode> {
    prop_oneof![
        Just(OperationMode::Normal),
        Just(OperationMode::Nonmutating),
        Just(OperationMode::Idempotent),
    ]
}

proptest! {
    #[test]
    fn prop_size_uses_short_form_below_255(size in 0usize..100_000) {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_size(size);
        let bytes = out.finished().unwrap();
        let expected_len = if size < 255 { 1 } else { 5 };
        prop_assert_eq!(bytes.len(), expected_len);

        let mut input = InputStream::new(bytes, ENCODING_1_1);
        prop_assert_eq!(input.read_size().unwrap(), size);
    }

    #[test]
    fn prop_primitives_decode_in_order(
        b in any::<bool>(),
        s in any::<i16>(),
        i in any::<i32>(),
        l in any::<i64>(),
        d in any::<f64>().prop_filter("not NaN", |d| !d.is_nan()),
        text in ".{0,64}",
    ) {
        let mut out = OutputStream::new(ENCODING_1_0);
        out.write_bool(b);
        out.write_short(s);
        out.write_int(i);
        out.write_long(l);
        out.write_double(d);
        out.write_string(&text);
        let bytes = out.finished().unwrap();

        let mut input = InputStream::new(bytes, ENCODING_1_0);
        prop_assert_eq!(input.read_bool().unwrap(), b);
        prop_assert_eq!(input.read_short().unwrap(), s);
        prop_assert_eq!(input.read_int().unwrap(), i);
        prop_assert_eq!(input.read_long().unwrap(), l);
        prop_assert_eq!(input.read_double().unwrap(), d);
        prop_assert_eq!(input.read_string().unwrap(), text);
        prop_assert!(input.is_at_end());
    }

    #[test]
    fn prop_identity_string_form_parses_back(name in any_name(), category in prop::option::of(any_name())) {
        let identity = match category {
            Some(category) => Identity::with_category(name, category),
            None => Identity::new(name),
        };
        let parsed: Identity = identity.to_string().parse().unwrap();
        prop_assert_eq!(parsed, identity);
    }

    #[test]
    fn prop_endpoint_string_form_parses_back(
        port in 0u16..=u16::MAX,
        timeout in prop_oneof![Just(-1i32), 1i32..600_000],
        compress in any::<bool>(),
    ) {
        let mut text = format!("tcp -h 127.0.0.1 -p {port}");
        if timeout < 0 {
            text.push_str(" -t infinite");
        } else {
            text.push_str(&format!(" -t {timeout}"));
        }
        if compress {
            text.push_str(" -z");
        }
        let endpoint: Endpoint = text.parse().unwrap();
        prop_assert_eq!(endpoint.to_string(), text.clone());
        let again: Endpoint = endpoint.to_string().parse().unwrap();
        prop_assert_eq!(again, endpoint);
    }

    #[test]
    fn prop_request_body_decodes(
        request_id in 1i32..=i32::MAX,
        name in any_name(),
        facet in prop::option::of(any_name()),
        operation in "[a-zA-Z]{1,16}",
        mode in any_mode(),
        context in prop::collection::hash_map("[a-z]{1,8}", ".{0,16}", 0..4),
        payload in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let params = Encapsulation::build(ENCODING_1_1, |out| out.write_byte_seq(&payload)).unwrap();
        let request = Request {
            header: RequestHeader {
                request_id,
                identity: Identity::new(name),
                facet: facet.unwrap_or_default(),
                operation,
                mode,
                context: context.into_iter().collect::<HashMap<_, _>>(),
            },
            params,
        };
        let message = request.to_message().unwrap();
        let header: &[u8; HEADER_SIZE] = message[..HEADER_SIZE].try_into().unwrap();
        let decoded_header = MessageHeader::decode(header, usize::MAX).unwrap();
        prop_assert_eq!(decoded_header.size, message.len());

        let mut input = InputStream::new(message.slice(HEADER_SIZE..), ENCODING_1_0);
        let decoded = Request::decode_body(&mut input, true).unwrap();
        prop_assert_eq!(decoded, request);
    }

    #[test]
    fn prop_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let bytes = Bytes::from(data.clone());
        let mut input = InputStream::new(bytes.clone(), ENCODING_1_1);
        let _ = Request::decode_body(&mut input, true);

        let mut input = InputStream::new(bytes, ENCODING_1_1);
        let _ = input.read_string_seq();

        if let Some(header) = data.get(..HEADER_SIZE).and_then(|h| <&[u8; HEADER_SIZE]>::try_from(h).ok()) {
            let _ = MessageHeader::decode(header, 1024 * 1024);
        }
    }
}
