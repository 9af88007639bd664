//! Property tests for the wire codec.
//!
//! Uses proptest to verify:
//! 1. Any client event survives a trip through either wire format.
//! 2. Server events keep their shape when encoded in the format a
//!    connection chose.
//! 3. Random bytes and random text never cause a panic in `decode`.
//! 4. Identity validation agrees with construction.

use huddle_proto::codec::{self, Frame, WireFormat};
use huddle_proto::event::{ClientEvent, LinkPreview, MessagePayload, ServerEvent};
use huddle_proto::identity::{ChannelKey, Identity, MAX_KEY_LEN};
use proptest::prelude::*;

// --- Strategies ---

fn arb_identity() -> impl Strategy<Value = Identity> {
    "[a-z0-9]{1,24}".prop_map(|s| Identity::new(s).expect("pattern is a valid identity"))
}

fn arb_channel() -> impl Strategy<Value = ChannelKey> {
    "[a-z0-9-]{1,32}".prop_map(|s| ChannelKey::new(s).expect("pattern is a valid key"))
}

fn arb_link_preview() -> impl Strategy<Value = LinkPreview> {
    (
        "https://[a-z]{1,12}\\.com/[a-z]{0,8}",
        proptest::option::of(".{0,40}"),
        proptest::option::of(".{0,80}"),
        proptest::option::of("https://[a-z]{1,12}\\.com/img\\.png"),
    )
        .prop_map(|(url, title, description, image)| LinkPreview {
            url,
            title,
            description,
            image,
        })
}

fn arb_payload() -> impl Strategy<Value = MessagePayload> {
    (
        proptest::option::of("[a-f0-9]{24}"),
        ".{0,256}",
        proptest::option::of("[a-z]{1,16}\\.(png|pdf|jpg)"),
        proptest::option::of(arb_link_preview()),
    )
        .prop_map(
            |(message_id, formatted_text, attachment, link_preview)| MessagePayload {
                message_id,
                formatted_text,
                attachment,
                link_preview,
            },
        )
}

fn arb_client_event() -> impl Strategy<Value = ClientEvent> {
    prop_oneof![
        (arb_identity(), prop::collection::vec(arb_identity(), 0..16))
            .prop_map(|(identity, contacts)| ClientEvent::Setup { identity, contacts }),
        arb_channel().prop_map(|channel| ClientEvent::JoinChannel { channel }),
        arb_channel().prop_map(|channel| ClientEvent::LeaveChannel { channel }),
        (arb_channel(), arb_payload())
            .prop_map(|(channel, payload)| ClientEvent::SubmitMessage { channel, payload }),
        Just(ClientEvent::Disconnect),
    ]
}

fn arb_server_event() -> impl Strategy<Value = ServerEvent> {
    prop_oneof![
        prop::collection::vec(arb_identity(), 0..16)
            .prop_map(|identities| ServerEvent::OnlineContacts { identities }),
        arb_identity().prop_map(|identity| ServerEvent::ContactJoined { identity }),
        arb_identity().prop_map(|identity| ServerEvent::ContactLeft { identity }),
        (arb_identity(), arb_channel(), arb_payload()).prop_map(|(sender, channel, payload)| {
            ServerEvent::MessageReceived {
                sender,
                channel,
                payload,
            }
        }),
        ".{0,64}".prop_map(|reason| ServerEvent::Error { reason }),
    ]
}

fn arb_format() -> impl Strategy<Value = WireFormat> {
    prop_oneof![Just(WireFormat::Binary), Just(WireFormat::Text)]
}

// --- Property tests ---

proptest! {
    /// A client event decodes back to itself in whichever format it was sent.
    #[test]
    fn client_event_survives_either_format(event in arb_client_event(), format in arb_format()) {
        let frame = format.encode(&event).expect("encode should succeed");
        prop_assert_eq!(frame.format(), format);
        let decoded: ClientEvent = codec::decode(&frame).expect("decode should succeed");
        prop_assert_eq!(event, decoded);
    }

    /// Server events encoded for a connection keep that connection's format.
    #[test]
    fn server_event_keeps_connection_format(event in arb_server_event(), format in arb_format()) {
        let frame = format.encode(&event).expect("encode should succeed");
        prop_assert_eq!(frame.format(), format);
        prop_assert!(!frame.is_empty());
        let decoded: ServerEvent = codec::decode(&frame).expect("decode should succeed");
        prop_assert_eq!(event, decoded);
    }

    /// Random bytes never cause a panic when decoded.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<ClientEvent>(&Frame::Binary(bytes));
    }

    /// Random text never causes a panic when decoded.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = codec::decode::<ClientEvent>(&Frame::Text(text));
    }

    /// Truncating a valid binary event yields an error, never a panic.
    #[test]
    fn truncated_binary_never_panics(event in arb_client_event(), cut in 0usize..64) {
        let bytes = codec::encode_binary(&event).expect("encode should succeed");
        let cut = cut.min(bytes.len());
        let _ = codec::decode_binary::<ClientEvent>(&bytes[..cut]);
    }

    /// Wire-decoded identities validate exactly when `Identity::new` accepts them.
    #[test]
    fn validation_matches_construction(raw in ".{0,160}") {
        let wire: Identity = codec::decode_text(
            &serde_json::to_string(&raw).expect("string encodes"),
        )
        .expect("any JSON string decodes");
        prop_assert_eq!(wire.validate().is_ok(), Identity::new(raw.clone()).is_ok());
        if raw.len() > MAX_KEY_LEN {
            prop_assert!(wire.validate().is_err());
        }
    }
}
