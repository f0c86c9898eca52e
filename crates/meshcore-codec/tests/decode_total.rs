use meshcore_codec::{
    checksum, decode, Advert, DecodeReason, DirectText, DomainEvent, GroupText, PacketBuilder,
    RawPacket,
};
use meshcore_types::{NodeType, PublicKey, ShortId};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn sample_packets() -> Vec<Vec<u8>> {
    let key = PublicKey::from_bytes([0x3c; 32]);
    vec![
        PacketBuilder::flood().advert(&Advert {
            public_key: Some(key),
            timestamp: 1,
            node_type: NodeType::Chat,
            location: None,
            feature1: Some(3),
            feature2: None,
            name: Some("Alice".into()),
        }),
        PacketBuilder::direct(vec![4, 5]).direct_text(&DirectText {
            dest: ShortId(1),
            src: ShortId(2),
            timestamp: 3,
            flags: 0,
            text: "hello".into(),
        }),
        PacketBuilder::flood().group_text(&GroupText {
            channel_hash: 9,
            timestamp: 3,
            flags: 0,
            sender_name: Some("Bob".into()),
            text: "hey @[Alice]".into(),
        }),
        PacketBuilder::flood().ack(77),
    ]
}

/// Re-seals a body with a valid checksum so the payload parser is reached.
fn seal(mut body: Vec<u8>) -> Vec<u8> {
    let crc = checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

#[test]
fn every_prefix_of_a_valid_packet_is_handled() {
    for packet in sample_packets() {
        for cut in 0..packet.len() {
            let raw = RawPacket::new(packet[..cut].to_vec());
            assert!(decode(&raw).is_err(), "prefix of length {cut} should not decode");
        }
        // A resealed prefix of the body reaches the payload parser.
        let body = &packet[..packet.len() - 4];
        for cut in 2..body.len() {
            let _ = decode(&RawPacket::new(seal(body[..cut].to_vec())));
        }
    }
}

#[test]
fn random_bytes_never_panic() {
    let mut rng = StdRng::seed_from_u64(0x6d65_7368);
    for _ in 0..5_000 {
        let len = rng.gen_range(0..200);
        let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let _ = decode(&RawPacket::new(bytes.clone()));
        let _ = decode(&RawPacket::new(seal(bytes)));
    }
}

#[test]
fn resealed_truncated_direct_text_reports_truncated() {
    let packet = &sample_packets()[1];
    // header, path_len, 2 hops, then only 3 of the 7 fixed payload bytes
    let body = packet[..7].to_vec();
    let err = decode(&RawPacket::new(seal(body))).expect_err("payload too short");
    assert_eq!(err.reason, DecodeReason::Truncated);
    assert_eq!(err.len, 11);
}

#[test]
fn decoding_is_deterministic() {
    for packet in sample_packets() {
        let raw = RawPacket::new(packet);
        assert_eq!(decode(&raw), decode(&raw));
        assert!(!matches!(
            decode(&raw).map(|d| d.event),
            Err(_) | Ok(DomainEvent::PathReport(_))
        ));
    }
}

proptest! {
    /// Any byte string either decodes or yields a `DecodeError`, the same
    /// way every time, sealed or not.
    #[test]
    fn decode_is_total_and_deterministic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let raw = RawPacket::new(bytes.clone());
        prop_assert_eq!(decode(&raw), decode(&raw));

        let sealed = RawPacket::new(seal(bytes));
        prop_assert_eq!(decode(&sealed), decode(&sealed));
    }

    /// Flipping any byte of a valid packet never panics the decoder.
    #[test]
    fn corrupted_packets_are_handled(
        which in 0usize..4,
        at in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut packet = sample_packets().swap_remove(which);
        let i = at.index(packet.len());
        packet[i] ^= mask;
        let _ = decode(&RawPacket::new(packet));
    }
}
