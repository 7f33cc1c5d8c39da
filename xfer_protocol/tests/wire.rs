// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use xfer_protocol::wire::*;
use xfer_protocol::FileKind;

fn offer_msg(leaf: &str) -> Message {
    Message {
        sender: 3,
        my_ref: 17,
        your_ref: 0,
        body: Body::OfferData(FileOffer {
            window: 5,
            icon: -1,
            x: 100,
            y: -200,
            size: 4096,
            kind: FileKind::TEXT,
            leaf: leaf.to_string(),
        }),
    }
}

#[test]
fn offer_round_trips() {
    let msg = offer_msg("report.txt");
    let bytes = msg.encode();
    assert_eq!(Message::decode(&bytes).unwrap(), msg);
}

#[test]
fn frames_are_word_aligned_and_sized_to_the_leaf() {
    // Header 20 + six body words 24 + "abc\0" = 48.
    let bytes = offer_msg("abc").encode();
    assert_eq!(bytes.len(), 48);
    assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), 48);

    // "abcd\0" needs padding to the next word: 20 + 24 + 8 = 52.
    let bytes = offer_msg("abcd").encode();
    assert_eq!(bytes.len(), 52);
    assert_eq!(&bytes[48..], &[b'd', 0, 0, 0], "NUL then zero padding");

    let empty = offer_msg("").encode();
    assert_eq!(empty.len(), 48);
}

#[test]
fn memory_spans_round_trip() {
    for body in [
        Body::MemoryPull(MemorySpan {
            anchor: 0x0001_0002,
            offset: 0,
            len: 257,
        }),
        Body::MemoryPush(MemorySpan {
            anchor: 0x0001_0002,
            offset: 257,
            len: 86,
        }),
    ] {
        let msg = Message {
            sender: 1,
            my_ref: 2,
            your_ref: 9,
            body,
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }
}

#[test]
fn dragging_round_trips_with_and_without_bbox() {
    let with_box = Message {
        sender: 8,
        my_ref: 40,
        your_ref: 0,
        body: Body::Dragging(DragInfo {
            window: 2,
            icon: 7,
            x: -4,
            y: 9,
            flags: drag_flags::FROM_SELECTION,
            bbox: Some(BBox {
                xmin: -10,
                ymin: -20,
                xmax: 30,
                ymax: 40,
            }),
            kinds: vec![FileKind(0x111), FileKind(0x222)],
        }),
    };
    assert_eq!(Message::decode(&with_box.encode()).unwrap(), with_box);

    let without_box = Message {
        sender: 8,
        my_ref: 41,
        your_ref: 40,
        body: Body::Dragging(DragInfo {
            window: 2,
            icon: 7,
            x: 0,
            y: 0,
            flags: drag_flags::DO_NOT_CLAIM,
            bbox: None,
            kinds: Vec::new(),
        }),
    };
    let decoded = Message::decode(&without_box.encode()).unwrap();
    assert_eq!(decoded, without_box);
}

#[test]
fn claim_kind_list_terminates() {
    let msg = Message {
        sender: 2,
        my_ref: 5,
        your_ref: 4,
        body: Body::DragClaim(ClaimInfo {
            flags: claim_flags::REMOVE_DRAG_BOX,
            kinds: vec![FileKind(0x10), FileKind(0x20), FileKind(0x30)],
        }),
    };
    let bytes = msg.encode();
    // flags + three kinds + terminator.
    assert_eq!(bytes.len(), HEADER_BYTES + 5 * WORD);
    assert_eq!(Message::decode(&bytes).unwrap(), msg);

    // An untyped-only list is empty on the wire.
    let untyped = Message {
        sender: 2,
        my_ref: 6,
        your_ref: 4,
        body: Body::DragClaim(ClaimInfo {
            flags: 0,
            kinds: vec![FileKind::NULL],
        }),
    };
    let bytes = untyped.encode();
    assert_eq!(bytes.len(), HEADER_BYTES + 2 * WORD);
    let decoded = Message::decode(&bytes).unwrap();
    let Body::DragClaim(ref claim) = decoded.body else {
        unreachable!()
    };
    assert!(claim.kinds.is_empty());
}

#[test]
fn malformed_frames_are_rejected() {
    let good = offer_msg("x").encode();

    // Unknown action code.
    let mut bad_action = good.clone();
    bad_action[16..20].copy_from_slice(&999u32.to_le_bytes());
    assert_eq!(
        Message::decode(&bad_action),
        Err(WireError::BadAction(999))
    );

    // Size word disagreeing with the slice.
    let mut bad_size = good.clone();
    bad_size[..4].copy_from_slice(&(good.len() as u32 + 4).to_le_bytes());
    assert_eq!(Message::decode(&bad_size), Err(WireError::BadSize));

    // Too short for a header, not aligned, and a missing NUL.
    assert_eq!(Message::decode(&good[..16]), Err(WireError::BadSize));
    assert_eq!(Message::decode(&good[..18]), Err(WireError::BadSize));

    let mut unterminated = good.clone();
    let last = unterminated.len() - 4;
    unterminated[last..].copy_from_slice(&[1, 1, 1, 1]);
    // The leaf field no longer carries a NUL.
    assert!(matches!(
        Message::decode(&unterminated),
        Err(WireError::BadString)
    ));
}

#[test]
fn frames_stream_over_a_socketpair() {
    let (mut left, mut right) = FrameConduit::pair().unwrap();

    let first = offer_msg("streamed.txt");
    let second = Message {
        sender: 4,
        my_ref: 18,
        your_ref: 17,
        body: Body::MemoryPull(MemorySpan {
            anchor: 7,
            offset: 0,
            len: 4097,
        }),
    };
    let third = Message {
        sender: 3,
        my_ref: 19,
        your_ref: 18,
        body: Body::MemoryPush(MemorySpan {
            anchor: 7,
            offset: 0,
            len: 512,
        }),
    };

    left.send(&first).unwrap();
    left.send(&second).unwrap();
    write_frame(&mut left, &third).unwrap();

    assert_eq!(right.recv().unwrap(), first);
    assert_eq!(right.recv().unwrap(), second);
    assert_eq!(read_frame(&mut right).unwrap(), third);
}
