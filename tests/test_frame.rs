mod common;
use common::*;

use bytes::BytesMut;
use samil_bridge::samil::FrameCodec;
use tokio_util::codec::Decoder;

#[test]
fn decodes_built_frame() {
    common_setup();

    let raw = Factory::values_response();
    let frame = Frame::decode(&raw).unwrap();

    assert_eq!(frame.message_id(), VALUES_RESPONSE_ID);
    assert_eq!(&frame.payload()[..], &Factory::values_payload()[..]);
    assert_eq!(frame.header().len(), 15);
    assert!(frame.checksum_ok());
}

#[test]
fn payload_size_comes_from_length_byte() {
    common_setup();

    let mut raw = Frame::build(VALUES_RESPONSE_ID, &[1, 2, 3]).unwrap().to_vec();
    raw.extend_from_slice(&[0xde, 0xad]);

    let frame = Frame::decode(&raw).unwrap();
    assert_eq!(&frame.payload()[..], &[1, 2, 3]);
}

#[test]
fn checksum_mismatch_is_reported_not_rejected() {
    common_setup();

    let mut raw = Factory::values_response().to_vec();
    let last = raw.len() - 1;
    raw[last] ^= 0xff;

    let frame = Frame::decode(&raw).unwrap();
    assert!(!frame.checksum_ok());
}

#[test]
fn short_frame_is_malformed() {
    common_setup();

    let raw = Factory::values_response();
    assert!(matches!(
        Frame::decode(&raw[..20]),
        Err(Error::MalformedFrame(_))
    ));
}

#[test]
fn truncated_payload_is_malformed() {
    common_setup();

    let raw = Factory::values_response();
    assert!(matches!(
        Frame::decode(&raw[..raw.len() - 10]),
        Err(Error::MalformedFrame(_))
    ));
}

#[test]
fn wrong_preamble_is_malformed() {
    common_setup();

    let mut raw = Factory::values_response().to_vec();
    raw[1] = 0xab;
    assert!(matches!(Frame::decode(&raw), Err(Error::MalformedFrame(_))));
}

#[test]
fn codec_splits_back_to_back_frames() {
    common_setup();

    let first = Factory::model_info_response();
    let second = Factory::values_response();

    let mut src = BytesMut::new();
    src.extend_from_slice(&[0x00, 0x13]);
    src.extend_from_slice(&first);
    src.extend_from_slice(&second[..10]);

    let mut codec = FrameCodec;
    assert_eq!(codec.decode(&mut src).unwrap().unwrap(), &first[..]);
    assert_eq!(codec.decode(&mut src).unwrap(), None);

    src.extend_from_slice(&second[10..]);
    assert_eq!(codec.decode(&mut src).unwrap().unwrap(), &second[..]);
    assert!(src.is_empty());
}
