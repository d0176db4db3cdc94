use gamenet::network::{HEADER_LEN, MAX_PAYLOAD_LEN};
use gamenet::{AppError, Frame, FrameDecoder, RingBuffer};
use rstest::rstest;

fn sample_frames() -> Vec<Frame> {
    vec![
        Frame::new(1, &b"A"[..]),
        Frame::new(2, &b"BB"[..]),
        Frame::new(3, Vec::new()),
        Frame::new(0xBEEF, vec![9u8; 300]),
        Frame::new(5, &b"tail"[..]),
    ]
}

fn wire(frames: &[Frame]) -> Vec<u8> {
    frames
        .iter()
        .flat_map(|frame| frame.encode().unwrap().to_vec())
        .collect()
}

#[rstest]
#[case::byte_by_byte(1)]
#[case::inside_header(4)]
#[case::odd(7)]
#[case::header_sized(HEADER_LEN)]
#[case::large(64)]
fn test_stream_split_anywhere_decodes_in_order(#[case] chunk: usize) {
    let sent = sample_frames();
    let bytes = wire(&sent);
    let mut buffer = RingBuffer::new(512);
    let mut received = Vec::new();

    for piece in bytes.chunks(chunk) {
        assert!(buffer.write(piece));
        for frame in FrameDecoder::frames(&mut buffer) {
            received.push(frame.unwrap());
        }
    }
    assert_eq!(received, sent);
    assert!(buffer.is_empty());
}

#[test]
fn test_two_frames_in_one_read() {
    let mut buffer = RingBuffer::new(64);
    let mut bytes = vec![1, 0, 1, 0, 0, 0, b'A'];
    bytes.extend([2, 0, 2, 0, 0, 0, b'B', b'B']);
    assert!(buffer.write(&bytes));

    let frames: Vec<Frame> = FrameDecoder::frames(&mut buffer)
        .map(Result::unwrap)
        .collect();
    assert_eq!(
        frames,
        vec![Frame::new(1, &b"A"[..]), Frame::new(2, &b"BB"[..])]
    );
}

#[test]
fn test_violation_keeps_earlier_frames() {
    let mut buffer = RingBuffer::new(64);
    let mut bytes = wire(&[Frame::new(7, &b"ok"[..])]);
    bytes.extend([8, 0]);
    bytes.extend(((MAX_PAYLOAD_LEN + 1) as u32).to_le_bytes());
    assert!(buffer.write(&bytes));

    let results: Vec<_> = FrameDecoder::frames(&mut buffer).collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), &Frame::new(7, &b"ok"[..]));
    assert!(matches!(results[1], Err(AppError::ProtocolViolation(_))));
    // the offending header is left in place
    assert_eq!(buffer.size(), HEADER_LEN);
}

#[test]
fn test_check_reports_frame_length() {
    let mut buffer = RingBuffer::new(64);
    assert!(matches!(
        FrameDecoder::check(&buffer),
        Err(AppError::Incomplete)
    ));
    assert!(buffer.write(&wire(&[Frame::new(4, &b"four"[..])])));
    assert_eq!(FrameDecoder::check(&buffer).unwrap(), HEADER_LEN + 4);
}
