use crate::net::TcpFlags;
use crate::proto::{
    Counters, SEG_OVERHEAD, Sacked, Segment, WriteQueue, fragment, trim_head, try_collapse,
};

fn bytes(n: usize) -> Vec<u8> {
    (0..n).map(|i| i as u8).collect()
}

#[test]
fn split_moves_fin_and_psh_to_tail_and_merge_restores() {
    let payload = bytes(300);
    let mut head = Segment::new(100, payload.clone(), TcpFlags::ACK | TcpFlags::PSH | TcpFlags::FIN);
    assert_eq!(head.end_seq, 401, "FIN takes one sequence number");

    let tail = head.split_off(100, 1000, false);
    assert_eq!((head.seq, head.end_seq), (100, 200));
    assert_eq!((tail.seq, tail.end_seq), (200, 401));
    assert_eq!(head.end_data_seq, tail.data_seq);
    assert!(!head.has(TcpFlags::FIN) && !head.has(TcpFlags::PSH));
    assert!(head.has(TcpFlags::ACK));
    assert!(tail.has(TcpFlags::FIN | TcpFlags::PSH | TcpFlags::ACK));

    head.try_merge(tail, 1000, false).expect("adjacent segments merge");
    assert_eq!((head.seq, head.end_seq), (100, 401));
    assert_eq!(head.payload(), payload.as_slice());
    assert!(head.has(TcpFlags::FIN));
}

#[test]
fn merge_refuses_shared_sacked_or_gapped_segments() {
    let mut a = Segment::new(0, bytes(40), TcpFlags::ACK);
    let b = Segment::new(40, bytes(40), TcpFlags::ACK);
    let shared = b.clone();
    let b = a.try_merge(b, 1000, false).expect_err("shared payload must not merge");
    drop(shared);

    let mut sacked = b;
    sacked.sacked.insert(Sacked::SACKED_ACKED);
    assert!(a.try_merge(sacked, 1000, false).is_err());

    let gap = Segment::new(90, bytes(10), TcpFlags::ACK);
    assert!(a.try_merge(gap, 1000, false).is_err());
    assert_eq!(a.len(), 40, "refused merges leave the head untouched");
}

#[test]
fn clones_share_payload_until_written() {
    let a = Segment::new(0, bytes(10), TcpFlags::ACK);
    let mut b = a.clone();
    assert!(a.is_cloned() && b.is_cloned());
    b.extend(&[0xff]);
    assert!(!a.is_cloned());
    assert_eq!(a.len(), 10);
    assert_eq!(b.len(), 11);
}

#[test]
fn remap_and_back_to_data_space() {
    let seg = Segment::new(5_000, bytes(100), TcpFlags::ACK).with_mapping(5_000);
    let mut sub = seg.remap(77);
    sub.path_mask = 0b10;
    assert_eq!((sub.seq, sub.end_seq, sub.sub_seq), (77, 177, 77));
    assert_eq!((sub.data_seq, sub.end_data_seq), (5_000, 5_100));

    let back = sub.to_data_space();
    assert_eq!((back.seq, back.end_seq), (5_000, 5_100));
    assert_eq!(back.path_mask, 0b10, "path history survives reinjection");
}

#[test]
#[should_panic(expected = "sequence-contiguous")]
fn push_tail_rejects_gaps() {
    let mut q = WriteQueue::new(64 * 1024);
    q.push_tail(Segment::new(0, bytes(10), TcpFlags::ACK));
    q.push_tail(Segment::new(11, bytes(10), TcpFlags::ACK));
}

#[test]
fn send_head_tracks_removals_and_memory_is_returned() {
    let mut q = WriteQueue::new(64 * 1024);
    q.push_tail(Segment::new(0, bytes(100), TcpFlags::ACK));
    q.push_tail(Segment::new(100, bytes(100), TcpFlags::ACK));
    assert_eq!(q.send_head(), Some(0));
    assert_eq!(q.wmem_queued(), 2 * (100 + SEG_OVERHEAD));

    q.advance_send_head();
    assert_eq!(q.send_head(), Some(1));
    assert_eq!(q.sent_len(), 1);

    let acked = q.pop_front().expect("front");
    assert_eq!(acked.seq, 0);
    assert_eq!(q.send_head(), Some(0), "send_head follows its segment");
    assert_eq!(q.wmem_queued(), 100 + SEG_OVERHEAD);
    assert!(q.take_shrunk());
    assert!(!q.take_shrunk());

    q.advance_send_head();
    assert_eq!(q.send_head(), None);
    assert_eq!(q.sent_len(), 1);
}

#[test]
fn fragment_of_sent_offloaded_segment_fixes_packet_count() {
    let mut q = WriteQueue::new(64 * 1024);
    let mut seg = Segment::new(0, bytes(400), TcpFlags::ACK);
    seg.set_tso_segs(100, true);
    assert_eq!(seg.pcount, 4);
    q.push_tail(seg);
    q.advance_send_head();
    let mut c = Counters {
        packets_out: 4,
        ..Counters::default()
    };

    fragment(&mut q, &mut c, 400, 0, 150, 100, true).expect("fragment");
    let (head, tail) = (q.get(0).expect("head"), q.get(1).expect("tail"));
    assert_eq!((head.len(), head.pcount), (150, 2));
    assert_eq!((tail.len(), tail.pcount), (250, 3));
    assert_eq!(c.packets_out, 5);
    assert_eq!(q.send_head(), None, "both halves stay on the sent side");
}

#[test]
fn fragment_at_payload_end_splits_off_only_the_fin() {
    let mut q = WriteQueue::new(64 * 1024);
    q.push_tail(Segment::new(0, bytes(100), TcpFlags::ACK | TcpFlags::FIN));
    let mut c = Counters::default();

    fragment(&mut q, &mut c, 0, 0, 100, 1000, false).expect("fragment");
    assert_eq!(q.len(), 2);
    let (head, tail) = (q.get(0).expect("head"), q.get(1).expect("tail"));
    assert_eq!((head.seq, head.end_seq, head.len()), (0, 100, 100));
    assert!(!head.has(TcpFlags::FIN));
    assert_eq!((tail.seq, tail.end_seq, tail.len()), (100, 101, 0));
    assert!(tail.has(TcpFlags::FIN));

    // 不带 FIN 的段在末尾处拆分没有意义
    let mut q = WriteQueue::new(64 * 1024);
    q.push_tail(Segment::new(0, bytes(100), TcpFlags::ACK));
    fragment(&mut q, &mut c, 0, 0, 100, 1000, false).expect("fragment");
    assert_eq!(q.len(), 1);
}

#[test]
fn collapse_merges_two_small_sent_segments() {
    let mut q = WriteQueue::new(64 * 1024);
    q.push_tail(Segment::new(0, bytes(40), TcpFlags::ACK));
    q.push_tail(Segment::new(40, bytes(40), TcpFlags::ACK | TcpFlags::PSH));
    q.advance_send_head();
    q.advance_send_head();
    if let Some(seg) = q.get_mut(1) {
        seg.sacked.insert(Sacked::LOST);
    }
    let mut c = Counters {
        packets_out: 2,
        lost_out: 1,
        ..Counters::default()
    };

    assert!(try_collapse(&mut q, &mut c, 0, 1_000, false, 1000, false));
    assert_eq!(q.len(), 1);
    let merged = q.get(0).expect("merged");
    assert_eq!((merged.seq, merged.end_seq, merged.len()), (0, 80, 80));
    assert!(merged.has(TcpFlags::PSH));
    assert_eq!(c.packets_out, 1);
    assert_eq!(c.lost_out, 0);
    assert_eq!(q.hints.retransmit, Some(0));
}

#[test]
fn collapse_respects_window_and_mss() {
    let mut q = WriteQueue::new(64 * 1024);
    q.push_tail(Segment::new(0, bytes(40), TcpFlags::ACK));
    q.push_tail(Segment::new(40, bytes(40), TcpFlags::ACK));
    let mut c = Counters::default();

    assert!(!try_collapse(&mut q, &mut c, 0, 60, false, 1000, false), "next ends past window");
    assert!(!try_collapse(&mut q, &mut c, 0, 1_000, false, 64, false), "merged exceeds mss");
    assert_eq!(q.len(), 2);
}

#[test]
fn trim_head_drops_acked_prefix() {
    let mut q = WriteQueue::new(64 * 1024);
    let mut seg = Segment::new(0, bytes(300), TcpFlags::ACK);
    seg.set_tso_segs(100, true);
    q.push_tail(seg);

    let reduced = trim_head(&mut q, 0, 120, 100, true);
    let seg = q.get(0).expect("seg");
    assert_eq!((seg.seq, seg.len(), seg.pcount), (120, 180, 2));
    assert_eq!(reduced, 1);
    assert_eq!(seg.payload()[0], 120);
}
