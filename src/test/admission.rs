use crate::net::TcpFlags;
use crate::proto::{
    NAGLE_CORK, NAGLE_OFF, NAGLE_PUSH, Segment, cwnd_test, minshall_check, nagle_check, nagle_test,
    snd_wnd_test,
};

use super::established_sock;

fn data(seq: u32, len: usize) -> Segment {
    Segment::new(seq, vec![0; len], TcpFlags::ACK)
}

#[test]
fn cwnd_quota_shrinks_as_flight_grows() {
    let seg = data(0, 100);
    let mut prev = u32::MAX;
    for in_flight in 0..=12 {
        let quota = cwnd_test(in_flight, 10, &seg);
        assert!(quota <= prev, "quota must not grow with in_flight");
        prev = quota;
    }
    assert_eq!(cwnd_test(3, 10, &seg), 7);
    assert_eq!(cwnd_test(10, 10, &seg), 0);
    assert_eq!(cwnd_test(12, 10, &seg), 0);
}

#[test]
fn lone_fin_ignores_congestion_window() {
    let fin = Segment::control(500, TcpFlags::ACK | TcpFlags::FIN);
    assert_eq!(cwnd_test(10, 10, &fin), 1);
    let fin_with_data = Segment::new(500, vec![1; 10], TcpFlags::ACK | TcpFlags::FIN);
    assert_eq!(cwnd_test(10, 10, &fin_with_data), 0);
}

#[test]
fn receive_window_checks_first_mss_only() {
    let seg = data(1_000, 3_000);
    // 只要第一个 MSS 在窗口内即可
    assert!(snd_wnd_test(&seg, seg.seq, seg.end_seq, 2_000, 1_000));
    assert!(!snd_wnd_test(&seg, seg.seq, seg.end_seq, 1_999, 1_000));

    let small = data(1_000, 500);
    assert!(snd_wnd_test(&small, small.seq, small.end_seq, 1_500, 1_000));
    assert!(!snd_wnd_test(&small, small.seq, small.end_seq, 1_499, 1_000));
}

#[test]
fn syn_is_exempt_from_receive_window() {
    let syn = Segment::control(42, TcpFlags::SYN);
    assert!(snd_wnd_test(&syn, syn.seq, syn.end_seq, 0, 536));
}

#[test]
fn minshall_sees_only_unacked_small_segments() {
    assert!(minshall_check(150, 100, 200));
    assert!(!minshall_check(100, 100, 200), "small segment already acked");
    assert!(!minshall_check(250, 100, 200), "beyond snd_nxt");
}

#[test]
fn nagle_holds_small_segment_while_one_is_outstanding() {
    let small = data(0, 100);
    let full = data(0, 1_000);
    assert!(!nagle_test(&small, 1_000, 0, false, true));
    assert!(nagle_test(&small, 1_000, 0, false, false));
    assert!(nagle_test(&full, 1_000, 0, false, true));
    assert!(nagle_test(&small, 1_000, NAGLE_OFF, false, true));
    assert!(nagle_test(&small, 1_000, NAGLE_PUSH | NAGLE_CORK, false, true));
    assert!(nagle_test(&small, 1_000, 0, true, true), "urgent / recovery forces");

    let fin = Segment::new(0, vec![0; 10], TcpFlags::ACK | TcpFlags::FIN);
    assert!(nagle_test(&fin, 1_000, 0, false, true));
}

#[test]
fn cork_holds_any_partial_segment() {
    assert!(nagle_check(999, 1_000, NAGLE_CORK, false));
    assert!(!nagle_check(1_000, 1_000, NAGLE_CORK, false));
    assert!(!nagle_check(10, 1_000, NAGLE_OFF, true));
}

#[test]
fn may_send_now_reflects_all_three_checks() {
    let (mut sock, _net, _sim) = established_sock(1040, 4);
    let seq = sock.write_seq;
    sock.queue_segment(Segment::new(seq, vec![0; 1_000], TcpFlags::ACK));
    assert!(sock.may_send_now(1_000));

    sock.counters.packets_out = 4;
    assert!(!sock.may_send_now(1_000), "window full");
    sock.counters.packets_out = 0;

    sock.snd_wnd = 500;
    assert!(!sock.may_send_now(1_000), "receiver window too small");
}
