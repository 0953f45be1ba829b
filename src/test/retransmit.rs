use crate::net::{NetApi, Network, PathIndex, TcpFlags};
use crate::proto::{AckSignal, CaState, Sacked, Segment, TcpSock, TimerKind};
use crate::sim::{SimTime, Simulator};

use super::{CONN, established_sock};

/// 发出三个满 MSS 的段并清空出口记录，返回第一个段的序号
fn sent_three(sock: &mut TcpSock, net: &mut Network, sim: &mut Simulator) -> u32 {
    let start = sock.write_seq;
    sock.queue_segment(Segment::new(start, vec![3; 3000], TcpFlags::ACK));
    sock.push(net, sim);
    assert_eq!(net.sent.len(), 3);
    net.sent.clear();
    start
}

#[test]
fn only_the_lost_segment_is_retransmitted() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    let start = sent_three(&mut sock, &mut net, &mut sim);

    sock.set_ca_state(CaState::Loss);
    sock.mark_lost(1);
    sock.xmit_retransmit_queue(&mut net, &mut sim);

    let frames: Vec<(u32, u32, bool)> = net.sent.iter().map(|f| (f.seq, f.len, f.retransmit)).collect();
    assert_eq!(frames, vec![(start + 1000, 1000, true)]);
    assert_eq!(sock.counters.retrans_out, 1);
    assert_eq!(sock.counters.lost_out, 1);
    assert_eq!(sock.counters.in_flight(), 3);
    assert_eq!(net.stats.retrans_segs, 1);
    assert_eq!(net.stats.slow_start_retrans, 1);

    let seg = sock.queue.get(1).expect("segment stays queued until acked");
    assert!(seg.sacked.contains(Sacked::SACKED_RETRANS | Sacked::EVER_RETRANS));

    // 已经重传过的段不会再被这一轮挑中
    sock.xmit_retransmit_queue(&mut net, &mut sim);
    assert_eq!(net.sent.len(), 1);
}

#[test]
fn loss_accounting_is_idempotent() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    sent_three(&mut sock, &mut net, &mut sim);

    sock.mark_lost(2);
    sock.mark_lost(2);
    assert_eq!(sock.counters.lost_out, 1);

    sock.retransmit_skb(2, &mut net, &mut sim).expect("retransmit");
    sock.retransmit_skb(2, &mut net, &mut sim).expect("retransmit again");
    assert_eq!(net.sent.len(), 2, "both copies reach the wire");
    assert_eq!(sock.counters.retrans_out, 1, "one segment, counted once");
    assert_eq!(sock.total_retrans, 2);
}

#[test]
fn sacked_segment_is_never_marked_lost() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    let start = sent_three(&mut sock, &mut net, &mut sim);

    assert_eq!(sock.mark_sacked(start + 1000, start + 2000), 1);
    sock.mark_lost(1);
    assert_eq!(sock.counters.lost_out, 0);
    assert_eq!(sock.counters.sacked_out, 1);
    assert_eq!(sock.highest_sack, Some(start + 2000));
}

#[test]
fn retransmit_timeout_enters_loss_and_backs_off() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    let start = sent_three(&mut sock, &mut net, &mut sim);
    let rto = sock.rto;
    assert_eq!(rto, SimTime::from_millis(200));

    sock.on_retransmit_timeout(&mut net, &mut sim);

    assert_eq!(sock.ca_state, CaState::Loss);
    assert_eq!(sock.cong.cwnd, 1);
    assert_eq!(sock.cong.ssthresh, 5);
    assert_eq!(sock.counters.lost_out, 3, "every unsacked segment is lost");
    assert_eq!(sock.counters.retrans_out, 1);
    assert_eq!(net.sent.len(), 1);
    assert_eq!((net.sent[0].seq, net.sent[0].retransmit), (start, true));
    assert_eq!(net.stats.slow_start_retrans, 1);
    assert_eq!(sock.backoff, 1);
    assert_eq!(sock.rto, SimTime::from_millis(400));
    assert!(sock.timer_pending(TimerKind::Retransmit));

    // 窗口只有 1：在途的那一个没回来之前不会再重传
    sock.xmit_retransmit_queue(&mut net, &mut sim);
    assert_eq!(net.sent.len(), 1);

    // 首段被确认后窗口长到 2，剩下两个丢失段一起补发
    net.sent.clear();
    let out = sock.on_ack(&AckSignal::new(start + 1000, u16::MAX), &mut net, &mut sim);
    assert_eq!(out.acked_pkts, 1);
    assert_eq!(sock.cong.cwnd, 2);
    let seqs: Vec<u32> = net.sent.iter().filter(|f| f.retransmit).map(|f| f.seq).collect();
    assert_eq!(seqs, vec![start + 1000, start + 2000]);
    assert_eq!(sock.ca_state, CaState::Loss, "high_seq not yet acknowledged");

    net.sent.clear();
    sock.on_ack(&AckSignal::new(start + 3000, u16::MAX), &mut net, &mut sim);
    assert_eq!(sock.ca_state, CaState::Open);
    assert_eq!(sock.counters, Default::default());
    assert!(!sock.timer_pending(TimerKind::Retransmit));
}

#[test]
fn rto_is_capped_at_maximum() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    sent_three(&mut sock, &mut net, &mut sim);
    for _ in 0..20 {
        sock.on_retransmit_timeout(&mut net, &mut sim);
    }
    assert_eq!(sock.rto, sock.cfg.rto_max());
    assert_eq!(sock.backoff, 20);
}

#[test]
fn failed_timeout_retransmit_does_not_back_off() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    sent_three(&mut sock, &mut net, &mut sim);
    net.remove_route(CONN, PathIndex::MASTER);

    sock.on_retransmit_timeout(&mut net, &mut sim);

    assert!(net.sent.is_empty());
    assert_eq!(sock.backoff, 0);
    assert_eq!(sock.rto, SimTime::from_millis(200));
    assert!(sock.timer_pending(TimerKind::Retransmit), "retry later");
}

#[test]
fn smaller_path_mtu_resends_oversized_segments() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    let start = sent_three(&mut sock, &mut net, &mut sim);
    if let Some(route) = net.route_mut(CONN, PathIndex::MASTER) {
        route.pmtu = 600;
    }

    sock.simple_retransmit(&mut net, &mut sim);

    assert_eq!(sock.mss_cache, 560);
    assert_eq!(sock.ca_state, CaState::Loss);
    assert_eq!(sock.cong.cwnd, 10, "mtu reduction is not a congestion signal");
    assert!(net.sent.iter().all(|f| f.retransmit && f.len <= 560));
    assert_eq!(net.sent.iter().map(|f| f.len).sum::<u32>(), 3000);
    assert_eq!(net.sent[0].seq, start);
    assert_eq!(sock.counters.packets_out, 6);
    assert_eq!(sock.counters.retrans_out, 6);
}

#[test]
fn route_failure_stops_retransmission() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    sent_three(&mut sock, &mut net, &mut sim);
    sock.set_ca_state(CaState::Loss);
    sock.mark_lost(0);
    assert!(net.route(CONN, PathIndex::MASTER).is_some());
    net.remove_route(CONN, PathIndex::MASTER);

    sock.xmit_retransmit_queue(&mut net, &mut sim);
    assert!(net.sent.is_empty());
    assert_eq!(sock.counters.retrans_out, 0);
}

/// 三个段已发出，第三个被选择确认，然后进入快速恢复
fn recovering(forward_allowed: bool) -> (TcpSock, Network, Simulator, u32) {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    let start = sent_three(&mut sock, &mut net, &mut sim);
    assert_eq!(sock.mark_sacked(start + 2000, start + 3000), 1);

    sock.enter_recovery(forward_allowed, sim.now());
    assert_eq!(sock.ca_state, CaState::Recovery);
    assert_eq!(sock.cong.ssthresh, 5);
    assert!(sock.queue.get(0).expect("head").sacked.contains(Sacked::LOST));
    assert_eq!(sock.counters.lost_out, 1);
    (sock, net, sim, start)
}

#[test]
fn recovery_forward_retransmits_when_nothing_new_can_go() {
    let (mut sock, mut net, mut sim, start) = recovering(true);

    sock.xmit_retransmit_queue(&mut net, &mut sim);

    let frames: Vec<(u32, u32)> = net.sent.iter().map(|f| (f.seq, f.len)).collect();
    assert_eq!(frames, vec![(start, 1000), (start + 1000, 1000)]);
    assert_eq!(net.stats.fast_retrans, 1);
    assert_eq!(net.stats.forward_retrans, 1);
    assert_eq!(sock.counters.retrans_out, 2);
}

#[test]
fn recovery_prefers_new_data_over_forward_retransmission() {
    let (mut sock, mut net, mut sim, start) = recovering(true);
    sock.queue_segment(Segment::new(start + 3000, vec![4; 1000], TcpFlags::ACK));
    assert!(sock.queue.send_head().is_some());

    sock.xmit_retransmit_queue(&mut net, &mut sim);

    let frames: Vec<(u32, u32)> = net.sent.iter().map(|f| (f.seq, f.len)).collect();
    assert_eq!(frames, vec![(start, 1000)], "only the lost head is resent");
    assert_eq!(net.stats.forward_retrans, 0);
    assert_eq!(sock.counters.retrans_out, 1);
}

#[test]
fn recovery_without_forward_permission_repairs_only_the_loss() {
    let (mut sock, mut net, mut sim, start) = recovering(false);

    sock.xmit_retransmit_queue(&mut net, &mut sim);

    let frames: Vec<(u32, u32)> = net.sent.iter().map(|f| (f.seq, f.len)).collect();
    assert_eq!(frames, vec![(start, 1000)]);
    assert_eq!(net.stats.forward_retrans, 0);
}

#[test]
fn partial_retransmit_recounts_packets_at_the_current_mss() {
    let (mut sock, mut net, mut sim) = established_sock(1040, 10);
    if let Some(route) = net.route_mut(CONN, PathIndex::MASTER) {
        route.gso_max_size = Some(64 * 1024);
    }
    let start = sock.write_seq;
    let mut seg = Segment::new(start, vec![6; 3000], TcpFlags::ACK);
    seg.set_tso_segs(1000, true);
    sock.queue_segment(seg);
    sock.queue.advance_send_head();
    sock.snd_nxt = start + 3000;
    sock.counters.packets_out = 3;

    // 首部 1000 字节已被确认，随后路径 MTU 降到 540
    sock.snd_una = start + 1000;
    if let Some(route) = net.route_mut(CONN, PathIndex::MASTER) {
        route.pmtu = 540;
    }

    sock.retransmit_skb(0, &mut net, &mut sim).expect("retransmit");

    assert_eq!(net.sent.len(), 1);
    assert_eq!((net.sent[0].seq, net.sent[0].len), (start + 1000, 500));
    assert_eq!(sock.mss_cache, 500);
    let queued: u32 = sock.queue.iter().map(|s| s.pcount).sum();
    assert_eq!(queued, 4);
    assert_eq!(sock.counters.packets_out, queued);
    assert_eq!(sock.counters.retrans_out, 1);
}
