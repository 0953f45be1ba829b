use std::sync::Arc;

use crate::error::EgressError;
use crate::mptcp::{
    Candidate, MetaSock, MinRttScheduler, RoundRobinScheduler, Scheduler, SchedulerAlgorithm,
    create_scheduler, idsn_for_token,
};
use crate::net::{Network, PathIndex, SentFrame, Stats, TcpFlags};
use crate::proto::options::{ParsedOption, parse};
use crate::proto::{AckSignal, CaState, DataMapping, TcpState};
use crate::sim::{SimTime, Simulator};

use super::{CONN, cfg, network, path, sock, syn_ack};

const TOKEN: u32 = 0xabcd_0001;

/// 各条子流都已完成握手的多路径连接
fn meta_on(paths: &[u8], algo: SchedulerAlgorithm) -> (MetaSock, Network, Simulator) {
    let cfg = cfg();
    let routes: Vec<(u8, u32)> = paths.iter().map(|&p| (p, 1500)).collect();
    let mut net = network(&routes);
    let mut sim = Simulator::default();
    let mut meta = MetaSock::new(CONN, Arc::clone(&cfg), TOKEN, create_scheduler(algo));
    for &p in paths {
        meta.add_subflow(sock(path(p), &cfg));
    }
    meta.connect(&mut net, &mut sim).expect("connect");
    for &p in paths {
        let sig = syn_ack(meta.subflow(path(p)).expect("subflow"), u16::MAX);
        meta.on_ack(path(p), &sig, &mut net, &mut sim);
    }
    assert_eq!(meta.state, TcpState::Established);
    net.sent.clear();
    net.stats = Stats::default();
    (meta, net, sim)
}

fn mapping(frame: &SentFrame) -> Option<DataMapping> {
    parse(&frame.options)
        .expect("options")
        .into_iter()
        .find_map(|o| match o {
            ParsedOption::DataSeq(m) => Some(m),
            _ => None,
        })
}

fn paths_used(net: &Network) -> Vec<u8> {
    net.sent.iter().map(|f| f.path.0).collect()
}

#[test]
fn idsn_is_derived_from_token() {
    let meta = MetaSock::new(CONN, cfg(), TOKEN, Box::new(MinRttScheduler));
    assert_eq!(meta.idsn, idsn_for_token(TOKEN));
    assert_eq!((meta.snd_una, meta.snd_nxt, meta.write_seq), (meta.idsn, meta.idsn, meta.idsn));
    assert_ne!(idsn_for_token(1), idsn_for_token(2));
}

#[test]
fn subflow_syns_carry_capable_then_join() {
    let cfg = cfg();
    let mut net = network(&[(1, 1500), (2, 1500)]);
    let mut sim = Simulator::default();
    let mut meta = MetaSock::new(CONN, Arc::clone(&cfg), TOKEN, Box::new(MinRttScheduler));
    meta.add_subflow(sock(path(1), &cfg));
    meta.add_subflow(sock(path(2), &cfg));
    meta.connect(&mut net, &mut sim).expect("connect");

    let first = parse(&net.sent_on(CONN, path(1)).next().expect("syn").options).expect("parse");
    assert!(first.contains(&ParsedOption::MpCapable { token: TOKEN }));
    let second = parse(&net.sent_on(CONN, path(2)).next().expect("syn").options).expect("parse");
    assert!(second.iter().any(|o| matches!(o, ParsedOption::MpJoin { addr_id: 2, .. })));
}

#[test]
fn data_goes_only_to_subflows_with_window() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::MinRtt);
    if let Some(sub) = meta.subflow_mut(path(1)) {
        sub.cong.cwnd = 0;
    }
    if let Some(sub) = meta.subflow_mut(path(2)) {
        sub.cong.cwnd = 5;
    }

    let n = meta.send(&[1; 3 * 1400], &mut net, &mut sim).expect("send");

    assert_eq!(n, 3 * 1400);
    assert_eq!(paths_used(&net), vec![2, 2, 2]);
    assert_eq!(net.stats.noneligible_marks, 0, "a full window is not local congestion");
    assert_eq!(meta.snd_nxt, meta.idsn + 3 * 1400);
    assert_eq!(meta.queue.send_head(), None);
    assert_eq!(meta.subflow(path(2)).map(|s| s.counters.packets_out), Some(3));

    let iss = meta.subflow(path(2)).map(|s| s.iss).expect("subflow");
    let m = mapping(&net.sent[1]).expect("data mapping");
    assert_eq!(m, DataMapping {
        data_seq: meta.idsn + 1400,
        sub_seq: iss + 1 + 1400,
        data_len: 1400,
    });
}

#[test]
fn round_robin_alternates_paths() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    meta.send(&[0; 4 * 1400], &mut net, &mut sim).expect("send");
    assert_eq!(paths_used(&net), vec![1, 2, 1, 2]);
    for frame in &net.sent {
        assert!(frame.len <= meta.cfg.mptcp_mss);
    }
}

#[test]
fn subflow_in_loss_is_skipped() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    if let Some(sub) = meta.subflow_mut(path(1)) {
        sub.set_ca_state(CaState::Loss);
    }
    meta.send(&[0; 2 * 1400], &mut net, &mut sim).expect("send");
    assert_eq!(paths_used(&net), vec![2, 2]);
}

#[test]
fn congested_subflow_is_excluded_for_the_round() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    net.inject_fault(CONN, path(1), EgressError::Congested);
    let write_seq = meta.subflow(path(1)).map(|s| s.write_seq).expect("subflow");

    meta.send(&[0; 1400], &mut net, &mut sim).expect("send");

    assert_eq!(paths_used(&net), vec![2]);
    assert_eq!(net.stats.noneligible_marks, 1);
    assert_eq!(net.stats.egress_congested, 1);
    assert_eq!(meta.noneligible, 0, "exclusion lasts one round");

    let sub = meta.subflow(path(1)).expect("subflow");
    assert_eq!(sub.write_seq, write_seq, "failed assignment is undone");
    assert!(sub.queue.is_empty());
    assert_eq!(sub.ca_state, CaState::Cwr);
}

#[test]
fn lone_congested_subflow_just_stops() {
    let (mut meta, mut net, mut sim) = meta_on(&[1], SchedulerAlgorithm::MinRtt);
    net.inject_fault(CONN, path(1), EgressError::Congested);

    meta.send(&[0; 1400], &mut net, &mut sim).expect("send");

    assert!(net.sent.is_empty());
    assert_eq!(net.stats.noneligible_marks, 0);
    assert_eq!(meta.queue.send_head(), Some(0), "data stays on the connection queue");
    assert_eq!(meta.snd_nxt, meta.idsn);
}

#[test]
fn reinjected_data_moves_to_another_path() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    meta.send(&[0; 2 * 1400], &mut net, &mut sim).expect("send");
    assert_eq!(paths_used(&net), vec![1, 2]);
    net.sent.clear();

    assert_eq!(meta.reinject_subflow(path(1)), 1);
    assert_eq!(meta.reinject_subflow(path(1)), 0, "already queued");
    meta.push(&mut net, &mut sim);

    assert_eq!(paths_used(&net), vec![2]);
    assert_eq!(mapping(&net.sent[0]).map(|m| m.data_seq), Some(meta.idsn));
    assert!(meta.reinject.is_empty());
    assert_eq!(meta.snd_nxt, meta.idsn + 2 * 1400, "reinjection sends no new data");
}

#[test]
fn acknowledged_reinjects_are_discarded() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    meta.send(&[0; 2 * 1400], &mut net, &mut sim).expect("send");
    net.sent.clear();
    meta.reinject_subflow(path(1));

    assert_eq!(meta.on_data_ack(meta.idsn + 1400, 65535), 1400);
    meta.push(&mut net, &mut sim);

    assert!(net.sent.is_empty());
    assert!(meta.reinject.is_empty());
    assert_eq!(net.stats.reinject_discards, 1);
    assert_eq!(meta.bytes_acked(), 1400);
}

#[test]
fn subflow_timeout_reinjects_elsewhere() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    meta.send(&[0; 2 * 1400], &mut net, &mut sim).expect("send");
    net.sent.clear();

    meta.on_subflow_timeout(path(1), &mut net, &mut sim);

    let on1: Vec<&SentFrame> = net.sent_on(CONN, path(1)).collect();
    let on2: Vec<&SentFrame> = net.sent_on(CONN, path(2)).collect();
    assert_eq!(on1.len(), 1);
    assert!(on1[0].retransmit, "the subflow still retransmits on its own path");
    assert_eq!(on2.len(), 1);
    assert_eq!(mapping(on2[0]).map(|m| m.data_seq), Some(meta.idsn));
    assert_eq!(meta.subflow(path(1)).map(|s| s.ca_state), Some(CaState::Loss));
}

fn is_fin(frame: &SentFrame) -> bool {
    TcpFlags::from_bits(frame.flags).contains(TcpFlags::FIN)
}

#[test]
fn closed_subflow_hands_its_only_copy_to_another_path() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    meta.send(&[0; 1400], &mut net, &mut sim).expect("send");
    assert_eq!(paths_used(&net), vec![1]);
    net.sent.clear();

    meta.close_subflow(path(1), &mut net, &mut sim);

    let on1: Vec<&SentFrame> = net.sent_on(CONN, path(1)).collect();
    assert_eq!(on1.len(), 1);
    assert!(is_fin(on1[0]) && on1[0].len == 0, "the closing path only sends its FIN");
    assert_eq!(meta.subflow(path(1)).map(|s| s.state), Some(TcpState::FinWait1));

    let on2: Vec<&SentFrame> = net.sent_on(CONN, path(2)).collect();
    assert_eq!(on2.len(), 1);
    assert_eq!(on2[0].len, 1400);
    assert_eq!(mapping(on2[0]).map(|m| m.data_seq), Some(meta.idsn));
    assert!(meta.reinject.is_empty());
    assert_eq!(meta.state, TcpState::Established);
    assert_eq!(meta.snd_nxt, meta.idsn + 1400);
}

#[test]
fn closed_subflow_does_not_resend_acknowledged_data() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    meta.send(&[0; 2 * 1400], &mut net, &mut sim).expect("send");
    assert_eq!(paths_used(&net), vec![1, 2]);
    meta.on_data_ack(meta.idsn + 1400, 65535);
    net.sent.clear();

    meta.close_subflow(path(1), &mut net, &mut sim);

    assert_eq!(paths_used(&net), vec![1]);
    assert!(is_fin(&net.sent[0]));
    assert!(meta.reinject.is_empty());
    assert_eq!(net.stats.reinject_discards, 0, "nothing was queued for reinjection");
}

#[test]
fn data_fin_is_broadcast_to_other_subflows() {
    let (mut meta, mut net, mut sim) = meta_on(&[1, 2], SchedulerAlgorithm::RoundRobin);
    let fin_seq = meta.write_seq;

    meta.close(&mut net, &mut sim);

    assert_eq!(meta.state, TcpState::FinWait1);
    assert_eq!(meta.write_seq, fin_seq + 1, "data FIN takes one data sequence number");
    let fins: Vec<&SentFrame> = net
        .sent
        .iter()
        .filter(|f| TcpFlags::from_bits(f.flags).contains(TcpFlags::FIN))
        .collect();
    assert_eq!(fins.len(), 2, "one subflow carries the data FIN, the other its own FIN");
    let carrier = parse(&fins[0].options).expect("parse");
    assert!(carrier.contains(&ParsedOption::DataFin));
    assert_eq!(mapping(fins[0]).map(|m| (m.data_seq, m.data_len)), Some((fin_seq, 0)));
    for sub in meta.subflows.values() {
        assert_eq!(sub.state, TcpState::FinWait1);
    }

    meta.on_data_ack(meta.write_seq, 65535);
    assert_eq!(meta.state, TcpState::FinWait2);
    assert!(meta.queue.is_empty());
}

#[test]
fn data_ack_on_subflow_ack_frees_connection_queue() {
    let (mut meta, mut net, mut sim) = meta_on(&[1], SchedulerAlgorithm::MinRtt);
    meta.send(&[0; 1400], &mut net, &mut sim).expect("send");
    let sub_nxt = meta.subflow(path(1)).map(|s| s.snd_nxt).expect("subflow");
    let sig = AckSignal {
        data_ack: Some(meta.idsn + 1400),
        ..AckSignal::new(sub_nxt, u16::MAX)
    };

    meta.on_ack(path(1), &sig, &mut net, &mut sim);

    assert!(meta.queue.is_empty());
    assert_eq!(meta.bytes_acked(), 1400);
    assert_eq!(meta.bytes_in_flight(), 0);
    assert!(meta.subflow(path(1)).is_some_and(|s| s.queue.is_empty()));
}

fn candidate(p: u8, srtt_ms: u64, in_flight: u32, cwnd: u32, carried: bool) -> Candidate {
    Candidate {
        path: path(p),
        srtt: SimTime::from_millis(srtt_ms),
        in_flight,
        cwnd,
        carried,
    }
}

#[test]
fn min_rtt_prefers_measured_fast_paths() {
    let mut s = MinRttScheduler;
    assert_eq!(s.select_subflow(&[]), None);
    let c = [candidate(1, 30, 0, 10, false), candidate(2, 10, 0, 10, false), candidate(3, 0, 0, 10, false)];
    assert_eq!(s.select_subflow(&c), Some(path(2)));

    // 同 RTT 选窗口余量大的
    let c = [candidate(1, 10, 8, 10, false), candidate(2, 10, 1, 10, false)];
    assert_eq!(s.select_subflow(&c), Some(path(2)));

    // 没有样本的路径只在别无选择时使用
    let c = [candidate(3, 0, 0, 10, false)];
    assert_eq!(s.select_subflow(&c), Some(path(3)));
}

#[test]
fn schedulers_avoid_paths_that_already_carried_the_data() {
    let c = [candidate(1, 5, 0, 10, true), candidate(2, 50, 0, 10, false)];
    assert_eq!(MinRttScheduler.select_subflow(&c), Some(path(2)));

    let all_carried = [candidate(1, 5, 0, 10, true), candidate(2, 50, 0, 10, true)];
    assert_eq!(MinRttScheduler.select_subflow(&all_carried), Some(path(1)));
}

#[test]
fn round_robin_wraps_around() {
    let mut s = RoundRobinScheduler::new();
    let c = [candidate(1, 0, 0, 10, false), candidate(3, 0, 0, 10, false)];
    let picks: Vec<_> = (0..4).filter_map(|_| s.select_subflow(&c)).collect();
    assert_eq!(picks, vec![path(1), path(3), path(1), path(3)]);
    assert_eq!(s.name(), "round-robin");
    assert_eq!(create_scheduler(SchedulerAlgorithm::MinRtt).name(), "min-rtt");
}

#[test]
fn paths_are_bounded() {
    assert!(PathIndex::new(0).is_none());
    assert!(PathIndex::new(8).is_some());
    assert!(PathIndex::new(9).is_none());
    assert_eq!(PathIndex::MASTER.flag(), 0b1);
    assert_eq!(path(8).flag(), 0x80);
}
