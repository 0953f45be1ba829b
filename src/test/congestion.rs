use crate::net::{NetWorld, TcpFlags};
use crate::proto::{CaState, CongestionOps, CwndState, Reno, Segment};
use crate::sim::{SimTime, Simulator};

use super::established_sock;

/// 推进仿真时钟；世界里没有连接，到期的定时器事件都会被忽略
fn advance(sim: &mut Simulator, to: SimTime) {
    let mut world = NetWorld::default();
    sim.run_until(to, &mut world);
}

#[test]
fn reno_slow_start_then_linear_growth() {
    let mut reno = Reno;
    let mut w = CwndState::new(10);
    w.ssthresh = 12;

    reno.cong_avoid(&mut w, 1);
    assert_eq!(w.cwnd, 11);
    reno.cong_avoid(&mut w, 1);
    assert_eq!(w.cwnd, 12);

    // 拥塞避免：一个窗口的确认才加一
    for _ in 0..11 {
        reno.cong_avoid(&mut w, 1);
    }
    assert_eq!(w.cwnd, 12);
    reno.cong_avoid(&mut w, 1);
    assert_eq!(w.cwnd, 13);

    assert_eq!(reno.ssthresh(&w), 6);
    w.cwnd = 3;
    assert_eq!(reno.ssthresh(&w), 2);
}

#[test]
fn current_ssthresh_remembers_three_quarters_of_cwnd() {
    let (mut s, _net, _sim) = established_sock(1040, 16);
    s.cong.ssthresh = 4;
    assert_eq!(s.current_ssthresh(), 12);

    s.set_ca_state(CaState::Recovery);
    assert_eq!(s.current_ssthresh(), 4);
}

#[test]
fn enter_cwr_pulls_cwnd_down_to_flight() {
    let (mut s, mut net, mut sim) = established_sock(1040, 10);
    let start = s.write_seq;
    s.queue_segment(Segment::new(start, vec![0; 3000], TcpFlags::ACK));
    s.push(&mut net, &mut sim);

    s.enter_cwr(true, sim.now());
    assert_eq!(s.ca_state, CaState::Cwr);
    assert_eq!(s.cong.cwnd, 4);
    assert_eq!(s.cong.ssthresh, 5);
    assert_eq!(s.high_seq, s.snd_nxt);

    // 已在 CWR 中再次进入不改变任何东西
    s.enter_cwr(true, sim.now());
    assert_eq!((s.cong.cwnd, s.cong.ssthresh), (4, 5));
}

#[test]
fn idle_connection_restarts_its_window() {
    let (mut s, mut net, mut sim) = established_sock(1040, 40);
    advance(&mut sim, SimTime::from_millis(900));

    s.send(&[0; 1000], &mut net, &mut sim).expect("send");

    assert_eq!(net.sent.len(), 1);
    assert_eq!(s.cong.cwnd, 10, "halved per idle rto down to the initial window");
    assert_eq!(s.lsndtime, SimTime::from_millis(900));
}

#[test]
fn short_idle_keeps_the_window() {
    let (mut s, mut net, mut sim) = established_sock(1040, 40);
    advance(&mut sim, SimTime::from_millis(150));

    s.send(&[0; 1000], &mut net, &mut sim).expect("send");
    assert_eq!(s.cong.cwnd, 40);
}

#[test]
fn application_limited_sender_decays_unused_window() {
    let (mut s, mut net, mut sim) = established_sock(1040, 20);
    s.send(&[0; 1000], &mut net, &mut sim).expect("send");
    assert_eq!(s.cong.used, 1);

    advance(&mut sim, SimTime::from_millis(300));
    s.send(&[0; 1000], &mut net, &mut sim).expect("send");

    assert_eq!(s.counters.packets_out, 2);
    assert_eq!(s.cong.cwnd, 11);
    assert_eq!(s.cong.used, 0);
}
