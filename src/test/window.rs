use crate::net::PathIndex;
use crate::proto::{InitialWindow, MAX_SIGNED_WINDOW, select_initial_window};
use crate::sim::Simulator;

use super::{cfg_with, establish, established_sock, network, sock};

#[test]
fn initial_window_is_mss_quantized_and_scaled() {
    let init = select_initial_window(262_144, 1460, 0, true, false, 262_144, 0);
    assert_eq!(
        init,
        InitialWindow {
            rcv_wnd: 4 * 1460,
            window_clamp: 65535 << 3,
            rcv_wscale: 3,
        }
    );
}

#[test]
fn initial_window_segment_cap_depends_on_mss() {
    let jumbo = select_initial_window(262_144, 9000, 0, false, false, 0, 0);
    assert_eq!(jumbo.rcv_wnd, 2 * 9000);
    assert_eq!((jumbo.rcv_wscale, jumbo.window_clamp), (0, 65535));

    let mid = select_initial_window(262_144, 2000, 0, false, false, 0, 0);
    assert_eq!(mid.rcv_wnd, 3 * 2000);

    let hinted = select_initial_window(100_000, 1460, 0, false, false, 0, 20);
    assert_eq!(hinted.rcv_wnd, 20 * 1460);
}

#[test]
fn signed_window_workaround_caps_unscaled_window() {
    let init = select_initial_window(30_000, 1, 0, false, true, 0, 0);
    assert_eq!(init.rcv_wnd, 30_000);
    let init = select_initial_window(60_000, 1, 0, false, true, 0, 0);
    assert_eq!(init.rcv_wnd, MAX_SIGNED_WINDOW);

    let cfg = cfg_with(|c| {
        c.workaround_signed_windows = true;
        c.window_scaling = false;
    });
    let mut net = network(&[(1, 1040)]);
    let mut sim = Simulator::default();
    let mut s = sock(PathIndex::MASTER, &cfg);
    establish(&mut s, &mut net, &mut sim, u16::MAX);
    assert_eq!(s.opts.rcv_wscale, 0);
    s.rcv_wnd = 60_000;
    s.rcv_wup = s.rcv_nxt;

    let (wire, rcv_wnd) = s.select_window();
    assert_eq!(u32::from(wire), MAX_SIGNED_WINDOW);
    assert_eq!(rcv_wnd, 60_000);
}

#[test]
fn advertised_window_never_shrinks() {
    let (mut s, _net, _sim) = established_sock(1040, 10);
    let ws = s.opts.rcv_wscale;
    let cur = s.receive_window();
    assert!(cur > 0);

    // 接收缓冲被占满，空闲空间为 0
    s.rcv_queued = s.cfg.rcvbuf;
    assert_eq!(s.raw_select_window(), 0);

    let (wire, rcv_wnd) = s.select_window();
    assert!(rcv_wnd >= cur);
    assert_eq!(rcv_wnd % (1 << ws), 0);
    assert_eq!(u32::from(wire), rcv_wnd.min(65535 << ws) >> ws);
}

#[test]
fn committed_window_moves_the_right_edge() {
    let (mut s, _net, _sim) = established_sock(1040, 10);
    s.rcv_nxt = s.rcv_nxt.wrapping_add(500);
    let before = s.receive_window();
    s.commit_window(before + 500);
    assert_eq!(s.rcv_wup, s.rcv_nxt);
    assert_eq!(s.receive_window(), before + 500);
}

#[test]
fn mtu_and_mss_conversions() {
    let (mut s, _net, _sim) = established_sock(1040, 10);
    assert_eq!(s.mtu_to_mss(1040), 1000);
    assert_eq!(s.mss_to_mtu(1000), 1040);
    assert_eq!(s.mtu_to_mss(9000), 1460, "clamped to the peer's mss");
    assert_eq!(s.mtu_to_mss(60), 48, "absolute floor");

    s.max_window = 1000;
    assert_eq!(s.bound_to_half_wnd(900), 500);
    assert_eq!(s.bound_to_half_wnd(400), 400);
    s.max_window = 40;
    assert_eq!(s.bound_to_half_wnd(900), 48, "never below a minimal packet");
}

#[test]
fn route_mtu_change_resyncs_mss() {
    let (mut s, mut net, _sim) = established_sock(1040, 10);
    if let Some(route) = net.route_mut(super::CONN, PathIndex::MASTER) {
        route.pmtu = 800;
    }
    assert_eq!(s.current_mss(&net), 760);
    assert_eq!(s.pmtu_cookie, 800);
}
