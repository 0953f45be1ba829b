//! 通告窗口
//!
//! 只负责“发出去的段里写多大的窗口”：初始窗口与缩放因子的选择，以及之后每个段的
//! 窗口计算（绝不收缩已经通告过的窗口）。接收窗口增长策略不在这里。

use super::sock::TcpSock;

/// 不缩放时兼容有符号窗口的上限
pub const MAX_SIGNED_WINDOW: u32 = 32767;
/// 缩放因子上限
pub const MAX_WSCALE: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialWindow {
    pub rcv_wnd: u32,
    pub window_clamp: u32,
    pub rcv_wscale: u8,
}

/// 选择初始接收窗口、窗口上限与缩放因子。
///
/// `space` 为可用的接收空间，`rmem_max` 为缓冲区可增长到的上限（决定缩放因子）。
pub fn select_initial_window(
    space: u32,
    mss: u32,
    window_clamp: u32,
    wscale_ok: bool,
    workaround_signed: bool,
    rmem_max: u32,
    init_rcv_wnd: u32,
) -> InitialWindow {
    let mut clamp = if window_clamp == 0 {
        65535u32 << MAX_WSCALE
    } else {
        window_clamp
    };
    let mut space = space.min(clamp);
    if mss > 0 && space > mss {
        space = (space / mss) * mss;
    }
    let mut rcv_wnd = if workaround_signed {
        space.min(MAX_SIGNED_WINDOW)
    } else {
        space
    };

    let mut rcv_wscale = 0u8;
    if wscale_ok {
        let mut room = rmem_max.min(clamp);
        while room > 65535 && rcv_wscale < MAX_WSCALE {
            room >>= 1;
            rcv_wscale += 1;
        }
    }

    // 初始窗口不超过 init_cwnd 个段
    if mss > (1u32 << rcv_wscale) {
        let init_cwnd = if mss > 1460 * 3 {
            2
        } else if mss > 1460 {
            3
        } else {
            4
        };
        if init_rcv_wnd != 0 && rcv_wnd > init_rcv_wnd * mss {
            rcv_wnd = init_rcv_wnd * mss;
        } else if rcv_wnd > init_cwnd * mss {
            rcv_wnd = init_cwnd * mss;
        }
    }

    clamp = clamp.min(65535u32 << rcv_wscale);
    InitialWindow {
        rcv_wnd,
        window_clamp: clamp,
        rcv_wscale,
    }
}

/// 由缓冲区大小换算出可通告的窗口（留四分之一给开销）
pub fn win_from_space(space: u32) -> u32 {
    space - space / 4
}

impl TcpSock {
    /// 接收缓冲的总窗口容量
    pub fn full_space(&self) -> u32 {
        win_from_space(self.cfg.rcvbuf)
    }

    /// 当前空闲的接收空间
    pub fn free_space(&self) -> u32 {
        win_from_space(self.cfg.rcvbuf.saturating_sub(self.rcv_queued))
    }

    /// 当前仍对对端有效的已通告窗口
    pub fn receive_window(&self) -> u32 {
        let win = i64::from(self.rcv_wup) + i64::from(self.rcv_wnd) - i64::from(self.rcv_nxt);
        win.max(0) as u32
    }

    /// 按空闲空间计算一个新窗口（未缩放）
    pub fn raw_select_window(&self) -> u32 {
        let full_space = self.window_clamp.min(self.full_space());
        let mut free_space = self.free_space();
        let mss = self.rcv_mss.min(full_space).max(1);

        if free_space < (full_space >> 1) && free_space < mss {
            return 0;
        }
        if free_space > self.rcv_ssthresh {
            free_space = self.rcv_ssthresh;
        }

        let ws = self.opts.rcv_wscale;
        let mut window = self.rcv_wnd;
        if ws != 0 {
            window = free_space;
            if (window >> ws) << ws != window {
                window = ((window >> ws) + 1) << ws;
            }
        } else if window <= free_space.saturating_sub(mss) || window > free_space {
            window = (free_space / mss) * mss;
        } else if mss == full_space && free_space > window + (full_space >> 1) {
            window = free_space;
        }
        window
    }

    /// 本段要通告的窗口：返回 (写进头部的缩放后值, 新的 rcv_wnd)。
    ///
    /// 只有段真正发出后才调用 [`TcpSock::commit_window`]。
    pub fn select_window(&self) -> (u16, u32) {
        let cur_win = self.receive_window();
        let mut new_win = self.raw_select_window();
        let ws = self.opts.rcv_wscale;

        // 不收缩：向上对齐到缩放粒度
        if new_win < cur_win {
            let gran = 1u32 << ws;
            new_win = cur_win.div_ceil(gran) * gran;
        }
        let rcv_wnd = new_win;

        let cap = if ws == 0 && self.cfg.workaround_signed_windows {
            MAX_SIGNED_WINDOW
        } else {
            65535u32 << ws
        };
        let wire = new_win.min(cap) >> ws;
        (wire as u16, rcv_wnd)
    }

    pub fn commit_window(&mut self, rcv_wnd: u32) {
        self.rcv_wnd = rcv_wnd;
        self.rcv_wup = self.rcv_nxt;
    }
}
