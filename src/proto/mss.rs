//! MSS 簿记
//!
//! MTU 与 MSS 的互相换算、按路径 MTU 同步 `mss_cache`、以及按当前选项开销修正发送 MSS。

use crate::net::{NetApi, RouteInfo, TCP_HEADER_LEN};

use super::options::established_options;
use super::sock::TcpSock;

/// MSS 的绝对下限
const MIN_MSS: u32 = 48;
/// 窗口折半截断时的最小包长（含头）
const MIN_PKT: u32 = 68;

impl TcpSock {
    /// 路由信息变化时刷新缓存的头部长度与分段卸载能力
    pub fn apply_route(&mut self, route: &RouteInfo) {
        self.net_header_len = route.net_header_len;
        self.ext_header_len = route.ext_header_len;
        self.gso_max_size = route.gso_max_size;
    }

    /// 不计选项之外的固定开销：MTU -> MSS
    pub fn mtu_to_mss(&self, pmtu: u32) -> u32 {
        let base = TCP_HEADER_LEN as u32;
        let mut mss = pmtu.saturating_sub(self.net_header_len + base);
        if mss > self.opts.mss_clamp {
            mss = self.opts.mss_clamp;
        }
        mss = mss.saturating_sub(self.ext_header_len);
        mss = mss.max(MIN_MSS);
        mss.saturating_sub(self.tcp_header_len.saturating_sub(base))
    }

    /// MSS -> MTU（含头部选项与网络层头）
    pub fn mss_to_mtu(&self, mss: u32) -> u32 {
        mss + self.tcp_header_len + self.ext_header_len + self.net_header_len
    }

    /// 初始化 PMTU 探测的搜索区间
    pub fn mtup_init(&mut self) {
        self.mtup.enabled = self.cfg.mtu_probing_enabled();
        self.mtup.search_high = self.opts.mss_clamp + TCP_HEADER_LEN as u32 + self.net_header_len;
        self.mtup.search_low = self.mss_to_mtu(self.cfg.base_mss);
        self.mtup.probe_size = 0;
    }

    /// 不超过见过的最大窗口的一半
    pub fn bound_to_half_wnd(&self, pktsize: u32) -> u32 {
        let half = self.max_window >> 1;
        if self.max_window != 0 && pktsize > half {
            half.max(MIN_PKT.saturating_sub(self.tcp_header_len))
        } else {
            pktsize
        }
    }

    /// 按路径 MTU 重新计算 `mss_cache`
    pub fn sync_mss(&mut self, pmtu: u32) -> u32 {
        if self.mtup.search_high > pmtu {
            self.mtup.search_high = pmtu;
        }
        let mut mss_now = self.mtu_to_mss(pmtu);
        mss_now = self.bound_to_half_wnd(mss_now);
        self.pmtu_cookie = pmtu;
        if self.mtup.enabled {
            mss_now = mss_now.min(self.mtu_to_mss(self.mtup.search_low));
        }
        self.mss_cache = mss_now;
        mss_now
    }

    /// 当前发送 MSS：按路由 MTU 同步，再按已建立连接的选项开销修正。
    ///
    /// `large_allowed` 时同时刷新分段卸载的目标尺寸 `xmit_size_goal`。
    pub fn current_mss_large(&mut self, net: &dyn NetApi, large_allowed: bool) -> u32 {
        if let Some(route) = net.route(self.id, self.path) {
            self.apply_route(&route);
            if route.pmtu != self.pmtu_cookie {
                self.sync_mss(route.pmtu);
            }
        }
        let mut mss_now = self.mss_cache;

        let opts = established_options(&self.opts, self.mp.as_ref(), None, 0);
        let header_len = (opts.size() + TCP_HEADER_LEN) as u32;
        if header_len != self.tcp_header_len {
            let delta = i64::from(header_len) - i64::from(self.tcp_header_len);
            mss_now = (i64::from(mss_now) - delta).max(i64::from(MIN_MSS)) as u32;
        }

        let mut goal = mss_now;
        if large_allowed && let Some(gso_max) = self.gso_max_size {
            goal = gso_max
                .saturating_sub(1)
                .saturating_sub(self.net_header_len + self.ext_header_len + self.tcp_header_len);
            goal = self.bound_to_half_wnd(goal);
            goal -= goal % mss_now;
            goal = goal.max(mss_now);
        }
        self.xmit_size_goal = goal;
        mss_now
    }

    pub fn current_mss(&mut self, net: &dyn NetApi) -> u32 {
        self.current_mss_large(net, false)
    }
}
