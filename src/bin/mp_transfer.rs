//! 多路径传输演示
//!
//! 在 N 条模拟路径上建立一个多路径连接（或 `--single` 时一个普通连接），
//! 应用按块写入给定字节数，可选地在写完后关闭，最后以 JSON 输出摘要。

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mpxmit_rs::config::XmitConfig;
use mpxmit_rs::mptcp::{MetaSock, SchedulerAlgorithm, create_scheduler};
use mpxmit_rs::net::{
    ConnId, NetWorld, Network, PathIndex, Peer, PeerConfig, PeerReport, RouteInfo, Stats,
};
use mpxmit_rs::proto::{Endpoint, TcpSock, TcpStack, TcpState};
use mpxmit_rs::sim::{Event, SimTime, Simulator, World};
use serde::Serialize;
use tracing::{error, info, warn};

const CONN: ConnId = ConnId(1);

#[derive(Debug, Parser)]
#[command(name = "mp-transfer", about = "多路径发送引擎演示：N 条路径上的一次批量传输")]
struct Args {
    /// 发送引擎配置（JSON，缺省字段取默认值）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 要发送的应用数据量（字节）
    #[arg(long, default_value_t = 1_000_000)]
    bytes: u64,

    /// 每次应用写入的块大小（字节）
    #[arg(long, default_value_t = 64 * 1024)]
    chunk: usize,

    /// 应用写入被发送缓冲挡回时的重试间隔（微秒）
    #[arg(long, default_value_t = 200)]
    write_retry_us: u64,

    /// 每条路径的往返时延（微秒），逗号分隔；条数即路径数
    #[arg(long, value_delimiter = ',', default_value = "200,600")]
    rtt_us: Vec<u64>,

    /// 每条路径的 MTU，逗号分隔；不足的路径用 1500
    #[arg(long, value_delimiter = ',')]
    mtu: Vec<u32>,

    /// 每条路径每 N 个数据帧丢一个，逗号分隔；0 不丢
    #[arg(long, value_delimiter = ',')]
    drop_every: Vec<u64>,

    /// 子流调度算法
    #[arg(long, value_enum, default_value_t = SchedulerAlgorithm::MinRtt)]
    scheduler: SchedulerAlgorithm,

    /// 只用第一条路径建立普通（单路径）连接
    #[arg(long, default_value_t = false)]
    single: bool,

    /// 写完后关闭连接
    #[arg(long, default_value_t = false)]
    close: bool,

    /// 对端通告窗口（字节）
    #[arg(long)]
    peer_window: Option<u32>,

    /// 仿真运行到多少毫秒
    #[arg(long, default_value_t = 10_000)]
    until_ms: u64,
}

/// 应用写入事件：尽量写，写不完就稍后再来
struct AppWrite {
    remaining: u64,
    chunk: usize,
    retry: SimTime,
    close: bool,
}

impl Event for AppWrite {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let AppWrite {
            mut remaining,
            chunk,
            retry,
            close,
        } = *self;
        let w = world
            .as_any_mut()
            .downcast_mut::<NetWorld>()
            .expect("world must be NetWorld");
        let NetWorld { net, stack, .. } = w;

        while remaining > 0 {
            let n = (chunk as u64).min(remaining) as usize;
            let buf = vec![0xabu8; n];
            match stack.send(CONN, &buf, net, sim) {
                Ok(0) => break,
                Ok(written) => remaining -= written as u64,
                Err(err) => {
                    warn!(?err, remaining, "应用写入失败，停止");
                    return;
                }
            }
        }
        if remaining > 0 {
            sim.schedule_in(
                retry,
                AppWrite {
                    remaining,
                    chunk,
                    retry,
                    close,
                },
            );
        } else if close {
            info!("应用数据写完，关闭连接");
            stack.close(CONN, net, sim);
        }
    }
}

#[derive(Debug, Serialize)]
struct SubflowSummary {
    path: u8,
    state: TcpState,
    srtt_us: u64,
    cwnd: u32,
    segs_out: u64,
    retrans: u32,
    frames: usize,
    payload_bytes: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    mode: &'static str,
    scheduler: Option<SchedulerAlgorithm>,
    bytes_requested: u64,
    bytes_acked: u64,
    state: TcpState,
    sim_time_ns: u64,
    peer: PeerReport,
    subflows: Vec<SubflowSummary>,
    stats: Stats,
}

fn subflow_summary(net: &Network, sock: &TcpSock) -> SubflowSummary {
    let frames: Vec<_> = net.sent_on(CONN, sock.path).collect();
    SubflowSummary {
        path: sock.path.0,
        state: sock.state,
        srtt_us: sock.srtt.0 / 1_000,
        cwnd: sock.cong.cwnd,
        segs_out: sock.segs_out,
        retrans: sock.total_retrans,
        frames: frames.len(),
        payload_bytes: frames.iter().map(|f| u64::from(f.len)).sum(),
    }
}

fn summarize(args: &Args, world: &NetWorld, now: SimTime) -> Option<Summary> {
    let ep = world.stack.get(CONN)?;
    let (mode, scheduler, bytes_acked, state, subflows) = match ep {
        Endpoint::Single(sock) => {
            let sent = sock.snd_una.wrapping_sub(sock.iss.wrapping_add(1));
            let fin = u32::from(matches!(sock.state, TcpState::FinWait2));
            (
                "single",
                None,
                u64::from(sent.saturating_sub(fin)),
                sock.state,
                vec![subflow_summary(&world.net, sock)],
            )
        }
        Endpoint::Multipath(meta) => {
            let fin = u32::from(matches!(meta.state, TcpState::FinWait2));
            (
                "multipath",
                Some(args.scheduler),
                u64::from(meta.bytes_acked().saturating_sub(fin)),
                meta.state,
                meta.subflows
                    .values()
                    .map(|s| subflow_summary(&world.net, s))
                    .collect(),
            )
        }
    };
    Some(Summary {
        mode,
        scheduler,
        bytes_requested: args.bytes,
        bytes_acked,
        state,
        sim_time_ns: now.0,
        peer: world.peer.report(CONN),
        subflows,
        stats: world.net.stats.clone(),
    })
}

fn build_world(args: &Args, cfg: &Arc<XmitConfig>) -> NetWorld {
    let mut net = Network::default();
    net.deliver = true;
    let mut peer_cfg = PeerConfig::default();
    if let Some(window) = args.peer_window {
        peer_cfg.window = window;
    }
    let mut world = NetWorld::new(net, Peer::new(peer_cfg));

    let paths = if args.single { 1 } else { args.rtt_us.len().clamp(1, PathIndex::MAX as usize) };
    let remote = SocketAddrV4::new(Ipv4Addr::new(10, 1, 0, 1), 80);
    let mut socks = Vec::with_capacity(paths);
    for i in 0..paths {
        let Some(path) = PathIndex::new(i as u8 + 1) else {
            break;
        };
        let rtt = args.rtt_us.get(i).copied().unwrap_or(200);
        let route = RouteInfo {
            pmtu: args.mtu.get(i).copied().unwrap_or(1500),
            latency: SimTime::from_micros(rtt / 2),
            ..RouteInfo::default()
        };
        world.net.set_route(CONN, path, route);
        world
            .net
            .set_drop_every(CONN, path, args.drop_every.get(i).copied().unwrap_or(0));

        let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, i as u8, 1), 40_000 + i as u16);
        let iss = 1_000_000u32.wrapping_mul(path.0 as u32);
        socks.push(TcpSock::new(CONN, path, local, remote, Arc::clone(cfg), iss));
    }

    let stack: &mut TcpStack = &mut world.stack;
    if args.single {
        if let Some(sock) = socks.pop() {
            stack.insert(sock);
        }
    } else {
        let mut meta = MetaSock::new(CONN, Arc::clone(cfg), 0x1357_9bdf, create_scheduler(args.scheduler));
        for sock in socks {
            meta.add_subflow(sock);
        }
        stack.insert(meta);
    }
    world
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => match XmitConfig::from_json_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(path = %path.display(), %err, "配置加载失败");
                return ExitCode::FAILURE;
            }
        },
        None => XmitConfig::default(),
    };
    let cfg = Arc::new(cfg);

    let mut sim = Simulator::default();
    let mut world = build_world(&args, &cfg);
    {
        let NetWorld { net, stack, .. } = &mut world;
        if let Err(err) = stack.connect(CONN, net, &mut sim) {
            error!(%err, "建连失败");
            return ExitCode::FAILURE;
        }
    }
    sim.schedule(
        SimTime::ZERO,
        AppWrite {
            remaining: args.bytes,
            chunk: args.chunk.max(1),
            retry: SimTime::from_micros(args.write_retry_us.max(1)),
            close: args.close,
        },
    );

    sim.run_until(SimTime::from_millis(args.until_ms), &mut world);

    let Some(summary) = summarize(&args, &world, sim.now()) else {
        error!("连接不存在");
        return ExitCode::FAILURE;
    };
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            error!(%err, "摘要序列化失败");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
