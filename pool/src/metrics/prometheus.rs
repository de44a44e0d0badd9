use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCK_CANDIDATES: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static BANS: OnceLock<IntCounter> = OnceLock::new();
static KICKED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap())
}

fn rejected() -> &'static IntCounterVec {
    REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_rejected_total", "Total rejected shares by reason"),
            &["reason"],
        )
        .unwrap()
    })
}

fn block_candidates() -> &'static IntCounter {
    BLOCK_CANDIDATES.get_or_init(|| {
        IntCounter::new(
            "block_candidates_total",
            "Total shares meeting the network target",
        )
        .unwrap()
    })
}

fn blocks_accepted() -> &'static IntCounter {
    BLOCKS_ACCEPTED
        .get_or_init(|| IntCounter::new("blocks_accepted_total", "Total blocks confirmed by a daemon").unwrap())
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        IntCounter::new(
            "block_submit_rejected_total",
            "Total block submissions rejected by a daemon",
        )
        .unwrap()
    })
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new(
            "vardiff_retargets_total",
            "Total VarDiff retarget events",
        )
        .unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new(
            "job_broadcasts_total",
            "Total mining.notify broadcasts sent",
        )
        .unwrap()
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS
        .get_or_init(|| IntCounter::new("rpc_requests_total", "Total RPC requests to daemons").unwrap())
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("rpc_errors_total", "Total RPC errors").unwrap())
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES
        .get_or_init(|| IntCounter::new("block_template_updates_total", "Total template updates").unwrap())
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        IntCounter::new(
            "block_template_fetch_errors_total",
            "Total template fetch errors",
        )
        .unwrap()
    })
}

fn bans() -> &'static IntCounter {
    BANS.get_or_init(|| IntCounter::new("stratum_bans_total", "Total IP bans triggered").unwrap())
}

fn kicked() -> &'static IntCounter {
    KICKED.get_or_init(|| {
        IntCounter::new("stratum_kicked_total", "Connections refused from banned IPs").unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| IntGauge::new("stratum_active_connections", "Active Stratum connections").unwrap())
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| IntGauge::new("block_template_height", "Current block template height").unwrap())
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected(reason: &str) {
    rejected().with_label_values(&[reason]).inc();
}

pub fn inc_block_candidates() {
    block_candidates().inc();
}

pub fn inc_blocks_accepted() {
    blocks_accepted().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn inc_bans() {
    bans().inc();
}

pub fn inc_kicked() {
    kicked().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(block_candidates().collect());
    mfs.extend(blocks_accepted().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(bans().collect());
    mfs.extend(kicked().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(template_height().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
