//! 软件模拟的「硬件」。只记录寄存器的值和刷新快表的次数，供测试检查。

use crate::trap::TrapCause;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static SATP: AtomicUsize = AtomicUsize::new(0);
static SIE: AtomicBool = AtomicBool::new(true);
static PAGE_FLUSHES: AtomicUsize = AtomicUsize::new(0);
static FULL_FLUSHES: AtomicUsize = AtomicUsize::new(0);
static PENDING_IPI: AtomicUsize = AtomicUsize::new(0);

// 模拟的scause/stval/spp
static SCAUSE: AtomicUsize = AtomicUsize::new(0);
static STVAL: AtomicUsize = AtomicUsize::new(0);
static SPP_USER: AtomicBool = AtomicBool::new(false);

pub fn write_satp(bits: usize) {
    SATP.store(bits, Ordering::SeqCst);
}

pub fn read_satp() -> usize {
    SATP.load(Ordering::SeqCst)
}

pub fn flush_tlb_page(_va: usize) {
    PAGE_FLUSHES.fetch_add(1, Ordering::SeqCst);
}

pub fn flush_tlb_all() {
    FULL_FLUSHES.fetch_add(1, Ordering::SeqCst);
}

pub fn intr_get() -> bool {
    SIE.load(Ordering::SeqCst)
}

pub fn intr_disable() {
    SIE.store(false, Ordering::SeqCst);
}

pub fn intr_enable() {
    SIE.store(true, Ordering::SeqCst);
}

// 主机上只有一个「核」
pub fn hart_id() -> usize {
    0
}

pub fn send_ipi(hart_mask: usize) {
    PENDING_IPI.fetch_or(hart_mask, Ordering::SeqCst);
}

pub fn clear_ipi() {
    PENDING_IPI.fetch_and(!(1 << hart_id()), Ordering::SeqCst);
}

// 已发出但还没被处理的核间中断掩码
pub fn pending_ipi() -> usize {
    PENDING_IPI.load(Ordering::SeqCst)
}

// (逐页刷新次数, 整体刷新次数)
pub fn tlb_flush_counts() -> (usize, usize) {
    (
        PAGE_FLUSHES.load(Ordering::SeqCst),
        FULL_FLUSHES.load(Ordering::SeqCst),
    )
}

// 模拟硬件触发一次Trap：写入scause、stval和sstatus.spp
pub fn raise_trap(scause: usize, stval: usize, from_user: bool) {
    SCAUSE.store(scause, Ordering::SeqCst);
    STVAL.store(stval, Ordering::SeqCst);
    SPP_USER.store(from_user, Ordering::SeqCst);
}

pub fn read_trap() -> (TrapCause, usize, bool) {
    (
        TrapCause::from_code(SCAUSE.load(Ordering::SeqCst)),
        STVAL.load(Ordering::SeqCst),
        SPP_USER.load(Ordering::SeqCst),
    )
}
