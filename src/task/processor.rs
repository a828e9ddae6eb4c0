//! 记录每个核当前装载的地址空间。
//!
//! 调度器在核上运行某个线程之前调用其地址空间的switch_to，离开时调用switch_from。
//! 快表维护根据这里的记录，决定哪些核需要刷新。

use crate::config::MAX_CORES;
use crate::mm::tlb::CoreSet;
use crate::arch;
use core::sync::atomic::{AtomicUsize, Ordering};

// 0表示没有装载任何地址空间，地址空间的ID从1开始
const NO_SPACE: usize = 0;
const SLOT_INIT: AtomicUsize = AtomicUsize::new(NO_SPACE);
static INSTALLED: [AtomicUsize; MAX_CORES] = [SLOT_INIT; MAX_CORES];

pub fn current_hart() -> usize {
    arch::hart_id()
}

// 当前核装载的地址空间
pub fn current_space() -> Option<usize> {
    match INSTALLED[current_hart()].load(Ordering::SeqCst) {
        NO_SPACE => None,
        id => Some(id),
    }
}

pub fn install_space(id: usize) {
    INSTALLED[current_hart()].store(id, Ordering::SeqCst);
}

// 只有当前核装载的正是id时才清除
pub fn uninstall_space(id: usize) -> bool {
    INSTALLED[current_hart()]
        .compare_exchange(id, NO_SPACE, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

// 地址空间销毁时，清除所有核上的记录
pub fn forget_space(id: usize) {
    for slot in INSTALLED.iter() {
        let _ = slot.compare_exchange(id, NO_SPACE, Ordering::SeqCst, Ordering::SeqCst);
    }
}

// 装载了地址空间id的核
pub fn cores_running(id: usize) -> CoreSet {
    let mut cores = CoreSet::empty();
    for (core, slot) in INSTALLED.iter().enumerate() {
        if slot.load(Ordering::SeqCst) == id {
            cores.insert(core);
        }
    }
    cores
}
