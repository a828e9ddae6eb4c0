//! 快表（TLB）维护。
//!
//! 修改页表后，所有可能缓存了旧映射的核都要刷新快表。
//! 刷新请求用[`invalidate`]发往一组核：当前核直接处理，其他核的请求放进它的邮箱，
//! 再用核间中断通知它，由它在[`handle_ipi`]中处理。

use super::address::{VPNRange, VirtAddr};
use crate::config::{MAX_CORES, SHOOTDOWN_MAILBOX_CAPACITY, TLB_FLUSH_THRESHOLD};
use crate::sync::IrqMutex;
use crate::{arch, task::processor};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use lazy_static::*;

// 一组核，每个核占一位
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreSet(usize);

impl CoreSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn single(core: usize) -> Self {
        Self(1 << core)
    }

    pub fn insert(&mut self, core: usize) {
        self.0 |= 1 << core;
    }

    pub fn contains(&self, core: usize) -> bool {
        self.0 & (1 << core) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn bits(&self) -> usize {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_CORES).filter(move |core| bits & (1 << core) != 0)
    }
}

// 在一个核上做了什么
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TlbAction {
    None,
    // 逐页刷新了这么多页
    Pages(usize),
    // 重新装载根页表，整体刷新
    Reload,
}

// 发给其他核的刷新请求
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Shootdown {
    // 刷新地址空间space_id在range上的快表项
    Range { space_id: usize, range: VPNRange },
    // 请求积压太多，改为清空整个快表
    All,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Invalidation {
    pub local: TlbAction,
    // 收到了请求的其他核
    pub remote: CoreSet,
}

lazy_static! {
    // 每个核一个邮箱
    static ref MAILBOXES: [IrqMutex<VecDeque<Shootdown>>; MAX_CORES] =
        core::array::from_fn(|_| IrqMutex::new(VecDeque::new()));
}

// 在当前核上刷新range：不超过阈值时逐页刷新，否则整体刷新
pub fn flush_local(range: VPNRange) -> TlbAction {
    if range.is_empty() {
        TlbAction::None
    } else if range.bytes() <= TLB_FLUSH_THRESHOLD {
        for vpn in range {
            arch::flush_tlb_page(VirtAddr::from(vpn).into());
        }
        TlbAction::Pages(range.len())
    } else {
        arch::reload_root();
        TlbAction::Reload
    }
}

// 让cores中的每个核都刷新地址空间space_id在range上的快表项
pub fn invalidate(space_id: usize, range: VPNRange, cores: CoreSet) -> Invalidation {
    let local = processor::current_hart();
    let mut result = Invalidation {
        local: TlbAction::None,
        remote: CoreSet::empty(),
    };
    for core in cores.iter() {
        if core == local {
            result.local = flush_local(range);
        } else {
            post(core, space_id, range);
            result.remote.insert(core);
        }
    }
    if !result.remote.is_empty() {
        trace!("shootdown {:?} of space {} to {:?}", range, space_id, result.remote);
        arch::send_ipi(result.remote.bits());
    }
    result
}

// 把请求放进core的邮箱。同一地址空间的请求合并成覆盖两者的区间；
// 邮箱满了之后换成一个All。
fn post(core: usize, space_id: usize, range: VPNRange) {
    let mut mailbox = MAILBOXES[core].lock();
    if mailbox.front() == Some(&Shootdown::All) {
        return;
    }
    for req in mailbox.iter_mut() {
        if let Shootdown::Range { space_id: id, range: pending } = req {
            if *id == space_id {
                let start = pending.get_start().min(range.get_start());
                let end = pending.get_end().max(range.get_end());
                *pending = VPNRange::new(start, end);
                return;
            }
        }
    }
    if mailbox.len() >= SHOOTDOWN_MAILBOX_CAPACITY {
        mailbox.clear();
        mailbox.push_back(Shootdown::All);
    } else {
        mailbox.push_back(Shootdown::Range { space_id, range });
    }
}

// 核间中断的处理：完成发给当前核的全部刷新请求，返回请求数
pub fn handle_ipi() -> usize {
    arch::clear_ipi();
    let requests: Vec<Shootdown> = MAILBOXES[processor::current_hart()]
        .lock()
        .drain(..)
        .collect();
    let current = processor::current_space();
    for req in requests.iter() {
        match *req {
            Shootdown::All => arch::reload_root(),
            // 请求发出后，该核可能已经切换了地址空间。切换时已经整体刷新过了。
            Shootdown::Range { space_id, range } if current == Some(space_id) => {
                flush_local(range);
            }
            Shootdown::Range { .. } => {}
        }
    }
    requests.len()
}

// 某个核的邮箱中还没处理的请求数
pub fn pending_shootdowns(core: usize) -> usize {
    MAILBOXES[core].lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::VirtPageNum;
    use crate::mm::test_support;

    #[test]
    fn small_ranges_are_flushed_page_by_page() {
        let _hw = test_support::hw_lock();
        let (pages, full) = arch::tlb_flush_counts();
        let range = VPNRange::new(VirtPageNum(0x10), VirtPageNum(0x14));
        assert_eq!(flush_local(range), TlbAction::Pages(4));
        let empty = VPNRange::new(VirtPageNum(0x10), VirtPageNum(0x10));
        assert_eq!(flush_local(empty), TlbAction::None);
        assert_eq!(arch::tlb_flush_counts(), (pages + 4, full));
    }

    #[test]
    fn threshold_is_inclusive() {
        let _hw = test_support::hw_lock();
        let pages = TLB_FLUSH_THRESHOLD / crate::config::PAGE_SIZE;
        let at = VPNRange::new(VirtPageNum(0), VirtPageNum(pages));
        assert_eq!(flush_local(at), TlbAction::Pages(pages));
        let (_, full) = arch::tlb_flush_counts();
        let above = VPNRange::new(VirtPageNum(0), VirtPageNum(pages + 1));
        assert_eq!(flush_local(above), TlbAction::Reload);
        assert_eq!(arch::tlb_flush_counts().1, full + 1);
    }

    #[test]
    fn remote_cores_get_a_message_and_an_ipi() {
        let _hw = test_support::hw_lock();
        let range = VPNRange::new(VirtPageNum(1), VirtPageNum(2));
        let mut cores = CoreSet::single(processor::current_hart());
        cores.insert(3);
        let result = invalidate(usize::MAX, range, cores);
        assert_eq!(result.local, TlbAction::Pages(1));
        assert_eq!(result.remote, CoreSet::single(3));
        assert!(pending_shootdowns(3) >= 1);
        assert!(arch::pending_ipi() & (1 << 3) != 0);
    }

    #[test]
    fn ipi_drains_the_local_mailbox() {
        let _hw = test_support::hw_lock();
        let local = processor::current_hart();
        let range = VPNRange::new(VirtPageNum(8), VirtPageNum(10));
        post(local, 4242, range);
        post(local, 4243, range);
        processor::install_space(4242);
        let (pages, _) = arch::tlb_flush_counts();
        assert_eq!(handle_ipi(), 2);
        // 只有当前装载的地址空间需要刷新
        assert_eq!(arch::tlb_flush_counts().0, pages + 2);
        assert_eq!(pending_shootdowns(local), 0);
        assert!(processor::uninstall_space(4242));
    }

    #[test]
    fn requests_for_one_space_are_merged() {
        let core = 5;
        post(core, 77, VPNRange::new(VirtPageNum(0x10), VirtPageNum(0x12)));
        post(core, 77, VPNRange::new(VirtPageNum(0x20), VirtPageNum(0x21)));
        post(core, 78, VPNRange::new(VirtPageNum(0x1), VirtPageNum(0x2)));
        let pending: Vec<Shootdown> = MAILBOXES[core].lock().iter().copied().collect();
        assert_eq!(
            pending,
            [
                Shootdown::Range {
                    space_id: 77,
                    range: VPNRange::new(VirtPageNum(0x10), VirtPageNum(0x21))
                },
                Shootdown::Range {
                    space_id: 78,
                    range: VPNRange::new(VirtPageNum(0x1), VirtPageNum(0x2))
                },
            ]
        );
    }

    #[test]
    fn full_mailbox_collapses_to_a_full_flush() {
        let _hw = test_support::hw_lock();
        let local = processor::current_hart();
        let range = VPNRange::new(VirtPageNum(1), VirtPageNum(2));
        for space_id in 0..SHOOTDOWN_MAILBOX_CAPACITY * 4 {
            post(local, 1000 + space_id, range);
        }
        assert_eq!(pending_shootdowns(local), 1);
        assert_eq!(MAILBOXES[local].lock().front(), Some(&Shootdown::All));
        let (_, full) = arch::tlb_flush_counts();
        assert_eq!(handle_ipi(), 1);
        assert_eq!(arch::tlb_flush_counts().1, full + 1);
    }

    #[test]
    fn core_set_iterates_members() {
        let mut set = CoreSet::empty();
        set.insert(0);
        set.insert(5);
        assert_eq!(set.iter().collect::<Vec<_>>(), [0, 5]);
        assert_eq!(set.count(), 2);
        assert!(set.contains(5) && !set.contains(1));
    }
}
