//! 管理页帧（frame），即物理页

use super::address::{PhysAddr, PhysPageNum};
use crate::sync::IrqMutex;
use buddy_system_allocator::FrameAllocator;
use core::fmt::{self, Debug, Formatter};
use lazy_static::*;

// 全局物理页帧池。分配工作交给伙伴系统，这里只记录总数和已分配的数量。
pub struct FramePool {
    allocator: FrameAllocator,
    total: usize,
    allocated: usize,
}

impl FramePool {
    pub fn new() -> Self {
        Self {
            allocator: FrameAllocator::new(),
            total: 0,
            allocated: 0,
        }
    }

    // 加入物理页号范围[l, r)
    pub fn add_frames(&mut self, l: PhysPageNum, r: PhysPageNum) {
        if l >= r {
            return;
        }
        self.allocator.add_frame(l.0, r.0);
        self.total += r.0 - l.0;
    }

    fn alloc(&mut self) -> Option<PhysPageNum> {
        let ppn = self.allocator.alloc(1)?;
        self.allocated += 1;
        Some(PhysPageNum(ppn))
    }

    fn dealloc(&mut self, ppn: PhysPageNum) {
        self.allocator.dealloc(ppn.0, 1);
        self.allocated -= 1;
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

// 该类型用于管理物理页帧的生命周期
pub struct FrameTracker {
    pub ppn: PhysPageNum,
}

impl FrameTracker {
    fn new(ppn: PhysPageNum) -> Self {
        // 清理物理页帧中的内容
        ppn.get_bytes_array().fill(0);
        Self { ppn }
    }
}

impl Debug for FrameTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "FrameTracker:PPN={:#x}", self.ppn.0)
    }
}

// FrameTracker生命周期结束时，物理页帧被回收
impl Drop for FrameTracker {
    fn drop(&mut self) {
        frame_dealloc(self.ppn);
    }
}

lazy_static! {
    pub static ref FRAME_ALLOCATOR: IrqMutex<FramePool> = IrqMutex::new(FramePool::new());
}

// 把物理内存[start, end)交给全局分配器。可以多次调用，加入不相连的内存段。
pub fn init_frame_allocator(start: PhysAddr, end: PhysAddr) {
    let (l, r) = (start.ceil(), end.floor());
    debug!("frame allocator: add {:?}..{:?}", l, r);
    FRAME_ALLOCATOR.lock().add_frames(l, r);
}

// 分配一个清零的物理页帧
pub fn frame_alloc() -> Option<FrameTracker> {
    if !alloc_permitted() {
        return None;
    }
    let ppn = FRAME_ALLOCATOR.lock().alloc()?;
    note_frames(1);
    Some(FrameTracker::new(ppn))
}

fn frame_dealloc(ppn: PhysPageNum) {
    FRAME_ALLOCATOR.lock().dealloc(ppn);
    note_frames(-1);
}

#[cfg(not(test))]
fn alloc_permitted() -> bool {
    true
}

#[cfg(not(test))]
fn note_frames(_delta: isize) {}

// 测试可以限制当前线程还能分配的页帧数，并统计当前线程持有的页帧
#[cfg(test)]
fn alloc_permitted() -> bool {
    super::test_support::take_frame_budget()
}

#[cfg(test)]
fn note_frames(delta: isize) {
    super::test_support::note_frames(delta)
}

// 还没分配出去的页帧数
pub fn free_frames() -> usize {
    let pool = FRAME_ALLOCATOR.lock();
    pool.total - pool.allocated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support;

    #[test]
    fn frames_are_zeroed_and_distinct() {
        test_support::init();
        let a = frame_alloc().unwrap();
        let b = frame_alloc().unwrap();
        assert_ne!(a.ppn, b.ppn);
        assert!(a.ppn.get_bytes_array().iter().all(|&x| x == 0));
        a.ppn.get_bytes_array()[0] = 0xaa;
        let ppn = a.ppn;
        drop(a);
        // 回收后再次分配出来的页帧要重新清零
        let again: alloc::vec::Vec<_> = (0..4).filter_map(|_| frame_alloc()).collect();
        for frame in again.iter().filter(|f| f.ppn == ppn) {
            assert_eq!(frame.ppn.get_bytes_array()[0], 0);
        }
    }

    #[test]
    fn exhausted_budget_fails_allocation() {
        test_support::init();
        let before = test_support::live_frames();
        {
            let _limit = test_support::limit_frames(1);
            let a = frame_alloc();
            assert!(a.is_some());
            assert!(frame_alloc().is_none());
            assert_eq!(test_support::live_frames(), before + 1);
        }
        assert_eq!(test_support::live_frames(), before);
        assert!(frame_alloc().is_some());
    }

    #[test]
    fn pool_counts_allocations() {
        let mut pool = FramePool::new();
        pool.add_frames(PhysPageNum(0x100), PhysPageNum(0x104));
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocated, 2);
        pool.dealloc(a);
        assert_eq!(pool.allocated, 1);
        assert_eq!(pool.total, 4);
    }
}
