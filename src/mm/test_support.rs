//! 单元测试共用的环境：用主机上的一块内存充当物理内存，以及测试用的后备文件。

use super::{init_frame_allocator, File, PhysAddr, VmError};
use crate::config::PAGE_SIZE;
use crate::logging;
use std::alloc::{alloc_zeroed, Layout};
use std::cell::Cell;
use std::sync::{Mutex, MutexGuard, Once};

const ARENA_PAGES: usize = 4096;

// 只初始化一次：分配一块按页对齐的内存（永不释放），交给物理页帧分配器。
// 主机上地址等于「物理地址」，页表可以直接通过它访问。
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        logging::init();
        let layout = Layout::from_size_align(ARENA_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let start = unsafe { alloc_zeroed(layout) } as usize;
        assert_ne!(start, 0, "cannot allocate the frame arena");
        init_frame_allocator(PhysAddr(start), PhysAddr(start + ARENA_PAGES * PAGE_SIZE));
    });
}

// 模拟的硬件寄存器和每个核的装载记录是全局的。
// 检查它们的测试需要串行执行。
pub fn hw_lock() -> MutexGuard<'static, ()> {
    static HW: Mutex<()> = Mutex::new(());
    // 某个测试panic之后，锁保护的状态仍然可用
    HW.lock().unwrap_or_else(|e| e.into_inner())
}

// 页帧池由所有测试线程共享，所以预算和计数都按线程记录
thread_local! {
    static FRAME_BUDGET: Cell<Option<usize>> = Cell::new(None);
    static LIVE_FRAMES: Cell<isize> = Cell::new(0);
}

// 在返回值被丢弃之前，当前线程最多还能分配budget个页帧
pub fn limit_frames(budget: usize) -> FrameLimit {
    FRAME_BUDGET.with(|b| b.set(Some(budget)));
    FrameLimit
}

pub struct FrameLimit;

impl Drop for FrameLimit {
    fn drop(&mut self) {
        FRAME_BUDGET.with(|b| b.set(None));
    }
}

pub fn take_frame_budget() -> bool {
    FRAME_BUDGET.with(|b| match b.get() {
        None => true,
        Some(0) => false,
        Some(n) => {
            b.set(Some(n - 1));
            true
        }
    })
}

pub fn note_frames(delta: isize) {
    LIVE_FRAMES.with(|n| n.set(n.get() + delta));
}

// 当前线程分配了还没回收的页帧数
pub fn live_frames() -> isize {
    LIVE_FRAMES.with(|n| n.get())
}

// 内存中的文件
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl File for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, VmError> {
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

// 每次读都失败的文件
pub struct FailingFile;

impl File for FailingFile {
    fn read_at(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, VmError> {
        Err(VmError::Io)
    }
}
