//! 页表的数据结构表示，以及SV39三级页表的基本操作：
//! 创建根页表（new）、定位或创建叶子页表项（drill）、只定位不创建（walk）。

use alloc::vec;
use alloc::vec::Vec;

use super::address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use super::frame_allocator::{frame_alloc, FrameTracker};
use super::VmError;
use crate::config::SATP_MODE_SV39;

bitflags! {
    // 页表项的标志位
    pub struct PTEFlags: u8 {
        const V = 1 << 0;  // Valid：页表项是否合法
        const R = 1 << 1;  // Read：可读
        const W = 1 << 2;  // Write：可写
        const X = 1 << 3;  // eXecute：可执行
        const U = 1 << 4;  // User：用户态可访问
        const G = 1 << 5;
        const A = 1 << 6;  // Access：已被访问
        const D = 1 << 7;  // Dirty：已被修改
    }
}

// 页表项为64位，结构如下（从高到低）：
//   - 10位保留
//   - 44位物理页号（PPN）
//   - 2位留给软件（RSW）
//   - 8位标志位
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct PageTableEntry {
    pub bits: usize,
}

// 按字段表生成每个字段的读写方法：名字 / 读方法 / 写方法 = [最低位, 位宽]
// 换一种页表格式时，只需要换一张表
macro_rules! pte_fields {
    ($($field:ident : $get:ident / $set:ident = [$lo:expr, $width:expr];)*) => {
        impl PageTableEntry {
            $(
                pub fn $get(&self) -> usize {
                    (self.bits >> $lo) & ((1usize << $width) - 1)
                }

                pub fn $set(&mut self, value: usize) {
                    let mask = ((1usize << $width) - 1) << $lo;
                    self.bits = (self.bits & !mask) | ((value << $lo) & mask);
                }
            )*
        }

        #[cfg(test)]
        const PTE_FIELDS: &[(&str, usize, usize)] = &[$((stringify!($field), $lo, $width)),*];
    };
}

// SV39
pte_fields! {
    valid: valid_bit / set_valid_bit = [0, 1];
    read: read_bit / set_read_bit = [1, 1];
    write: write_bit / set_write_bit = [2, 1];
    exec: exec_bit / set_exec_bit = [3, 1];
    user: user_bit / set_user_bit = [4, 1];
    global: global_bit / set_global_bit = [5, 1];
    accessed: accessed_bit / set_accessed_bit = [6, 1];
    dirty: dirty_bit / set_dirty_bit = [7, 1];
    flags: flag_bits / set_flag_bits = [0, 8];
    rsw: rsw_bits / set_rsw_bits = [8, 2];
    ppn: ppn_bits / set_ppn_bits = [10, 44];
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        let mut pte = Self::empty();
        pte.set_ppn_bits(ppn.0);
        pte.set_flag_bits(flags.bits() as usize);
        pte
    }

    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }

    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum(self.ppn_bits())
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.flag_bits() as u8)
    }

    pub fn is_valid(&self) -> bool {
        self.valid_bit() == 1
    }

    pub fn readable(&self) -> bool {
        self.read_bit() == 1
    }

    pub fn writable(&self) -> bool {
        self.write_bit() == 1
    }

    pub fn executable(&self) -> bool {
        self.exec_bit() == 1
    }

    pub fn user(&self) -> bool {
        self.user_bit() == 1
    }

    // R、W、X全为0的合法页表项指向下一级页表
    pub fn is_leaf(&self) -> bool {
        self.flags().intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X)
    }

    // 标记为不存在。物理页号等其余位保留，下次drill时原地更新。
    pub fn invalidate(&mut self) {
        self.set_valid_bit(0);
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE({:?}, {:?})", self.ppn(), self.flags())
    }
}

// 多级页表。每个地址空间都有自己的页表。
pub struct PageTable {
    // 根页表的物理页号
    root_ppn: PhysPageNum,
    // 根页表和各级中间页表所在的物理页帧，随页表一起回收
    frames: Vec<FrameTracker>,
}

impl PageTable {
    // 分配一个物理页作为根页表
    pub fn new() -> Result<Self, VmError> {
        let frame = frame_alloc().ok_or(VmError::OutOfMemory)?;
        Ok(PageTable {
            root_ppn: frame.ppn,
            frames: vec![frame],
        })
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    // 找到虚拟页号对应的叶子页表项，中间页表不存在时就创建。
    // 返回的页表项不一定合法，需要调用者进一步设置。
    fn find_pte_create(&mut self, vpn: VirtPageNum) -> Result<&'static mut PageTableEntry, VmError> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == idxs.len() - 1 {
                return Ok(pte);
            }
            if !pte.is_valid() {
                let frame = frame_alloc().ok_or(VmError::OutOfMemory)?;
                *pte = PageTableEntry::new(frame.ppn, PTEFlags::V);
                self.frames.push(frame);
            }
            ppn = pte.ppn();
        }
        unreachable!()
    }

    // 找到虚拟页号对应的叶子页表项，不创建中间页表。
    // 中间页表不存在时返回None；叶子页表项本身可能不合法。
    pub fn walk(&self, vpn: VirtPageNum) -> Option<&'static mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == idxs.len() - 1 {
                return Some(pte);
            }
            if !pte.is_valid() || pte.is_leaf() {
                return None;
            }
            ppn = pte.ppn();
        }
        None
    }

    // 建立或原地更新一个叶子映射：vpn -> ppn，访问权限为access
    pub fn drill(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, access: PTEFlags) -> Result<(), VmError> {
        let pte = self.find_pte_create(vpn)?;
        *pte = PageTableEntry::new(ppn, access | PTEFlags::V);
        trace!("drill {:?} -> {:?} {:?}", vpn, ppn, access);
        Ok(())
    }

    // 如果该页的页表项存在，把它标记为不存在。返回之前是否存在。
    pub fn invalidate(&mut self, vpn: VirtPageNum) -> bool {
        match self.walk(vpn) {
            Some(pte) if pte.is_valid() => {
                pte.invalidate();
                true
            }
            _ => false,
        }
    }

    // 找到虚拟页号对应的合法页表项，返回其拷贝
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.walk(vpn).filter(|pte| pte.is_valid()).map(|pte| *pte)
    }

    // 虚拟地址到物理地址
    pub fn translate_va(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.translate(va.floor()).map(|pte| {
            let aligned: PhysAddr = pte.ppn().into();
            PhysAddr(aligned.0 + va.page_offset())
        })
    }

    // CSR寄存器satp的值：MODE (4 bits) | ASID (16 bits) | PPN (44 bits)
    // ASID始终为0，切换地址空间时整体刷新快表
    pub fn token(&self) -> usize {
        SATP_MODE_SV39 << 60 | self.root_ppn.0
    }

    // 页表本身占用的物理页数
    pub fn table_frames(&self) -> usize {
        self.frames.len()
    }
}
