//! 地址相关的类型：虚拟地址、物理地址、虚拟页号、物理页号，以及虚拟页号的区间。

use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS};
use core::fmt::{self, Debug, Formatter};
use core::ops::Add;

use super::page_table::PageTableEntry;

// SV39中，虚拟地址为39位，物理地址为56位
const VA_WIDTH_SV39: usize = 39;
const PA_WIDTH_SV39: usize = 56;
const VPN_WIDTH_SV39: usize = VA_WIDTH_SV39 - PAGE_SIZE_BITS;
const PPN_WIDTH_SV39: usize = PA_WIDTH_SV39 - PAGE_SIZE_BITS;

// 一个页表页中有512个页表项
pub const PTE_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<usize>();

// 39位虚拟地址空间的大小
pub const VA_LIMIT: usize = 1 << VA_WIDTH_SV39;

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VirtAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PhysAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VirtPageNum(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PhysPageNum(pub usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VA:{:#x}", self.0)
    }
}
impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VPN:{:#x}", self.0)
    }
}
impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PA:{:#x}", self.0)
    }
}
impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PPN:{:#x}", self.0)
    }
}

// 从usize转换时，只保留SV39用得到的低位
impl From<usize> for VirtAddr {
    fn from(v: usize) -> Self {
        Self(v & (VA_LIMIT - 1))
    }
}
impl From<usize> for PhysAddr {
    fn from(v: usize) -> Self {
        Self(v & ((1 << PA_WIDTH_SV39) - 1))
    }
}
impl From<usize> for VirtPageNum {
    fn from(v: usize) -> Self {
        Self(v & ((1 << VPN_WIDTH_SV39) - 1))
    }
}
impl From<usize> for PhysPageNum {
    fn from(v: usize) -> Self {
        Self(v & ((1 << PPN_WIDTH_SV39) - 1))
    }
}

impl From<VirtAddr> for usize {
    fn from(v: VirtAddr) -> Self {
        // 第38位为1时，高25位也要全部置1，否则MMU会认为这是非法地址
        if v.0 >= (1 << (VA_WIDTH_SV39 - 1)) {
            v.0 | !(VA_LIMIT - 1)
        } else {
            v.0
        }
    }
}
impl From<PhysAddr> for usize {
    fn from(v: PhysAddr) -> Self {
        v.0
    }
}

impl From<VirtPageNum> for VirtAddr {
    fn from(v: VirtPageNum) -> Self {
        Self(v.0 << PAGE_SIZE_BITS)
    }
}
impl From<PhysPageNum> for PhysAddr {
    fn from(v: PhysPageNum) -> Self {
        Self(v.0 << PAGE_SIZE_BITS)
    }
}

// SV39的合法虚拟地址：第63到38位要么全为0（低半部分），要么全为1（高半部分）
pub fn is_canonical(va: usize) -> bool {
    let top = va >> (VA_WIDTH_SV39 - 1);
    top == 0 || top == usize::MAX >> (VA_WIDTH_SV39 - 1)
}

// [va, va+len)全部是合法地址，且不跨过高低两半之间的空洞
pub fn canonical_range(va: usize, len: usize) -> bool {
    let last = match len.checked_sub(1).and_then(|l| va.checked_add(l)) {
        Some(last) => last,
        None => return false,
    };
    is_canonical(va) && is_canonical(last) && va >> (VA_WIDTH_SV39 - 1) == last >> (VA_WIDTH_SV39 - 1)
}

// 地址或长度是否按页对齐
pub fn page_aligned(v: usize) -> bool {
    v & (PAGE_SIZE - 1) == 0
}

impl VirtAddr {
    // 向下取整得到虚拟页号
    pub fn floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }
    // 向上取整得到虚拟页号
    pub fn ceil(&self) -> VirtPageNum {
        VirtPageNum((self.0 + PAGE_SIZE - 1) >> PAGE_SIZE_BITS)
    }
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl PhysAddr {
    pub fn floor(&self) -> PhysPageNum {
        PhysPageNum(self.0 >> PAGE_SIZE_BITS)
    }
    pub fn ceil(&self) -> PhysPageNum {
        PhysPageNum((self.0 + PAGE_SIZE - 1) >> PAGE_SIZE_BITS)
    }
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl Add<usize> for VirtPageNum {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

impl Add<usize> for PhysPageNum {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

impl VirtPageNum {
    // 取出三级页表中的索引，从根页表开始：[一级, 二级, 三级]，每级9位
    pub fn indexes(&self) -> [usize; 3] {
        let mut vpn = self.0;
        let mut idx = [0usize; 3];
        for i in (0..3).rev() {
            idx[i] = vpn & (PTE_PER_PAGE - 1);
            vpn >>= 9;
        }
        idx
    }
}

// 内核对物理内存做了恒等映射，所以物理地址可以直接当指针用
impl PhysPageNum {
    // 把该物理页当作页表页，得到其中的512个页表项
    pub fn get_pte_array(&self) -> &'static mut [PageTableEntry] {
        let pa: PhysAddr = (*self).into();
        unsafe { core::slice::from_raw_parts_mut(pa.0 as *mut PageTableEntry, PTE_PER_PAGE) }
    }

    // 以字节的形式访问该物理页
    pub fn get_bytes_array(&self) -> &'static mut [u8] {
        let pa: PhysAddr = (*self).into();
        unsafe { core::slice::from_raw_parts_mut(pa.0 as *mut u8, PAGE_SIZE) }
    }
}

// 虚拟页号的区间[start, end)
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VPNRange {
    start: VirtPageNum,
    end: VirtPageNum,
}

impl VPNRange {
    pub fn new(start: VirtPageNum, end: VirtPageNum) -> Self {
        assert!(start <= end, "start {:?} > end {:?}!", start, end);
        Self { start, end }
    }

    // 由起始地址和长度构造，长度向上取整到页
    pub fn from_va_len(va: usize, len: usize) -> Self {
        let start = VirtAddr::from(va);
        let end = VirtAddr(start.0 + len);
        Self::new(start.floor(), end.ceil())
    }

    pub fn get_start(&self) -> VirtPageNum {
        self.start
    }

    pub fn get_end(&self) -> VirtPageNum {
        self.end
    }

    // 区间内的页数
    pub fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    // 区间的字节长度
    pub fn bytes(&self) -> usize {
        self.len() << PAGE_SIZE_BITS
    }
}

impl IntoIterator for VPNRange {
    type Item = VirtPageNum;
    type IntoIter = core::iter::Map<core::ops::Range<usize>, fn(usize) -> VirtPageNum>;
    fn into_iter(self) -> Self::IntoIter {
        (self.start.0..self.end.0).map(VirtPageNum as fn(usize) -> VirtPageNum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_indexes_split_into_three_levels() {
        let vpn = VirtPageNum((1 << 18) | (2 << 9) | 3);
        assert_eq!(vpn.indexes(), [1, 2, 3]);
    }

    #[test]
    fn floor_and_ceil() {
        assert_eq!(VirtAddr(0x1fff).floor(), VirtPageNum(1));
        assert_eq!(VirtAddr(0x1001).ceil(), VirtPageNum(2));
        assert_eq!(VirtAddr(0x2000).ceil(), VirtPageNum(2));
        assert_eq!(PhysAddr(0x3000).floor(), PhysPageNum(3));
    }

    #[test]
    fn upper_half_addresses_are_sign_extended() {
        let high: usize = 0xffff_ffc0_0000_0000;
        let va = VirtAddr::from(high);
        assert_eq!(usize::from(va), high);
        assert_eq!(usize::from(VirtAddr::from(0x1000)), 0x1000);
    }

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical(0x3f_ffff_ffff));
        assert!(is_canonical(0xffff_ffc0_0000_0000));
        assert!(!is_canonical(0x40_0000_0000));
        assert!(!is_canonical(0x80_0000_0000));
        assert!(canonical_range(0x3f_ffff_f000, 0x1000));
        // 跨过低半部分的末尾
        assert!(!canonical_range(0x3f_ffff_f000, 0x2000));
        assert!(canonical_range(0xffff_ffff_ffff_f000, 0x1000));
        assert!(!canonical_range(0x1000, 0));
    }

    #[test]
    fn range_iterates_every_page() {
        let range = VPNRange::from_va_len(0x1000, 0x3000);
        assert_eq!(range.len(), 3);
        assert_eq!(range.bytes(), 0x3000);
        let pages: alloc::vec::Vec<_> = range.into_iter().collect();
        assert_eq!(pages, [VirtPageNum(1), VirtPageNum(2), VirtPageNum(3)]);
    }
}
