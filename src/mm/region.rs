//! 区域（Region）的描述，以及记录一个地址空间中全部区域的RegionTracker。

use super::address::{canonical_range, page_aligned, PhysAddr, PhysPageNum, VPNRange, VirtPageNum};
use super::frame_allocator::FrameTracker;
use super::page_table::PTEFlags;
use super::{File, VmError};
use crate::config::PAGE_SIZE_BITS;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt::{self, Debug, Formatter};

bitflags! {
    // 区域的保护标志，由通用地址空间框架定义
    pub struct ProtFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        // 固定在物理内存中，物理位置不能改变
        const PIN = 1 << 3;
        // 只有内核态可以访问
        const KERNEL = 1 << 4;
        const SWAP = 1 << 5;
        // 添加区域时立即建立全部映射，而不是等缺页
        const EAGER = 1 << 6;
        // 匿名内存：每页分配一个新的物理页帧，忽略pa_start
        const ANONYMOUS = 1 << 7;
        // 文件映射：每页分配物理页帧，并从后备文件读入内容
        const FILE_BACKED = 1 << 8;
    }
}

bitflags! {
    // 判断两个描述是否指「同一个区域」时，需要相等的字段
    pub struct MatchMask: u8 {
        const VA = 1 << 0;
        const PA = 1 << 1;
        const LEN = 1 << 2;
        const PROTECT = 1 << 3;
    }
}

// 调用者对一段映射的声明：[va_start, va_start+len) -> [pa_start, pa_start+len)
#[derive(Clone)]
pub struct Region {
    pub va_start: usize,
    pub pa_start: usize,
    pub len: usize,
    pub prot: ProtFlags,
    // 只有FILE_BACKED区域才有
    pub file: Option<Arc<dyn File>>,
}

impl Region {
    pub fn new(va_start: usize, pa_start: usize, len: usize, prot: ProtFlags) -> Self {
        Self {
            va_start,
            pa_start,
            len,
            prot,
            file: None,
        }
    }

    // 设置后备文件，区域变成文件映射
    pub fn with_file(mut self, file: Arc<dyn File>) -> Self {
        self.prot |= ProtFlags::FILE_BACKED;
        self.file = Some(file);
        self
    }

    pub fn end(&self) -> usize {
        self.va_start + self.len
    }

    pub fn contains(&self, va: usize) -> bool {
        self.va_start <= va && va < self.end()
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.va_start < other.end() && other.va_start < self.end()
    }

    pub fn vpn_range(&self) -> VPNRange {
        VPNRange::from_va_len(self.va_start, self.len)
    }

    // 是否需要为每个页分配自己的物理页帧
    pub fn is_backed(&self) -> bool {
        self.prot
            .intersects(ProtFlags::ANONYMOUS | ProtFlags::FILE_BACKED)
    }

    // 转换成页表项的访问权限
    pub fn access(&self) -> PTEFlags {
        let mut flags = PTEFlags::empty();
        // SV39中W=1、R=0是保留的组合，可写必须可读
        if self.prot.intersects(ProtFlags::READ | ProtFlags::WRITE) {
            flags |= PTEFlags::R;
        }
        if self.prot.contains(ProtFlags::WRITE) {
            flags |= PTEFlags::W;
        }
        if self.prot.contains(ProtFlags::EXEC) {
            flags |= PTEFlags::X;
        }
        if !self.prot.contains(ProtFlags::KERNEL) {
            flags |= PTEFlags::U;
        }
        flags
    }

    // 没有后备页帧的区域，vpn对应的物理页号
    pub fn pa_of(&self, vpn: VirtPageNum) -> PhysPageNum {
        let offset = vpn.0 - self.vpn_range().get_start().0;
        PhysAddr::from(self.pa_start).floor() + offset
    }

    // vpn对应的文件内偏移：从区域开头算起
    pub fn file_offset(&self, vpn: VirtPageNum) -> usize {
        (vpn.0 - self.vpn_range().get_start().0) << PAGE_SIZE_BITS
    }

    pub fn matches(&self, other: &Region, mask: MatchMask) -> bool {
        (!mask.contains(MatchMask::VA) || self.va_start == other.va_start)
            && (!mask.contains(MatchMask::PA) || self.pa_start == other.pa_start)
            && (!mask.contains(MatchMask::LEN) || self.len == other.len)
            && (!mask.contains(MatchMask::PROTECT) || self.prot == other.prot)
    }

    // 检查描述本身是否合法，不涉及其他区域
    pub fn validate(&self) -> Result<(), VmError> {
        if !page_aligned(self.va_start) || !page_aligned(self.pa_start) || !page_aligned(self.len) {
            return Err(VmError::Misaligned);
        }
        if self.len == 0 || self.va_start.checked_add(self.len).is_none() {
            return Err(VmError::InvalidArgument);
        }
        // 记录以原始的va_start为键，截断到39位后不能与别的地址重合
        if !canonical_range(self.va_start, self.len) {
            return Err(VmError::InvalidArgument);
        }
        validate_prot(self.prot)?;
        if self.prot.contains(ProtFlags::FILE_BACKED) != self.file.is_some() {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }
}

// 至少要有一种访问权限，且匿名和文件映射不能同时出现
pub fn validate_prot(prot: ProtFlags) -> Result<(), VmError> {
    if !prot.intersects(ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC) {
        return Err(VmError::InvalidArgument);
    }
    if prot.contains(ProtFlags::ANONYMOUS | ProtFlags::FILE_BACKED) {
        return Err(VmError::InvalidArgument);
    }
    Ok(())
}

// 文件只比较是不是同一个对象
impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        let same_file = match (&self.file, &other.file) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.matches(other, MatchMask::all()) && same_file
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) -> {:#x} {:?}{}",
            self.va_start,
            self.end(),
            self.pa_start,
            self.prot,
            if self.file.is_some() { " (file)" } else { "" }
        )
    }
}

// 地址空间中的一条区域记录。
// 区域描述是调用者那份的私有拷贝；匿名/文件映射区域的物理页帧也由它管理。
pub struct MapRegion {
    pub region: Region,
    pub frames: BTreeMap<VirtPageNum, FrameTracker>,
}

impl MapRegion {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            frames: BTreeMap::new(),
        }
    }
}

// 记录一个地址空间中的全部区域，以起始虚拟地址为键。
// 所有操作都假定调用者已经拿到了地址空间的锁。
#[derive(Default)]
pub struct RegionTracker {
    regions: BTreeMap<usize, MapRegion>,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapRegion> {
        self.regions.values()
    }

    // 调用者需要先用check_overlap确认没有重叠
    pub fn insert(&mut self, record: MapRegion) {
        debug_assert!(self.check_overlap(&record.region).is_none());
        self.regions.insert(record.region.va_start, record);
    }

    // 返回与region的虚拟地址范围相交的已有区域
    pub fn check_overlap(&self, region: &Region) -> Option<&Region> {
        // 区域互不重叠，所以只需要看起始地址在region结束之前的最后一个区域
        self.regions
            .range(..region.end())
            .next_back()
            .map(|(_, r)| &r.region)
            .filter(|r| r.intersects(region))
    }

    fn find_key(&self, region: &Region, mask: MatchMask) -> Option<usize> {
        if mask.contains(MatchMask::VA) {
            self.regions
                .get(&region.va_start)
                .filter(|r| r.region.matches(region, mask))
                .map(|r| r.region.va_start)
        } else {
            self.regions
                .values()
                .find(|r| r.region.matches(region, mask))
                .map(|r| r.region.va_start)
        }
    }

    // 按mask找到匹配的区域记录
    pub fn find(&self, region: &Region, mask: MatchMask) -> Option<&MapRegion> {
        let key = self.find_key(region, mask)?;
        self.regions.get(&key)
    }

    // 删除第一个与region匹配的区域，返回它的记录
    pub fn remove(&mut self, region: &Region, mask: MatchMask) -> Result<MapRegion, VmError> {
        let key = self.find_key(region, mask).ok_or(VmError::NoMatch)?;
        self.regions.remove(&key).ok_or(VmError::NoMatch)
    }

    // 包含虚拟地址va的区域
    pub fn find_at(&self, va: usize) -> Option<&MapRegion> {
        self.regions
            .range(..=va)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.region.contains(va))
    }

    pub fn find_at_mut(&mut self, va: usize) -> Option<&mut MapRegion> {
        self.regions
            .range_mut(..=va)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.region.contains(va))
    }

    // 找到按mask与cur匹配的区域，把mask之外的字段改成new中的值。
    // 保护标志的修改（mask为VA|LEN|PA）和物理地址的修改（mask为VA|LEN|PROTECT）都用它。
    // 后备文件不属于任何字段，保持不变。
    pub fn update(&mut self, cur: &Region, new: &Region, mask: MatchMask) -> Option<&mut MapRegion> {
        let key = self.find_key(cur, mask)?;
        let mut record = self.regions.remove(&key)?;
        let r = &mut record.region;
        if !mask.contains(MatchMask::VA) {
            r.va_start = new.va_start;
        }
        if !mask.contains(MatchMask::PA) {
            r.pa_start = new.pa_start;
        }
        if !mask.contains(MatchMask::LEN) {
            r.len = new.len;
        }
        if !mask.contains(MatchMask::PROTECT) {
            r.prot = new.prot;
        }
        let key = r.va_start;
        self.regions.insert(key, record);
        self.regions.get_mut(&key)
    }
}
