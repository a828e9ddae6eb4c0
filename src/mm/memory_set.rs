//! 地址空间：一个页表，加上一组区域的记录。
//!
//! 区域的增删改都在地址空间的锁内完成，持锁时屏蔽中断。
//! 匿名和文件映射页需要的物理页帧尽量在锁外准备好（分配、读文件），
//! 拿到锁之后再检查一遍状态，没有变化才提交。

use super::address::{PhysAddr, VPNRange, VirtAddr, VirtPageNum};
use super::fault::{AccessType, ExceptionRecord, FaultError, FaultOutcome, Vector};
use super::frame_allocator::{frame_alloc, FrameTracker};
use super::page_table::PageTable;
use super::region::{validate_prot, MapRegion, MatchMask, ProtFlags, Region, RegionTracker};
use super::tlb::{self, TlbAction};
use super::VmError;
use crate::aspace::Characteristics;
use crate::config::PAGE_SIZE;
use crate::sync::{IrqMutex, IrqMutexGuard};
use crate::{arch, task::processor};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

// 地址空间的ID从1开始，0表示「没有地址空间」
static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(1);

// 受锁保护的部分
pub struct MemorySet {
    page_table: PageTable,
    regions: RegionTracker,
    // 绑定到该地址空间的线程
    threads: BTreeSet<usize>,
    destroyed: bool,
}

#[derive(Default)]
struct SpaceStats {
    faults: AtomicUsize,
    lazy_pages: AtomicUsize,
    tlb_page_flushes: AtomicUsize,
    tlb_reloads: AtomicUsize,
    shootdowns: AtomicUsize,
}

// 统计信息的一份拷贝
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    // 交给exception处理的缺页异常
    pub faults: usize,
    // 缺页时建立的映射
    pub lazy_pages: usize,
    pub tlb_page_flushes: usize,
    pub tlb_reloads: usize,
    // 发给其他核的刷新请求
    pub shootdowns: usize,
}

pub struct AddressSpace {
    id: usize,
    name: String,
    // satp的值，创建后不再改变
    token: usize,
    inner: IrqMutex<MemorySet>,
    stats: SpaceStats,
}

impl AddressSpace {
    // 创建一个空的地址空间，只分配根页表
    pub fn create(name: &str) -> Result<Self, VmError> {
        let page_table = PageTable::new()?;
        let id = NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed);
        let token = page_table.token();
        debug!("aspace {}: create '{}' token={:#x}", id, name, token);
        Ok(Self {
            id,
            name: String::from(name),
            token,
            inner: IrqMutex::new(MemorySet {
                page_table,
                regions: RegionTracker::new(),
                threads: BTreeSet::new(),
                destroyed: false,
            }),
            stats: SpaceStats::default(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn characteristics() -> Characteristics {
        Characteristics {
            granularity: PAGE_SIZE,
            alignment: PAGE_SIZE,
            caps: ProtFlags::ANONYMOUS | ProtFlags::FILE_BACKED,
        }
    }

    fn lock_live(&self) -> Result<IrqMutexGuard<'_, MemorySet>, VmError> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(VmError::Destroyed);
        }
        Ok(inner)
    }

    // 所有区域都删除、所有线程都解绑之后才能销毁
    pub fn destroy(&self) -> Result<(), VmError> {
        let mut inner = self.lock_live()?;
        if !inner.regions.is_empty() || !inner.threads.is_empty() {
            warn!(
                "aspace {}: destroy with {} regions and {} threads",
                self.id,
                inner.regions.len(),
                inner.threads.len()
            );
            return Err(VmError::Busy);
        }
        inner.destroyed = true;
        processor::forget_space(self.id);
        debug!("aspace {}: destroyed", self.id);
        Ok(())
    }

    pub fn add_thread(&self, tid: usize) -> Result<(), VmError> {
        let mut inner = self.lock_live()?;
        if !inner.threads.insert(tid) {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }

    pub fn remove_thread(&self, tid: usize) -> Result<(), VmError> {
        let mut inner = self.lock_live()?;
        if !inner.threads.remove(&tid) {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }

    pub fn threads(&self) -> Vec<usize> {
        self.inner.lock().threads.iter().copied().collect()
    }

    // 添加一个区域。EAGER区域立即建立全部映射，任何一页失败都会撤销整个操作。
    pub fn add_region(&self, region: &Region) -> Result<(), VmError> {
        region.validate()?;
        // 先检查一次重叠，避免为注定失败的请求分配页帧
        if let Some(other) = self.lock_live()?.regions.check_overlap(region) {
            warn!("aspace {}: {:?} overlaps {:?}", self.id, region, other);
            return Err(VmError::Overlap);
        }
        let mut frames = prepare_frames(region)?;

        let mut inner = self.lock_live()?;
        // 锁外准备页帧期间，可能有别的区域插了进来
        if let Some(other) = inner.regions.check_overlap(region) {
            warn!("aspace {}: {:?} overlaps {:?}", self.id, region, other);
            return Err(VmError::Overlap);
        }
        let mut record = MapRegion::new(region.clone());
        let range = region.vpn_range();
        if region.prot.contains(ProtFlags::EAGER) {
            let page_table = &mut inner.page_table;
            for vpn in range {
                if let Err(e) = drill_page(page_table, &mut record, vpn, frames.remove(&vpn)) {
                    // 新建的映射此前都不存在，快表里没有它们
                    unmap_pages(page_table, range);
                    warn!("aspace {}: eager {:?} failed at {:?}: {}", self.id, region, vpn, e);
                    return Err(e);
                }
            }
        }
        inner.regions.insert(record);
        self.flush_tlb(range);
        debug!("aspace {}: add {:?}", self.id, region);
        Ok(())
    }

    // 删除一个区域。描述的全部字段都要与记录一致。
    pub fn remove_region(&self, region: &Region) -> Result<(), VmError> {
        let mut inner = self.lock_live()?;
        let record = inner.regions.remove(region, MatchMask::all())?;
        let range = record.region.vpn_range();
        let unmapped = unmap_pages(&mut inner.page_table, range);
        self.flush_tlb(range);
        debug!(
            "aspace {}: remove {:?}, {} pages were present",
            self.id, record.region, unmapped
        );
        // 快表刷新之后才回收页帧
        drop(record);
        Ok(())
    }

    // 修改区域的保护标志。区域由(VA, LEN, PA)确定。
    pub fn protect_region(&self, region: &Region, prot: ProtFlags) -> Result<(), VmError> {
        validate_prot(prot)?;
        let mask = MatchMask::VA | MatchMask::LEN | MatchMask::PA;
        let mut inner = self.lock_live()?;
        let cur = inner
            .regions
            .find(region, mask)
            .map(|r| r.region.clone())
            .ok_or(VmError::NoMatch)?;
        // 匿名/文件映射的属性决定了页帧归谁，不能中途改变
        let backing = ProtFlags::ANONYMOUS | ProtFlags::FILE_BACKED;
        if cur.prot & backing != prot & backing {
            return Err(VmError::InvalidArgument);
        }
        let old_access = cur.access();
        let mut new = cur.clone();
        new.prot = prot;

        let MemorySet {
            page_table, regions, ..
        } = &mut *inner;
        let record = regions.update(&cur, &new, mask).ok_or(VmError::NoMatch)?;
        let range = record.region.vpn_range();
        let mut result = Ok(());
        if prot.contains(ProtFlags::EAGER) {
            if let Err(e) = redrill(page_table, record) {
                // 剩下的页在下次访问时按新权限重建
                unmap_pages(page_table, range);
                result = Err(e);
            }
        } else if record.region.access() != old_access {
            unmap_pages(page_table, range);
        }
        self.flush_tlb(range);
        debug!("aspace {}: protect {:?} -> {:?}", self.id, cur, prot);
        result
    }

    // 把区域搬到新的物理地址。数据已经由调用者拷贝好了。
    pub fn move_region(&self, cur: &Region, new: &Region) -> Result<(), VmError> {
        let mask = MatchMask::VA | MatchMask::LEN | MatchMask::PROTECT;
        if !cur.matches(new, mask) {
            return Err(VmError::InvalidArgument);
        }
        new.validate()?;
        let mut inner = self.lock_live()?;
        let MemorySet {
            page_table, regions, ..
        } = &mut *inner;
        let found = regions.find(cur, mask).ok_or(VmError::NoMatch)?;
        if found.region.prot.contains(ProtFlags::PIN) && found.region.pa_start != new.pa_start {
            return Err(VmError::Pinned);
        }
        let record = regions.update(cur, new, mask).ok_or(VmError::NoMatch)?;
        let range = record.region.vpn_range();
        unmap_pages(page_table, range);
        let mut result = Ok(());
        if record.region.prot.contains(ProtFlags::EAGER) {
            if let Err(e) = redrill(page_table, record) {
                unmap_pages(page_table, range);
                result = Err(e);
            }
        }
        self.flush_tlb(range);
        debug!("aspace {}: move {:?} -> {:#x}", self.id, cur, new.pa_start);
        result
    }

    // 缺页处理。成功时返回，由调用者重新执行出错的指令。
    pub fn handle_fault(
        &self,
        record: &ExceptionRecord,
        vector: Vector,
    ) -> Result<FaultOutcome, FaultError> {
        let addr = record.addr;
        if vector == Vector::GeneralProtection {
            return Err(FaultError::GeneralProtection { addr });
        }
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        let vpn = VirtAddr::from(addr).floor();

        let (region, needs_frame) = {
            let inner = self.inner.lock();
            let found = inner
                .regions
                .find_at(addr)
                .ok_or(FaultError::NoRegion { addr })?;
            if inner.page_table.translate(vpn).is_some() {
                return if found.region.access().contains(record.access.required()) {
                    Err(FaultError::Inconsistent { addr })
                } else {
                    Err(FaultError::Violation {
                        addr,
                        access: record.access,
                    })
                };
            }
            // 之前被置为不存在的页，页帧还在记录里
            let needs_frame = found.region.is_backed() && !found.frames.contains_key(&vpn);
            (found.region.clone(), needs_frame)
        };

        let frame = if needs_frame {
            let frame = alloc_backing_frame(&region, vpn)
                .map_err(|error| FaultError::Backing { addr, error })?;
            Some(frame)
        } else {
            None
        };

        let mut inner = self.inner.lock();
        let MemorySet {
            page_table, regions, ..
        } = &mut *inner;
        let current = match regions.find_at_mut(addr) {
            Some(current) if current.region == region => current,
            _ => return Ok(FaultOutcome::Retry),
        };
        if page_table.translate(vpn).is_some() {
            return Ok(FaultOutcome::Retry);
        }
        drill_page(page_table, current, vpn, frame)
            .map_err(|error| FaultError::Backing { addr, error })?;
        self.stats.lazy_pages.fetch_add(1, Ordering::Relaxed);
        Ok(FaultOutcome::Drilled)
    }

    // 异常处理的入口。致命的错误直接停机；权限违规返回给调用者，由它终止出错的上下文。
    pub fn exception(&self, record: &ExceptionRecord, vector: Vector) -> Result<(), FaultError> {
        match self.handle_fault(record, vector) {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!("aspace {} '{}': {}", self.id, self.name, e);
                self.print();
                panic!("unrecoverable fault in address space '{}': {}", self.name, e);
            }
            Err(e) => {
                warn!("aspace {}: {}", self.id, e);
                Err(e)
            }
        }
    }

    // 按MMU的方式翻译va。访问不被允许时，返回硬件会报告的异常。
    // 内核访问用户页按sstatus.SUM置位处理。
    pub fn translate(&self, va: usize, access: AccessType) -> Result<PhysAddr, ExceptionRecord> {
        let inner = self.inner.lock();
        let vaddr = VirtAddr::from(va);
        match inner.page_table.translate(vaddr.floor()) {
            Some(pte) if pte.flags().contains(access.required()) => {
                let base: PhysAddr = pte.ppn().into();
                Ok(PhysAddr(base.0 + vaddr.page_offset()))
            }
            _ => Err(ExceptionRecord::new(va, access)),
        }
    }

    // 包含va的区域
    pub fn find_at(&self, va: usize) -> Option<Region> {
        self.inner
            .lock()
            .regions
            .find_at(va)
            .map(|r| r.region.clone())
    }

    pub fn regions(&self) -> Vec<Region> {
        self.inner
            .lock()
            .regions
            .iter()
            .map(|r| r.region.clone())
            .collect()
    }

    // 页表本身占用的页帧数
    pub fn table_frames(&self) -> usize {
        self.inner.lock().page_table.table_frames()
    }

    // 全部区域持有的后备页帧数
    pub fn resident_frames(&self) -> usize {
        self.inner.lock().regions.iter().map(|r| r.frames.len()).sum()
    }

    // 在当前核上装载该地址空间
    pub fn switch_to(&self) {
        arch::write_satp(self.token);
        arch::flush_tlb_all();
        processor::install_space(self.id);
    }

    pub fn switch_from(&self) {
        processor::uninstall_space(self.id);
    }

    pub fn print(&self) {
        let inner = self.inner.lock();
        info!(
            "aspace {} '{}': token={:#x}, {} regions, {} threads, {} table frames",
            self.id,
            self.name,
            self.token,
            inner.regions.len(),
            inner.threads.len(),
            inner.page_table.table_frames()
        );
        for record in inner.regions.iter() {
            info!("  {:?} frames={}", record.region, record.frames.len());
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            faults: self.stats.faults.load(Ordering::Relaxed),
            lazy_pages: self.stats.lazy_pages.load(Ordering::Relaxed),
            tlb_page_flushes: self.stats.tlb_page_flushes.load(Ordering::Relaxed),
            tlb_reloads: self.stats.tlb_reloads.load(Ordering::Relaxed),
            shootdowns: self.stats.shootdowns.load(Ordering::Relaxed),
        }
    }

    // 在装载了该地址空间的核上刷新range。调用者持有锁。
    fn flush_tlb(&self, range: VPNRange) {
        let cores = processor::cores_running(self.id);
        if cores.is_empty() {
            return;
        }
        let result = tlb::invalidate(self.id, range, cores);
        match result.local {
            TlbAction::Pages(n) => {
                self.stats.tlb_page_flushes.fetch_add(n, Ordering::Relaxed);
            }
            TlbAction::Reload => {
                self.stats.tlb_reloads.fetch_add(1, Ordering::Relaxed);
            }
            TlbAction::None => {}
        }
        self.stats
            .shootdowns
            .fetch_add(result.remote.count(), Ordering::Relaxed);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        processor::forget_space(self.id);
    }
}

// 为后备页分配一个清零的页帧，文件映射还要读入对应的一页
fn alloc_backing_frame(region: &Region, vpn: VirtPageNum) -> Result<FrameTracker, VmError> {
    let frame = frame_alloc().ok_or(VmError::OutOfMemory)?;
    if let Some(file) = region.file.as_ref() {
        let buf = frame.ppn.get_bytes_array();
        let read = file.read_at(region.file_offset(vpn), buf)?;
        // 读到文件末尾，剩下的部分补0
        buf[read.min(PAGE_SIZE)..].fill(0);
    }
    Ok(frame)
}

// EAGER的匿名/文件映射区域，在拿锁之前准备好每一页的页帧
fn prepare_frames(region: &Region) -> Result<BTreeMap<VirtPageNum, FrameTracker>, VmError> {
    let mut frames = BTreeMap::new();
    if region.prot.contains(ProtFlags::EAGER) && region.is_backed() {
        for vpn in region.vpn_range() {
            frames.insert(vpn, alloc_backing_frame(region, vpn)?);
        }
    }
    Ok(frames)
}

// 为区域中的一页建立映射。后备页优先用记录中已有的页帧，其次用frame，都没有时现场分配。
fn drill_page(
    page_table: &mut PageTable,
    record: &mut MapRegion,
    vpn: VirtPageNum,
    frame: Option<FrameTracker>,
) -> Result<(), VmError> {
    let ppn = if record.region.is_backed() {
        match record.frames.get(&vpn) {
            Some(existing) => existing.ppn,
            None => {
                let frame = match frame {
                    Some(frame) => frame,
                    None => alloc_backing_frame(&record.region, vpn)?,
                };
                let ppn = frame.ppn;
                record.frames.insert(vpn, frame);
                ppn
            }
        }
    } else {
        record.region.pa_of(vpn)
    };
    page_table.drill(vpn, ppn, record.region.access())
}

// 按记录中的当前描述，重建整个区域的映射
fn redrill(page_table: &mut PageTable, record: &mut MapRegion) -> Result<(), VmError> {
    for vpn in record.region.vpn_range() {
        drill_page(page_table, record, vpn, None)?;
    }
    Ok(())
}

// 把range中存在的页表项置为不存在，返回这样的页数
fn unmap_pages(page_table: &mut PageTable, range: VPNRange) -> usize {
    range
        .into_iter()
        .filter(|vpn| page_table.invalidate(*vpn))
        .count()
}
