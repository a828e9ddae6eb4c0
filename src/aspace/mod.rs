//! 通用的地址空间框架。
//!
//! 地址空间的实现按名字注册（例如`sv39`），再通过实现的名字创建地址空间，
//! 创建出的地址空间也以自己的名字登记，供调度器和异常处理查找。
//! 框架只通过[`VmOps`]操作地址空间，不关心具体的页表格式。

use crate::mm::{AddressSpace, ExceptionRecord, FaultError, ProtFlags, Region, Vector, VmError};
use crate::sync::IrqMutex;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use lazy_static::*;

// 地址空间实现支持的粒度和功能
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Characteristics {
    // 映射的最小单位
    pub granularity: usize,
    // 区域的起始地址需要的对齐
    pub alignment: usize,
    // 支持的区域类型，取自ProtFlags::ANONYMOUS和ProtFlags::FILE_BACKED
    pub caps: ProtFlags,
}

// 地址空间的操作表
pub trait VmOps: Send + Sync {
    fn destroy(&self) -> Result<(), VmError>;
    fn add_thread(&self, tid: usize) -> Result<(), VmError>;
    fn remove_thread(&self, tid: usize) -> Result<(), VmError>;
    fn add_region(&self, region: &Region) -> Result<(), VmError>;
    fn remove_region(&self, region: &Region) -> Result<(), VmError>;
    fn protect_region(&self, region: &Region, prot: ProtFlags) -> Result<(), VmError>;
    fn move_region(&self, cur: &Region, new: &Region) -> Result<(), VmError>;
    fn switch_from(&self);
    fn switch_to(&self);
    // 致命的异常不会返回
    fn exception(&self, record: &ExceptionRecord, vector: Vector) -> Result<(), FaultError>;
    fn print(&self);
}

impl VmOps for AddressSpace {
    fn destroy(&self) -> Result<(), VmError> {
        AddressSpace::destroy(self)
    }

    fn add_thread(&self, tid: usize) -> Result<(), VmError> {
        AddressSpace::add_thread(self, tid)
    }

    fn remove_thread(&self, tid: usize) -> Result<(), VmError> {
        AddressSpace::remove_thread(self, tid)
    }

    fn add_region(&self, region: &Region) -> Result<(), VmError> {
        AddressSpace::add_region(self, region)
    }

    fn remove_region(&self, region: &Region) -> Result<(), VmError> {
        AddressSpace::remove_region(self, region)
    }

    fn protect_region(&self, region: &Region, prot: ProtFlags) -> Result<(), VmError> {
        AddressSpace::protect_region(self, region, prot)
    }

    fn move_region(&self, cur: &Region, new: &Region) -> Result<(), VmError> {
        AddressSpace::move_region(self, cur, new)
    }

    fn switch_from(&self) {
        AddressSpace::switch_from(self)
    }

    fn switch_to(&self) {
        AddressSpace::switch_to(self)
    }

    fn exception(&self, record: &ExceptionRecord, vector: Vector) -> Result<(), FaultError> {
        AddressSpace::exception(self, record, vector)
    }

    fn print(&self) {
        AddressSpace::print(self)
    }
}

// 一种地址空间实现：创建函数和它的特性
#[derive(Copy, Clone)]
pub struct VmImpl {
    pub create: fn(&str) -> Result<Arc<dyn VmOps>, VmError>,
    pub characteristics: fn() -> Characteristics,
}

lazy_static! {
    static ref IMPLS: IrqMutex<BTreeMap<String, VmImpl>> = IrqMutex::new(BTreeMap::new());
    static ref SPACES: IrqMutex<BTreeMap<String, Arc<dyn VmOps>>> =
        IrqMutex::new(BTreeMap::new());
}

pub fn register_impl(name: &str, imp: VmImpl) -> Result<(), VmError> {
    let mut impls = IMPLS.lock();
    if impls.contains_key(name) {
        return Err(VmError::Exists);
    }
    impls.insert(name.to_string(), imp);
    debug!("aspace: register implementation '{}'", name);
    Ok(())
}

fn find_impl(name: &str) -> Result<VmImpl, VmError> {
    IMPLS.lock().get(name).copied().ok_or(VmError::NotFound)
}

pub fn characteristics(impl_name: &str) -> Result<Characteristics, VmError> {
    Ok((find_impl(impl_name)?.characteristics)())
}

// 用实现impl_name创建一个地址空间，登记在name下
pub fn create(impl_name: &str, name: &str) -> Result<Arc<dyn VmOps>, VmError> {
    let imp = find_impl(impl_name)?;
    if SPACES.lock().contains_key(name) {
        return Err(VmError::Exists);
    }
    let space = (imp.create)(name)?;
    let mut spaces = SPACES.lock();
    // 创建期间同名的地址空间可能已经登记
    if spaces.contains_key(name) {
        return Err(VmError::Exists);
    }
    spaces.insert(name.to_string(), space.clone());
    Ok(space)
}

pub fn lookup(name: &str) -> Option<Arc<dyn VmOps>> {
    SPACES.lock().get(name).cloned()
}

// 销毁并注销一个地址空间。还有区域或线程时失败，地址空间保持登记。
pub fn unregister(name: &str) -> Result<(), VmError> {
    let space = lookup(name).ok_or(VmError::NotFound)?;
    space.destroy()?;
    SPACES.lock().remove(name);
    debug!("aspace: unregister '{}'", name);
    Ok(())
}

fn create_sv39(name: &str) -> Result<Arc<dyn VmOps>, VmError> {
    Ok(Arc::new(AddressSpace::create(name)?))
}

// 注册本库提供的SV39实现
pub fn init() {
    let sv39 = VmImpl {
        create: create_sv39,
        characteristics: AddressSpace::characteristics,
    };
    if register_impl("sv39", sv39).is_err() {
        debug!("aspace: sv39 already registered");
    }
}
