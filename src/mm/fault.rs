//! 缺页处理用到的类型：异常记录、异常向量和处理结果。

use super::page_table::PTEFlags;
use super::VmError;
use core::fmt::{self, Display, Formatter};

bitflags! {
    // 触发异常的那次访问。没有WRITE和EXEC时就是读。
    pub struct AccessType: u8 {
        const WRITE = 1 << 0;
        // 来自用户态
        const USER = 1 << 1;
        // 取指令
        const EXEC = 1 << 2;
    }
}

impl AccessType {
    pub const READ: AccessType = AccessType::empty();

    // 这次访问要求页表项具有的权限
    pub fn required(&self) -> PTEFlags {
        let mut flags = if self.contains(AccessType::EXEC) {
            PTEFlags::X
        } else if self.contains(AccessType::WRITE) {
            PTEFlags::W
        } else {
            PTEFlags::R
        };
        if self.contains(AccessType::USER) {
            flags |= PTEFlags::U;
        }
        flags
    }
}

// 硬件异常的描述：出错的虚拟地址和访问方式
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub addr: usize,
    pub access: AccessType,
}

impl ExceptionRecord {
    pub fn new(addr: usize, access: AccessType) -> Self {
        Self { addr, access }
    }
}

// 交给地址空间处理的异常种类
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Vector {
    // 访问了不允许访问的物理内存。这里没有用户态隔离，一律致命。
    GeneralProtection,
    PageFault,
}

// 缺页处理成功后的结果。两种情况都是返回并重新执行出错的指令。
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    // 为出错的页建立了映射
    Drilled,
    // 处理期间区域或页表被并发修改了，什么都没做
    Retry,
}

// 缺页处理失败的原因
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultError {
    GeneralProtection { addr: usize },
    // 出错地址不在任何区域中
    NoRegion { addr: usize },
    // 页表项存在，且区域的权限足够，本不该触发异常
    Inconsistent { addr: usize },
    // 为缺页准备物理页帧、读文件或分配页表页失败
    Backing { addr: usize, error: VmError },
    // 访问超出了区域声明的权限
    Violation { addr: usize, access: AccessType },
}

impl FaultError {
    // 除了权限违规只终止出错的上下文，其余都要停机
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FaultError::Violation { .. })
    }
}

impl Display for FaultError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::GeneralProtection { addr } => {
                write!(f, "general protection fault at {:#x}", addr)
            }
            FaultError::NoRegion { addr } => write!(f, "fault at {:#x} outside every region", addr),
            FaultError::Inconsistent { addr } => write!(
                f,
                "present entry at {:#x} faulted although the region allows the access",
                addr
            ),
            FaultError::Backing { addr, error } => {
                write!(f, "cannot back the page at {:#x}: {}", addr, error)
            }
            FaultError::Violation { addr, access } => {
                write!(f, "access {:?} to {:#x} violates region rights", access, addr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rights() {
        assert_eq!(AccessType::READ.required(), PTEFlags::R);
        assert_eq!(
            (AccessType::WRITE | AccessType::USER).required(),
            PTEFlags::W | PTEFlags::U
        );
        assert_eq!(AccessType::EXEC.required(), PTEFlags::X);
    }

    #[test]
    fn only_violations_are_recoverable() {
        assert!(!FaultError::Violation { addr: 0, access: AccessType::WRITE }.is_fatal());
        assert!(FaultError::NoRegion { addr: 0 }.is_fatal());
        assert!(FaultError::Inconsistent { addr: 0 }.is_fatal());
        assert!(FaultError::GeneralProtection { addr: 0 }.is_fatal());
    }
}
