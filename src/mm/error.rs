use core::fmt::{self, Display, Formatter};

// 地址空间操作可以恢复的错误。
// 交给通用框架时，用status()转换成负数的状态码。
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmError {
    // 地址或长度没有按页对齐
    Misaligned,
    // 参数不合法，例如长度为0、没有任何访问权限、文件映射却没有文件
    InvalidArgument,
    // 与已有区域重叠
    Overlap,
    // 找不到匹配的区域
    NoMatch,
    // 区域被固定（PIN），不能改变其物理位置
    Pinned,
    // 地址空间还有区域或线程，不能销毁
    Busy,
    // 地址空间已经被销毁
    Destroyed,
    // 物理页帧（包括页表页）分配失败
    OutOfMemory,
    // 读取文件失败
    Io,
    // 名字没有注册
    NotFound,
    // 名字已经注册过
    Exists,
}

impl VmError {
    pub fn status(self) -> isize {
        match self {
            VmError::Misaligned => -1,
            VmError::InvalidArgument => -2,
            VmError::Overlap => -3,
            VmError::NoMatch => -4,
            VmError::Pinned => -5,
            VmError::Busy => -6,
            VmError::Destroyed => -7,
            VmError::OutOfMemory => -8,
            VmError::Io => -9,
            VmError::NotFound => -10,
            VmError::Exists => -11,
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::Misaligned => "address or length is not page aligned",
            VmError::InvalidArgument => "invalid argument",
            VmError::Overlap => "region overlaps an existing region",
            VmError::NoMatch => "no matching region",
            VmError::Pinned => "region is pinned",
            VmError::Busy => "address space still has regions or threads",
            VmError::Destroyed => "address space is destroyed",
            VmError::OutOfMemory => "out of physical memory",
            VmError::Io => "failed to read backing file",
            VmError::NotFound => "name is not registered",
            VmError::Exists => "name is already registered",
        };
        f.write_str(msg)
    }
}

// 方便系统调用层直接返回状态码
impl From<VmError> for isize {
    fn from(e: VmError) -> Self {
        e.status()
    }
}
