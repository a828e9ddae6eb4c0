//! 单个地址空间的虚拟内存管理器（基于RISC-V的SV39分页机制）。
//!
//! 调用者用一组「区域」（虚拟地址范围、物理地址范围、访问权限）声明地址空间的内容，
//! 本库负责把它们变成页表中的映射：可以在添加区域时立即建立（eager），
//! 也可以等到第一次访问触发缺页异常时再建立（lazy）。
//!
//! - [`mm`]：地址、页表、物理页帧、区域记录和地址空间本身
//! - [`aspace`]：通用的地址空间框架（操作表、按名字注册）
//! - [`trap`]：把硬件异常转交给地址空间的缺页处理
//! - [`task`]：记录每个核当前装载的地址空间

// 内核中没有标准库。只有跑单元测试时才用std。
#![cfg_attr(not(test), no_std)]

// 引入Rust内置的alloc库，用于动态内存分配
extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

#[macro_use]
pub mod console;
pub mod arch;
pub mod aspace;
pub mod config;
pub mod logging;
pub mod mm;
pub mod sync;
pub mod task;
pub mod trap;

pub use aspace::{Characteristics, VmOps};
pub use mm::{AddressSpace, ProtFlags, Region, VmError};

// 内核启动时调用一次：[start, end)是交给地址空间使用的物理内存
pub fn init(start: usize, end: usize) {
    logging::init();
    mm::init_frame_allocator(mm::PhysAddr::from(start), mm::PhysAddr::from(end));
    aspace::init();
    info!("vmspace: {} frames available", mm::free_frames());
}
