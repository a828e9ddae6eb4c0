//! 基于RISC-V的SV39分页机制的地址空间管理。
//! 地址、页表、物理页帧分配、区域记录、快表维护和地址空间本身，都在这里实现。
//!
//! 每个地址空间由一组区域描述，区域的映射可以立即建立，也可以在缺页时建立。

mod address;
mod error;
mod fault;
mod file;
mod frame_allocator;
mod memory_set;
mod page_table;
mod region;
pub mod tlb;

#[cfg(test)]
pub mod test_support;

pub use address::{PhysAddr, PhysPageNum, VPNRange, VirtAddr, VirtPageNum};
pub use error::VmError;
pub use fault::{AccessType, ExceptionRecord, FaultError, FaultOutcome, Vector};
pub use file::File;
pub use frame_allocator::{frame_alloc, free_frames, init_frame_allocator, FrameTracker};
pub use memory_set::{AddressSpace, StatsSnapshot};
pub use page_table::{PTEFlags, PageTable, PageTableEntry};
pub use region::{MatchMask, ProtFlags, Region};
