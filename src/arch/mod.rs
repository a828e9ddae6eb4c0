//! 与体系结构相关的操作：satp、快表刷新、中断开关、核间中断和Trap原因。
//!
//! 在RISC-V上直接访问CSR寄存器；在其他平台（例如跑单元测试的主机）上，
//! 用一组软件模拟的寄存器代替，使得上层代码不需要区分。

#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use riscv64::*;

#[cfg(not(target_arch = "riscv64"))]
mod host;
#[cfg(not(target_arch = "riscv64"))]
pub use host::*;

// 重新装载当前的根页表，并清空整个快表
pub fn reload_root() {
    write_satp(read_satp());
    flush_tlb_all();
}
