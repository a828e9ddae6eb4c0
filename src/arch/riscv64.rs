use crate::trap::TrapCause;
use core::arch::asm;
use riscv::register::{
    satp,
    scause::{self, Exception, Interrupt, Trap},
    sstatus::{self, SPP},
    stval,
};

// 写入satp寄存器，切换MMU使用的根页表
pub fn write_satp(bits: usize) {
    unsafe {
        satp::write(bits);
    }
}

pub fn read_satp() -> usize {
    satp::read().bits()
}

// 只清除给定虚拟地址所在页的快表项
pub fn flush_tlb_page(va: usize) {
    unsafe {
        asm!("sfence.vma {}, zero", in(reg) va);
    }
}

// sfence.vma不带参数时，清空整个快表
pub fn flush_tlb_all() {
    unsafe {
        asm!("sfence.vma");
    }
}

// 当前是否允许S特权级的中断
pub fn intr_get() -> bool {
    sstatus::read().sie()
}

pub fn intr_disable() {
    unsafe {
        sstatus::clear_sie();
    }
}

pub fn intr_enable() {
    unsafe {
        sstatus::set_sie();
    }
}

// 当前核的编号。启动时由入口代码存放在tp寄存器里。
pub fn hart_id() -> usize {
    let id: usize;
    unsafe {
        asm!("mv {}, tp", out(reg) id);
    }
    id
}

// 向hart_mask中的核发送核间中断。legacy接口要求传入掩码所在的地址。
pub fn send_ipi(hart_mask: usize) {
    #[allow(deprecated)]
    sbi_rt::legacy::send_ipi(&hart_mask as *const usize as usize);
}

// 清除当前核上挂起的软件中断（核间中断以S特权级软件中断的形式到达）
pub fn clear_ipi() {
    unsafe {
        asm!("csrc sip, {}", in(reg) 1usize << 1);
    }
}

// 读出Trap的原因、附加信息（出错的地址），以及Trap是否来自用户态
pub fn read_trap() -> (TrapCause, usize, bool) {
    let scause = scause::read();
    let cause = match scause.cause() {
        Trap::Exception(Exception::LoadPageFault) => TrapCause::LoadPageFault,
        Trap::Exception(Exception::StorePageFault) => TrapCause::StorePageFault,
        Trap::Exception(Exception::InstructionPageFault) => TrapCause::InstructionPageFault,
        Trap::Exception(Exception::LoadFault) => TrapCause::LoadFault,
        Trap::Exception(Exception::StoreFault) => TrapCause::StoreFault,
        Trap::Exception(Exception::InstructionFault) => TrapCause::InstructionFault,
        Trap::Interrupt(Interrupt::SupervisorSoft) => TrapCause::SupervisorSoft,
        _ => TrapCause::Other(scause.bits()),
    };
    let from_user = sstatus::read().spp() == SPP::User;
    (cause, stval::read(), from_user)
}
