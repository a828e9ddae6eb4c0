//! 异常分发：把硬件报告的Trap原因翻译成异常记录，交给当前地址空间处理。
//!
//! 内核的Trap入口（保存上下文、切换栈）不在这里。入口代码拿到当前线程的地址空间后，
//! 调用[`handle_trap`]，再根据返回的[`TrapOutcome`]决定重新执行还是终止出错的上下文。

use crate::arch;
use crate::aspace::VmOps;
use crate::mm::{tlb, AccessType, ExceptionRecord, Vector};

// 本模块关心的Trap原因，取自scause
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapCause {
    InstructionFault,
    LoadFault,
    StoreFault,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    // S特权级软件中断，核间中断以它的形式到达
    SupervisorSoft,
    Other(usize),
}

const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);

impl TrapCause {
    // 按scause的编码解析
    pub fn from_code(scause: usize) -> Self {
        match scause {
            1 => TrapCause::InstructionFault,
            5 => TrapCause::LoadFault,
            7 => TrapCause::StoreFault,
            12 => TrapCause::InstructionPageFault,
            13 => TrapCause::LoadPageFault,
            15 => TrapCause::StorePageFault,
            code if code == INTERRUPT_BIT | 1 => TrapCause::SupervisorSoft,
            code => TrapCause::Other(code),
        }
    }
}

// 异常处理完之后怎么办
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    // 回到出错的指令重新执行
    Retry,
    // 终止出错的上下文
    KillContext,
}

// 访存异常转换成(异常记录, 异常向量)。其他Trap不归地址空间处理，返回None。
pub fn decode(cause: TrapCause, stval: usize, from_user: bool) -> Option<(ExceptionRecord, Vector)> {
    let mut access = match cause {
        TrapCause::LoadPageFault | TrapCause::LoadFault => AccessType::READ,
        TrapCause::StorePageFault | TrapCause::StoreFault => AccessType::WRITE,
        TrapCause::InstructionPageFault | TrapCause::InstructionFault => AccessType::EXEC,
        _ => return None,
    };
    if from_user {
        access |= AccessType::USER;
    }
    let vector = match cause {
        TrapCause::LoadPageFault | TrapCause::StorePageFault | TrapCause::InstructionPageFault => {
            Vector::PageFault
        }
        // 访问权限错误（PMP等）说明访问了不该访问的物理内存
        _ => Vector::GeneralProtection,
    };
    Some((ExceptionRecord::new(stval, access), vector))
}

// 处理一次Trap。致命的异常在地址空间里停机，不会返回。
pub fn dispatch(space: &dyn VmOps, cause: TrapCause, stval: usize, from_user: bool) -> TrapOutcome {
    if cause == TrapCause::SupervisorSoft {
        let handled = tlb::handle_ipi();
        trace!("ipi: {} shootdowns", handled);
        return TrapOutcome::Retry;
    }
    let (record, vector) = match decode(cause, stval, from_user) {
        Some(decoded) => decoded,
        None => panic!("Unsupported trap {:?}, stval = {:#x}!", cause, stval),
    };
    match space.exception(&record, vector) {
        Ok(()) => TrapOutcome::Retry,
        Err(e) => {
            println_kernel!("{}, killed by kernel.", e);
            TrapOutcome::KillContext
        }
    }
}

// 读出当前核上Trap的原因，交给space处理
pub fn handle_trap(space: &dyn VmOps) -> TrapOutcome {
    let (cause, stval, from_user) = arch::read_trap();
    dispatch(space, cause, stval, from_user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{test_support, AddressSpace, ProtFlags, Region};

    #[test]
    fn scause_codes() {
        assert_eq!(TrapCause::from_code(13), TrapCause::LoadPageFault);
        assert_eq!(TrapCause::from_code(15), TrapCause::StorePageFault);
        assert_eq!(TrapCause::from_code(INTERRUPT_BIT | 1), TrapCause::SupervisorSoft);
        assert_eq!(TrapCause::from_code(2), TrapCause::Other(2));
    }

    #[test]
    fn decode_access_types() {
        let (record, vector) = decode(TrapCause::StorePageFault, 0x1000, true).unwrap();
        assert_eq!(record.access, AccessType::WRITE | AccessType::USER);
        assert_eq!(vector, Vector::PageFault);
        let (record, vector) = decode(TrapCause::InstructionFault, 0x2000, false).unwrap();
        assert_eq!(record.access, AccessType::EXEC);
        assert_eq!(vector, Vector::GeneralProtection);
        assert!(decode(TrapCause::Other(8), 0, true).is_none());
    }

    #[test]
    fn page_faults_are_repaired_or_kill_the_context() {
        let _hw = test_support::hw_lock();
        test_support::init();
        let space = AddressSpace::create("trap-test").unwrap();
        let r = Region::new(0x1000, 0x1000, 0x1000, ProtFlags::READ);
        space.add_region(&r).unwrap();

        arch::raise_trap(13, 0x1008, true);
        assert_eq!(handle_trap(&space), TrapOutcome::Retry);
        assert!(space
            .translate(0x1008, AccessType::READ | AccessType::USER)
            .is_ok());

        arch::raise_trap(15, 0x1008, true);
        assert_eq!(handle_trap(&space), TrapOutcome::KillContext);
        assert_eq!(space.stats().faults, 2);
    }

    #[test]
    fn ipi_is_acknowledged() {
        let _hw = test_support::hw_lock();
        test_support::init();
        let space = AddressSpace::create("ipi-test").unwrap();
        assert_eq!(
            dispatch(&space, TrapCause::SupervisorSoft, 0, false),
            TrapOutcome::Retry
        );
    }

    #[test]
    #[should_panic(expected = "Unsupported trap")]
    fn unsupported_traps_halt() {
        test_support::init();
        let space = AddressSpace::create("bad-trap").unwrap();
        dispatch(&space, TrapCause::Other(2), 0, false);
    }
}
