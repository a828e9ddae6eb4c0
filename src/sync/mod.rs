// 提供同步和内部可变性的原语类型
mod up;

pub use up::{intr_nesting, IrqMutex, IrqMutexGuard};
