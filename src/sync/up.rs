use crate::{arch, config::MAX_CORES};
use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use spin::{Mutex, MutexGuard};

// 屏蔽中断的自旋锁。
// 拿到锁时，自动屏蔽当前核的中断；释放锁时，恢复拿锁之前的中断状态。
// 这样持有锁的代码不会被中断处理程序（例如缺页异常）重入。
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

// 先释放内部的锁，再打开中断，所以要用Option控制drop的顺序
pub struct IrqMutexGuard<'a, T>(Option<MutexGuard<'a, T>>);

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        masking_info().enter();
        IrqMutexGuard(Some(self.inner.lock()))
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.0 = None;
        masking_info().exit();
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        match self.0.as_ref() {
            Some(guard) => guard.deref(),
            None => unreachable!(),
        }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.0.as_mut() {
            Some(guard) => guard.deref_mut(),
            None => unreachable!(),
        }
    }
}

// 每个核各自记录屏蔽中断的嵌套层数
struct IntrMaskingInfo {
    nested_level: AtomicUsize,
    sie_before_masking: AtomicBool,
}

impl IntrMaskingInfo {
    const fn new() -> Self {
        Self {
            nested_level: AtomicUsize::new(0),
            sie_before_masking: AtomicBool::new(false),
        }
    }

    // 屏蔽中断
    fn enter(&self) {
        let sie = arch::intr_get();
        arch::intr_disable();
        // 只有最外层才记录屏蔽前的状态
        if self.nested_level.fetch_add(1, Ordering::SeqCst) == 0 {
            self.sie_before_masking.store(sie, Ordering::SeqCst);
        }
    }

    // 打开中断
    fn exit(&self) {
        let level = self.nested_level.fetch_sub(1, Ordering::SeqCst);
        if level == 1 && self.sie_before_masking.load(Ordering::SeqCst) {
            arch::intr_enable();
        }
    }
}

const MASKING_INIT: IntrMaskingInfo = IntrMaskingInfo::new();
static INTR_MASKING_INFO: [IntrMaskingInfo; MAX_CORES] = [MASKING_INIT; MAX_CORES];

fn masking_info() -> &'static IntrMaskingInfo {
    &INTR_MASKING_INFO[arch::hart_id()]
}

// 当前核屏蔽中断的嵌套层数
pub fn intr_nesting() -> usize {
    masking_info().nested_level.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = IrqMutex::new(1usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(intr_nesting() >= 1);
        }
        assert_eq!(*lock.lock(), 2);
    }
}
