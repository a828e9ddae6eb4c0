//! 内核的打印输出。
//!
//! 本库不直接驱动串口。内核启动时通过[`set_sink`]提供一个输出函数（例如写UART或调用SBI），
//! 在此之前的输出会被丢弃（跑单元测试时则打印到标准输出）。

use core::fmt::{self, Write};
use spin::Mutex;

static SINK: Mutex<Option<fn(&str)>> = Mutex::new(None);

struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let sink = *SINK.lock();
        match sink {
            Some(sink) => sink(s),
            #[cfg(test)]
            None => std::print!("{}", s),
            #[cfg(not(test))]
            None => {}
        }
        Ok(())
    }
}

// 设置输出函数
pub fn set_sink(sink: fn(&str)) {
    *SINK.lock() = Some(sink);
}

pub fn print(args: fmt::Arguments) {
    // 输出失败时没有别的地方可以报告，直接忽略
    let _ = Stdout.write_fmt(args);
}

// 声明一个可在内核中打印的宏
#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?));
    }
}

#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?));
    }
}

#[macro_export]
macro_rules! println_kernel {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!("\u{1B}[93m[kernel]\u{1B}[0m ", $fmt, "\n") $(, $($arg)+)?));
    }
}
