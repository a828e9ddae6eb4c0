//! 调度层与地址空间的交界：每个核当前装载的是哪个地址空间。
pub mod processor;
