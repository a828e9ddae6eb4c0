//! 一些配置

// 页面大小为4KB。这也是本管理器支持的唯一粒度和对齐。
pub const PAGE_SIZE: usize = 4096;
// 需要12位才能表示页面的任意位置。这是页内偏移（Page Offset）的位长。
pub const PAGE_SIZE_BITS: usize = 12;

// 刷新快表的阈值（2MB）
// 不超过该长度的范围逐页刷新；超过时直接整体刷新。
pub const TLB_FLUSH_THRESHOLD: usize = 0x20_0000;

// 支持的最大核数
pub const MAX_CORES: usize = 8;

// CSR寄存器satp中MODE字段的值，8表示SV39分页机制
pub const SATP_MODE_SV39: usize = 8;

// 每个核的快表刷新邮箱最多积压这么多请求，再多就改为整体刷新
pub const SHOOTDOWN_MAILBOX_CAPACITY: usize = 16;
