use super::VmError;

// 文件映射区域的后备文件
pub trait File: Send + Sync {
    // 从offset开始读入buf，返回实际读到的字节数。读到文件末尾时可以少于buf的长度。
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, VmError>;
}
