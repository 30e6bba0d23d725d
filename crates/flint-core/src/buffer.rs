use bytes::BytesMut;
use parking_lot::Mutex;

const BUCKET_MIN_SHIFT: u32 = 10;
const BUCKET_COUNT: usize = 7;
const MAX_PER_BUCKET: usize = 64;

/// 按容量分桶的 `BytesMut` 池。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读缓冲、TLS 记录缓冲与拷贝环在连接生命周期里高频借还，分桶复用把
///   分配压力限制在冷路径；
/// - 桶容量取 2 的幂（1 KiB 至 64 KiB），与内核套接字缓冲的常见量级对齐。
///
/// ## 契约（What）
/// - `acquire` 返回已清空、容量不小于请求值的缓冲；超出最大桶的请求直接
///   分配且不回池；
/// - `release` 接收所有权，重复归还被所有权语义天然排除；桶满时缓冲直接
///   释放；
/// - 连接关闭路径应归还所有仍持有的缓冲。
pub struct BufferPool {
    buckets: Mutex<[Vec<BytesMut>; BUCKET_COUNT]>,
}

impl BufferPool {
    /// 创建空池。
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// 借出一块容量不小于 `min_capacity` 的空缓冲。
    pub fn acquire(&self, min_capacity: usize) -> BytesMut {
        match bucket_index(min_capacity) {
            Some(index) => {
                let mut buckets = self.buckets.lock();
                if let Some(mut buf) = buckets[index].pop() {
                    buf.clear();
                    return buf;
                }
                drop(buckets);
                BytesMut::with_capacity(bucket_capacity(index))
            }
            None => BytesMut::with_capacity(min_capacity),
        }
    }

    /// 归还缓冲；容量不属于任何桶或桶已满时直接丢弃。
    pub fn release(&self, mut buf: BytesMut) {
        let capacity = buf.capacity();
        let Some(index) = bucket_index(capacity) else {
            return;
        };
        if bucket_capacity(index) != capacity {
            return;
        }
        buf.clear();
        let mut buckets = self.buckets.lock();
        if buckets[index].len() < MAX_PER_BUCKET {
            buckets[index].push(buf);
        }
    }

    /// 当前池中缓存的缓冲总数（测试与观测用）。
    pub fn pooled_count(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// `capacity` 所属桶的下标；超过最大桶返回 `None`。
fn bucket_index(capacity: usize) -> Option<usize> {
    let min = 1usize << BUCKET_MIN_SHIFT;
    if capacity <= min {
        return Some(0);
    }
    let shift = usize::BITS - (capacity - 1).leading_zeros();
    let index = (shift - BUCKET_MIN_SHIFT) as usize;
    (index < BUCKET_COUNT).then_some(index)
}

fn bucket_capacity(index: usize) -> usize {
    1usize << (BUCKET_MIN_SHIFT + index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_rounds_up_to_bucket() {
        let pool = BufferPool::new();
        let buf = pool.acquire(1500);
        assert!(buf.capacity() >= 2048, "1500 字节请求应落入 2 KiB 桶");
        assert!(buf.is_empty());
    }

    #[test]
    fn release_then_acquire_reuses_buffer() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(1024);
        buf.extend_from_slice(b"stale bytes");
        pool.release(buf);
        assert_eq!(pool.pooled_count(), 1);
        let again = pool.acquire(1024);
        assert!(again.is_empty(), "归还的缓冲必须以清空状态借出");
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn oversized_request_bypasses_pool() {
        let pool = BufferPool::new();
        let buf = pool.acquire(1 << 20);
        assert!(buf.capacity() >= 1 << 20);
        pool.release(buf);
        assert_eq!(pool.pooled_count(), 0, "超大缓冲不回池");
    }

    #[test]
    fn bucket_index_boundaries() {
        assert_eq!(bucket_index(1), Some(0));
        assert_eq!(bucket_index(1024), Some(0));
        assert_eq!(bucket_index(1025), Some(1));
        assert_eq!(bucket_index(65536), Some(6));
        assert_eq!(bucket_index(65537), None);
    }
}
