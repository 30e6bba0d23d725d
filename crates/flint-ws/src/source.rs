use bytes::Bytes;

/// 一次拉取的结果。
pub enum SourcePull {
    /// 一段非空字节。
    Data(Bytes),
    /// 来源耗尽；出站泵据此发出 FIN=1 的终帧。
    End,
    /// 暂无数据但尚未结束；泵进入取帧停顿。
    Pending,
}

/// 出站消息的字节来源。
///
/// 分片器按 `max` 上限逐帧拉取；同一消息可能被拉取多次。实现方保证
/// `End` 之后不再返回数据。
pub trait ByteSource: Send {
    fn pull(&mut self, max: usize) -> SourcePull;
}

/// 内存字节来源：整段消息已在手。
pub struct BytesSource {
    data: Option<Bytes>,
}

impl BytesSource {
    pub fn new(data: Bytes) -> Self {
        Self { data: Some(data) }
    }
}

impl ByteSource for BytesSource {
    fn pull(&mut self, max: usize) -> SourcePull {
        match self.data.take() {
            None => SourcePull::End,
            Some(mut data) => {
                if data.is_empty() {
                    return SourcePull::End;
                }
                if data.len() <= max {
                    SourcePull::Data(data)
                } else {
                    let chunk = data.split_to(max);
                    self.data = Some(data);
                    SourcePull::Data(chunk)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_single_chunk() {
        let mut source = BytesSource::new(Bytes::from_static(b"abc"));
        let SourcePull::Data(chunk) = source.pull(10) else {
            panic!("expected data");
        };
        assert_eq!(&chunk[..], b"abc");
        assert!(matches!(source.pull(10), SourcePull::End));
    }

    #[test]
    fn large_payload_is_fragmented_by_max() {
        let mut source = BytesSource::new(Bytes::from_static(b"abcdef"));
        let SourcePull::Data(first) = source.pull(4) else {
            panic!("expected first chunk");
        };
        assert_eq!(&first[..], b"abcd");
        let SourcePull::Data(second) = source.pull(4) else {
            panic!("expected second chunk");
        };
        assert_eq!(&second[..], b"ef");
        assert!(matches!(source.pull(4), SourcePull::End));
    }

    #[test]
    fn empty_payload_ends_immediately() {
        let mut source = BytesSource::new(Bytes::new());
        assert!(matches!(source.pull(8), SourcePull::End));
    }
}
